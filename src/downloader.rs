use std::path::Path;
use std::time::Instant;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;

/// Extensions fetchable as plain files, without going through an extractor.
const DIRECT_EXTENSIONS: [&str; 10] = [
    "mp4", "m4a", "mp3", "webm", "mkv", "wav", "ogg", "flac", "mov", "avi",
];

#[derive(Debug, Clone, serde::Serialize)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: u64,
    pub percent: f64,
    pub speed_mbps: f64,
}

/// The media extension of a direct http(s) file URL, if it has one.
pub fn direct_extension(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return None;
    }
    let ext = Path::new(parsed.path())
        .extension()?
        .to_str()?
        .to_ascii_lowercase();
    if DIRECT_EXTENSIONS.contains(&ext.as_str()) {
        Some(ext)
    } else {
        None
    }
}

/// The file stem of the URL path, used as a fallback title.
pub fn url_file_stem(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let stem = Path::new(parsed.path()).file_stem()?.to_str()?.to_string();
    if stem.is_empty() {
        None
    } else {
        Some(stem)
    }
}

/// Stream a URL to `dest`, reporting progress at most every 100ms.
/// Returns the number of bytes written.
pub async fn download_file<F>(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    mut on_progress: F,
) -> Result<u64, String>
where
    F: FnMut(DownloadProgress),
{
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| format!("Download request failed: {}", e))?;

    if !response.status().is_success() {
        return Err(format!("Download failed: HTTP {}", response.status()));
    }

    // Unknown Content-Length is tolerated; percent just stays at 0
    let total = response.content_length().unwrap_or(0);

    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| format!("Failed to create {}: {}", dest.display(), e))?;

    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;
    let start = Instant::now();
    let mut last_report = start;

    while let Some(item) = stream.next().await {
        let chunk = item.map_err(|e| format!("Failed to read response body: {}", e))?;

        file.write_all(&chunk)
            .await
            .map_err(|e| format!("Failed to write {}: {}", dest.display(), e))?;

        downloaded += chunk.len() as u64;

        let now = Instant::now();
        if now.duration_since(last_report).as_millis() >= 100 || (total > 0 && downloaded == total) {
            last_report = now;

            let elapsed = start.elapsed().as_secs_f64();
            let speed_mbps = if elapsed > 0.0 {
                (downloaded as f64 / elapsed) / 1_000_000.0
            } else {
                0.0
            };
            let percent = if total > 0 {
                (downloaded as f64 / total as f64) * 100.0
            } else {
                0.0
            };

            on_progress(DownloadProgress {
                downloaded,
                total,
                percent,
                speed_mbps,
            });
        }
    }

    file.flush()
        .await
        .map_err(|e| format!("Failed to flush {}: {}", dest.display(), e))?;

    Ok(downloaded)
}
