use std::collections::HashSet;
use std::process::Stdio;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

const TARGET_HEIGHTS: [i64; 6] = [144, 240, 360, 480, 720, 1080];
const MAX_FORMATS: usize = 8;

pub struct YtDlpClient {
    binary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormatOption {
    pub format_id: String,
    pub ext: String,
    pub resolution: String,
    pub filesize: u64,
    pub format_note: String,
    pub has_video: bool,
    pub has_audio: bool,
}

#[derive(Debug, Serialize)]
pub struct VideoInfo {
    pub title: String,
    pub duration: u64,
    pub thumbnail: String,
    pub formats: Vec<FormatOption>,
}

impl YtDlpClient {
    pub fn new(binary: &str) -> Self {
        YtDlpClient {
            binary: binary.to_string(),
        }
    }

    /// Metadata probe: JSON dump, no download.
    pub async fn probe(&self, url: &str) -> Result<VideoInfo, String> {
        let output = Command::new(&self.binary)
            .args(["-J", "--no-playlist", "--no-warnings", "--socket-timeout", "10", url])
            .output()
            .await
            .map_err(|e| format!("Failed to run {}: {}", self.binary, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("{} probe failed: {}", self.binary, last_line(&stderr)));
        }

        let info: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| format!("Failed to parse probe output: {}", e))?;

        Ok(VideoInfo {
            title: info.get("title").and_then(|v| v.as_str()).unwrap_or("Unknown").to_string(),
            duration: info.get("duration").and_then(|v| v.as_u64()).unwrap_or(0),
            thumbnail: info.get("thumbnail").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            formats: useful_formats(&info),
        })
    }

    /// Run a download, reporting `(percent, speed)` as progress lines arrive.
    pub async fn download<F>(
        &self,
        url: &str,
        format_id: &str,
        output_format: &str,
        output_template: &str,
        mut on_progress: F,
    ) -> Result<(), String>
    where
        F: FnMut(&str, &str),
    {
        let mut args = selector_args(format_id, output_format)?;
        for flag in [
            "--newline",
            "--no-playlist",
            "--no-warnings",
            "--socket-timeout",
            "30",
            "--retries",
            "3",
            "--concurrent-fragments",
            "4",
            "--http-chunk-size",
            "10M",
            "-o",
        ] {
            args.push(flag.to_string());
        }
        args.push(output_template.to_string());
        args.push(url.to_string());

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("Failed to spawn {}: {}", self.binary, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "Failed to capture stdout".to_string())?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| "Failed to capture stderr".to_string())?;

        // Drain stderr concurrently so a chatty child cannot block on a full pipe
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = BufReader::new(stderr).read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some((percent, speed)) = parse_progress_line(&line) {
                on_progress(percent, speed);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| format!("Failed to wait for {}: {}", self.binary, e))?;
        let stderr_out = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(format!(
                "{} exited with {}: {}",
                self.binary,
                status,
                last_line(&stderr_out)
            ));
        }
        Ok(())
    }
}

/// Map the requested output format to yt-dlp selection arguments.
/// The mp3 path hands transcoding to ffmpeg via audio extraction.
pub fn selector_args(format_id: &str, output_format: &str) -> Result<Vec<String>, String> {
    fn strs(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    match output_format {
        "mp4" => Ok(vec![
            "-f".to_string(),
            format!("{}/best[ext=mp4]/best", format_id),
        ]),
        "m4a" => Ok(strs(&["-f", "bestaudio[ext=m4a]/bestaudio"])),
        "webm" => Ok(strs(&["-f", "bestaudio[ext=webm]/bestaudio"])),
        "mp3" => Ok(strs(&[
            "-f",
            "bestaudio/best",
            "-x",
            "--audio-format",
            "mp3",
            "--audio-quality",
            "192K",
        ])),
        other => Err(format!("Unsupported output format: {}", other)),
    }
}

/// Reduce a probe document to the formats worth offering: progressive MP4 at
/// the target heights (deduplicated), plus one audio-only track.
pub(crate) fn useful_formats(info: &serde_json::Value) -> Vec<FormatOption> {
    let empty = Vec::new();
    let formats = info
        .get("formats")
        .and_then(|v| v.as_array())
        .unwrap_or(&empty);

    let mut useful = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for f in formats {
        let height = match f.get("height").and_then(|v| v.as_i64()) {
            Some(h) => h,
            None => continue,
        };
        if !TARGET_HEIGHTS.contains(&height) {
            continue;
        }

        let ext = f.get("ext").and_then(|v| v.as_str()).unwrap_or("mp4");
        let vcodec = f.get("vcodec").and_then(|v| v.as_str()).unwrap_or("none");
        let acodec = f.get("acodec").and_then(|v| v.as_str()).unwrap_or("none");

        if ext == "mp4" && vcodec != "none" && acodec != "none" {
            let label = format!("{}p", height);
            if !seen.insert(label.clone()) {
                continue;
            }
            useful.push(FormatOption {
                format_id: f.get("format_id").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                ext: "mp4".to_string(),
                resolution: label,
                filesize: f.get("filesize").and_then(|v| v.as_u64()).unwrap_or(0),
                format_note: "fast (video+audio)".to_string(),
                has_video: true,
                has_audio: true,
            });
        }
    }

    for f in formats {
        let vcodec = f.get("vcodec").and_then(|v| v.as_str()).unwrap_or("none");
        let acodec = f.get("acodec").and_then(|v| v.as_str()).unwrap_or("none");
        if acodec == "none" || vcodec != "none" {
            continue;
        }
        let ext = f.get("ext").and_then(|v| v.as_str()).unwrap_or("");
        if ext == "m4a" || ext == "webm" {
            useful.push(FormatOption {
                format_id: f.get("format_id").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                ext: ext.to_string(),
                resolution: "audio only".to_string(),
                filesize: f.get("filesize").and_then(|v| v.as_u64()).unwrap_or(0),
                format_note: "audio only".to_string(),
                has_video: false,
                has_audio: true,
            });
            break;
        }
    }

    useful.truncate(MAX_FORMATS);
    useful
}

/// Progress lines look like:
/// `[download]  42.3% of ~10.00MiB at 1.23MiB/s ETA 00:05`
fn parse_progress_line(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix("[download]")?;

    let mut percent = None;
    let mut speed = "";
    let mut tokens = rest.split_whitespace();
    while let Some(tok) = tokens.next() {
        if tok.ends_with('%') {
            percent = Some(tok);
        } else if tok == "at" {
            if let Some(next) = tokens.next() {
                speed = next;
            }
        }
    }

    percent.map(|p| (p, speed))
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
}
