use crate::db::{Database, JobRecord};
use crate::downloader;
use crate::events::JobEvent;
use crate::ytdlp::YtDlpClient;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};

/// Results larger than this are deleted instead of handed to the browser.
pub const MAX_FILE_SIZE: u64 = 2000 * 1024 * 1024; // 2GB

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

struct DownloadOutcome {
    filename: String,
    filepath: String,
    filesize: i64,
}

pub async fn run_worker(
    db_instance: Database,
    ytdlp_bin: String,
    spool_dir: PathBuf,
    tx: broadcast::Sender<JobEvent>,
) {
    tracing::info!("Worker started, polling for download jobs...");

    let db = Arc::new(Mutex::new(db_instance));
    let client = YtDlpClient::new(&ytdlp_bin);
    let http = reqwest::Client::new();

    loop {
        // Scope the lock to just claiming the job
        let job_opt = {
            let db_lock = db.lock().unwrap();
            match db_lock.get_next_pending_job() {
                Ok(res) => res,
                Err(e) => {
                    tracing::error!("Failed to fetch pending job: {}", e);
                    None // Treat error as no job (will sleep)
                }
            }
        };

        match job_opt {
            Some(job) => {
                tracing::info!("Starting download {} ({})", job.id, job.url);

                {
                    let db_lock = db.lock().unwrap();
                    if let Err(e) = db_lock.mark_job_downloading(&job.id) {
                        tracing::error!("Failed to mark job as downloading: {}", e);
                        continue;
                    }
                }

                let _ = tx.send(JobEvent {
                    job_id: job.id.clone(),
                    status: "downloading".to_string(),
                    progress: Some("0%".to_string()),
                    speed: None,
                    filename: None,
                    error: None,
                });

                let result =
                    process_download(db.clone(), &client, &http, &spool_dir, &job, &tx).await;

                let db_lock = db.lock().unwrap();
                match result {
                    Ok(outcome) => {
                        if let Err(e) = db_lock.mark_job_completed(
                            &job.id,
                            &outcome.filename,
                            &outcome.filepath,
                            outcome.filesize,
                        ) {
                            tracing::error!("Failed to mark job as completed: {}", e);
                        } else {
                            tracing::info!(
                                "Download {} completed ({} bytes)",
                                job.id,
                                outcome.filesize
                            );

                            let _ = tx.send(JobEvent {
                                job_id: job.id.clone(),
                                status: "completed".to_string(),
                                progress: Some("100%".to_string()),
                                speed: None,
                                filename: Some(outcome.filename),
                                error: None,
                            });
                        }
                    }
                    Err(error) => {
                        tracing::error!("Download {} failed: {}", job.id, error);
                        let _ = db_lock.mark_job_failed(&job.id, &error);

                        let _ = tx.send(JobEvent {
                            job_id: job.id.clone(),
                            status: "failed".to_string(),
                            progress: None,
                            speed: None,
                            filename: None,
                            error: Some(error),
                        });
                    }
                }
            }
            None => {
                sleep(Duration::from_millis(1000)).await;
            }
        }
    }
}

/// Persist and broadcast a progress update, throttled to one write per
/// PROGRESS_INTERVAL.
fn report_progress(
    db: &Arc<Mutex<Database>>,
    tx: &broadcast::Sender<JobEvent>,
    job_id: &str,
    last_report: &mut Option<Instant>,
    percent: &str,
    speed: &str,
) {
    let now = Instant::now();
    if last_report.map_or(false, |t| now.duration_since(t) < PROGRESS_INTERVAL) {
        return;
    }
    *last_report = Some(now);

    {
        let db_lock = db.lock().unwrap();
        if let Err(e) = db_lock.update_job_progress(job_id, percent, speed) {
            tracing::warn!("Failed to update progress for {}: {}", job_id, e);
        }
    }

    let _ = tx.send(JobEvent {
        job_id: job_id.to_string(),
        status: "downloading".to_string(),
        progress: Some(percent.to_string()),
        speed: Some(speed.to_string()),
        filename: None,
        error: None,
    });
}

async fn process_download(
    db: Arc<Mutex<Database>>,
    client: &YtDlpClient,
    http: &reqwest::Client,
    spool_dir: &Path,
    job: &JobRecord,
    tx: &broadcast::Sender<JobEvent>,
) -> Result<DownloadOutcome, String> {
    let mut last_report: Option<Instant> = None;

    if let Some(ext) = downloader::direct_extension(&job.url) {
        // Plain file URL, no extractor needed
        let title =
            downloader::url_file_stem(&job.url).unwrap_or_else(|| "download".to_string());
        let dest = spool_dir.join(format!("{}.{}", job.id, ext));

        downloader::download_file(http, &job.url, &dest, |p| {
            let percent = format!("{:.1}%", p.percent);
            let speed = format!("{:.2}MB/s", p.speed_mbps);
            report_progress(&db, tx, &job.id, &mut last_report, &percent, &speed);
        })
        .await?;

        finish(spool_dir, &job.id, &title)
    } else {
        // Probe first: early failure for bad URLs, and the title for the
        // browser-facing filename
        let info = client.probe(&job.url).await?;

        let template = spool_dir
            .join(format!("{}.%(ext)s", job.id))
            .to_string_lossy()
            .to_string();

        client
            .download(
                &job.url,
                &job.format_id,
                &job.output_format,
                &template,
                |percent, speed| {
                    report_progress(&db, tx, &job.id, &mut last_report, percent, speed);
                },
            )
            .await?;

        finish(spool_dir, &job.id, &info.title)
    }
}

fn finish(spool_dir: &Path, job_id: &str, title: &str) -> Result<DownloadOutcome, String> {
    let path = find_output_file(spool_dir, job_id)
        .ok_or_else(|| "Download produced no file".to_string())?;

    let size = std::fs::metadata(&path)
        .map_err(|e| format!("Failed to stat {}: {}", path.display(), e))?
        .len();

    if size > MAX_FILE_SIZE {
        let _ = std::fs::remove_file(&path);
        return Err("File too large".to_string());
    }

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let filename = if ext.is_empty() {
        sanitize_title(title)
    } else {
        format!("{}.{}", sanitize_title(title), ext)
    };

    Ok(DownloadOutcome {
        filename,
        filepath: path.to_string_lossy().to_string(),
        filesize: size as i64,
    })
}

/// Locate the finished spool file by stem, skipping partial-download
/// droppings.
fn find_output_file(spool_dir: &Path, job_id: &str) -> Option<PathBuf> {
    for entry in std::fs::read_dir(spool_dir).ok()?.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let stem_matches = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map_or(false, |s| s == job_id);
        if !stem_matches {
            continue;
        }
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if ext == "part" || ext == "ytdl" {
            continue;
        }
        return Some(path);
    }
    None
}

/// Clean the video title for the browser: alphanumerics, spaces and dashes
/// only.
pub(crate) fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == ' ' || *c == '-')
        .collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sanitizes_titles() {
        assert_eq!(
            sanitize_title("Cool Video: Part 2 [HD] (2024)!"),
            "Cool Video Part 2 HD 2024"
        );
        assert_eq!(sanitize_title("  spaced out  "), "spaced out");
        assert_eq!(sanitize_title("dash-ok"), "dash-ok");
        assert_eq!(sanitize_title("///"), "download");
        assert_eq!(sanitize_title(""), "download");
    }

    #[test]
    fn finds_output_file_by_stem() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("job-1.mp4"), b"video").unwrap();
        std::fs::write(dir.path().join("job-1.mp4.part"), b"partial").unwrap();
        std::fs::write(dir.path().join("job-2.mp4"), b"other").unwrap();

        let found = find_output_file(dir.path(), "job-1").unwrap();
        assert_eq!(found.file_name().unwrap(), "job-1.mp4");
    }

    #[test]
    fn partial_files_do_not_count_as_output() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("job-1.part"), b"partial").unwrap();
        std::fs::write(dir.path().join("job-1.ytdl"), b"state").unwrap();

        assert!(find_output_file(dir.path(), "job-1").is_none());
    }

    #[test]
    fn finish_builds_browser_filename() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("job-1.m4a"), b"audio").unwrap();

        let outcome = finish(dir.path(), "job-1", "My Song: Live!").unwrap();
        assert_eq!(outcome.filename, "My Song Live.m4a");
        assert_eq!(outcome.filesize, 5);
        assert!(outcome.filepath.ends_with("job-1.m4a"));
    }

    #[test]
    fn finish_without_output_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(finish(dir.path(), "job-1", "title").is_err());
    }
}
