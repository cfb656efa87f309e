use crate::db::Database;
use std::path::Path;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Finished files are kept this long for the browser to come back for them.
const RETENTION_SECS: i64 = 3600;

/// Start the GC background task
/// - Runs every 10 minutes
/// - Deletes terminal jobs older than 1 hour together with their spool files
pub async fn start_gc_task(db_path: String) {
    info!("[GC] Starting garbage collection task...");

    let mut interval = interval(SWEEP_INTERVAL);

    // First tick fires immediately, then every sweep interval
    loop {
        interval.tick().await;

        let path = db_path.clone();

        // rusqlite work stays on a blocking thread
        let result = tokio::task::spawn_blocking(move || {
            let db = match Database::new(&path) {
                Ok(d) => d,
                Err(e) => {
                    error!("[GC] Failed to open database: {}", e);
                    return;
                }
            };

            match db.gc_expired_jobs(RETENTION_SECS) {
                Ok((purged, paths)) => {
                    let mut removed = 0;
                    for p in &paths {
                        match std::fs::remove_file(p) {
                            Ok(()) => removed += 1,
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                            Err(e) => error!("[GC] Failed to remove {}: {}", p, e),
                        }
                    }
                    if purged > 0 {
                        info!(
                            "[GC] Purged {} expired jobs, removed {} spool files (1h retention)",
                            purged, removed
                        );
                    }
                }
                Err(e) => {
                    error!("[GC] Failed to run job GC: {}", e);
                }
            }
        })
        .await;

        if let Err(e) = result {
            error!("[GC] Task panicked: {}", e);
        }
    }
}

/// Remove every file in the spool directory. Stale files from a previous run
/// are unreachable: their jobs were failed over at startup or their delivery
/// links died with the process.
pub fn clean_spool(spool_dir: &Path) -> usize {
    let mut removed = 0;
    if let Ok(entries) = std::fs::read_dir(spool_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!("Failed to remove stale spool file {}: {}", path.display(), e);
                }
            }
        }
    }
    removed
}
