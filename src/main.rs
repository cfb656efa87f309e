use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cron;
mod db;
mod downloader;
mod events;
mod files;
mod worker;
mod ytdlp;

use db::{Database, JobRecord};
use events::JobEvent;
use ytdlp::{FormatOption, YtDlpClient};

const OUTPUT_FORMATS: [&str; 4] = ["mp4", "m4a", "webm", "mp3"];

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub ytdlp_bin: String,
    pub tx: tokio::sync::broadcast::Sender<JobEvent>,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting vidfetch-server...");

    let db_path = std::env::var("DATABASE_PATH").unwrap_or_else(|_| "vidfetch.db".to_string());
    let spool_dir = PathBuf::from(
        std::env::var("DOWNLOADS_DIR").unwrap_or_else(|_| "downloads".to_string()),
    );
    let ytdlp_bin = std::env::var("YTDLP_BIN").unwrap_or_else(|_| "yt-dlp".to_string());

    // Spool directory must stay writable for any uid the container runs as
    std::fs::create_dir_all(&spool_dir).expect("Failed to create downloads directory");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&spool_dir, std::fs::Permissions::from_mode(0o777));
    }

    let stale = cron::clean_spool(&spool_dir);
    if stale > 0 {
        tracing::info!("Removed {} stale spool files", stale);
    }

    let db_instance = Database::new(&db_path).expect("Failed to initialize database");
    match db_instance.fail_interrupted_jobs() {
        Ok(0) => {}
        Ok(n) => tracing::warn!("Failed over {} interrupted jobs", n),
        Err(e) => tracing::error!("Failed to fail over interrupted jobs: {}", e),
    }

    // Initialize broadcast channel
    let (tx, _rx) = tokio::sync::broadcast::channel(100);

    let db_clone_for_worker = db_instance.clone();
    let db_for_state = Arc::new(Mutex::new(db_instance));

    let state = AppState {
        db: db_for_state,
        ytdlp_bin: ytdlp_bin.clone(),
        tx: tx.clone(),
    };

    // Pass tx to worker
    let tx_clone = tx.clone();
    tokio::spawn(async move {
        worker::run_worker(db_clone_for_worker, ytdlp_bin, spool_dir, tx_clone).await;
    });

    // GC cron task reopens the database from its path
    tokio::spawn(async move {
        cron::start_gc_task(db_path).await;
    });

    // Build router
    let app = Router::new()
        .route("/", get(root))
        .route("/api/analyze", post(analyze_video))
        .route("/api/download", post(create_download))
        .route("/api/status/:id", get(get_download_status))
        .route("/api/downloads/active", get(get_active_downloads))
        .route("/api/file/:id", get(get_file))

        // SSE Events
        .route("/api/events", get(sse_handler))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state);

    let port = port_from_env(std::env::var("PORT").ok());
    let addr = format!("0.0.0.0:{}", port);

    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

/// PORT from the environment; absent or empty means 8000.
fn port_from_env(value: Option<String>) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => v,
        _ => "8000".to_string(),
    }
}

fn valid_http_url(url: &str) -> bool {
    match reqwest::Url::parse(url) {
        Ok(u) => u.scheme() == "http" || u.scheme() == "https",
        Err(_) => false,
    }
}

// SSE Handler
use axum::response::sse::{Event, Sse};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;

async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::info!("New SSE connection established");
    let rx = state.tx.subscribe();

    let stream = tokio_stream::wrappers::BroadcastStream::new(rx)
        .map(|msg| {
            match msg {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    Ok(Event::default().data(data))
                }
                Err(_lag) => {
                    tracing::warn!("SSE stream lagged");
                    Ok(Event::default().comment("lagged"))
                }
            }
        });

    Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default())
}

// Health check endpoint: the container probe hits this, keep it cheap
async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "vidfetch-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// === API Types ===

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub success: bool,
    pub title: String,
    pub duration: u64,
    pub thumbnail: String,
    pub formats: Vec<FormatOption>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    pub format_id: String,
    pub output_format: String, // "mp4" | "m4a" | "webm" | "mp3"
}

#[derive(Debug, Serialize)]
pub struct CreateDownloadResponse {
    pub success: bool,
    pub download_id: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub download_id: String,
    pub status: String,
    pub progress: String,
    pub speed: String,
    pub filename: String,
    pub filesize: i64,
    pub error: Option<String>,
}

fn status_response(job: JobRecord) -> StatusResponse {
    StatusResponse {
        download_id: job.id,
        status: job.status,
        progress: job.progress,
        speed: job.speed,
        filename: job.filename.unwrap_or_default(),
        filesize: job.filesize.unwrap_or(0),
        error: job.error,
    }
}

// === API Handlers ===

async fn analyze_video(
    State(state): State<AppState>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<AnalyzeResponse>, StatusCode> {
    if !valid_http_url(&req.url) {
        return Err(StatusCode::BAD_REQUEST);
    }

    let client = YtDlpClient::new(&state.ytdlp_bin);

    match client.probe(&req.url).await {
        Ok(info) => Ok(Json(AnalyzeResponse {
            success: true,
            title: info.title,
            duration: info.duration,
            thumbnail: info.thumbnail,
            formats: info.formats,
        })),
        Err(e) => {
            tracing::error!("Analyze failed for {}: {}", req.url, e);
            Err(StatusCode::BAD_REQUEST)
        }
    }
}

async fn create_download(
    State(state): State<AppState>,
    Json(req): Json<DownloadRequest>,
) -> Result<Json<CreateDownloadResponse>, StatusCode> {
    if !valid_http_url(&req.url) {
        return Err(StatusCode::BAD_REQUEST);
    }
    if !OUTPUT_FORMATS.contains(&req.output_format.as_str()) {
        return Err(StatusCode::BAD_REQUEST);
    }

    let db = state.db.lock().await;

    match db.create_job(&req.url, &req.format_id, &req.output_format) {
        Ok(job) => Ok(Json(CreateDownloadResponse {
            success: true,
            download_id: job.id,
            message: "Download queued".to_string(),
        })),
        Err(e) => {
            tracing::error!("Failed to create download job: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn get_download_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, StatusCode> {
    let db = state.db.lock().await;

    match db.get_job(&id) {
        Ok(Some(job)) => Ok(Json(status_response(job))),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to get job: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn get_active_downloads(
    State(state): State<AppState>,
) -> Result<Json<Vec<StatusResponse>>, StatusCode> {
    let db = state.db.lock().await;

    match db.get_active_jobs() {
        Ok(jobs) => Ok(Json(jobs.into_iter().map(status_response).collect())),
        Err(e) => {
            tracing::error!("Failed to get active jobs: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Serve a finished file once: the spool copy is deleted after the browser
/// receives it.
async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, StatusCode> {
    let job = {
        let db = state.db.lock().await;
        match db.get_job(&id) {
            Ok(Some(job)) => job,
            Ok(None) => return Err(StatusCode::NOT_FOUND),
            Err(e) => {
                tracing::error!("Failed to get job: {}", e);
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
    };

    if job.status != "completed" {
        return Err(StatusCode::BAD_REQUEST);
    }

    let filepath = job.filepath.ok_or(StatusCode::NOT_FOUND)?;
    let filename = job.filename.unwrap_or_else(|| "download".to_string());

    files::serve_and_cleanup(std::path::Path::new(&filepath), &filename).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_defaults_when_absent_or_empty() {
        assert_eq!(port_from_env(None), "8000");
        assert_eq!(port_from_env(Some(String::new())), "8000");
        assert_eq!(port_from_env(Some("   ".to_string())), "8000");
        assert_eq!(port_from_env(Some("9090".to_string())), "9090");
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(valid_http_url("https://www.youtube.com/watch?v=abc"));
        assert!(valid_http_url("http://example.com/clip.mp4"));
        assert!(!valid_http_url("ftp://example.com/clip.mp4"));
        assert!(!valid_http_url("file:///etc/passwd"));
        assert!(!valid_http_url("not a url"));
    }

    #[test]
    fn status_response_fills_defaults() {
        let job = JobRecord {
            id: "abc".to_string(),
            url: "https://example.com/v".to_string(),
            format_id: "22".to_string(),
            output_format: "mp4".to_string(),
            status: "pending".to_string(),
            progress: "0%".to_string(),
            speed: String::new(),
            filename: None,
            filepath: None,
            filesize: None,
            error: None,
            created_at: "2024-01-01T00:00:00Z".to_string(),
            started_at: None,
            completed_at: None,
        };

        let resp = status_response(job);
        assert_eq!(resp.download_id, "abc");
        assert_eq!(resp.filename, "");
        assert_eq!(resp.filesize, 0);
        assert!(resp.error.is_none());
    }
}
