use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
pub struct JobEvent {
    pub job_id: String,
    pub status: String, // "downloading", "completed", "failed"
    pub progress: Option<String>,
    pub speed: Option<String>,
    pub filename: Option<String>,
    pub error: Option<String>,
}
