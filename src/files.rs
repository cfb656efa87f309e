use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use futures::StreamExt;
use tokio_util::io::ReaderStream;

/// Removes the spool file once the response stream is dropped, whether the
/// client read it to the end or hung up early. Delivery is single-use.
struct DeleteOnDrop {
    path: PathBuf,
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::info!("Removed served file {}", self.path.display()),
            Err(e) => tracing::warn!("Failed to remove served file {}: {}", self.path.display(), e),
        }
    }
}

pub async fn serve_and_cleanup(path: &Path, download_name: &str) -> Result<Response, StatusCode> {
    let file = tokio::fs::File::open(path).await.map_err(|e| {
        tracing::error!("Failed to open {}: {}", path.display(), e);
        StatusCode::NOT_FOUND
    })?;

    let len = file
        .metadata()
        .await
        .map_err(|e| {
            tracing::error!("Failed to stat {}: {}", path.display(), e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .len();

    let guard = DeleteOnDrop {
        path: path.to_path_buf(),
    };

    // The guard lives inside the stream closure, so the file is deleted
    // exactly when the body is dropped
    let stream = ReaderStream::new(file).map(move |chunk| {
        let _ = &guard;
        chunk
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, len)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", download_name),
        )
        .body(Body::from_stream(stream))
        .map_err(|e| {
            tracing::error!("Failed to build file response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn delete_on_drop_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("served.mp4");
        std::fs::write(&path, b"data").unwrap();

        {
            let _guard = DeleteOnDrop { path: path.clone() };
        }

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let err = serve_and_cleanup(&dir.path().join("nope.mp4"), "nope.mp4")
            .await
            .err();
        assert_eq!(err, Some(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn response_carries_attachment_headers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"0123456789").unwrap();

        let response = serve_and_cleanup(&path, "My Clip.mp4").await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_LENGTH).unwrap(),
            "10"
        );
        assert_eq!(
            response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"My Clip.mp4\""
        );

        // Body still pending; the file must survive until the stream drops
        assert!(path.exists());
        drop(response);
        assert!(!path.exists());
    }
}
