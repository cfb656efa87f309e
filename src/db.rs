use rusqlite::{Connection, Result, Row, params};
use chrono::Utc;
use uuid::Uuid;
use serde::{Serialize, Deserialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub url: String,
    pub format_id: String,
    pub output_format: String,
    pub status: String, // "pending" | "downloading" | "completed" | "failed"
    pub progress: String,
    pub speed: String,
    pub filename: Option<String>,
    pub filepath: Option<String>,
    pub filesize: Option<i64>,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

pub struct Database {
    conn: Connection,
    path: String,
}

impl Clone for Database {
    fn clone(&self) -> Self {
        // For simplicity, open a new connection with the same path.
        // In production, use a connection pool.
        Database {
            conn: Connection::open(&self.path).expect("Failed to clone db connection"),
            path: self.path.clone(),
        }
    }
}

impl Database {
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                format_id TEXT NOT NULL,
                output_format TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                progress TEXT NOT NULL DEFAULT '0%',
                speed TEXT NOT NULL DEFAULT '',
                filename TEXT,
                filepath TEXT,
                filesize INTEGER,
                error TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_completed_at ON jobs(completed_at);
        "#)?;

        Ok(Database {
            conn,
            path: path.to_string(),
        })
    }

    fn job_from_row(row: &Row) -> Result<JobRecord> {
        Ok(JobRecord {
            id: row.get(0)?,
            url: row.get(1)?,
            format_id: row.get(2)?,
            output_format: row.get(3)?,
            status: row.get(4)?,
            progress: row.get(5)?,
            speed: row.get(6)?,
            filename: row.get(7)?,
            filepath: row.get(8)?,
            filesize: row.get(9)?,
            error: row.get(10)?,
            created_at: row.get(11)?,
            started_at: row.get(12)?,
            completed_at: row.get(13)?,
        })
    }

    pub fn create_job(&self, url: &str, format_id: &str, output_format: &str) -> Result<JobRecord> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().to_rfc3339();

        self.conn.execute(
            "INSERT INTO jobs (id, url, format_id, output_format, status, progress, speed, created_at) VALUES (?1, ?2, ?3, ?4, 'pending', '0%', '', ?5)",
            params![id, url, format_id, output_format, created_at],
        )?;

        Ok(JobRecord {
            id,
            url: url.to_string(),
            format_id: format_id.to_string(),
            output_format: output_format.to_string(),
            status: "pending".to_string(),
            progress: "0%".to_string(),
            speed: String::new(),
            filename: None,
            filepath: None,
            filesize: None,
            error: None,
            created_at,
            started_at: None,
            completed_at: None,
        })
    }

    pub fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, url, format_id, output_format, status, progress, speed, filename, filepath, filesize, error, created_at, started_at, completed_at FROM jobs WHERE id = ?1"
        )?;

        let mut rows = stmt.query(params![id])?;

        if let Some(row) = rows.next()? {
            Ok(Some(Self::job_from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn get_next_pending_job(&self) -> Result<Option<JobRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, url, format_id, output_format, status, progress, speed, filename, filepath, filesize, error, created_at, started_at, completed_at FROM jobs WHERE status = 'pending' ORDER BY created_at ASC LIMIT 1"
        )?;

        let mut rows = stmt.query([])?;

        if let Some(row) = rows.next()? {
            Ok(Some(Self::job_from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn mark_job_downloading(&self, id: &str) -> Result<()> {
        let started_at = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE jobs SET status = 'downloading', started_at = ?1 WHERE id = ?2",
            params![started_at, id],
        )?;
        Ok(())
    }

    pub fn update_job_progress(&self, id: &str, progress: &str, speed: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE jobs SET progress = ?1, speed = ?2 WHERE id = ?3",
            params![progress, speed, id],
        )?;
        Ok(())
    }

    pub fn mark_job_completed(&self, id: &str, filename: &str, filepath: &str, filesize: i64) -> Result<()> {
        let completed_at = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE jobs SET status = 'completed', progress = '100%', speed = '', filename = ?1, filepath = ?2, filesize = ?3, completed_at = ?4 WHERE id = ?5",
            params![filename, filepath, filesize, completed_at, id],
        )?;
        Ok(())
    }

    pub fn mark_job_failed(&self, id: &str, error: &str) -> Result<()> {
        let completed_at = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE jobs SET status = 'failed', error = ?1, completed_at = ?2 WHERE id = ?3",
            params![error, completed_at, id],
        )?;
        Ok(())
    }

    pub fn get_active_jobs(&self) -> Result<Vec<JobRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, url, format_id, output_format, status, progress, speed, filename, filepath, filesize, error, created_at, started_at, completed_at FROM jobs WHERE status IN ('pending', 'downloading') ORDER BY created_at ASC"
        )?;

        let mut rows = stmt.query([])?;
        let mut jobs = Vec::new();

        while let Some(row) = rows.next()? {
            jobs.push(Self::job_from_row(row)?);
        }
        Ok(jobs)
    }

    /// Jobs left mid-download by a previous process cannot resume: the spool
    /// file is gone after the startup sweep. Pending jobs stay queued.
    pub fn fail_interrupted_jobs(&self) -> Result<usize> {
        let completed_at = Utc::now().to_rfc3339();
        let count = self.conn.execute(
            "UPDATE jobs SET status = 'failed', error = 'interrupted by restart', completed_at = ?1 WHERE status = 'downloading'",
            params![completed_at],
        )?;
        Ok(count)
    }

    /// Delete terminal jobs whose completed_at is older than the retention
    /// window. Returns the purged count and the spool paths of the purged
    /// jobs so the caller can remove the files.
    pub fn gc_expired_jobs(&self, retention_secs: i64) -> Result<(usize, Vec<String>)> {
        let cutoff = (Utc::now() - chrono::Duration::seconds(retention_secs)).to_rfc3339();

        let (ids, paths) = {
            let mut stmt = self.conn.prepare(
                "SELECT id, filepath FROM jobs WHERE status IN ('completed', 'failed') AND completed_at < ?1"
            )?;
            let mut rows = stmt.query(params![cutoff])?;

            let mut ids = Vec::new();
            let mut paths = Vec::new();
            while let Some(row) = rows.next()? {
                ids.push(row.get::<_, String>(0)?);
                if let Some(path) = row.get::<_, Option<String>>(1)? {
                    paths.push(path);
                }
            }
            (ids, paths)
        };

        for id in &ids {
            self.conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        }

        Ok((ids.len(), paths))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_db(dir: &tempfile::TempDir) -> Database {
        let path = dir.path().join("test.db");
        Database::new(path.to_str().unwrap()).unwrap()
    }

    #[test]
    fn job_lifecycle() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let job = db.create_job("https://example.com/watch?v=abc", "22", "mp4").unwrap();
        assert_eq!(job.status, "pending");
        assert_eq!(job.progress, "0%");

        let next = db.get_next_pending_job().unwrap().unwrap();
        assert_eq!(next.id, job.id);
        assert_eq!(next.url, "https://example.com/watch?v=abc");

        db.mark_job_downloading(&job.id).unwrap();
        db.update_job_progress(&job.id, "42.3%", "1.20MiB/s").unwrap();

        let fetched = db.get_job(&job.id).unwrap().unwrap();
        assert_eq!(fetched.status, "downloading");
        assert_eq!(fetched.progress, "42.3%");
        assert_eq!(fetched.speed, "1.20MiB/s");
        assert!(fetched.started_at.is_some());
        assert!(db.get_next_pending_job().unwrap().is_none());

        db.mark_job_completed(&job.id, "My Video.mp4", "downloads/x.mp4", 1234).unwrap();
        let done = db.get_job(&job.id).unwrap().unwrap();
        assert_eq!(done.status, "completed");
        assert_eq!(done.progress, "100%");
        assert_eq!(done.filename.as_deref(), Some("My Video.mp4"));
        assert_eq!(done.filesize, Some(1234));
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn pending_jobs_are_fifo() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let first = db.create_job("https://example.com/a", "22", "mp4").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        db.create_job("https://example.com/b", "22", "mp4").unwrap();

        let next = db.get_next_pending_job().unwrap().unwrap();
        assert_eq!(next.id, first.id);
    }

    #[test]
    fn failed_jobs_record_error() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let job = db.create_job("https://example.com/a", "22", "mp4").unwrap();
        db.mark_job_downloading(&job.id).unwrap();
        db.mark_job_failed(&job.id, "yt-dlp exited with 1").unwrap();

        let failed = db.get_job(&job.id).unwrap().unwrap();
        assert_eq!(failed.status, "failed");
        assert_eq!(failed.error.as_deref(), Some("yt-dlp exited with 1"));
        assert!(failed.completed_at.is_some());
    }

    #[test]
    fn interrupted_jobs_fail_over_but_pending_stay() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let stuck = db.create_job("https://example.com/a", "22", "mp4").unwrap();
        db.mark_job_downloading(&stuck.id).unwrap();
        let queued = db.create_job("https://example.com/b", "22", "mp4").unwrap();

        assert_eq!(db.fail_interrupted_jobs().unwrap(), 1);

        let failed = db.get_job(&stuck.id).unwrap().unwrap();
        assert_eq!(failed.status, "failed");
        assert_eq!(failed.error.as_deref(), Some("interrupted by restart"));

        let still_pending = db.get_job(&queued.id).unwrap().unwrap();
        assert_eq!(still_pending.status, "pending");
    }

    #[test]
    fn gc_collects_expired_terminal_jobs() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let job = db.create_job("https://example.com/a", "22", "mp4").unwrap();
        db.mark_job_completed(&job.id, "a.mp4", "downloads/a.mp4", 10).unwrap();

        // Fresh terminal jobs survive a normal retention window
        let (purged, paths) = db.gc_expired_jobs(3600).unwrap();
        assert_eq!(purged, 0);
        assert!(paths.is_empty());
        assert!(db.get_job(&job.id).unwrap().is_some());

        // A negative retention puts the cutoff in the future and expires everything
        let (purged, paths) = db.gc_expired_jobs(-1).unwrap();
        assert_eq!(purged, 1);
        assert_eq!(paths, vec!["downloads/a.mp4".to_string()]);
        assert!(db.get_job(&job.id).unwrap().is_none());
    }

    #[test]
    fn active_jobs_lists_pending_and_downloading() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let a = db.create_job("https://example.com/a", "22", "mp4").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = db.create_job("https://example.com/b", "140", "m4a").unwrap();
        db.mark_job_downloading(&a.id).unwrap();

        let c = db.create_job("https://example.com/c", "22", "mp4").unwrap();
        db.mark_job_downloading(&c.id).unwrap();
        db.mark_job_failed(&c.id, "boom").unwrap();

        let active = db.get_active_jobs().unwrap();
        let ids: Vec<&str> = active.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec![a.id.as_str(), b.id.as_str()]);
    }
}
