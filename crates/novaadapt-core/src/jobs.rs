//! Async job manager: a fixed worker pool dispatching in-memory closures
//! with SQLite-backed persistence. Every transition is written through
//! before the worker moves on, and jobs left in `queued`/`running` across
//! a restart are marked `failed`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::cancellation::CancelHandle;
use crate::db;
use novaadapt_types::{AsyncJob, JobStatus};

pub const RESTART_ERROR: &str = "process restart before completion";

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

type StoreResult<T> = std::result::Result<T, JobStoreError>;

pub type JobFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, String>> + Send>>;
pub type JobClosure = Box<dyn FnOnce(CancelHandle) -> JobFuture + Send>;

struct JobStoreDb {
    conn: Mutex<Connection>,
}

impl JobStoreDb {
    async fn open(path: impl AsRef<std::path::Path>) -> StoreResult<Self> {
        let conn = db::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS async_jobs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                result_json TEXT,
                error TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        Ok(JobStoreDb { conn: Mutex::new(conn) })
    }

    async fn upsert(&self, job: &AsyncJob) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO async_jobs(id, status, created_at, started_at, finished_at, result_json, error, cancel_requested)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                result_json = excluded.result_json,
                error = excluded.error,
                cancel_requested = excluded.cancel_requested",
            params![
                job.id,
                job.status.as_str(),
                job.created_at.to_rfc3339(),
                job.started_at.map(|dt| dt.to_rfc3339()),
                job.finished_at.map(|dt| dt.to_rfc3339()),
                job.result.as_ref().map(|v| serde_json::to_string(v)).transpose()?,
                job.error,
                job.cancel_requested,
            ],
        )?;
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<Option<AsyncJob>> {
        let conn = self.conn.lock().await;
        conn.query_row(SELECT_SQL, params![id], row_to_job)
            .optional()
            .map_err(JobStoreError::from)
    }

    async fn list(&self, limit: i64) -> StoreResult<Vec<AsyncJob>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, status, created_at, started_at, finished_at, result_json, error, cancel_requested
             FROM async_jobs ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit.max(1)], row_to_job)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Marks every non-terminal job as `failed`.
    /// Called once at startup before any new jobs are submitted.
    async fn fail_incomplete_on_restart(&self) -> StoreResult<usize> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let affected = conn.execute(
            "UPDATE async_jobs SET status = 'failed', error = ?1, finished_at = ?2
             WHERE status IN ('queued', 'running')",
            params![RESTART_ERROR, now],
        )?;
        Ok(affected)
    }
}

const SELECT_SQL: &str = "SELECT id, status, created_at, started_at, finished_at, result_json, error, cancel_requested
    FROM async_jobs WHERE id = ?1";

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<AsyncJob> {
    let status: String = row.get(1)?;
    let status: JobStatus = match status.as_str() {
        "queued" => JobStatus::Queued,
        "running" => JobStatus::Running,
        "succeeded" => JobStatus::Succeeded,
        "failed" => JobStatus::Failed,
        _ => JobStatus::Canceled,
    };
    let created_at: String = row.get(2)?;
    let result_json: Option<String> = row.get(5)?;
    let parse_dt = |s: Option<String>| {
        s.and_then(|text| chrono::DateTime::parse_from_rfc3339(&text).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };
    Ok(AsyncJob {
        id: row.get(0)?,
        status,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        started_at: parse_dt(row.get(3)?),
        finished_at: parse_dt(row.get(4)?),
        result: result_json
            .map(|text| serde_json::from_str(&text))
            .transpose()
            .map_err(|err| rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(err)))?,
        error: row.get(6)?,
        cancel_requested: row.get(7)?,
    })
}

struct Task {
    id: String,
    closure: JobClosure,
}

/// Runs submitted closures on a fixed-size worker pool, persisting status
/// transitions and supporting cooperative cancellation.
pub struct JobManager {
    store: Arc<JobStoreDb>,
    sender: mpsc::Sender<Task>,
    cancels: Arc<Mutex<HashMap<String, CancelHandle>>>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl JobManager {
    pub async fn new(
        db_path: impl AsRef<std::path::Path>,
        worker_count: usize,
        queue_capacity: usize,
    ) -> StoreResult<Self> {
        let store = Arc::new(JobStoreDb::open(db_path).await?);
        store.fail_incomplete_on_restart().await?;

        let (sender, receiver) = mpsc::channel::<Task>(queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let cancels: Arc<Mutex<HashMap<String, CancelHandle>>> = Arc::new(Mutex::new(HashMap::new()));

        let mut workers = Vec::with_capacity(worker_count.max(1));
        for _ in 0..worker_count.max(1) {
            let receiver = receiver.clone();
            let store = store.clone();
            let cancels = cancels.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let task = {
                        let mut guard = receiver.lock().await;
                        guard.recv().await
                    };
                    let Some(task) = task else { break };
                    run_task(&store, &cancels, task).await;
                }
            }));
        }

        Ok(JobManager { store, sender, cancels, workers })
    }

    pub async fn submit(&self, closure: JobClosure) -> StoreResult<String> {
        let job_id = Uuid::new_v4().simple().to_string();
        let job = AsyncJob {
            id: job_id.clone(),
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            cancel_requested: false,
        };
        self.store.upsert(&job).await?;
        self.cancels.lock().await.insert(job_id.clone(), CancelHandle::new());

        let task = Task { id: job_id.clone(), closure };
        if self.sender.send(task).await.is_err() {
            // Queue shut down; mark the job failed rather than leave it
            // wedged in `queued` forever.
            let mut failed = job;
            failed.status = JobStatus::Failed;
            failed.error = Some("job queue is shut down".to_string());
            failed.finished_at = Some(Utc::now());
            self.store.upsert(&failed).await?;
        }
        Ok(job_id)
    }

    pub async fn get(&self, id: &str) -> StoreResult<Option<AsyncJob>> {
        self.store.get(id).await
    }

    pub async fn list(&self, limit: i64) -> StoreResult<Vec<AsyncJob>> {
        self.store.list(limit).await
    }

    /// Sets `cancel_requested`. A queued job transitions straight to
    /// `canceled`; a running job observes the token cooperatively.
    pub async fn cancel(&self, id: &str) -> StoreResult<Option<AsyncJob>> {
        let Some(mut job) = self.store.get(id).await? else {
            return Ok(None);
        };
        job.cancel_requested = true;

        if let Some(handle) = self.cancels.lock().await.get(id) {
            handle.cancel();
        }

        if job.status == JobStatus::Queued {
            job.status = JobStatus::Canceled;
            job.finished_at = Some(Utc::now());
            job.error = Some("canceled before it started running".to_string());
        }
        self.store.upsert(&job).await?;
        Ok(Some(job))
    }

    pub async fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn run_task(store: &Arc<JobStoreDb>, cancels: &Arc<Mutex<HashMap<String, CancelHandle>>>, task: Task) {
    let Task { id, closure } = task;
    let cancel_handle = cancels
        .lock()
        .await
        .get(&id)
        .cloned()
        .unwrap_or_default();

    if cancel_handle.is_canceled() {
        finish(store, &id, JobStatus::Canceled, None, Some("canceled before it started running".to_string())).await;
        cancels.lock().await.remove(&id);
        return;
    }

    let Some(mut job) = store.get(&id).await.ok().flatten() else {
        return;
    };
    job.status = JobStatus::Running;
    job.started_at = Some(Utc::now());
    let _ = store.upsert(&job).await;

    let outcome = closure(cancel_handle.clone()).await;

    let status = if cancel_handle.is_canceled() {
        JobStatus::Canceled
    } else {
        match &outcome {
            Ok(_) => JobStatus::Succeeded,
            Err(_) => JobStatus::Failed,
        }
    };
    let (result, error) = match outcome {
        Ok(value) if status == JobStatus::Succeeded => (Some(value), None),
        Ok(_) => (None, Some("canceled".to_string())),
        Err(err) => (None, Some(err)),
    };
    finish(store, &id, status, result, error).await;
    cancels.lock().await.remove(&id);
}

async fn finish(
    store: &Arc<JobStoreDb>,
    id: &str,
    status: JobStatus,
    result: Option<Value>,
    error: Option<String>,
) {
    if let Ok(Some(mut job)) = store.get(id).await {
        job.status = status;
        job.result = result;
        job.error = error;
        job.finished_at = Some(Utc::now());
        let _ = store.upsert(&job).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn manager() -> JobManager {
        let dir = tempfile::tempdir().unwrap();
        JobManager::new(dir.path().join("jobs.db"), 2, 16).await.unwrap()
    }

    #[tokio::test]
    async fn submitted_job_eventually_succeeds() {
        let manager = manager().await;
        let id = manager
            .submit(Box::new(|_cancel| Box::pin(async move { Ok(json!({"ok": true})) })))
            .await
            .unwrap();

        let mut job = manager.get(&id).await.unwrap().unwrap();
        for _ in 0..50 {
            if job.status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            job = manager.get(&id).await.unwrap().unwrap();
        }
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn failing_closure_marks_job_failed() {
        let manager = manager().await;
        let id = manager
            .submit(Box::new(|_cancel| Box::pin(async move { Err("boom".to_string()) })))
            .await
            .unwrap();

        let mut job = manager.get(&id).await.unwrap().unwrap();
        for _ in 0..50 {
            if job.status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            job = manager.get(&id).await.unwrap().unwrap();
        }
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn restart_marks_incomplete_jobs_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        {
            let store = JobStoreDb::open(&path).await.unwrap();
            let job = AsyncJob {
                id: "stuck".to_string(),
                status: JobStatus::Running,
                created_at: Utc::now(),
                started_at: Some(Utc::now()),
                finished_at: None,
                result: None,
                error: None,
                cancel_requested: false,
            };
            store.upsert(&job).await.unwrap();
        }
        let manager = JobManager::new(&path, 1, 4).await.unwrap();
        let job = manager.get("stuck").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(RESTART_ERROR));
    }
}
