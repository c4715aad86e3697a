//! Idempotency-key store: a `(key, method, path)`-keyed record of
//! in-flight/completed requests, with a SHA-256 canonical-JSON payload
//! hash used to detect a reused key replayed with a different body.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::db;
use novaadapt_types::{IdempotencyEntry, IdempotencyStatus};

#[derive(Debug, Error)]
pub enum IdempotencyStoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, IdempotencyStoreError>;

/// TTL/retention knobs for stored entries, mirroring `AuditStoreConfig`'s
/// lazy-cleanup shape.
#[derive(Debug, Clone)]
pub struct IdempotencyStoreConfig {
    pub retention: Duration,
    pub cleanup_interval: Duration,
}

impl Default for IdempotencyStoreConfig {
    fn default() -> Self {
        IdempotencyStoreConfig {
            retention: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Outcome of `begin`, telling the caller whether to execute the request,
/// replay a stored response, or reject a key reused with a different body.
#[derive(Clone)]
pub enum BeginOutcome {
    /// No prior record; caller should execute the request and call
    /// `complete`.
    New,
    /// A request with this key/method/path/payload is already executing
    /// on another task.
    InProgress,
    /// A completed response exists for this exact request; replay it.
    Replay(IdempotencyEntry),
    /// The key was reused with a different request body.
    Conflict,
}

impl std::fmt::Debug for BeginOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BeginOutcome::New => write!(f, "New"),
            BeginOutcome::InProgress => write!(f, "InProgress"),
            BeginOutcome::Replay(entry) => write!(f, "Replay({entry:?})"),
            BeginOutcome::Conflict => write!(f, "Conflict"),
        }
    }
}

pub struct IdempotencyStore {
    conn: Arc<Mutex<Connection>>,
    config: IdempotencyStoreConfig,
    last_cleanup: Mutex<Instant>,
}

impl IdempotencyStore {
    pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::open_with_config(path, IdempotencyStoreConfig::default()).await
    }

    pub async fn open_with_config(
        path: impl AsRef<std::path::Path>,
        config: IdempotencyStoreConfig,
    ) -> Result<Self> {
        let conn = db::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS idempotency_entries (
                key TEXT NOT NULL,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                payload_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                status_code INTEGER,
                response_json TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (key, method, path)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_idempotency_entries_created_at ON idempotency_entries(created_at)",
            [],
        )?;
        Ok(IdempotencyStore {
            conn: Arc::new(Mutex::new(conn)),
            config,
            last_cleanup: Mutex::new(Instant::now() - Duration::from_secs(3600)),
        })
    }

    pub async fn begin(
        &self,
        key: &str,
        method: &str,
        path: &str,
        payload: &Value,
    ) -> Result<BeginOutcome> {
        self.cleanup_expired_if_due().await?;

        let payload_hash = payload_hash(payload);
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;

        let existing: Option<IdempotencyEntry> = conn
            .query_row(
                "SELECT key, method, path, payload_hash, status, status_code, response_json, created_at, updated_at
                 FROM idempotency_entries WHERE key = ?1 AND method = ?2 AND path = ?3",
                params![key, method, path],
                row_to_entry,
            )
            .optional()?;

        if let Some(entry) = existing {
            if entry.payload_hash != payload_hash {
                return Ok(BeginOutcome::Conflict);
            }
            return Ok(match entry.status {
                IdempotencyStatus::InProgress => BeginOutcome::InProgress,
                IdempotencyStatus::Completed => BeginOutcome::Replay(entry),
            });
        }

        conn.execute(
            "INSERT INTO idempotency_entries(key, method, path, payload_hash, status, status_code, response_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'in_progress', NULL, NULL, ?5, ?5)",
            params![key, method, path, payload_hash, now],
        )?;
        Ok(BeginOutcome::New)
    }

    pub async fn complete(
        &self,
        key: &str,
        method: &str,
        path: &str,
        status_code: u16,
        response: &Value,
    ) -> Result<()> {
        let response_json = serde_json::to_string(response)?;
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE idempotency_entries
             SET status = 'completed', status_code = ?1, response_json = ?2, updated_at = ?3
             WHERE key = ?4 AND method = ?5 AND path = ?6",
            params![status_code as i64, response_json, now, key, method, path],
        )?;
        Ok(())
    }

    /// Releases a reservation made by `begin` when the handler fails
    /// before calling `complete`, so a retried request isn't wedged in
    /// `InProgress` forever.
    pub async fn clear(&self, key: &str, method: &str, path: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM idempotency_entries WHERE key = ?1 AND method = ?2 AND path = ?3 AND status = 'in_progress'",
            params![key, method, path],
        )?;
        Ok(())
    }

    /// Cheap liveness probe for the deep health check: confirms the
    /// connection still answers, without touching any rows.
    pub async fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    /// On-demand expiry sweep, independent of the lazy `cleanup_interval`
    /// gate.
    pub async fn prune_expired(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        self.delete_expired(&conn)
    }

    async fn cleanup_expired_if_due(&self) -> Result<()> {
        if self.config.retention.is_zero() {
            return Ok(());
        }
        {
            let mut last = self.last_cleanup.lock().await;
            if !self.config.cleanup_interval.is_zero()
                && last.elapsed() < self.config.cleanup_interval
            {
                return Ok(());
            }
            *last = Instant::now();
        }
        let conn = self.conn.lock().await;
        self.delete_expired(&conn)?;
        Ok(())
    }

    fn delete_expired(&self, conn: &Connection) -> Result<usize> {
        if self.config.retention.is_zero() {
            return Ok(0);
        }
        let cutoff = Utc::now() - chrono::Duration::from_std(self.config.retention).unwrap_or_default();
        let affected = conn.execute(
            "DELETE FROM idempotency_entries WHERE created_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(affected)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<IdempotencyEntry> {
    let status: String = row.get(4)?;
    let status = match status.as_str() {
        "completed" => IdempotencyStatus::Completed,
        _ => IdempotencyStatus::InProgress,
    };
    let response_json: Option<String> = row.get(6)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(IdempotencyEntry {
        key: row.get(0)?,
        method: row.get(1)?,
        path: row.get(2)?,
        payload_hash: row.get(3)?,
        status,
        status_code: row.get::<_, Option<i64>>(5)?.map(|code| code as u16),
        response_payload: response_json
            .map(|text| serde_json::from_str(&text))
            .transpose()
            .map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(err))
            })?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

/// Canonical (sorted-key) JSON serialization, SHA-256 hashed, giving a
/// stable payload fingerprint regardless of key order or whitespace.
pub fn payload_hash(payload: &Value) -> String {
    let canonical = canonical_json(payload);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let entries: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap(), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", entries.join(","))
        }
        Value::Array(items) => {
            let entries: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", entries.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> IdempotencyStore {
        let dir = tempfile::tempdir().unwrap();
        IdempotencyStore::open(dir.path().join("idempotency.db")).await.unwrap()
    }

    #[tokio::test]
    async fn first_begin_returns_new() {
        let store = store().await;
        let outcome = store.begin("k1", "POST", "/run", &json!({"a": 1})).await.unwrap();
        assert!(matches!(outcome, BeginOutcome::New));
    }

    #[tokio::test]
    async fn repeated_begin_while_in_progress_returns_in_progress() {
        let store = store().await;
        store.begin("k1", "POST", "/run", &json!({"a": 1})).await.unwrap();
        let outcome = store.begin("k1", "POST", "/run", &json!({"a": 1})).await.unwrap();
        assert!(matches!(outcome, BeginOutcome::InProgress));
    }

    #[tokio::test]
    async fn completed_request_is_replayed() {
        let store = store().await;
        store.begin("k1", "POST", "/run", &json!({"a": 1})).await.unwrap();
        store.complete("k1", "POST", "/run", 200, &json!({"ok": true})).await.unwrap();
        let outcome = store.begin("k1", "POST", "/run", &json!({"a": 1})).await.unwrap();
        match outcome {
            BeginOutcome::Replay(entry) => {
                assert_eq!(entry.status_code, Some(200));
                assert_eq!(entry.response_payload, Some(json!({"ok": true})));
            }
            other => panic!("expected Replay, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn same_key_with_different_payload_conflicts() {
        let store = store().await;
        store.begin("k1", "POST", "/run", &json!({"a": 1})).await.unwrap();
        let outcome = store.begin("k1", "POST", "/run", &json!({"a": 2})).await.unwrap();
        assert!(matches!(outcome, BeginOutcome::Conflict));
    }

    #[test]
    fn canonical_hash_is_stable_across_key_order() {
        let a = payload_hash(&json!({"a": 1, "b": 2}));
        let b = payload_hash(&json!({"b": 2, "a": 1}));
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn prune_expired_removes_old_entries_but_keeps_fresh_ones() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdempotencyStore::open_with_config(
            dir.path().join("idempotency.db"),
            IdempotencyStoreConfig {
                retention: Duration::from_secs(0),
                cleanup_interval: Duration::from_secs(0),
            },
        )
        .await
        .unwrap();
        store.begin("stale", "POST", "/run", &json!({"a": 1})).await.unwrap();

        // retention=0 disables expiry entirely.
        assert_eq!(store.prune_expired().await.unwrap(), 0);

        let conn = store.conn.lock().await;
        conn.execute(
            "UPDATE idempotency_entries SET created_at = '2000-01-01T00:00:00Z' WHERE key = 'stale'",
            [],
        )
        .unwrap();
        drop(conn);

        let aged = IdempotencyStore::open_with_config(
            dir.path().join("idempotency.db"),
            IdempotencyStoreConfig {
                retention: Duration::from_secs(60),
                cleanup_interval: Duration::from_secs(0),
            },
        )
        .await
        .unwrap();
        let removed = aged.prune_expired().await.unwrap();
        assert_eq!(removed, 1);
    }
}
