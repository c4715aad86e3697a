//! Append-only audit event store: SQLite-backed, retry-on-busy writes,
//! indexed lookups, lazy TTL cleanup gated by a cleanup interval.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::db;
use novaadapt_types::AuditEvent;

#[derive(Debug, Error)]
pub enum AuditStoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, AuditStoreError>;

#[derive(Debug, Clone)]
pub struct AuditStoreConfig {
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub retention: Duration,
    pub cleanup_interval: Duration,
}

impl Default for AuditStoreConfig {
    fn default() -> Self {
        AuditStoreConfig {
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(20),
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ListFilter {
    pub category: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub since_id: Option<i64>,
}

/// Append-only event log backing `/events` and dashboard summaries (spec
/// §4.8). Invariant 4: ids are strictly increasing in insertion order.
pub struct AuditStore {
    conn: Arc<Mutex<Connection>>,
    config: AuditStoreConfig,
    last_cleanup: Arc<Mutex<Instant>>,
    next_id_hint: AtomicI64,
}

impl AuditStore {
    pub async fn open(path: impl AsRef<std::path::Path>, config: AuditStoreConfig) -> Result<Self> {
        let conn = db::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                category TEXT NOT NULL,
                action TEXT NOT NULL,
                status TEXT NOT NULL,
                request_id TEXT,
                entity_type TEXT,
                entity_id TEXT,
                payload_json TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_events_category_id ON audit_events(category, id DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_events_entity ON audit_events(entity_type, entity_id, id DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_events_created_at ON audit_events(created_at)",
            [],
        )?;
        Ok(AuditStore {
            conn: Arc::new(Mutex::new(conn)),
            config,
            last_cleanup: Arc::new(Mutex::new(Instant::now() - Duration::from_secs(3600))),
            next_id_hint: AtomicI64::new(0),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn append(
        &self,
        category: &str,
        action: &str,
        status: &str,
        request_id: Option<&str>,
        entity_type: Option<&str>,
        entity_id: Option<&str>,
        payload: Option<&Value>,
    ) -> Result<AuditEvent> {
        let now = Utc::now();
        let payload_json = payload.map(|v| serde_json::to_string(v)).transpose()?;
        let category = category.to_string();
        let action = action.to_string();
        let status = status.to_string();
        let request_id = request_id.map(str::to_string);
        let entity_type = entity_type.map(str::to_string);
        let entity_id = entity_id.map(str::to_string);

        self.cleanup_expired_if_due().await?;

        let id = self
            .with_retry(|conn| {
                conn.execute(
                    "INSERT INTO audit_events(created_at, category, action, status, request_id, entity_type, entity_id, payload_json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        now.to_rfc3339(),
                        category,
                        action,
                        status,
                        request_id,
                        entity_type,
                        entity_id,
                        payload_json,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        self.next_id_hint.store(id, Ordering::Relaxed);

        self.get(id)
            .await?
            .ok_or_else(|| AuditStoreError::Database(rusqlite::Error::QueryReturnedNoRows))
    }

    pub async fn get(&self, id: i64) -> Result<Option<AuditEvent>> {
        self.with_retry(|conn| {
            conn.query_row(
                "SELECT id, created_at, category, action, status, request_id, entity_type, entity_id, payload_json
                 FROM audit_events WHERE id = ?1",
                params![id],
                row_to_event,
            )
            .optional()
        })
        .await
    }

    pub async fn list(&self, limit: i64, filter: ListFilter) -> Result<Vec<AuditEvent>> {
        let limit = limit.max(1);
        self.with_retry(move |conn| {
            let mut clauses = Vec::new();
            let mut bound: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(category) = &filter.category {
                clauses.push("category = ?".to_string());
                bound.push(Box::new(category.clone()));
            }
            if let Some(entity_type) = &filter.entity_type {
                clauses.push("entity_type = ?".to_string());
                bound.push(Box::new(entity_type.clone()));
            }
            if let Some(entity_id) = &filter.entity_id {
                clauses.push("entity_id = ?".to_string());
                bound.push(Box::new(entity_id.clone()));
            }
            if let Some(since_id) = filter.since_id {
                clauses.push("id > ?".to_string());
                bound.push(Box::new(since_id));
            }
            let where_sql = if clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clauses.join(" AND "))
            };
            bound.push(Box::new(limit));
            let sql = format!(
                "SELECT id, created_at, category, action, status, request_id, entity_type, entity_id, payload_json
                 FROM audit_events {where_sql} ORDER BY id DESC LIMIT ?"
            );
            let mut stmt = conn.prepare(&sql)?;
            let params_ref: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
            let rows = stmt.query_map(params_ref.as_slice(), row_to_event)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    pub async fn prune_expired(&self) -> Result<usize> {
        self.with_retry(|conn| self.delete_expired(conn, true)).await
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
        self.with_retry(|conn| self.delete_expired(conn, false)).await?;
        Ok(())
    }

    fn delete_expired(&self, conn: &Connection, _force: bool) -> rusqlite::Result<usize> {
        if self.config.retention.is_zero() {
            return Ok(0);
        }
        let cutoff = Utc::now() - chrono::Duration::from_std(self.config.retention).unwrap_or_default();
        let affected = conn.execute(
            "DELETE FROM audit_events WHERE created_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(affected)
    }

    async fn with_retry<T>(
        &self,
        op: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock().await;
        let mut attempt = 0;
        loop {
            match op(&conn) {
                Ok(value) => return Ok(value),
                Err(err) if db::is_retryable_sqlite_error(&err) && attempt + 1 < self.config.retry_attempts => {
                    attempt += 1;
                    let delay = self.config.retry_backoff * 2u32.pow(attempt - 1);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEvent> {
    let created_at: String = row.get(1)?;
    let payload_json: Option<String> = row.get(8)?;
    Ok(AuditEvent {
        id: row.get(0)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        category: row.get(2)?,
        action: row.get(3)?,
        status: row.get(4)?,
        request_id: row.get(5)?,
        entity_type: row.get(6)?,
        entity_id: row.get(7)?,
        payload: payload_json
            .map(|text| serde_json::from_str(&text))
            .transpose()
            .map_err(|err| rusqlite::Error::FromSqlConversionFailure(
                8,
                rusqlite::types::Type::Text,
                Box::new(err),
            ))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> AuditStore {
        let dir = tempfile::tempdir().unwrap();
        AuditStore::open(dir.path().join("audit.db"), AuditStoreConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn append_ids_are_strictly_increasing() {
        let store = store().await;
        let first = store.append("plans", "create", "ok", None, None, None, None).await.unwrap();
        let second = store.append("plans", "approve", "ok", None, None, None, None).await.unwrap();
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn list_since_id_returns_only_newer_rows() {
        let store = store().await;
        let first = store.append("a", "x", "ok", None, None, None, None).await.unwrap();
        let second = store.append("a", "y", "ok", None, None, None, None).await.unwrap();
        let rows = store
            .list(100, ListFilter { since_id: Some(first.id), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, second.id);
    }

    #[tokio::test]
    async fn list_filters_by_category() {
        let store = store().await;
        store.append("plans", "create", "ok", None, None, None, None).await.unwrap();
        store.append("jobs", "submit", "ok", None, None, None, None).await.unwrap();
        let rows = store
            .list(100, ListFilter { category: Some("jobs".to_string()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].category, "jobs");
    }

    #[tokio::test]
    async fn get_returns_none_for_missing_id() {
        let store = store().await;
        assert!(store.get(999).await.unwrap().is_none());
    }
}
