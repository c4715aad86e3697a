//! Append-only action log: every dispatched action is recorded with its
//! outcome, and `undone` is the single field mutated after insertion once
//! its paired undo action has been executed.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::db;
use novaadapt_types::{Action, ActionLogEntry};

#[derive(Debug, Error)]
pub enum ActionLogError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, ActionLogError>;

pub struct ActionLog {
    conn: Arc<Mutex<Connection>>,
}

impl ActionLog {
    pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = db::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS action_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action_json TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                undone INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        Ok(ActionLog {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn record(&self, action: &Action, status: &str) -> Result<i64> {
        let payload = serde_json::to_string(action)?;
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO action_log(action_json, status, created_at, undone) VALUES (?1, ?2, ?3, 0)",
            params![payload, status, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn mark_undone(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("UPDATE action_log SET undone = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<Option<ActionLogEntry>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, action_json, status, created_at, undone FROM action_log WHERE id = ?1",
            params![id],
            row_to_entry,
        )
        .optional()
        .map_err(ActionLogError::from)
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<ActionLogEntry>> {
        let limit = limit.max(1);
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, action_json, status, created_at, undone FROM action_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_entry)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActionLogEntry> {
    let action_json: String = row.get(1)?;
    let created_at: String = row.get(3)?;
    let action: Action = serde_json::from_str(&action_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(err))
    })?;
    let undo_action = action.undo.as_deref().cloned();
    Ok(ActionLogEntry {
        id: row.get(0)?,
        action,
        status: row.get(2)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        undone: row.get::<_, i64>(4)? != 0,
        undo_action,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn log() -> ActionLog {
        let dir = tempfile::tempdir().unwrap();
        ActionLog::open(dir.path().join("actions.db")).await.unwrap()
    }

    fn action() -> Action {
        Action {
            r#type: "click".to_string(),
            target: "OK".to_string(),
            value: None,
            undo: None,
        }
    }

    #[tokio::test]
    async fn record_then_get_round_trips() {
        let log = log().await;
        let id = log.record(&action(), "ok").await.unwrap();
        let entry = log.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, "ok");
        assert!(!entry.undone);
    }

    #[tokio::test]
    async fn mark_undone_flips_flag() {
        let log = log().await;
        let id = log.record(&action(), "ok").await.unwrap();
        log.mark_undone(id).await.unwrap();
        let entry = log.get(id).await.unwrap().unwrap();
        assert!(entry.undone);
    }

    #[tokio::test]
    async fn recent_returns_newest_first() {
        let log = log().await;
        let first = log.record(&action(), "ok").await.unwrap();
        let second = log.record(&action(), "ok").await.unwrap();
        let rows = log.recent(10).await.unwrap();
        assert_eq!(rows[0].id, second);
        assert_eq!(rows[1].id, first);
    }
}
