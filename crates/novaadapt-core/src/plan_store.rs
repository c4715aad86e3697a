//! Plan persistence and state-machine driver, built on
//! `novaadapt_orchestrator::transition` for the pure status logic. Every
//! status change here goes through the reducer first so an illegal
//! transition is rejected before any row is written.

use std::sync::Arc;

use chrono::Utc;
use novaadapt_orchestrator::{transition, PlanEvent, PlanStatus, PlanTransitionError};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db;
use novaadapt_types::{Action, ExecutionResult, Plan, PlanProgress};

#[derive(Debug, Error)]
pub enum PlanStoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("plan `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Transition(#[from] PlanTransitionError),
}

type Result<T> = std::result::Result<T, PlanStoreError>;

pub struct PlanStore {
    conn: Arc<Mutex<Connection>>,
}

impl PlanStore {
    pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = db::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS plans (
                id TEXT PRIMARY KEY,
                objective TEXT NOT NULL,
                strategy TEXT NOT NULL,
                model TEXT,
                model_id TEXT,
                actions_json TEXT NOT NULL,
                votes_json TEXT NOT NULL,
                model_errors_json TEXT NOT NULL,
                attempted_models_json TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                approved_at TEXT,
                rejected_at TEXT,
                executed_at TEXT,
                reject_reason TEXT,
                execution_results_json TEXT NOT NULL,
                action_log_ids_json TEXT NOT NULL,
                progress_json TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_plans_created_at ON plans(created_at DESC)",
            [],
        )?;
        Ok(PlanStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        objective: &str,
        strategy: &str,
        model: Option<&str>,
        model_id: Option<&str>,
        actions: Vec<Action>,
        votes: std::collections::HashMap<String, String>,
        model_errors: std::collections::HashMap<String, String>,
        attempted_models: Vec<String>,
    ) -> Result<Plan> {
        let now = Utc::now();
        let plan = Plan {
            id: Uuid::new_v4().simple().to_string(),
            objective: objective.to_string(),
            strategy: strategy.to_string(),
            model: model.map(str::to_string),
            model_id: model_id.map(str::to_string),
            actions,
            votes,
            model_errors,
            attempted_models,
            status: PlanStatus::Pending.as_str().to_string(),
            created_at: now,
            updated_at: now,
            approved_at: None,
            rejected_at: None,
            executed_at: None,
            reject_reason: None,
            execution_results: Vec::new(),
            action_log_ids: Vec::new(),
            progress: PlanProgress::default(),
        };
        self.insert(&plan).await?;
        Ok(plan)
    }

    async fn insert(&self, plan: &Plan) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO plans(
                id, objective, strategy, model, model_id, actions_json, votes_json,
                model_errors_json, attempted_models_json, status, created_at, updated_at,
                approved_at, rejected_at, executed_at, reject_reason,
                execution_results_json, action_log_ids_json, progress_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                plan.id,
                plan.objective,
                plan.strategy,
                plan.model,
                plan.model_id,
                serde_json::to_string(&plan.actions)?,
                serde_json::to_string(&plan.votes)?,
                serde_json::to_string(&plan.model_errors)?,
                serde_json::to_string(&plan.attempted_models)?,
                plan.status,
                plan.created_at.to_rfc3339(),
                plan.updated_at.to_rfc3339(),
                plan.approved_at.map(|dt| dt.to_rfc3339()),
                plan.rejected_at.map(|dt| dt.to_rfc3339()),
                plan.executed_at.map(|dt| dt.to_rfc3339()),
                plan.reject_reason,
                serde_json::to_string(&plan.execution_results)?,
                serde_json::to_string(&plan.action_log_ids)?,
                serde_json::to_string(&plan.progress)?,
            ],
        )?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Plan>> {
        let conn = self.conn.lock().await;
        conn.query_row(SELECT_SQL, params![id], row_to_plan)
            .optional()
            .map_err(PlanStoreError::from)
    }

    pub async fn list(&self, limit: i64) -> Result<Vec<Plan>> {
        let limit = limit.max(1);
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{} ORDER BY created_at DESC LIMIT ?1",
            SELECT_SQL.trim_end_matches("WHERE id = ?1")
        ))?;
        let rows = stmt.query_map(params![limit], row_to_plan)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Applies a pure state-machine event and persists the resulting
    /// status plus the relevant timestamp. Returns the updated plan.
    pub async fn apply_event(&self, id: &str, event: PlanEvent) -> Result<Plan> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| PlanStoreError::NotFound(id.to_string()))?;
        let from_status: PlanStatus = current.status.parse().map_err(|_| {
            PlanStoreError::NotFound(format!("plan `{id}` has unrecognized status"))
        })?;
        let reject_reason = if let PlanEvent::Reject { reason } = &event {
            Some(reason.clone())
        } else {
            None
        };
        let next = transition(from_status, &event)?;
        let now = Utc::now();

        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE plans SET
                status = ?1,
                updated_at = ?2,
                approved_at = CASE WHEN ?3 THEN COALESCE(approved_at, ?2) ELSE approved_at END,
                rejected_at = CASE WHEN ?4 THEN ?2 ELSE rejected_at END,
                executed_at = CASE WHEN ?5 THEN ?2 ELSE executed_at END,
                reject_reason = COALESCE(?6, reject_reason)
             WHERE id = ?7",
            params![
                next.as_str(),
                now.to_rfc3339(),
                matches!(next, PlanStatus::Approved | PlanStatus::Executing),
                matches!(next, PlanStatus::Rejected),
                matches!(next, PlanStatus::Executed | PlanStatus::Failed),
                reject_reason,
                id,
            ],
        )?;
        drop(conn);
        self.get(id).await?.ok_or_else(|| PlanStoreError::NotFound(id.to_string()))
    }

    /// Appends execution results, action-log ids, and progress for the
    /// action most recently dispatched.
    pub async fn append_execution(
        &self,
        id: &str,
        result: ExecutionResult,
        action_log_id: i64,
        total: usize,
    ) -> Result<Plan> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| PlanStoreError::NotFound(id.to_string()))?;
        let mut execution_results = current.execution_results;
        execution_results.push(result);
        let mut action_log_ids = current.action_log_ids;
        action_log_ids.push(action_log_id);
        let progress = PlanProgress {
            completed: execution_results.len(),
            total,
        };
        let now = Utc::now();

        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE plans SET execution_results_json = ?1, action_log_ids_json = ?2, progress_json = ?3, updated_at = ?4 WHERE id = ?5",
            params![
                serde_json::to_string(&execution_results)?,
                serde_json::to_string(&action_log_ids)?,
                serde_json::to_string(&progress)?,
                now.to_rfc3339(),
                id,
            ],
        )?;
        drop(conn);
        self.get(id).await?.ok_or_else(|| PlanStoreError::NotFound(id.to_string()))
    }

    pub async fn set_model_error(&self, id: &str, model: &str, error: &str) -> Result<()> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| PlanStoreError::NotFound(id.to_string()))?;
        let mut model_errors = current.model_errors;
        model_errors.insert(model.to_string(), error.to_string());
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE plans SET model_errors_json = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(&model_errors)?, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }
}

const SELECT_SQL: &str = "SELECT id, objective, strategy, model, model_id, actions_json, votes_json,
    model_errors_json, attempted_models_json, status, created_at, updated_at,
    approved_at, rejected_at, executed_at, reject_reason,
    execution_results_json, action_log_ids_json, progress_json
    FROM plans WHERE id = ?1";

fn row_to_plan(row: &rusqlite::Row<'_>) -> rusqlite::Result<Plan> {
    let parse_dt = |s: Option<String>| -> Option<chrono::DateTime<Utc>> {
        s.and_then(|text| chrono::DateTime::parse_from_rfc3339(&text).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };
    let from_json = |field: usize, text: String| -> rusqlite::Result<_> {
        serde_json::from_str(&text).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(field, rusqlite::types::Type::Text, Box::new(err))
        })
    };

    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;

    Ok(Plan {
        id: row.get(0)?,
        objective: row.get(1)?,
        strategy: row.get(2)?,
        model: row.get(3)?,
        model_id: row.get(4)?,
        actions: from_json(5, row.get(5)?)?,
        votes: from_json(6, row.get(6)?)?,
        model_errors: from_json(7, row.get(7)?)?,
        attempted_models: from_json(8, row.get(8)?)?,
        status: row.get(9)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        approved_at: parse_dt(row.get(12)?),
        rejected_at: parse_dt(row.get(13)?),
        executed_at: parse_dt(row.get(14)?),
        reject_reason: row.get(15)?,
        execution_results: from_json(16, row.get(16)?)?,
        action_log_ids: from_json(17, row.get(17)?)?,
        progress: from_json(18, row.get(18)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    async fn store() -> PlanStore {
        let dir = tempfile::tempdir().unwrap();
        PlanStore::open(dir.path().join("plans.db")).await.unwrap()
    }

    #[tokio::test]
    async fn create_persists_pending_plan() {
        let store = store().await;
        let plan = store
            .create("do the thing", "single", Some("gpt"), None, vec![], HashMap::new(), HashMap::new(), vec![])
            .await
            .unwrap();
        assert_eq!(plan.status, "pending");
        let fetched = store.get(&plan.id).await.unwrap().unwrap();
        assert_eq!(fetched.objective, "do the thing");
    }

    #[tokio::test]
    async fn approve_without_execute_transitions_to_approved() {
        let store = store().await;
        let plan = store
            .create("obj", "single", None, None, vec![], HashMap::new(), HashMap::new(), vec![])
            .await
            .unwrap();
        let updated = store
            .apply_event(&plan.id, PlanEvent::Approve { execute: false })
            .await
            .unwrap();
        assert_eq!(updated.status, "approved");
        assert!(updated.approved_at.is_some());
    }

    #[tokio::test]
    async fn reject_from_pending_sets_reason() {
        let store = store().await;
        let plan = store
            .create("obj", "single", None, None, vec![], HashMap::new(), HashMap::new(), vec![])
            .await
            .unwrap();
        let updated = store
            .apply_event(&plan.id, PlanEvent::Reject { reason: "nope".to_string() })
            .await
            .unwrap();
        assert_eq!(updated.status, "rejected");
        assert_eq!(updated.reject_reason.as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn rejecting_an_executed_plan_is_illegal() {
        let store = store().await;
        let plan = store
            .create("obj", "single", None, None, vec![], HashMap::new(), HashMap::new(), vec![])
            .await
            .unwrap();
        store
            .apply_event(&plan.id, PlanEvent::Approve { execute: true })
            .await
            .unwrap();
        store
            .apply_event(&plan.id, PlanEvent::ExecutionFinished { all_ok: true })
            .await
            .unwrap();
        let err = store
            .apply_event(&plan.id, PlanEvent::Reject { reason: "too late".to_string() })
            .await
            .unwrap_err();
        assert!(matches!(err, PlanStoreError::Transition(PlanTransitionError::AlreadyExecuted)));
    }

    #[tokio::test]
    async fn append_execution_updates_progress() {
        let store = store().await;
        let plan = store
            .create("obj", "single", None, None, vec![], HashMap::new(), HashMap::new(), vec![])
            .await
            .unwrap();
        let action = Action { r#type: "click".into(), target: "OK".into(), value: None, undo: None };
        let result = ExecutionResult {
            status: "ok".into(),
            output: "done".into(),
            action: action.clone(),
            dangerous: false,
            attempts: Some(1),
        };
        let updated = store.append_execution(&plan.id, result, 1, 2).await.unwrap();
        assert_eq!(updated.progress.completed, 1);
        assert_eq!(updated.progress.total, 2);
        assert_eq!(updated.action_log_ids, vec![1]);
    }
}
