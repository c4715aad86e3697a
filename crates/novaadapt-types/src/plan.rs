use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Action;

/// One attempted action's outcome, appended to `Plan::execution_results`
/// as execution proceeds. `attempts` counts the dispatch retry loop
/// (1 on first-try success).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: String,
    pub output: String,
    pub action: Action,
    pub dangerous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

/// `{completed, total}` progress counter updated atomically alongside
/// each execution-result append.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PlanProgress {
    pub completed: usize,
    pub total: usize,
}

/// A persisted, approvable action plan. `status` is one
/// of the `PlanStatus` variants from `novaadapt-orchestrator`, stored as
/// its `as_str()` string so this leaf crate has no dependency on the pure
/// state-machine crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub objective: String,
    pub strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub votes: HashMap<String, String>,
    #[serde(default)]
    pub model_errors: HashMap<String, String>,
    #[serde(default)]
    pub attempted_models: Vec<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
    #[serde(default)]
    pub execution_results: Vec<ExecutionResult>,
    #[serde(default)]
    pub action_log_ids: Vec<i64>,
    #[serde(default)]
    pub progress: PlanProgress,
}
