//! Wire-format request/response shapes for the novaadapt HTTP API
//!, kept separate from the storage-internal types in
//! `novaadapt-types` so a route's JSON body can evolve independently of
//! how a store persists it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use novaadapt_types::{Action, AsyncJob, Plan};

fn default_strategy() -> String {
    "single".to_string()
}

fn default_max_actions() -> u32 {
    25
}

/// Body of `POST /run`, `/run_async`, `/plans`.
#[derive(Debug, Clone, Deserialize)]
pub struct RunObjectiveRequest {
    pub objective: String,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub candidates: Vec<String>,
    #[serde(default)]
    pub fallbacks: Vec<String>,
    #[serde(default)]
    pub execute: bool,
    #[serde(default = "default_true")]
    pub record_history: bool,
    #[serde(default)]
    pub allow_dangerous: bool,
    #[serde(default = "default_max_actions")]
    pub max_actions: u32,
}

fn default_true() -> bool {
    true
}

/// Response of a synchronous `/run` or the dry-run preview folded into a
/// created plan.
#[derive(Debug, Clone, Serialize)]
pub struct RunObjectiveResponse {
    pub model: String,
    pub model_id: String,
    pub strategy: String,
    pub votes: std::collections::HashMap<String, String>,
    pub model_errors: std::collections::HashMap<String, String>,
    pub attempted_models: Vec<String>,
    pub actions: Vec<Action>,
    pub results: Vec<novaadapt_types::ExecutionResult>,
    pub action_log_ids: Vec<i64>,
}

/// Body of `POST /swarm/run`.
#[derive(Debug, Clone, Deserialize)]
pub struct SwarmRunRequest {
    pub objectives: Vec<String>,
    #[serde(default)]
    pub max_agents: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwarmRunResponse {
    pub job_ids: Vec<String>,
    pub accepted: usize,
    pub rejected: usize,
}

/// Body of `POST /undo` and `POST /plans/{id}/undo`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UndoRequest {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub mark_only: bool,
    #[serde(default)]
    pub execute: bool,
}

/// Body of `POST /plans/{id}/approve` and `/approve_async`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApprovePlanRequest {
    #[serde(default = "default_true")]
    pub execute: bool,
    #[serde(default)]
    pub allow_dangerous: bool,
    #[serde(default)]
    pub max_actions: Option<usize>,
    #[serde(default)]
    pub action_retry_attempts: u32,
    #[serde(default = "default_retry_backoff")]
    pub action_retry_backoff_seconds: f64,
    #[serde(default)]
    pub retry_failed_only: bool,
}

fn default_retry_backoff() -> f64 {
    0.25
}

/// Body of `POST /plans/{id}/reject`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RejectPlanRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// `{job_id, status}` envelope returned by every `*_async` route (202).
#[derive(Debug, Clone, Serialize)]
pub struct AsyncJobAccepted {
    pub job_id: String,
    pub status: &'static str,
    pub kind: String,
}

/// Uniform error body.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub request_id: String,
}

/// `GET /models` response entry.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub name: String,
    pub model: String,
    pub provider: String,
    pub base_url: String,
}

/// `POST /check` query/body and response entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckRequest {
    #[serde(default)]
    pub models: Option<Vec<String>>,
    #[serde(default)]
    pub probe_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub model: String,
    pub provider: String,
    pub ok: bool,
    pub latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `GET /health` response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checks: Option<Vec<HealthCheck>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// `GET /dashboard/data` response: plan/job counts by status plus a
/// recent-audit feed for an external dashboard frontend to render.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardData {
    pub plans_by_status: std::collections::HashMap<String, i64>,
    pub jobs_by_status: std::collections::HashMap<String, i64>,
    pub recent_audit: Vec<novaadapt_types::AuditEvent>,
}

/// `GET /history` response entry (the undo/action log).
pub type HistoryEntry = novaadapt_types::ActionLogEntry;

/// Query params shared by list routes (`limit`, and audit filters).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub category: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub since_id: Option<i64>,
}

/// Query params for SSE stream routes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamQuery {
    pub timeout: Option<f64>,
    pub interval: Option<f64>,
}

/// Query params for `GET /health`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthQuery {
    #[serde(default)]
    pub deep: Option<i32>,
    #[serde(default)]
    pub execution: Option<i32>,
}

pub fn plan_response(plan: &Plan) -> Value {
    serde_json::to_value(plan).unwrap_or(Value::Null)
}

pub fn job_response(job: &AsyncJob) -> Value {
    serde_json::to_value(job).unwrap_or(Value::Null)
}
