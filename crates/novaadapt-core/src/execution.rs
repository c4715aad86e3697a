//! Plan execution driver: generalizes the agent's dispatch loop
//! (`agent::Agent::run_objective`) with per-action retry and backoff, and
//! persists through `PlanStore::append_execution` after every single
//! action so SSE readers observe intermediate progress.

use std::sync::Arc;
use std::time::Duration;

use novaadapt_orchestrator::PlanEvent;
use novaadapt_types::{Action, ExecutionResult, Plan};
use thiserror::Error;

use crate::action_log::{ActionLog, ActionLogError};
use crate::plan_store::{PlanStore, PlanStoreError};
use crate::policy::ActionPolicy;
use crate::transport::ExecutionTransport;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Plan(#[from] PlanStoreError),
    #[error(transparent)]
    ActionLog(#[from] ActionLogError),
    #[error("plan `{0}` not found")]
    NotFound(String),
}

type Result<T> = std::result::Result<T, ExecutionError>;

/// Options for one execution pass over a plan's actions.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub allow_dangerous: bool,
    pub max_actions: usize,
    pub action_retry_attempts: u32,
    pub action_retry_backoff_seconds: f64,
    pub retry_failed_only: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        ExecuteOptions {
            allow_dangerous: false,
            max_actions: usize::MAX,
            action_retry_attempts: 0,
            action_retry_backoff_seconds: 0.25,
            retry_failed_only: false,
        }
    }
}

/// Drives a plan already transitioned into `executing` through its
/// action list, persisting one `append_execution` per action so
/// readers (including SSE streams) observe intermediate progress, then
/// moves the plan to `executed` or `failed`.
pub struct PlanExecutor {
    plans: Arc<PlanStore>,
    policy: ActionPolicy,
    transport: Arc<dyn ExecutionTransport>,
    action_log: Arc<ActionLog>,
}

impl PlanExecutor {
    pub fn new(
        plans: Arc<PlanStore>,
        transport: Arc<dyn ExecutionTransport>,
        action_log: Arc<ActionLog>,
    ) -> Self {
        PlanExecutor {
            plans,
            policy: ActionPolicy::new(),
            transport,
            action_log,
        }
    }

    /// Runs (or resumes, for retry-failed-only) one execution pass and
    /// returns the plan in its final `executed`/`failed` state. The
    /// caller is responsible for having already transitioned the plan
    /// into `executing` via `PlanStore::apply_event`.
    pub async fn run(&self, plan_id: &str, options: ExecuteOptions) -> Result<Plan> {
        let plan = self
            .plans
            .get(plan_id)
            .await?
            .ok_or_else(|| ExecutionError::NotFound(plan_id.to_string()))?;

        let indices: Vec<usize> = if options.retry_failed_only {
            plan.execution_results
                .iter()
                .enumerate()
                .filter(|(_, result)| matches!(result.status.as_str(), "failed" | "blocked"))
                .map(|(idx, _)| idx)
                .collect()
        } else {
            (0..plan.actions.len())
                .take(options.max_actions.max(1))
                .collect()
        };

        let total = plan.actions.len();
        let mut all_ok = true;

        for idx in indices {
            let Some(current) = self.plans.get(plan_id).await? else {
                return Err(ExecutionError::NotFound(plan_id.to_string()));
            };
            if current.status != "executing" {
                // Plan status was changed out from under us; abort rather
                // than keep dispatching against a plan someone else moved.
                all_ok = false;
                break;
            }

            let action = &plan.actions[idx];
            let (result, log_status) = self.dispatch_one(action, &options).await;
            if result.status != "ok" {
                all_ok = false;
            }

            let log_id = self.action_log.record(&result.action, log_status).await?;
            self.plans.append_execution(plan_id, result, log_id, total).await?;
        }

        let finished = self
            .plans
            .apply_event(plan_id, PlanEvent::ExecutionFinished { all_ok })
            .await?;
        Ok(finished)
    }

    async fn dispatch_one(
        &self,
        action: &Action,
        options: &ExecuteOptions,
    ) -> (ExecutionResult, &'static str) {
        let decision = self.policy.evaluate(action, options.allow_dangerous);
        if !decision.allowed {
            let result = ExecutionResult {
                status: "blocked".to_string(),
                output: decision.reason,
                action: action.clone(),
                dangerous: decision.dangerous,
                attempts: None,
            };
            return (result, "blocked");
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = self.transport.execute(action, false).await;
            let (status, output, dispatched) = match outcome {
                Ok(out) => (out.status, out.output, out.action),
                Err(err) => ("failed".to_string(), err.to_string(), action.clone()),
            };

            if status == "ok" || attempt > options.action_retry_attempts {
                let result = ExecutionResult {
                    status: status.clone(),
                    output,
                    action: dispatched,
                    dangerous: decision.dangerous,
                    attempts: Some(attempt),
                };
                let log_status: &'static str = if status == "ok" { "ok" } else { "failed" };
                return (result, log_status);
            }

            let delay = options.action_retry_backoff_seconds * 2f64.powi((attempt - 1) as i32);
            tokio::time::sleep(Duration::from_secs_f64(delay.max(0.0))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    use crate::transport::{TransportHealth, TransportOutcome};
    use novaadapt_orchestrator::PlanEvent;

    struct ScriptedTransport {
        replies: AsyncMutex<Vec<&'static str>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExecutionTransport for ScriptedTransport {
        async fn execute(&self, action: &Action, _dry_run: bool) -> anyhow::Result<TransportOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().await;
            let status = if replies.is_empty() { "ok" } else { replies.remove(0) };
            Ok(TransportOutcome {
                status: status.to_string(),
                output: "done".to_string(),
                action: action.clone(),
            })
        }

        async fn probe(&self) -> anyhow::Result<TransportHealth> {
            Ok(TransportHealth { ok: true, detail: "scripted".to_string() })
        }
    }

    async fn setup() -> (PlanStore, ActionLog) {
        let dir = tempfile::tempdir().unwrap();
        let plans = PlanStore::open(dir.path().join("plans.db")).await.unwrap();
        let action_log = ActionLog::open(dir.path().join("actions.db")).await.unwrap();
        (plans, action_log)
    }

    #[tokio::test]
    async fn retries_until_success_and_reports_attempts() {
        let (plans, action_log) = setup().await;
        let action = Action { r#type: "type".into(), target: "Search".into(), value: Some("hi".into()), undo: None };
        let plan = plans
            .create("obj", "single", None, None, vec![action], Default::default(), Default::default(), vec![])
            .await
            .unwrap();
        plans.apply_event(&plan.id, PlanEvent::Approve { execute: true }).await.unwrap();

        let transport = Arc::new(ScriptedTransport {
            replies: AsyncMutex::new(vec!["failed", "failed"]),
            calls: AtomicUsize::new(0),
        });
        let executor = PlanExecutor::new(Arc::new(plans), transport, Arc::new(action_log));
        let options = ExecuteOptions {
            action_retry_attempts: 2,
            action_retry_backoff_seconds: 0.0,
            ..ExecuteOptions::default()
        };
        let finished = executor.run(&plan.id, options).await.unwrap();
        assert_eq!(finished.status, "executed");
        assert_eq!(finished.execution_results[0].attempts, Some(3));
    }

    #[tokio::test]
    async fn retry_failed_only_targets_previously_failed_actions() {
        let (plans, action_log) = setup().await;
        let a1 = Action { r#type: "click".into(), target: "A".into(), value: None, undo: None };
        let a2 = Action { r#type: "click".into(), target: "B".into(), value: None, undo: None };
        let a3 = Action { r#type: "click".into(), target: "C".into(), value: None, undo: None };
        let plan = plans
            .create("obj", "single", None, None, vec![a1.clone(), a2.clone(), a3.clone()], Default::default(), Default::default(), vec![])
            .await
            .unwrap();
        plans.apply_event(&plan.id, PlanEvent::Approve { execute: true }).await.unwrap();

        plans
            .append_execution(&plan.id, ExecutionResult { status: "ok".into(), output: "done".into(), action: a1, dangerous: false, attempts: Some(1) }, 1, 3)
            .await
            .unwrap();
        plans
            .append_execution(&plan.id, ExecutionResult { status: "failed".into(), output: "boom".into(), action: a2, dangerous: false, attempts: Some(1) }, 2, 3)
            .await
            .unwrap();
        plans
            .append_execution(&plan.id, ExecutionResult { status: "ok".into(), output: "done".into(), action: a3, dangerous: false, attempts: Some(1) }, 3, 3)
            .await
            .unwrap();
        plans.apply_event(&plan.id, PlanEvent::ExecutionFinished { all_ok: false }).await.unwrap();
        plans.apply_event(&plan.id, PlanEvent::RetryFailedStarted).await.unwrap();

        let transport = Arc::new(ScriptedTransport { replies: AsyncMutex::new(vec![]), calls: AtomicUsize::new(0) });
        let plans = Arc::new(plans);
        let executor = PlanExecutor::new(plans.clone(), transport.clone(), Arc::new(action_log));
        let options = ExecuteOptions { retry_failed_only: true, ..ExecuteOptions::default() };
        let finished = executor.run(&plan.id, options).await.unwrap();

        assert_eq!(finished.status, "executed");
        assert_eq!(finished.execution_results.len(), 4);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
