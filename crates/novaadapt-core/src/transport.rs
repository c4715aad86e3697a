//! Execution transport abstraction, built as an `#[async_trait]` interface:
//! the orchestrator depends only on this trait, and a subprocess/HTTP/
//! daemon/native/browser transport can be swapped in without touching the
//! plan or agent logic.

use async_trait::async_trait;
use novaadapt_types::Action;
use serde::{Deserialize, Serialize};

/// Outcome of dispatching one action, lighter than `ExecutionResult`:
/// the `dangerous`/`attempts` bookkeeping is added by the plan store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportOutcome {
    pub status: String,
    pub output: String,
    pub action: Action,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportHealth {
    pub ok: bool,
    pub detail: String,
}

/// The orchestrator's only dependency on "how an action actually runs".
/// Implementations must never mutate external state when `dry_run` is
/// true.
#[async_trait]
pub trait ExecutionTransport: Send + Sync {
    async fn execute(&self, action: &Action, dry_run: bool) -> anyhow::Result<TransportOutcome>;
    async fn probe(&self) -> anyhow::Result<TransportHealth>;
}

/// An in-process transport that never touches the outside world: in
/// `dry_run` it previews, and in live mode it still only echoes the
/// action back with status `ok`. Exists so the crate is runnable and
/// testable without a real subprocess/HTTP/daemon transport wired in;
/// richer transports (subprocess, HTTP, daemon, native, browser) are
/// supplied by the deployment, not this crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTransport;

#[async_trait]
impl ExecutionTransport for NoopTransport {
    async fn execute(&self, action: &Action, dry_run: bool) -> anyhow::Result<TransportOutcome> {
        let status = if dry_run { "preview" } else { "ok" };
        Ok(TransportOutcome {
            status: status.to_string(),
            output: format!("{} {}", action.r#type, action.target),
            action: action.clone(),
        })
    }

    async fn probe(&self) -> anyhow::Result<TransportHealth> {
        Ok(TransportHealth {
            ok: true,
            detail: "noop transport".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action() -> Action {
        Action {
            r#type: "click".to_string(),
            target: "OK".to_string(),
            value: None,
            undo: None,
        }
    }

    #[tokio::test]
    async fn dry_run_never_reports_ok() {
        let transport = NoopTransport;
        let outcome = transport.execute(&action(), true).await.unwrap();
        assert_eq!(outcome.status, "preview");
    }

    #[tokio::test]
    async fn live_run_reports_ok() {
        let transport = NoopTransport;
        let outcome = transport.execute(&action(), false).await.unwrap();
        assert_eq!(outcome.status, "ok");
    }

    #[tokio::test]
    async fn probe_reports_healthy() {
        let transport = NoopTransport;
        let health = transport.probe().await.unwrap();
        assert!(health.ok);
    }
}
