use serde::{Deserialize, Serialize};

/// States of the plan state machine.
///
/// `pending -> approved | rejected`; `approved -> executing -> executed | failed`;
/// `pending -> executing` is allowed when approval requests immediate execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Approved,
    Executing,
    Executed,
    Failed,
    Rejected,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PlanStatus::Executed | PlanStatus::Failed | PlanStatus::Rejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlanStatus::Pending => "pending",
            PlanStatus::Approved => "approved",
            PlanStatus::Executing => "executing",
            PlanStatus::Executed => "executed",
            PlanStatus::Failed => "failed",
            PlanStatus::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for PlanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PlanStatus::Pending),
            "approved" => Ok(PlanStatus::Approved),
            "executing" => Ok(PlanStatus::Executing),
            "executed" => Ok(PlanStatus::Executed),
            "failed" => Ok(PlanStatus::Failed),
            "rejected" => Ok(PlanStatus::Rejected),
            other => Err(format!("unknown plan status `{other}`")),
        }
    }
}

/// Events that drive a plan's transitions. These mirror the HTTP-level
/// operations exposed over the plan routes; the reducer is pure and
/// performs no I/O.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanEvent {
    Approve { execute: bool },
    ApproveExecuteStarted,
    ExecutionFinished { all_ok: bool },
    RetryFailedStarted,
    Reject { reason: String },
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PlanTransitionError {
    #[error("plan is already executing")]
    AlreadyExecuting,
    #[error("plan is already executed")]
    AlreadyExecuted,
    #[error("plan is already rejected")]
    AlreadyRejected,
    #[error("plan is already failed")]
    AlreadyFailed,
    #[error("retry_failed requires the plan to currently be in `failed`")]
    NotFailed,
    #[error("illegal transition `{event}` from state `{from}`")]
    Illegal { from: &'static str, event: &'static str },
}
