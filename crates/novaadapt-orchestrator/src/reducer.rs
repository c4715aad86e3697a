use crate::{PlanEvent, PlanStatus, PlanTransitionError};

/// Pure transition function for the plan state machine. No I/O, no clock
/// reads; callers own persistence and timestamps.
///
/// Concurrent approvals of the same plan are mutually exclusive at the
/// store layer; this function is what the store
/// consults under its write lock to decide whether an event is legal from
/// the plan's current status, and what the resulting status is.
pub fn transition(
    current: PlanStatus,
    event: &PlanEvent,
) -> Result<PlanStatus, PlanTransitionError> {
    use PlanEvent::*;
    use PlanStatus::*;

    match (current, event) {
        (Pending, Approve { execute: false }) => Ok(Approved),
        (Pending, Approve { execute: true }) => Ok(Executing),
        (Pending, Reject { .. }) => Ok(Rejected),
        (Approved, ApproveExecuteStarted) => Ok(Executing),
        (Approved, Reject { .. }) => Ok(Rejected),
        (Executing, ExecutionFinished { all_ok: true }) => Ok(Executed),
        (Executing, ExecutionFinished { all_ok: false }) => Ok(Failed),
        (Failed, RetryFailedStarted) => Ok(Executing),

        (Executing, Approve { .. }) | (Executing, ApproveExecuteStarted) => {
            Err(PlanTransitionError::AlreadyExecuting)
        }
        (Executed, _) => Err(PlanTransitionError::AlreadyExecuted),
        (Rejected, _) => Err(PlanTransitionError::AlreadyRejected),
        (Failed, Approve { .. }) | (Failed, ApproveExecuteStarted) | (Failed, Reject { .. }) => {
            Err(PlanTransitionError::AlreadyFailed)
        }
        (other, RetryFailedStarted) if other != Failed => Err(PlanTransitionError::NotFailed),
        (Executing, Reject { .. }) => Err(PlanTransitionError::Illegal {
            from: current.as_str(),
            event: "reject",
        }),
        (from, event) => Err(PlanTransitionError::Illegal {
            from: from.as_str(),
            event: event_name(event),
        }),
    }
}

fn event_name(event: &PlanEvent) -> &'static str {
    match event {
        PlanEvent::Approve { .. } => "approve",
        PlanEvent::ApproveExecuteStarted => "approve_execute_started",
        PlanEvent::ExecutionFinished { .. } => "execution_finished",
        PlanEvent::RetryFailedStarted => "retry_failed_started",
        PlanEvent::Reject { .. } => "reject",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_approve_without_execute_moves_to_approved() {
        let next = transition(PlanStatus::Pending, &PlanEvent::Approve { execute: false }).unwrap();
        assert_eq!(next, PlanStatus::Approved);
    }

    #[test]
    fn pending_approve_with_execute_moves_straight_to_executing() {
        let next = transition(PlanStatus::Pending, &PlanEvent::Approve { execute: true }).unwrap();
        assert_eq!(next, PlanStatus::Executing);
    }

    #[test]
    fn executing_finish_all_ok_is_executed() {
        let next =
            transition(PlanStatus::Executing, &PlanEvent::ExecutionFinished { all_ok: true }).unwrap();
        assert_eq!(next, PlanStatus::Executed);
    }

    #[test]
    fn executing_finish_any_failed_is_failed() {
        let next =
            transition(PlanStatus::Executing, &PlanEvent::ExecutionFinished { all_ok: false }).unwrap();
        assert_eq!(next, PlanStatus::Failed);
    }

    #[test]
    fn retry_failed_only_allowed_from_failed() {
        let err = transition(PlanStatus::Pending, &PlanEvent::RetryFailedStarted).unwrap_err();
        assert_eq!(err, PlanTransitionError::NotFailed);
        let next = transition(PlanStatus::Failed, &PlanEvent::RetryFailedStarted).unwrap();
        assert_eq!(next, PlanStatus::Executing);
    }

    #[test]
    fn terminal_states_reject_every_further_event() {
        for terminal in [PlanStatus::Executed, PlanStatus::Rejected] {
            assert!(transition(terminal, &PlanEvent::Approve { execute: false }).is_err());
            assert!(transition(terminal, &PlanEvent::Reject { reason: "x".into() }).is_err());
        }
    }

    #[test]
    fn second_concurrent_approval_of_executing_plan_fails_fast() {
        let err =
            transition(PlanStatus::Executing, &PlanEvent::Approve { execute: true }).unwrap_err();
        assert_eq!(err, PlanTransitionError::AlreadyExecuting);
    }

    #[test]
    fn reject_not_allowed_while_executing() {
        let err = transition(
            PlanStatus::Executing,
            &PlanEvent::Reject { reason: "operator abort".into() },
        )
        .unwrap_err();
        assert!(matches!(err, PlanTransitionError::Illegal { .. }));
    }
}
