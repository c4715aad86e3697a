//! Destructive-action detection: a pure `ActionPolicy` gate over static
//! `DANGEROUS_TYPES`/`DANGEROUS_KEYWORDS` sets. No I/O, so it is
//! trivially testable.

use std::collections::HashSet;

use once_cell::sync::Lazy;

use novaadapt_types::{Action, PolicyDecision};

/// Action types that are always dangerous regardless of keyword content
/// (see DESIGN.md Open Question decisions for how this set was chosen).
static DANGEROUS_TYPES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "delete",
        "remove",
        "rm",
        "format",
        "shutdown",
        "reboot",
        "kill",
        "terminate",
        "run_shell",
        "shell",
        "terminal",
    ]
    .into_iter()
    .collect()
});

/// Substrings that mark an action dangerous when found in the lowercased
/// concatenation of type/target/value.
static DANGEROUS_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "rm -rf",
        "format",
        "factory reset",
        "delete",
        "drop table",
        "shutdown",
        "reboot",
        "killall",
        "poweroff",
    ]
    .into_iter()
    .collect()
});

const BLOCKED_REASON: &str = "Blocked potentially destructive action. \
Re-run with allow_dangerous after reviewing the plan.";

/// Guards action execution with minimal, explicit risk checks (spec
/// §4.3).
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionPolicy;

impl ActionPolicy {
    pub fn new() -> Self {
        ActionPolicy
    }

    pub fn evaluate(&self, action: &Action, allow_dangerous: bool) -> PolicyDecision {
        let normalized_type = action.r#type.trim().to_lowercase();
        let haystack = action.haystack();

        let dangerous = DANGEROUS_TYPES.contains(normalized_type.as_str())
            || DANGEROUS_KEYWORDS.iter().any(|keyword| haystack.contains(keyword));

        if dangerous && !allow_dangerous {
            return PolicyDecision {
                allowed: false,
                dangerous: true,
                reason: BLOCKED_REASON.to_string(),
            };
        }

        PolicyDecision {
            allowed: true,
            dangerous,
            reason: "allowed".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use novaadapt_types::Action;

    fn action(r#type: &str, target: &str, value: Option<&str>) -> Action {
        Action {
            r#type: r#type.to_string(),
            target: target.to_string(),
            value: value.map(str::to_string),
            undo: None,
        }
    }

    #[test]
    fn benign_action_is_allowed_and_not_dangerous() {
        let decision = ActionPolicy::new().evaluate(&action("click", "OK", None), false);
        assert!(decision.allowed);
        assert!(!decision.dangerous);
    }

    #[test]
    fn dangerous_type_is_blocked_without_opt_in() {
        let decision = ActionPolicy::new().evaluate(&action("delete", "file.txt", None), false);
        assert!(!decision.allowed);
        assert!(decision.dangerous);
    }

    #[test]
    fn dangerous_type_is_allowed_with_opt_in_but_still_flagged() {
        let decision = ActionPolicy::new().evaluate(&action("delete", "file.txt", None), true);
        assert!(decision.allowed);
        assert!(decision.dangerous);
    }

    #[test]
    fn dangerous_keyword_in_value_is_detected() {
        let decision = ActionPolicy::new().evaluate(
            &action("run_command", "disk", Some("rm -rf /")),
            false,
        );
        assert!(decision.dangerous);
        assert!(!decision.allowed);
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        let decision = ActionPolicy::new().evaluate(&action("note", "x", Some("DROP TABLE users")), false);
        assert!(decision.dangerous);
    }
}
