use serde::{Deserialize, Serialize};

/// The outcome of running the policy gate over one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub dangerous: bool,
    pub reason: String,
}
