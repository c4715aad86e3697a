use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A configured chat model endpoint. Immutable
/// after load; the router holds these in a name-keyed map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEndpoint {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_provider")]
    pub provider: String,
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_provider() -> String {
    "openai-compatible".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// A single role-tagged utterance in a chat request. Immutable per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// Quorum bookkeeping attached to a vote-strategy `RouterResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteSummary {
    pub winner_votes: usize,
    pub required_votes: usize,
    pub total_votes: usize,
    pub quorum_met: bool,
}

/// The outcome of a single `ModelRouter::chat` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterResult {
    pub model_name: String,
    pub model_id: String,
    pub content: String,
    pub strategy: String,
    #[serde(default)]
    pub votes: HashMap<String, String>,
    #[serde(default)]
    pub errors: HashMap<String, String>,
    #[serde(default)]
    pub attempted_models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote_summary: Option<VoteSummary>,
}
