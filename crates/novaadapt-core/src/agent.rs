//! Objective-to-actions agent: composes the fixed system prompt, invokes
//! the model router, parses/sanitizes the reply into actions, then (in
//! live mode) dispatches each through the policy gate and transport,
//! logging every attempt.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::action_log::ActionLog;
use crate::policy::ActionPolicy;
use crate::transport::ExecutionTransport;
use novaadapt_providers::{ChatRequest, ModelRouter, Strategy};
use novaadapt_types::{sanitize_action, Action, ChatMessage, ExecutionResult};

/// Fixed system prompt compiled into the binary. Not user-configurable.
pub const SYSTEM_PROMPT: &str = "You are NovaAdapt. Convert the objective into deterministic desktop actions. \
Return strict JSON only. Use schema: {\"actions\": [ {\"type\": str, \"target\": str, \"value\": str?} ] }.";

#[derive(Debug, Clone)]
pub struct RunObjectiveRequest {
    pub objective: String,
    pub strategy: Strategy,
    pub model_name: Option<String>,
    pub candidate_models: Vec<String>,
    pub fallback_models: Vec<String>,
    pub dry_run: bool,
    pub record_history: bool,
    pub allow_dangerous: bool,
    pub max_actions: usize,
}

/// Aggregate result of running one objective. The HTTP layer maps this onto
/// `novaadapt_wire::RunObjectiveResponse`.
#[derive(Debug, Clone)]
pub struct RunObjectiveOutcome {
    pub model: String,
    pub model_id: String,
    pub strategy: String,
    pub votes: HashMap<String, String>,
    pub model_errors: HashMap<String, String>,
    pub attempted_models: Vec<String>,
    pub actions: Vec<Action>,
    pub results: Vec<ExecutionResult>,
    pub action_log_ids: Vec<i64>,
}

pub struct Agent {
    router: Arc<ModelRouter>,
    transport: Arc<dyn ExecutionTransport>,
    action_log: Arc<ActionLog>,
    policy: ActionPolicy,
}

impl Agent {
    pub fn new(
        router: Arc<ModelRouter>,
        transport: Arc<dyn ExecutionTransport>,
        action_log: Arc<ActionLog>,
    ) -> Self {
        Agent {
            router,
            transport,
            action_log,
            policy: ActionPolicy::new(),
        }
    }

    pub async fn run_objective(&self, request: RunObjectiveRequest) -> anyhow::Result<RunObjectiveOutcome> {
        let messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Objective:\n{}\n\nOnly output JSON matching the schema, with no markdown.",
                request.objective
            )),
        ];

        let chat_request = ChatRequest {
            model_name: request.model_name,
            candidates: request.candidate_models,
            fallbacks: request.fallback_models,
        };
        let result = self.router.chat(&messages, request.strategy, chat_request).await?;

        let actions = parse_actions(&result.content, request.max_actions);

        let mut results = Vec::with_capacity(actions.len());
        let mut action_log_ids = Vec::with_capacity(actions.len());

        for action in &actions {
            let decision = self.policy.evaluate(action, request.allow_dangerous);

            if !request.dry_run && !decision.allowed {
                let outcome = ExecutionResult {
                    status: "blocked".to_string(),
                    output: decision.reason.clone(),
                    action: action.clone(),
                    dangerous: decision.dangerous,
                    attempts: None,
                };
                if request.record_history {
                    let id = self.action_log.record(action, "blocked").await?;
                    action_log_ids.push(id);
                }
                results.push(outcome);
                continue;
            }

            let dispatched = self.transport.execute(action, request.dry_run).await?;
            let outcome = ExecutionResult {
                status: dispatched.status.clone(),
                output: dispatched.output,
                action: dispatched.action.clone(),
                dangerous: decision.dangerous,
                attempts: Some(1),
            };
            if request.record_history {
                let id = self.action_log.record(&dispatched.action, &dispatched.status).await?;
                action_log_ids.push(id);
            }
            results.push(outcome);
        }

        Ok(RunObjectiveOutcome {
            model: result.model_name,
            model_id: result.model_id,
            strategy: result.strategy,
            votes: result.votes,
            model_errors: result.errors,
            attempted_models: result.attempted_models,
            actions,
            results,
            action_log_ids,
        })
    }
}

/// Parsing contract: strip a leading fence, parse JSON,
/// accept `{"actions": [...]}` or a bare list, sanitize, cap at
/// `max_actions`.
pub fn parse_actions(raw: &str, max_actions: usize) -> Vec<Action> {
    let stripped = strip_fence(raw.trim());

    let parsed: Option<Value> = serde_json::from_str(stripped).ok();
    let Some(parsed) = parsed else {
        return vec![novaadapt_types::note_from_raw_text(raw)];
    };

    let candidates: Vec<Value> = match parsed {
        Value::Object(ref obj) => match obj.get("actions").and_then(Value::as_array) {
            Some(items) if !items.is_empty() => items.clone(),
            _ => Vec::new(),
        },
        Value::Array(items) => items,
        _ => Vec::new(),
    };

    if candidates.is_empty() {
        return vec![Action::note("empty_plan", "Model did not return actions")];
    }

    candidates
        .into_iter()
        .take(max_actions.max(1))
        .enumerate()
        .map(|(idx, raw)| sanitize_action(idx, &raw))
        .collect()
}

fn strip_fence(text: &str) -> &str {
    if let Some(rest) = text.strip_prefix("```") {
        let rest = rest.trim_matches('`');
        let rest = rest.strip_prefix("json\n").unwrap_or(rest);
        return rest.trim();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_object_with_actions_field() {
        let raw = r#"{"actions": [{"type": "click", "target": "OK"}]}"#;
        let actions = parse_actions(raw, 25);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].r#type, "click");
    }

    #[test]
    fn parses_bare_list() {
        let raw = r#"[{"type": "click", "target": "OK"}, {"type": "type", "target": "field", "value": "hi"}]"#;
        let actions = parse_actions(raw, 25);
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn strips_fenced_json_block() {
        let raw = "```json\n{\"actions\": [{\"type\": \"click\", \"target\": \"OK\"}]}\n```";
        let actions = parse_actions(raw, 25);
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn invalid_json_yields_single_note_action() {
        let actions = parse_actions("not json at all", 25);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].r#type, "note");
    }

    #[test]
    fn empty_actions_list_yields_empty_plan_note() {
        let actions = parse_actions(r#"{"actions": []}"#, 25);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].target, "empty_plan");
    }

    #[test]
    fn max_actions_caps_the_list() {
        let raw = r#"{"actions": [{"type":"a","target":"1"},{"type":"a","target":"2"},{"type":"a","target":"3"}]}"#;
        let actions = parse_actions(raw, 2);
        assert_eq!(actions.len(), 2);
    }
}
