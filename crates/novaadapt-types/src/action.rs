use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A structured instruction `{type, target, value?, undo?}` produced by the
/// agent from a model reply.
///
/// `type` is an open vocabulary (an LLM can emit anything); this is why
/// `Action` is a flat struct rather than a closed enum of variants — see
/// the Open Question note in DESIGN.md.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub r#type: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo: Option<Box<Action>>,
}

impl Action {
    pub fn note(target: impl Into<String>, value: impl Into<String>) -> Self {
        Action {
            r#type: "note".to_string(),
            target: target.into(),
            value: Some(value.into()),
            undo: None,
        }
    }

    /// Lowercased concatenation of type/target/value, used by the policy
    /// gate for keyword matching.
    pub fn haystack(&self) -> String {
        format!(
            "{} {} {}",
            self.r#type,
            self.target,
            self.value.as_deref().unwrap_or("")
        )
        .to_lowercase()
    }
}

/// Maximum bytes of raw model text captured in a parse-failure note action.
pub const NOTE_RAW_TEXT_LIMIT: usize = 500;

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Turns an arbitrary JSON value into either a well-formed `Action` or a
/// `note` diagnostic action. This is the single choke point every
/// candidate object gets funneled through, so sanitization is idempotent
/// and total: every input yields exactly one output, and re-sanitizing an
/// already-sanitized action is a no-op because its `type`/`target` are
/// already non-empty trimmed strings.
pub fn sanitize_action(index: usize, raw: &Value) -> Action {
    let obj = match raw.as_object() {
        Some(obj) => obj,
        None => {
            return Action::note(
                "invalid_action",
                format!("Action {index} missing required fields"),
            )
        }
    };

    let r#type = coerce_trimmed_string(obj.get("type"));
    let target = coerce_trimmed_string(obj.get("target"));

    if r#type.is_empty() || target.is_empty() {
        return Action::note(
            "invalid_action",
            format!("Action {index} missing required fields"),
        );
    }

    let value = obj.get("value").and_then(stringify_value);
    let undo = match obj.get("undo") {
        Some(v) if v.is_object() => Some(Box::new(sanitize_action(index, v))),
        _ => None,
    };

    Action {
        r#type,
        target,
        value,
        undo,
    }
}

fn coerce_trimmed_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) if !other.is_null() => other.to_string().trim().to_string(),
        _ => String::new(),
    }
}

fn stringify_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Produce the diagnostic note action used when the model's raw text
/// could not be parsed as actions at all.
pub fn note_from_raw_text(raw_text: &str) -> Action {
    let trimmed = raw_text.trim();
    let bounded = truncate_chars(trimmed, NOTE_RAW_TEXT_LIMIT);
    Action::note("raw_output", bounded)
}

/// An append-only action-log entry. The `undone` flag is the only field
/// ever mutated after insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub id: i64,
    pub action: Action,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub undone: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo_action: Option<Action>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_keeps_well_formed_action() {
        let raw = json!({"type": " click ", "target": " OK ", "value": 3});
        let action = sanitize_action(0, &raw);
        assert_eq!(action.r#type, "click");
        assert_eq!(action.target, "OK");
        assert_eq!(action.value.as_deref(), Some("3"));
    }

    #[test]
    fn sanitize_replaces_missing_fields_with_note() {
        let raw = json!({"type": "click"});
        let action = sanitize_action(2, &raw);
        assert_eq!(action.r#type, "note");
        assert_eq!(action.target, "invalid_action");
        assert_eq!(
            action.value.as_deref(),
            Some("Action 2 missing required fields")
        );
    }

    #[test]
    fn sanitize_is_idempotent() {
        let raw = json!({"type": "click", "target": "OK"});
        let once = sanitize_action(0, &raw);
        let twice = sanitize_action(0, &serde_json::to_value(&once).unwrap());
        assert_eq!(once, twice);
    }

    #[test]
    fn sanitize_non_object_yields_note() {
        let raw = json!("just a string");
        let action = sanitize_action(5, &raw);
        assert_eq!(action.r#type, "note");
    }

    #[test]
    fn note_from_raw_text_bounds_length() {
        let long = "x".repeat(1000);
        let action = note_from_raw_text(&long);
        assert_eq!(action.value.as_ref().unwrap().len(), NOTE_RAW_TEXT_LIMIT);
    }
}
