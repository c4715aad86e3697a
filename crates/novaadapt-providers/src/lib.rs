//! Model endpoint registry and chat router: single/vote strategies with
//! fallbacks, a fixed per-call timeout, and a normalize/majority-vote
//! rule for reconciling candidate replies.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use novaadapt_types::{ChatMessage, ModelEndpoint, RouterResult, VoteSummary};

/// Router-wide settings carried alongside the endpoint list:
/// `temperature`, `max_tokens`, and `timeout` apply to every call
/// regardless of which endpoint handles it.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
    pub default_vote_candidates: usize,
    pub min_vote_agreement: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        RouterSettings {
            temperature: 0.2,
            max_tokens: 800,
            timeout_seconds: 90,
            default_vote_candidates: 3,
            min_vote_agreement: 1,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RoutingFileSection {
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
    #[serde(default)]
    default_vote_candidates: Option<usize>,
    #[serde(default)]
    min_vote_agreement: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    models: Vec<ModelEndpoint>,
    default_model: String,
    #[serde(default)]
    routing: Option<RoutingFileSection>,
}

/// Chat request strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Single,
    Vote,
}

impl Strategy {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "single" => Ok(Strategy::Single),
            "vote" => Ok(Strategy::Vote),
            other => bail!("strategy must be 'single' or 'vote', got '{other}'"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model_name: Option<String>,
    pub candidates: Vec<String>,
    pub fallbacks: Vec<String>,
}

/// Routes chat requests to configured model endpoints under a chosen
/// strategy. Holds an immutable endpoint map plus an HTTP
/// client; `list`/`chat`/`health_check` are the only entry points.
#[derive(Clone)]
pub struct ModelRouter {
    endpoints: HashMap<String, ModelEndpoint>,
    default_model: String,
    settings: RouterSettings,
    client: Client,
}

impl ModelRouter {
    pub fn new(
        endpoints: Vec<ModelEndpoint>,
        default_model: impl Into<String>,
        settings: RouterSettings,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            bail!("ModelRouter requires at least one endpoint");
        }
        let default_model = default_model.into();
        let endpoints: HashMap<String, ModelEndpoint> = endpoints
            .into_iter()
            .map(|endpoint| (endpoint.name.clone(), endpoint))
            .collect();
        if !endpoints.contains_key(&default_model) {
            bail!("default model '{default_model}' not found in endpoints");
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .context("building HTTP client for model router")?;
        Ok(ModelRouter {
            endpoints,
            default_model,
            settings,
            client,
        })
    }

    /// Load endpoints and routing settings from a JSON config file (spec
    /// §4.1, ported from `ModelRouter.from_config_file`).
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading model router config {}", path.as_ref().display()))?;
        let file: ConfigFile = serde_json::from_str(&raw).context("parsing model router config")?;
        let routing = file.routing.unwrap_or(RoutingFileSection {
            temperature: None,
            max_tokens: None,
            timeout_seconds: None,
            default_vote_candidates: None,
            min_vote_agreement: None,
        });
        let defaults = RouterSettings::default();
        let settings = RouterSettings {
            temperature: routing.temperature.unwrap_or(defaults.temperature),
            max_tokens: routing.max_tokens.unwrap_or(defaults.max_tokens),
            timeout_seconds: routing.timeout_seconds.unwrap_or(defaults.timeout_seconds),
            default_vote_candidates: routing
                .default_vote_candidates
                .unwrap_or(defaults.default_vote_candidates)
                .max(1),
            min_vote_agreement: routing
                .min_vote_agreement
                .unwrap_or(defaults.min_vote_agreement)
                .max(1),
        };
        Self::new(file.models, file.default_model, settings)
    }

    pub fn list(&self) -> Vec<ModelEndpoint> {
        let mut endpoints: Vec<ModelEndpoint> = self.endpoints.values().cloned().collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));
        endpoints
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        strategy: Strategy,
        request: ChatRequest,
    ) -> Result<RouterResult> {
        match strategy {
            Strategy::Single => self.chat_single(messages, request).await,
            Strategy::Vote => self.chat_vote(messages, request).await,
        }
    }

    async fn chat_single(&self, messages: &[ChatMessage], request: ChatRequest) -> Result<RouterResult> {
        let primary = request.model_name.unwrap_or_else(|| self.default_model.clone());
        let ordered = dedupe_names(
            std::iter::once(primary)
                .chain(request.fallbacks.into_iter())
                .collect(),
        );

        let mut errors = HashMap::new();
        for name in &ordered {
            let endpoint = match self.resolve(name) {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    errors.insert(name.clone(), err.to_string());
                    continue;
                }
            };
            match self.invoke(endpoint, messages).await {
                Ok(content) => {
                    return Ok(RouterResult {
                        model_name: endpoint.name.clone(),
                        model_id: endpoint.model.clone(),
                        content,
                        strategy: "single".to_string(),
                        votes: HashMap::new(),
                        errors,
                        attempted_models: ordered,
                        vote_summary: None,
                    });
                }
                Err(err) => {
                    errors.insert(name.clone(), err.to_string());
                }
            }
        }

        let joined = join_errors(&errors);
        Err(anyhow!("All model attempts failed: {joined}"))
    }

    async fn chat_vote(&self, messages: &[ChatMessage], request: ChatRequest) -> Result<RouterResult> {
        let names = if request.candidates.is_empty() {
            self.default_vote_models()
        } else {
            dedupe_names(request.candidates)
        };
        if names.is_empty() {
            bail!("candidate_models must not be empty when strategy='vote'");
        }
        if self.settings.min_vote_agreement > names.len() {
            bail!(
                "min_vote_agreement={} exceeds vote candidates={}",
                self.settings.min_vote_agreement,
                names.len()
            );
        }

        let calls = names.iter().map(|name| {
            let messages = messages.to_vec();
            let name = name.clone();
            async move {
                let outcome = async {
                    let endpoint = self.resolve(&name)?;
                    self.invoke(endpoint, &messages).await
                }
                .await;
                (name, outcome)
            }
        });
        // Bounded parallelism <= min(4, N).
        let limit = names.len().min(4).max(1);
        let results: Vec<(String, anyhow::Result<String>)> =
            stream::iter(calls).buffer_unordered(limit).collect().await;

        let mut votes = HashMap::new();
        let mut errors = HashMap::new();
        for (name, outcome) in results {
            match outcome {
                Ok(content) => {
                    votes.insert(name, content);
                }
                Err(err) => {
                    errors.insert(name, err.to_string());
                }
            }
        }

        if votes.is_empty() {
            let joined = join_errors(&errors);
            bail!("All vote candidates failed: {joined}");
        }

        // buffer_unordered completes in arrival order, not candidate order;
        // rebuild outputs in `names` order so the tie-break below is
        // first-seen among the ordered candidate list, not first-arrived.
        let outputs: Vec<String> = names
            .iter()
            .filter_map(|name| votes.get(name).cloned())
            .collect();

        let (chosen, winner_count) = majority_vote(&outputs);
        if winner_count < self.settings.min_vote_agreement {
            bail!(
                "Vote quorum not met: winner_votes={winner_count}, required_votes={}",
                self.settings.min_vote_agreement
            );
        }

        let winner_name = names
            .iter()
            .find(|name| {
                votes
                    .get(name.as_str())
                    .map(|reply| normalize(reply) == normalize(&chosen))
                    .unwrap_or(false)
            })
            .cloned()
            .unwrap_or_else(|| names[0].clone());
        let winner_endpoint = self.resolve(&winner_name)?;

        Ok(RouterResult {
            model_name: winner_name,
            model_id: winner_endpoint.model.clone(),
            content: chosen,
            strategy: "vote".to_string(),
            votes,
            errors,
            attempted_models: names,
            vote_summary: Some(VoteSummary {
                winner_votes: winner_count,
                required_votes: self.settings.min_vote_agreement,
                total_votes: outputs.len(),
                quorum_met: true,
            }),
        })
    }

    pub async fn health_check(
        &self,
        names: Option<Vec<String>>,
        probe_prompt: &str,
    ) -> Vec<CheckOutcome> {
        let names = dedupe_names(names.unwrap_or_else(|| self.endpoints.keys().cloned().collect()));
        let messages = vec![ChatMessage::user(probe_prompt)];
        let mut report = Vec::with_capacity(names.len());
        for name in names {
            let Ok(endpoint) = self.resolve(&name) else {
                report.push(CheckOutcome {
                    name: name.clone(),
                    model: String::new(),
                    provider: String::new(),
                    ok: false,
                    latency_ms: 0.0,
                    preview: None,
                    error: Some(format!("Unknown model endpoint '{name}'")),
                });
                continue;
            };
            let start = Instant::now();
            match self.invoke(endpoint, &messages).await {
                Ok(content) => report.push(CheckOutcome {
                    name: endpoint.name.clone(),
                    model: endpoint.model.clone(),
                    provider: endpoint.provider.clone(),
                    ok: true,
                    latency_ms: round2(start.elapsed().as_secs_f64() * 1000.0),
                    preview: Some(content.chars().take(120).collect()),
                    error: None,
                }),
                Err(err) => report.push(CheckOutcome {
                    name: endpoint.name.clone(),
                    model: endpoint.model.clone(),
                    provider: endpoint.provider.clone(),
                    ok: false,
                    latency_ms: round2(start.elapsed().as_secs_f64() * 1000.0),
                    preview: None,
                    error: Some(err.to_string()),
                }),
            }
        }
        report
    }

    fn resolve(&self, name: &str) -> Result<&ModelEndpoint> {
        self.endpoints
            .get(name)
            .ok_or_else(|| anyhow!("Unknown model endpoint '{name}'"))
    }

    fn default_vote_models(&self) -> Vec<String> {
        let mut ordered = vec![self.default_model.clone()];
        let mut rest: Vec<String> = self
            .endpoints
            .keys()
            .filter(|name| *name != &self.default_model)
            .cloned()
            .collect();
        rest.sort();
        ordered.extend(rest);
        ordered.truncate(self.settings.default_vote_candidates);
        ordered
    }

    async fn invoke(&self, endpoint: &ModelEndpoint, messages: &[ChatMessage]) -> Result<String> {
        let api_key = match &endpoint.api_key_env {
            Some(env_var) => Some(std::env::var(env_var).map_err(|_| {
                anyhow!("Missing API key env var '{env_var}' for endpoint '{}'", endpoint.name)
            })?),
            None => None,
        };

        let base = endpoint.base_url.trim_end_matches('/');
        let url = if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        };

        let body = json!({
            "model": endpoint.model,
            "messages": messages
                .iter()
                .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
                .collect::<Vec<_>>(),
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_tokens,
            "stream": false,
        });

        let mut req = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(self.settings.timeout_seconds))
            .json(&body);
        for (key, value) in &endpoint.headers {
            req = req.header(key, value);
        }
        if let Some(key) = api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|err| anyhow!("Model endpoint '{}' unreachable: {err}", endpoint.name))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Model endpoint '{}' failed ({status}): {body}", endpoint.name);
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|err| anyhow!("Model endpoint '{}' returned invalid JSON: {err}", endpoint.name))?;

        let choices = raw
            .get("choices")
            .and_then(Value::as_array)
            .filter(|items| !items.is_empty())
            .ok_or_else(|| anyhow!("Model endpoint '{}' returned no choices", endpoint.name))?;

        let content = choices[0]
            .get("message")
            .and_then(|m| m.get("content"))
            .cloned()
            .unwrap_or(Value::Null);

        Ok(match content {
            Value::String(text) => text.trim().to_string(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string(),
            Value::Null => {
                warn!(endpoint = %endpoint.name, "model reply had no content field");
                String::new()
            }
            other => other.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub name: String,
    pub model: String,
    pub provider: String,
    pub ok: bool,
    pub latency_ms: f64,
    pub preview: Option<String>,
    pub error: Option<String>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn dedupe_names(names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ordered = Vec::with_capacity(names.len());
    for name in names {
        if !name.is_empty() && seen.insert(name.clone()) {
            ordered.push(name);
        }
    }
    ordered
}

fn join_errors(errors: &HashMap<String, String>) -> String {
    let mut pairs: Vec<String> = errors.iter().map(|(k, v)| format!("{k}: {v}")).collect();
    pairs.sort();
    pairs.join("; ")
}

/// Majority vote by normalized equality, ties broken by first occurrence
/// in `outputs`.
fn majority_vote(outputs: &[String]) -> (String, usize) {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut first_seen_order: Vec<String> = Vec::new();
    for item in outputs {
        let key = normalize(item);
        if !counts.contains_key(&key) {
            first_seen_order.push(key.clone());
        }
        *counts.entry(key).or_insert(0) += 1;
    }
    // `max_by_key` keeps the *last* maximal element on ties, which would
    // break first-seen ordering; fold explicitly so the first key to reach
    // the highest count wins.
    let mut iter = first_seen_order.into_iter();
    let first = iter.next().expect("outputs is non-empty");
    let mut winner_key = first.clone();
    let mut best_count = counts[&first];
    for key in iter {
        let count = counts[&key];
        if count > best_count {
            best_count = count;
            winner_key = key;
        }
    }
    let winner_count = best_count;
    let winner_text = outputs
        .iter()
        .find(|item| normalize(item) == winner_key)
        .cloned()
        .unwrap_or_else(|| outputs[0].clone());
    (winner_text, winner_count)
}

/// Vote normalization: JSON
/// replies canonicalize to sorted-key compact JSON prefixed `json:`;
/// everything else lowercases and collapses whitespace. No float
/// tolerance beyond JSON canonicalization.
fn normalize(text: &str) -> String {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => format!("json:{}", canonical_json(&value)),
        Err(_) => text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase(),
    }
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap(), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_json_key_order_and_whitespace() {
        let a = normalize(r#"{"b": 1, "a": 2}"#);
        let b = normalize(r#"{ "a" : 2 , "b" : 1 }"#);
        assert_eq!(a, b);
    }

    #[test]
    fn normalize_lowercases_and_collapses_plain_text() {
        let a = normalize("  Click   OK  ");
        let b = normalize("click ok");
        assert_eq!(a, b);
    }

    #[test]
    fn majority_vote_breaks_ties_by_first_seen() {
        let outputs = vec!["B".to_string(), "a".to_string(), "b".to_string(), "A".to_string()];
        let (winner, count) = majority_vote(&outputs);
        assert_eq!(count, 2);
        assert_eq!(normalize(&winner), normalize("B"));
    }

    #[test]
    fn dedupe_names_preserves_first_occurrence_order() {
        let deduped = dedupe_names(vec!["a".into(), "b".into(), "a".into(), "c".into()]);
        assert_eq!(deduped, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }
}
