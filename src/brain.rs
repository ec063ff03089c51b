//! Reasoning oracle adapter.
//!
//! The oracle is consulted once per step with the screenshot, the goal, the
//! step history and the page state, and answers with a [`Decision`]. Output
//! that cannot be read as a decision is absorbed into [`Decision::fallback`]
//! instead of failing the call.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::OracleSettings;
use crate::error::{AgentError, Result};
use crate::types::{Action, Decision, DecisionStatus, HistoryEntry, PageState};

const API_KEY_VAR: &str = "OPENAI_API_KEY";

const SYSTEM_PROMPT: &str = r##"You are a browser automation agent. You see a screenshot of the current page and decide ONE next action at a time.

Available actions:
- {"type":"click","selector":"#submit"} or {"type":"click","text":"Sign in"}
- {"type":"type","selector":"input[name=q]","text":"search query"}
- {"type":"scroll","direction":"down","amount":500}
- {"type":"navigate","url":"https://..."}
- {"type":"extract","selector":"main"}
- {"type":"wait","duration_ms":1000}

Respond with a single JSON object and nothing else:
{"status":"continue|complete|stuck","action":{...},"reasoning":"why","confidence":0-100,"extracted_data":null}

Rules:
1. Use "complete" only when the goal is satisfied; put the answer in extracted_data.
2. Use "stuck" when you cannot see a way forward.
3. Look at the history. If an action failed, try something different instead of repeating it.
4. Keep steps minimal."##;

/// The reasoning oracle: one decision per step.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn decide(
        &self,
        screenshot: &[u8],
        goal: &str,
        history: &[HistoryEntry],
        page: &PageState,
    ) -> Result<Decision>;
}

/// Vision chat-completions client for OpenAI-compatible endpoints.
pub struct OpenAiOracle {
    client: Client,
    api_key: String,
    settings: OracleSettings,
}

impl OpenAiOracle {
    /// Reads the API key from `OPENAI_API_KEY`.
    pub fn from_env(settings: OracleSettings) -> Result<Self> {
        let api_key = std::env::var(API_KEY_VAR)
            .map_err(|_| AgentError::config(format!("{API_KEY_VAR} not set in environment")))?;
        Self::new(settings, api_key)
    }

    pub fn new(settings: OracleSettings, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            settings,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.settings.api_base.trim_end_matches('/'))
    }
}

#[async_trait]
impl Oracle for OpenAiOracle {
    async fn decide(
        &self,
        screenshot: &[u8],
        goal: &str,
        history: &[HistoryEntry],
        page: &PageState,
    ) -> Result<Decision> {
        let messages = build_messages(
            screenshot,
            goal,
            history,
            page,
            self.settings.max_history_entries,
        );

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.settings.model,
                "messages": messages,
                "temperature": self.settings.temperature,
                "response_format": {"type": "json_object"},
            }))
            .send()
            .await
            .map_err(|e| AgentError::oracle(format!("request failed: {e}")))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| AgentError::oracle(format!("unreadable response body: {e}")))?;

        if !status.is_success() {
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("unknown API error");
            return Err(AgentError::oracle(format!("API error ({status}): {message}")));
        }

        let Some(content) = body["choices"][0]["message"]["content"].as_str() else {
            warn!(response = %body, "oracle response has no message content");
            return Ok(Decision::fallback("oracle returned no content"));
        };

        debug!(content, "oracle replied");
        Ok(parse_decision(content))
    }
}

fn build_messages(
    screenshot: &[u8],
    goal: &str,
    history: &[HistoryEntry],
    page: &PageState,
    max_history: usize,
) -> Vec<Value> {
    let start = history.len().saturating_sub(max_history);
    let mut text = format!(
        "Goal: {goal}\n\nPage URL: {}\nTitle: {}\nReady state: {} (loaded: {})\n",
        page.url, page.title, page.ready_state, page.loaded
    );
    if history.is_empty() {
        text.push_str("\nNo steps taken yet.");
    } else {
        text.push_str("\nHistory:\n");
        for entry in &history[start..] {
            text.push_str(&render_history_entry(entry));
            text.push('\n');
        }
    }

    let image_url = format!("data:image/png;base64,{}", BASE64.encode(screenshot));
    vec![
        json!({"role": "system", "content": SYSTEM_PROMPT}),
        json!({
            "role": "user",
            "content": [
                {"type": "text", "text": text},
                {"type": "image_url", "image_url": {"url": image_url}},
            ],
        }),
    ]
}

fn render_history_entry(entry: &HistoryEntry) -> String {
    let action = serde_json::to_string(&entry.action)
        .unwrap_or_else(|_| entry.action.kind().to_string());
    let outcome = match entry.result.error() {
        None => "ok".to_string(),
        Some(err) => format!("FAILED: {err}"),
    };
    format!(
        "step {}: {} -> {} (confidence {:.0})",
        entry.step, action, outcome, entry.confidence
    )
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    action: Option<Value>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    confidence: Option<Value>,
    #[serde(default, alias = "extractedData")]
    extracted_data: Option<Value>,
}

/// Interprets raw oracle output. Never fails: unreadable content becomes a
/// zero-confidence `continue`/`wait` decision.
pub fn parse_decision(content: &str) -> Decision {
    match try_parse_decision(content) {
        Ok(decision) => decision,
        Err(e) => {
            warn!(error = %e, "falling back to wait decision");
            Decision::fallback(format!("could not interpret oracle output: {e}"))
        }
    }
}

fn try_parse_decision(content: &str) -> Result<Decision> {
    let json = extract_json_object(content)
        .ok_or_else(|| AgentError::OracleParse("no JSON object in output".into()))?;
    let raw: RawDecision =
        serde_json::from_str(json).map_err(|e| AgentError::OracleParse(e.to_string()))?;

    let status = match raw.status.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("complete") | Some("completed") | Some("done") => DecisionStatus::Complete,
        Some("stuck") => DecisionStatus::Stuck,
        _ => DecisionStatus::Continue,
    };

    let mut reasoning = raw.reasoning.unwrap_or_default();
    let action = match raw.action.map(parse_action) {
        Some(Ok(action)) => action,
        Some(Err(e)) => {
            reasoning = format!("{reasoning} [action replaced by wait: {e}]");
            Action::default()
        }
        None => Action::default(),
    };

    let confidence = raw.confidence.as_ref().and_then(number_from).unwrap_or(0.0);
    Ok(Decision::new(
        status,
        action,
        reasoning.trim(),
        confidence,
        raw.extracted_data.filter(|v| !v.is_null()),
    ))
}

fn parse_action(mut value: Value) -> Result<Action> {
    if let Some(kind) = value.get_mut("type")
        && let Some(name) = kind.as_str()
    {
        *kind = Value::String(name.to_ascii_lowercase());
    }
    let action: Action =
        serde_json::from_value(value).map_err(|e| AgentError::OracleParse(e.to_string()))?;
    action.validate()?;
    Ok(action)
}

fn number_from(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').parse().ok(),
        _ => None,
    }
}

/// Strips markdown fences and surrounding prose, keeping the outermost
/// `{ ... }` span.
fn extract_json_object(content: &str) -> Option<&str> {
    let cleaned = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    (start < end).then(|| &cleaned[start..=end])
}
