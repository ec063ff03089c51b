use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, Result};

pub const DEFAULT_STEP_BUDGET: usize = 25;
pub const DEFAULT_WAIT_MS: u64 = 1000;
pub const MAX_WAIT_MS: u64 = 60_000;
const DEFAULT_SCROLL_AMOUNT: u32 = 500;

/// A single atomic step the oracle asks the agent to perform.
///
/// Serialized with an internal `type` tag so the oracle can answer with
/// `{"type":"click","selector":"#submit"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Type {
        selector: String,
        text: String,
    },
    Scroll {
        direction: ScrollDirection,
        #[serde(default = "default_scroll_amount")]
        amount: u32,
    },
    Navigate {
        url: String,
    },
    Extract {
        selector: String,
    },
    Wait {
        #[serde(default = "default_wait_ms")]
        duration_ms: u64,
    },
}

fn default_scroll_amount() -> u32 {
    DEFAULT_SCROLL_AMOUNT
}

fn default_wait_ms() -> u64 {
    DEFAULT_WAIT_MS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

/// The variant tag of an [`Action`], without its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Type,
    Scroll,
    Navigate,
    Extract,
    Wait,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Click => "click",
            ActionKind::Type => "type",
            ActionKind::Scroll => "scroll",
            ActionKind::Navigate => "navigate",
            ActionKind::Extract => "extract",
            ActionKind::Wait => "wait",
        };
        f.write_str(name)
    }
}

impl Action {
    pub fn wait(duration_ms: u64) -> Self {
        Action::Wait { duration_ms }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Click { .. } => ActionKind::Click,
            Action::Type { .. } => ActionKind::Type,
            Action::Scroll { .. } => ActionKind::Scroll,
            Action::Navigate { .. } => ActionKind::Navigate,
            Action::Extract { .. } => ActionKind::Extract,
            Action::Wait { .. } => ActionKind::Wait,
        }
    }

    /// Checks the field-presence rule of the variant. Must pass before the
    /// action is handed to an execution surface.
    pub fn validate(&self) -> Result<()> {
        match self {
            Action::Click { selector, text } => {
                if is_blank(selector.as_deref()) && is_blank(text.as_deref()) {
                    return Err(AgentError::invalid_action(
                        "click needs a selector or a text label",
                    ));
                }
            }
            Action::Type { selector, .. } => {
                if selector.trim().is_empty() {
                    return Err(AgentError::invalid_action("type needs a selector"));
                }
            }
            Action::Scroll { amount, .. } => {
                if *amount == 0 {
                    return Err(AgentError::invalid_action("scroll amount must be positive"));
                }
            }
            Action::Navigate { url } => {
                let parsed = url::Url::parse(url)
                    .map_err(|e| AgentError::invalid_action(format!("bad url {url:?}: {e}")))?;
                if !matches!(parsed.scheme(), "http" | "https" | "about") {
                    return Err(AgentError::invalid_action(format!(
                        "unsupported url scheme: {}",
                        parsed.scheme()
                    )));
                }
            }
            Action::Extract { selector } => {
                if selector.trim().is_empty() {
                    return Err(AgentError::invalid_action("extract needs a selector"));
                }
            }
            Action::Wait { duration_ms } => {
                if *duration_ms > MAX_WAIT_MS {
                    return Err(AgentError::invalid_action(format!(
                        "wait of {duration_ms}ms exceeds {MAX_WAIT_MS}ms"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for Action {
    fn default() -> Self {
        Action::wait(DEFAULT_WAIT_MS)
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.is_none_or(|v| v.trim().is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Continue,
    Complete,
    Stuck,
}

/// One answer of the reasoning oracle. Built fresh per call and read-only
/// afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    status: DecisionStatus,
    action: Action,
    reasoning: String,
    confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    extracted_data: Option<Value>,
}

impl Decision {
    /// Confidence is clamped into `[0, 100]`; extracted data is kept only for
    /// `Complete` decisions.
    pub fn new(
        status: DecisionStatus,
        action: Action,
        reasoning: impl Into<String>,
        confidence: f64,
        extracted_data: Option<Value>,
    ) -> Self {
        let extracted_data = match status {
            DecisionStatus::Complete => extracted_data,
            _ => None,
        };
        Self {
            status,
            action,
            reasoning: reasoning.into(),
            confidence: clamp_confidence(confidence),
            extracted_data,
        }
    }

    pub fn proceed(action: Action, reasoning: impl Into<String>, confidence: f64) -> Self {
        Self::new(DecisionStatus::Continue, action, reasoning, confidence, None)
    }

    pub fn complete(data: Option<Value>, reasoning: impl Into<String>, confidence: f64) -> Self {
        Self::new(
            DecisionStatus::Complete,
            Action::default(),
            reasoning,
            confidence,
            data,
        )
    }

    pub fn stuck(action: Action, reasoning: impl Into<String>, confidence: f64) -> Self {
        Self::new(DecisionStatus::Stuck, action, reasoning, confidence, None)
    }

    /// Safe default used when the oracle output cannot be interpreted.
    pub fn fallback(reason: impl Into<String>) -> Self {
        Self::proceed(Action::default(), reason, 0.0)
    }

    pub fn status(&self) -> DecisionStatus {
        self.status
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn extracted_data(&self) -> Option<&Value> {
        self.extracted_data.as_ref()
    }
}

pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// Outcome of one `act` call on the execution surface.
///
/// `error` is present exactly when the action failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionResult {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    attempts: u32,
}

impl ActionResult {
    pub fn ok(data: Option<Value>, attempts: u32) -> Self {
        Self {
            success: true,
            data,
            error: None,
            attempts,
        }
    }

    pub fn failed(error: impl Into<String>, attempts: u32) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// What the agent observes about the page besides the screenshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageState {
    pub url: String,
    pub title: String,
    pub ready_state: String,
    pub loaded: bool,
}

impl PageState {
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        ready_state: impl Into<String>,
    ) -> Self {
        let ready_state = ready_state.into();
        Self {
            url: url.into(),
            title: title.into(),
            loaded: ready_state == "complete",
            ready_state,
        }
    }
}

/// How long `navigate` waits for the page to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitPolicy {
    /// Wait for the navigation to finish and the document body to exist.
    Strict,
    /// Only wait for the document body.
    Loose,
}

/// One step's full record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub step: usize,
    pub action: Action,
    pub reasoning: String,
    pub confidence: f64,
    pub result: ActionResult,
    pub url: String,
    pub timestamp: DateTime<Utc>,
}
