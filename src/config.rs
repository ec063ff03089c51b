//! Agent configuration, loaded from TOML.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::types::DEFAULT_STEP_BUDGET;

pub const MAX_SETTLE_DELAY_MS: u64 = 5000;
const CONFIG_DIR_NAME: &str = "agentic-rpa";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub oracle: OracleSettings,
    pub browser: BrowserSettings,
    pub executor: ExecutorSettings,
    pub retry: RetrySettings,
    pub policy: PolicySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleSettings {
    pub model: String,
    pub api_base: String,
    pub temperature: f32,
    /// How many trailing history entries are sent with each request.
    pub max_history_entries: usize,
    pub request_timeout_secs: u64,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            temperature: 0.2,
            max_history_entries: 10,
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    /// DevTools endpoint of an already running Chrome to attach to.
    pub debugger_url: Option<String>,
    /// Persistent profile directory, so logins survive between runs.
    pub profile_dir: Option<PathBuf>,
    pub window_width: u32,
    pub window_height: u32,
    pub navigation_timeout_ms: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            debugger_url: None,
            profile_dir: None,
            window_width: 1280,
            window_height: 800,
            navigation_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub step_budget: usize,
    pub settle_delay_ms: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            step_budget: DEFAULT_STEP_BUDGET,
            settle_delay_ms: 1000,
        }
    }
}

impl ExecutorSettings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms.min(MAX_SETTLE_DELAY_MS))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    pub confidence_threshold: f64,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Load configuration from a TOML string.
    pub fn load_str(content: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the user config file if there is one, defaults otherwise.
    pub fn discover() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                debug!(path = %path.display(), "loading config");
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    pub fn validate(&self) -> Result<()> {
        if self.executor.step_budget == 0 {
            return Err(AgentError::config("executor.step_budget must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(AgentError::config("retry.max_attempts must be at least 1"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(AgentError::config("retry.multiplier must be >= 1.0"));
        }
        let threshold = self.policy.confidence_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(AgentError::config(format!(
                "policy.confidence_threshold must be in (0, 1], got {threshold}"
            )));
        }
        if self.oracle.model.trim().is_empty() {
            return Err(AgentError::config("oracle.model must not be empty"));
        }
        Ok(())
    }
}
