use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors raised by the oracle, the execution surface and the policy.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The reasoning oracle could not be reached or answered with an error.
    #[error("oracle call failed: {0}")]
    Oracle(String),

    /// The oracle answered, but its content is not a decision.
    #[error("oracle response could not be parsed: {0}")]
    OracleParse(String),

    /// An action was attempted on the surface and failed.
    #[error("action failed: {0}")]
    Execution(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// The action does not satisfy its variant's field rules.
    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("execution surface is not initialized")]
    NotInitialized,

    /// The surface could not be launched or the start page could not be reached.
    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl AgentError {
    pub fn oracle(message: impl Into<String>) -> Self {
        Self::Oracle(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    pub fn invalid_action(message: impl Into<String>) -> Self {
        Self::InvalidAction(message.into())
    }

    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether another attempt at the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution(_) | Self::Timeout(_))
    }
}
