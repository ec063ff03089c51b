//! Autonomous web-page agent: a step loop that asks a vision oracle what to
//! do next and performs it in a browser, plus a policy that routes discrete
//! action requests to the cheapest automation strategy likely to work.

pub mod brain;
pub mod config;
pub mod dom;
pub mod error;
pub mod executor;
pub mod hands;
pub mod ledger;
pub mod orchestrator;
pub mod types;

pub use brain::{OpenAiOracle, Oracle, parse_decision};
pub use config::AgentConfig;
pub use dom::{ChromeDomAnalyzer, StructuralAnalysis, StructuralAnalyzer};
pub use error::{AgentError, Result};
pub use executor::{ExecutorConfig, TaskExecutor, TaskResult, TaskStatus};
pub use hands::{ChromeSurface, ExecutionSurface, RetryPolicy};
pub use orchestrator::{
    ActionRequest, Approach, ApproachPolicy, Orchestrator, Selection, StrategyExecutor,
};
pub use types::{Action, ActionResult, Decision, DecisionStatus, HistoryEntry, PageState};
