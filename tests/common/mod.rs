#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use agentic_rpa::error::{AgentError, Result};
use agentic_rpa::executor::{ExecutorConfig, TaskExecutor};
use agentic_rpa::hands::{ExecutionSurface, RetryPolicy};
use agentic_rpa::types::{Action, ActionKind, Decision, HistoryEntry, PageState, WaitPolicy};
use agentic_rpa::Oracle;
use async_trait::async_trait;
use serde_json::Value;

pub const START_URL: &str = "https://shop.example.com";

pub enum Reply {
    Decide(Decision),
    Fail(&'static str),
    Panic(&'static str),
}

/// Oracle that plays back a script. Once the script is exhausted it answers
/// with a distinct `wait` each call, so the run keeps going without looking
/// stuck.
pub struct ScriptedOracle {
    script: Mutex<VecDeque<Reply>>,
    seen_history: Mutex<Vec<usize>>,
    calls: Mutex<u64>,
}

impl ScriptedOracle {
    pub fn new(script: Vec<Reply>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            seen_history: Mutex::new(Vec::new()),
            calls: Mutex::new(0),
        }
    }

    pub fn history_lengths(&self) -> Vec<usize> {
        self.seen_history.lock().unwrap().clone()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn decide(
        &self,
        _screenshot: &[u8],
        _goal: &str,
        history: &[HistoryEntry],
        _page: &PageState,
    ) -> Result<Decision> {
        self.seen_history.lock().unwrap().push(history.len());
        let call = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        let reply = self.script.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Decide(decision)) => Ok(decision),
            Some(Reply::Fail(message)) => Err(AgentError::oracle(message)),
            Some(Reply::Panic(message)) => panic!("{message}"),
            None => Ok(Decision::proceed(Action::wait(call), "keep going", 50.0)),
        }
    }
}

/// In-memory execution surface that records every call.
#[derive(Default)]
pub struct FakeSurface {
    pub launched: bool,
    pub closed: bool,
    pub fail_launch: bool,
    pub panic_on_launch: bool,
    pub fail_navigation: bool,
    pub strict_times_out: bool,
    pub capture_failures: u32,
    /// Every `perform` of these kinds fails with a retryable error.
    pub failing_kinds: Vec<ActionKind>,
    /// The next N `perform` calls fail with a retryable error.
    pub transient_failures: u32,
    pub navigations: Vec<(String, WaitPolicy)>,
    pub performed: Vec<Action>,
    pub captures: u32,
}

impl FakeSurface {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionSurface for FakeSurface {
    async fn launch(&mut self, _headless: bool) -> Result<()> {
        if self.panic_on_launch {
            panic!("devtools handshake went sideways");
        }
        if self.fail_launch {
            return Err(AgentError::execution("chrome binary missing"));
        }
        self.launched = true;
        Ok(())
    }

    async fn capture(&mut self) -> Result<Vec<u8>> {
        if !self.launched {
            return Err(AgentError::NotInitialized);
        }
        if self.capture_failures > 0 {
            self.capture_failures -= 1;
            return Err(AgentError::execution("screenshot failed"));
        }
        self.captures += 1;
        Ok(vec![0x89, 0x50, 0x4e, 0x47])
    }

    async fn page_state(&mut self) -> Result<PageState> {
        if !self.launched {
            return Err(AgentError::NotInitialized);
        }
        let url = self
            .navigations
            .last()
            .map(|(url, _)| url.clone())
            .unwrap_or_default();
        Ok(PageState::new(url, "Shop", "complete"))
    }

    async fn perform(&mut self, action: &Action) -> Result<Option<Value>> {
        if !self.launched {
            return Err(AgentError::NotInitialized);
        }
        self.performed.push(action.clone());
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(AgentError::execution("element detached"));
        }
        if self.failing_kinds.contains(&action.kind()) {
            return Err(AgentError::execution(format!("{} failed", action.kind())));
        }
        match action {
            Action::Extract { .. } => Ok(Some(serde_json::json!(["$9.99"]))),
            _ => Ok(None),
        }
    }

    async fn goto(&mut self, url: &str, policy: WaitPolicy) -> Result<()> {
        if !self.launched {
            return Err(AgentError::NotInitialized);
        }
        self.navigations.push((url.to_string(), policy));
        if self.fail_navigation {
            return Err(AgentError::execution("net::ERR_NAME_NOT_RESOLVED"));
        }
        if self.strict_times_out && policy == WaitPolicy::Strict {
            return Err(AgentError::Timeout(format!("navigation to {url}")));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.launched = false;
        self.closed = true;
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::no_delay(3)
    }
}

pub fn executor(
    oracle: ScriptedOracle,
    surface: FakeSurface,
) -> TaskExecutor<ScriptedOracle, FakeSurface> {
    settling_executor(oracle, surface, Duration::ZERO)
}

pub fn settling_executor(
    oracle: ScriptedOracle,
    surface: FakeSurface,
    settle_delay: Duration,
) -> TaskExecutor<ScriptedOracle, FakeSurface> {
    TaskExecutor::new(
        oracle,
        surface,
        ExecutorConfig {
            settle_delay,
            retry_actions: true,
        },
    )
}

pub fn click(selector: &str) -> Action {
    Action::Click {
        selector: Some(selector.to_string()),
        text: None,
    }
}
