//! Step control loop: perceive, decide, act, record, until the goal is met,
//! the agent is stuck, or the step budget runs out.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::brain::Oracle;
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::hands::ExecutionSurface;
use crate::ledger::{History, Metrics};
use crate::types::{
    Action, ActionResult, Decision, DecisionStatus, HistoryEntry, PageState, WaitPolicy,
};

pub const STUCK_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Pause after each step so page mutations can finish.
    pub settle_delay: Duration,
    /// Whether failed actions are retried by the surface.
    pub retry_actions: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(1),
            retry_actions: true,
        }
    }
}

impl From<&AgentConfig> for ExecutorConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            settle_delay: config.executor.settle_delay(),
            retry_actions: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Partial,
    Failed,
}

/// Everything a run reports, whatever its outcome.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub steps_taken: usize,
    pub history: Vec<HistoryEntry>,
    pub reasoning: String,
    pub metrics: Metrics,
}

/// Where the run is. Each adapter call moves it to the next phase.
enum Phase {
    Navigating,
    Capturing {
        step: usize,
    },
    Deciding {
        step: usize,
        screenshot: Vec<u8>,
        page: PageState,
    },
    Acting {
        step: usize,
        decision: Decision,
        page: PageState,
    },
    Done(TaskResult),
}

impl Phase {
    fn step(&self) -> Option<usize> {
        match self {
            Phase::Capturing { step }
            | Phase::Deciding { step, .. }
            | Phase::Acting { step, .. } => Some(*step),
            Phase::Navigating | Phase::Done(_) => None,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Mutable bookkeeping of a single run.
struct Run<'a> {
    goal: &'a str,
    budget: usize,
    history: History,
    metrics: Metrics,
    stuck_count: u32,
    last_action: Option<Action>,
}

impl<'a> Run<'a> {
    fn new(goal: &'a str, budget: usize) -> Self {
        Self {
            goal,
            budget,
            history: History::new(),
            metrics: Metrics::start(),
            stuck_count: 0,
            last_action: None,
        }
    }

    fn finish(
        &mut self,
        status: TaskStatus,
        result: Option<Value>,
        steps_taken: usize,
        reasoning: String,
    ) -> TaskResult {
        self.metrics.finish();
        TaskResult {
            status,
            result,
            steps_taken,
            history: std::mem::take(&mut self.history).into_entries(),
            reasoning,
            metrics: self.metrics.clone(),
        }
    }

    /// Updates the stuck counter for `decision`; returns the new count.
    fn observe_progress(&mut self, decision: &Decision) -> u32 {
        let reported = decision.status() == DecisionStatus::Stuck;
        let repeated = self.last_action.as_ref() == Some(decision.action());
        if reported || repeated {
            self.stuck_count += 1;
            debug!(reported, repeated, stuck_count = self.stuck_count, "no progress");
        } else {
            self.stuck_count = 0;
        }
        self.stuck_count
    }

    fn stuck_reasoning(&self, decision: &Decision) -> String {
        let kinds: Vec<String> = self
            .history
            .recent_kinds(STUCK_THRESHOLD as usize)
            .iter()
            .map(ToString::to_string)
            .collect();
        format!(
            "Agent is stuck after {} steps without progress (last actions: {}); goal not achieved: {}. Last oracle reasoning: {}",
            self.stuck_count,
            kinds.join(", "),
            self.goal,
            decision.reasoning()
        )
    }
}

/// Drives one task at a time against an oracle and an execution surface.
pub struct TaskExecutor<O, S> {
    oracle: O,
    surface: S,
    config: ExecutorConfig,
}

impl<O: Oracle, S: ExecutionSurface> TaskExecutor<O, S> {
    pub fn new(oracle: O, surface: S, config: ExecutorConfig) -> Self {
        Self {
            oracle,
            surface,
            config,
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn into_parts(self) -> (O, S) {
        (self.oracle, self.surface)
    }

    /// Runs `goal` from `start_url` for at most `step_budget` steps.
    ///
    /// Only launch and initial navigation failures are returned as errors;
    /// every other outcome is a [`TaskResult`]. The surface is closed on all
    /// paths.
    pub async fn run_task(
        &mut self,
        goal: &str,
        start_url: &str,
        step_budget: usize,
        headless: bool,
    ) -> Result<TaskResult> {
        info!(goal, start_url, step_budget, "starting task");
        let outcome = self.drive(goal, start_url, step_budget, headless).await;

        match AssertUnwindSafe(self.surface.close()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to release execution surface"),
            Err(panic) => warn!(
                panic = %panic_message(&*panic),
                "execution surface panicked on release"
            ),
        }

        match &outcome {
            Ok(result) => info!(
                status = ?result.status,
                steps = result.steps_taken,
                errors = result.metrics.errors_encountered,
                "task finished"
            ),
            Err(e) => error!(error = %e, "task could not start"),
        }
        outcome
    }

    async fn drive(
        &mut self,
        goal: &str,
        start_url: &str,
        step_budget: usize,
        headless: bool,
    ) -> Result<TaskResult> {
        let mut run = Run::new(goal, step_budget);
        let mut phase = Phase::Navigating;

        loop {
            phase = match phase {
                Phase::Done(result) => return Ok(result),
                Phase::Capturing { step } if step >= run.budget => {
                    let reasoning = format!(
                        "Step budget of {} reached without completing the goal: {}",
                        run.budget, run.goal
                    );
                    Phase::Done(run.finish(TaskStatus::Partial, None, run.budget, reasoning))
                }
                phase => {
                    let step = phase.step();
                    let advance = self.advance(&mut run, phase, start_url, headless);
                    let advanced = AssertUnwindSafe(advance).catch_unwind().await;
                    match advanced {
                        Ok(next) => next?,
                        Err(panic) => self.recover_panic(&mut run, step, &*panic).await?,
                    }
                }
            };
        }
    }

    /// Runs the adapter call behind `phase` and returns the phase that follows.
    async fn advance(
        &mut self,
        run: &mut Run<'_>,
        phase: Phase,
        start_url: &str,
        headless: bool,
    ) -> Result<Phase> {
        Ok(match phase {
            Phase::Navigating => {
                self.start(start_url, headless).await?;
                Phase::Capturing { step: 0 }
            }
            Phase::Capturing { step } => self.capture(run, step).await,
            Phase::Deciding {
                step,
                screenshot,
                page,
            } => self.decide(run, step, &screenshot, page).await,
            Phase::Acting {
                step,
                decision,
                page,
            } => self.act(run, step, decision, page).await,
            Phase::Done(result) => Phase::Done(result),
        })
    }

    /// A panic inside a step is counted like any other step error. One
    /// during startup fails the run.
    async fn recover_panic(
        &mut self,
        run: &mut Run<'_>,
        step: Option<usize>,
        payload: &(dyn Any + Send),
    ) -> Result<Phase> {
        let message = panic_message(payload);
        let Some(step) = step else {
            return Err(AgentError::initialization(format!("startup panicked: {message}")));
        };
        error!(step, panic = %message, "step panicked, continuing");
        run.metrics.errors_encountered += 1;
        Ok(self.next_step(run, step).await)
    }

    async fn start(&mut self, start_url: &str, headless: bool) -> Result<()> {
        Action::Navigate {
            url: start_url.to_string(),
        }
        .validate()
        .map_err(|e| AgentError::initialization(format!("bad start url: {e}")))?;

        self.surface
            .launch(headless)
            .await
            .map_err(|e| AgentError::initialization(format!("could not start browser: {e}")))?;
        self.surface
            .navigate(start_url, WaitPolicy::Strict)
            .await
            .map_err(|e| AgentError::initialization(format!("could not open {start_url}: {e}")))
    }

    async fn capture(&mut self, run: &mut Run<'_>, step: usize) -> Phase {
        let screenshot = match self.surface.capture().await {
            Ok(bytes) => bytes,
            Err(e) => return self.recover(run, step, "capture", e).await,
        };
        run.metrics.screenshots_taken += 1;

        match self.surface.page_state().await {
            Ok(page) => Phase::Deciding {
                step,
                screenshot,
                page,
            },
            Err(e) => self.recover(run, step, "page state", e).await,
        }
    }

    async fn decide(
        &mut self,
        run: &mut Run<'_>,
        step: usize,
        screenshot: &[u8],
        page: PageState,
    ) -> Phase {
        run.metrics.oracle_calls += 1;
        let decision = match self
            .oracle
            .decide(screenshot, run.goal, run.history.entries(), &page)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                // Oracle failures are noise, not stagnation: stuck_count is untouched.
                warn!(step, error = %e, "oracle call failed");
                run.metrics.errors_encountered += 1;
                let reasoning = format!("oracle error: {e}");
                run.history.push(HistoryEntry {
                    step,
                    action: Action::default(),
                    reasoning: reasoning.clone(),
                    confidence: 0.0,
                    result: ActionResult::failed(reasoning, 0),
                    url: page.url,
                    timestamp: Utc::now(),
                });
                return self.next_step(run, step).await;
            }
        };

        info!(
            step,
            status = ?decision.status(),
            action = %decision.action().kind(),
            confidence = decision.confidence(),
            "oracle decided"
        );

        if decision.status() == DecisionStatus::Complete {
            let reasoning = decision.reasoning().to_string();
            let data = decision.extracted_data().cloned();
            return Phase::Done(run.finish(TaskStatus::Success, data, step + 1, reasoning));
        }

        if run.observe_progress(&decision) >= STUCK_THRESHOLD {
            let reasoning = run.stuck_reasoning(&decision);
            warn!(step, "{reasoning}");
            return Phase::Done(run.finish(TaskStatus::Failed, None, step + 1, reasoning));
        }

        Phase::Acting {
            step,
            decision,
            page,
        }
    }

    async fn act(
        &mut self,
        run: &mut Run<'_>,
        step: usize,
        decision: Decision,
        page: PageState,
    ) -> Phase {
        let result = self
            .surface
            .act(decision.action(), self.config.retry_actions)
            .await;
        run.metrics.actions_executed += 1;
        if let Some(err) = result.error() {
            warn!(step, attempts = result.attempts(), error = err, "action failed");
            run.metrics.errors_encountered += 1;
        }

        run.history.push(HistoryEntry {
            step,
            action: decision.action().clone(),
            reasoning: decision.reasoning().to_string(),
            confidence: decision.confidence(),
            result,
            url: page.url,
            timestamp: Utc::now(),
        });
        run.last_action = Some(decision.action().clone());

        self.next_step(run, step).await
    }

    /// A step-level surface error: counted, then the run moves on.
    async fn recover(
        &mut self,
        run: &mut Run<'_>,
        step: usize,
        stage: &str,
        e: AgentError,
    ) -> Phase {
        warn!(step, stage, error = %e, "step error, continuing");
        run.metrics.errors_encountered += 1;
        self.next_step(run, step).await
    }

    async fn next_step(&self, run: &Run<'_>, step: usize) -> Phase {
        let next = step + 1;
        if next < run.budget && !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }
        Phase::Capturing { step: next }
    }
}
