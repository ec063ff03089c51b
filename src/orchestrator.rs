//! Approach selection for discrete action requests.
//!
//! Each request is routed to one of three automation strategies, cheapest
//! first: structural locators, generated scripts, or the vision agent. The
//! choice comes from priority-ordered rules over the page's structural
//! signals, recent failures on the same URL and the success rates learned
//! from earlier results.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dom::{StructuralAnalysis, StructuralAnalyzer};
use crate::ledger::BoundedLog;
use crate::types::ActionResult;

pub const DECISION_LOG_CAPACITY: usize = 100;
pub const EXECUTION_LOG_CAPACITY: usize = 50;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

const FAILURE_MEMORY_SECS: i64 = 3600;
const OUTCOME_SEARCH_WINDOW: usize = 5;
const FORM_THRESHOLD_FACTOR: f64 = 0.7;
const CODEGEN_MIN_CONFIDENCE: f64 = 0.4;
const LEARNING_MIN_DECISIONS: usize = 6;
const LEARNING_MIN_ATTEMPTS: u32 = 3;

/// Automation strategy, in ascending order of cost and capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approach {
    Structural,
    Codegen,
    VisionFallback,
}

impl Approach {
    pub const ALL: [Approach; 3] = [
        Approach::Structural,
        Approach::Codegen,
        Approach::VisionFallback,
    ];
}

impl fmt::Display for Approach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Approach::Structural => "structural",
            Approach::Codegen => "codegen",
            Approach::VisionFallback => "vision_fallback",
        };
        f.write_str(name)
    }
}

/// A single discrete action to automate on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub url: String,
    pub task: String,
    /// Overrides every rule when set.
    #[serde(default)]
    pub preferred_approach: Option<Approach>,
    #[serde(default = "default_threshold")]
    pub confidence_threshold: f64,
}

fn default_threshold() -> f64 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

impl ActionRequest {
    pub fn new(url: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            task: task.into(),
            preferred_approach: None,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }

    pub fn with_preferred(mut self, approach: Approach) -> Self {
        self.preferred_approach = Some(approach);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageComplexity {
    Simple,
    Moderate,
    Complex,
}

impl PageComplexity {
    pub fn from_counts(element_count: usize, form_count: usize) -> Self {
        if element_count > 15 || form_count > 2 {
            PageComplexity::Complex
        } else if element_count > 5 || form_count > 0 {
            PageComplexity::Moderate
        } else {
            PageComplexity::Simple
        }
    }
}

/// Per-request snapshot the rules are evaluated against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionContext {
    pub structural_confidence: f64,
    pub page_complexity: PageComplexity,
    pub element_count: usize,
    pub form_count: usize,
    /// Approaches that failed on this URL within the last hour.
    pub previous_failures: BTreeSet<Approach>,
}

impl DecisionContext {
    fn failed_recently(&self, approach: Approach) -> bool {
        self.previous_failures.contains(&approach)
    }
}

/// Running success rate of one approach.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ApproachStats {
    pub success_rate: f64,
    pub attempts: u32,
}

impl ApproachStats {
    /// Incremental mean over binary outcomes.
    fn record(&mut self, success: bool) {
        self.attempts += 1;
        let n = f64::from(self.attempts);
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate = (self.success_rate * (n - 1.0) + outcome) / n;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedOutcome {
    pub success: bool,
    pub execution_time_ms: u64,
    pub error: Option<String>,
}

/// One logged strategy choice; the outcome is filled in once known.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRecord {
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub task: String,
    pub approach: Approach,
    pub reasoning: String,
    pub structural_confidence: f64,
    pub page_complexity: PageComplexity,
    pub element_count: usize,
    pub form_count: usize,
    pub previous_failures: Vec<Approach>,
    pub outcome: Option<RecordedOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub approach: Approach,
    pub success: bool,
    pub execution_time_ms: u64,
    pub error: Option<String>,
}

/// The chosen approach with the context and the one-line reason behind it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub approach: Approach,
    pub context: DecisionContext,
    pub reasoning: String,
}

/// Diagnostics snapshot of the learned model.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyReport {
    pub stats: BTreeMap<Approach, ApproachStats>,
    pub total_decisions: usize,
    pub recent_decisions: Vec<DecisionRecord>,
    pub recent_executions: Vec<ExecutionRecord>,
}

struct PolicyState {
    stats: BTreeMap<Approach, ApproachStats>,
    decisions: BoundedLog<DecisionRecord>,
    executions: BoundedLog<ExecutionRecord>,
    total_decisions: usize,
}

impl PolicyState {
    fn new() -> Self {
        Self {
            stats: BTreeMap::new(),
            decisions: BoundedLog::new(DECISION_LOG_CAPACITY),
            executions: BoundedLog::new(EXECUTION_LOG_CAPACITY),
            total_decisions: 0,
        }
    }

    fn recent_failures(&self, url: &str, now: DateTime<Utc>) -> BTreeSet<Approach> {
        let cutoff = now - chrono::Duration::seconds(FAILURE_MEMORY_SECS);
        self.decisions
            .iter()
            .filter(|r| r.url == url && r.timestamp >= cutoff)
            .filter(|r| r.outcome.as_ref().is_some_and(|o| !o.success))
            .map(|r| r.approach)
            .collect()
    }

    /// Highest learned success rate among approaches with enough attempts
    /// and no recent failure. Ties go to the cheaper approach.
    fn best_learned(&self, context: &DecisionContext) -> Option<(Approach, ApproachStats)> {
        let mut best: Option<(Approach, ApproachStats)> = None;
        for approach in Approach::ALL {
            let Some(stats) = self.stats.get(&approach) else {
                continue;
            };
            if stats.attempts < LEARNING_MIN_ATTEMPTS || context.failed_recently(approach) {
                continue;
            }
            if best.is_none_or(|(_, b)| stats.success_rate > b.success_rate) {
                best = Some((approach, *stats));
            }
        }
        best
    }

    fn evaluate(&self, request: &ActionRequest, ctx: &DecisionContext) -> (Approach, String) {
        let confidence = ctx.structural_confidence;
        let threshold = request.confidence_threshold;

        if let Some(preferred) = request.preferred_approach {
            return (preferred, format!("caller requested {preferred}"));
        }

        if confidence >= threshold
            && (ctx.page_complexity == PageComplexity::Simple || ctx.element_count >= 3)
            && !ctx.failed_recently(Approach::Structural)
        {
            return (
                Approach::Structural,
                format!(
                    "structural confidence {confidence:.2} meets threshold {threshold:.2} with {} interactive elements",
                    ctx.element_count
                ),
            );
        }

        if confidence >= FORM_THRESHOLD_FACTOR * threshold && ctx.form_count > 0 {
            return (
                Approach::Structural,
                format!(
                    "{} form(s) present and structural confidence {confidence:.2} is within 70% of threshold",
                    ctx.form_count
                ),
            );
        }

        let non_trivial = ctx.page_complexity != PageComplexity::Simple;
        if !ctx.failed_recently(Approach::Codegen)
            && ((confidence >= CODEGEN_MIN_CONFIDENCE && non_trivial)
                || ctx.page_complexity == PageComplexity::Complex)
        {
            return (
                Approach::Codegen,
                format!(
                    "{:?} page with structural confidence {confidence:.2} suits generated scripts",
                    ctx.page_complexity
                ),
            );
        }

        if self.decisions.len() >= LEARNING_MIN_DECISIONS
            && let Some((approach, stats)) = self.best_learned(ctx)
        {
            return (
                approach,
                format!(
                    "learned success rate {:.2} over {} attempts",
                    stats.success_rate, stats.attempts
                ),
            );
        }

        (
            Approach::VisionFallback,
            "no cheaper approach qualifies; using vision".to_string(),
        )
    }
}

/// Synchronized selection policy. All learning state lives behind one lock.
pub struct ApproachPolicy {
    state: Mutex<PolicyState>,
}

impl Default for ApproachPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ApproachPolicy {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PolicyState::new()),
        }
    }

    /// Picks an approach for `request` and logs the decision.
    pub fn choose_approach(
        &self,
        request: &ActionRequest,
        analysis: &StructuralAnalysis,
    ) -> Selection {
        self.choose_approach_at(request, analysis, Utc::now())
    }

    fn choose_approach_at(
        &self,
        request: &ActionRequest,
        analysis: &StructuralAnalysis,
        now: DateTime<Utc>,
    ) -> Selection {
        let mut state = self.state.lock();
        let context = DecisionContext {
            structural_confidence: analysis.confidence,
            page_complexity: PageComplexity::from_counts(
                analysis.interactive_element_count,
                analysis.forms_count,
            ),
            element_count: analysis.interactive_element_count,
            form_count: analysis.forms_count,
            previous_failures: state.recent_failures(&request.url, now),
        };

        let (approach, reasoning) = state.evaluate(request, &context);
        debug!(url = %request.url, %approach, %reasoning, ?context, "approach chosen");

        state.decisions.push(DecisionRecord {
            timestamp: now,
            url: request.url.clone(),
            task: request.task.clone(),
            approach,
            reasoning: reasoning.clone(),
            structural_confidence: context.structural_confidence,
            page_complexity: context.page_complexity,
            element_count: context.element_count,
            form_count: context.form_count,
            previous_failures: context.previous_failures.iter().copied().collect(),
            outcome: None,
        });
        state.total_decisions += 1;

        Selection {
            approach,
            context,
            reasoning,
        }
    }

    /// Folds an execution result into the learned rates and the decision log.
    pub fn record_result(
        &self,
        request: &ActionRequest,
        approach: Approach,
        result: &ActionResult,
        elapsed: Duration,
    ) {
        let now = Utc::now();
        let success = result.is_success();
        let error = result.error().map(String::from);
        let execution_time_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        let mut state = self.state.lock();
        let stats = state.stats.entry(approach).or_default();
        stats.record(success);
        debug!(
            %approach,
            success,
            rate = stats.success_rate,
            attempts = stats.attempts,
            "result recorded"
        );

        if let Some(record) = state
            .decisions
            .recent_mut(OUTCOME_SEARCH_WINDOW)
            .find(|r| r.url == request.url && r.approach == approach)
        {
            record.outcome = Some(RecordedOutcome {
                success,
                execution_time_ms,
                error: error.clone(),
            });
        }

        state.executions.push(ExecutionRecord {
            timestamp: now,
            url: request.url.clone(),
            approach,
            success,
            execution_time_ms,
            error,
        });
    }

    pub fn stats(&self, approach: Approach) -> ApproachStats {
        self.state.lock().stats.get(&approach).copied().unwrap_or_default()
    }

    pub fn report(&self) -> PolicyReport {
        let state = self.state.lock();
        PolicyReport {
            stats: state.stats.clone(),
            total_decisions: state.total_decisions,
            recent_decisions: state.decisions.to_vec(),
            recent_executions: state.executions.to_vec(),
        }
    }
}

/// One automation strategy. The policy treats them uniformly.
#[async_trait]
pub trait StrategyExecutor: Send + Sync {
    async fn execute(&self, request: &ActionRequest, context: &DecisionContext) -> ActionResult;
}

/// What `Orchestrator::execute` did for a request.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub approach: Approach,
    pub reasoning: String,
    pub context: DecisionContext,
    pub result: ActionResult,
    pub execution_time_ms: u64,
}

/// Analyze, choose, dispatch, learn.
pub struct Orchestrator {
    policy: ApproachPolicy,
    analyzer: Arc<dyn StructuralAnalyzer>,
    executors: HashMap<Approach, Arc<dyn StrategyExecutor>>,
}

impl Orchestrator {
    pub fn new(analyzer: Arc<dyn StructuralAnalyzer>) -> Self {
        Self {
            policy: ApproachPolicy::new(),
            analyzer,
            executors: HashMap::new(),
        }
    }

    pub fn with_executor(
        mut self,
        approach: Approach,
        executor: Arc<dyn StrategyExecutor>,
    ) -> Self {
        self.executors.insert(approach, executor);
        self
    }

    pub fn policy(&self) -> &ApproachPolicy {
        &self.policy
    }

    pub fn report(&self) -> PolicyReport {
        self.policy.report()
    }

    /// Analysis failures degrade to an empty analysis rather than failing
    /// the request.
    pub async fn plan(&self, request: &ActionRequest) -> Selection {
        let analysis = match self.analyzer.analyze(&request.url).await {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!(url = %request.url, error = %e, "structural analysis failed");
                StructuralAnalysis::new(0.0, 0, 0)
            }
        };
        self.policy.choose_approach(request, &analysis)
    }

    pub async fn execute(&self, request: &ActionRequest) -> ExecutionReport {
        let selection = self.plan(request).await;
        info!(
            url = %request.url,
            approach = %selection.approach,
            reasoning = %selection.reasoning,
            "executing request"
        );

        let started = Instant::now();
        let result = match self.executors.get(&selection.approach) {
            Some(executor) => executor.execute(request, &selection.context).await,
            None => ActionResult::failed(
                format!("no executor registered for {}", selection.approach),
                0,
            ),
        };
        let elapsed = started.elapsed();

        self.policy
            .record_result(request, selection.approach, &result, elapsed);

        ExecutionReport {
            approach: selection.approach,
            reasoning: selection.reasoning,
            context: selection.context,
            result,
            execution_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }
}
