mod common;

use std::time::Duration;

use agentic_rpa::error::AgentError;
use agentic_rpa::executor::TaskStatus;
use agentic_rpa::types::{Action, ActionKind, Decision, WaitPolicy};
use common::{
    FakeSurface, Reply, START_URL, ScriptedOracle, click, executor, settling_executor,
};
use serde_json::json;

const GOAL: &str = "find the price of the blue mug";

#[tokio::test]
async fn completes_on_first_step() {
    let oracle = ScriptedOracle::new(vec![Reply::Decide(Decision::complete(
        Some(json!({"price": "$9.99"})),
        "price is visible",
        95.0,
    ))]);
    let mut executor = executor(oracle, FakeSurface::new());

    let result = executor.run_task(GOAL, START_URL, 10, true).await.unwrap();

    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(result.steps_taken, 1);
    assert_eq!(result.result, Some(json!({"price": "$9.99"})));
    assert_eq!(result.reasoning, "price is visible");
    assert!(result.history.is_empty());
    assert_eq!(result.metrics.screenshots_taken, 1);
    assert_eq!(result.metrics.oracle_calls, 1);
    assert_eq!(result.metrics.actions_executed, 0);
    assert!(result.metrics.finished_at.is_some());

    let surface = executor.surface();
    assert!(surface.closed);
    assert_eq!(
        surface.navigations,
        vec![(START_URL.to_string(), WaitPolicy::Strict)]
    );
}

#[tokio::test]
async fn distinct_actions_until_budget_is_partial() {
    let mut executor = executor(ScriptedOracle::new(vec![]), FakeSurface::new());

    let result = executor.run_task(GOAL, START_URL, 5, true).await.unwrap();

    assert_eq!(result.status, TaskStatus::Partial);
    assert_eq!(result.steps_taken, 5);
    assert!(result.result.is_none());
    assert_eq!(result.history.len(), 5);
    assert!(result.reasoning.contains("budget"));
    assert_eq!(result.metrics.actions_executed, 5);
    assert_eq!(result.metrics.errors_encountered, 0);
    assert!(executor.surface().closed);
}

#[tokio::test]
async fn three_stuck_reports_fail_the_run() {
    let script = (0..3)
        .map(|i| Reply::Decide(Decision::stuck(Action::wait(100 + i), "no idea", 10.0)))
        .collect();
    let mut executor = executor(ScriptedOracle::new(script), FakeSurface::new());

    let result = executor.run_task(GOAL, START_URL, 10, true).await.unwrap();

    assert_eq!(result.status, TaskStatus::Failed);
    assert!(result.steps_taken <= 3);
    assert!(result.result.is_none());
    assert!(result.reasoning.contains(GOAL));
}

#[tokio::test]
async fn repeating_the_same_action_fails_the_run() {
    let script = (0..10)
        .map(|_| Reply::Decide(Decision::proceed(click("#add-to-cart"), "add it", 70.0)))
        .collect();
    let mut executor = executor(ScriptedOracle::new(script), FakeSurface::new());

    let result = executor.run_task(GOAL, START_URL, 10, true).await.unwrap();

    assert_eq!(result.status, TaskStatus::Failed);
    // First proposal sets the baseline; the next three are repeats.
    assert_eq!(result.steps_taken, 4);
    assert!(result.reasoning.contains("click, click, click"));
    assert!(result.reasoning.contains(GOAL));
    assert!(executor.surface().closed);
}

#[tokio::test]
async fn progress_resets_the_stuck_counter() {
    let script = vec![
        Reply::Decide(Decision::stuck(Action::wait(1), "hmm", 20.0)),
        Reply::Decide(Decision::stuck(Action::wait(2), "hmm", 20.0)),
        Reply::Decide(Decision::proceed(click("#next"), "try next", 60.0)),
        Reply::Decide(Decision::stuck(Action::wait(3), "hmm", 20.0)),
        Reply::Decide(Decision::stuck(Action::wait(4), "hmm", 20.0)),
        Reply::Decide(Decision::complete(None, "done", 90.0)),
    ];
    let mut executor = executor(ScriptedOracle::new(script), FakeSurface::new());

    let result = executor.run_task(GOAL, START_URL, 10, true).await.unwrap();

    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(result.steps_taken, 6);
}

#[tokio::test]
async fn oracle_error_is_recorded_and_run_recovers() {
    let script = vec![
        Reply::Fail("503 from upstream"),
        Reply::Decide(Decision::complete(Some(json!("$9.99")), "found", 90.0)),
    ];
    let mut executor = executor(ScriptedOracle::new(script), FakeSurface::new());

    let result = executor.run_task(GOAL, START_URL, 10, true).await.unwrap();

    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(result.steps_taken, 2);
    assert!(result.metrics.errors_encountered >= 1);
    assert_eq!(result.history.len(), 1);
    let synthetic = &result.history[0];
    assert_eq!(synthetic.action.kind(), ActionKind::Wait);
    assert_eq!(synthetic.confidence, 0.0);
    assert!(synthetic.reasoning.contains("503 from upstream"));
    assert!(!synthetic.result.is_success());
    assert_eq!(result.metrics.actions_executed, 0);
}

#[tokio::test]
async fn oracle_errors_never_count_as_stuck() {
    let script = (0..6).map(|_| Reply::Fail("timeout")).collect();
    let mut executor = executor(ScriptedOracle::new(script), FakeSurface::new());

    let result = executor.run_task(GOAL, START_URL, 6, true).await.unwrap();

    assert_eq!(result.status, TaskStatus::Partial);
    assert_eq!(result.steps_taken, 6);
    assert_eq!(result.metrics.errors_encountered, 6);
    assert_eq!(result.metrics.oracle_calls, 6);
}

#[tokio::test]
async fn failed_actions_are_recorded_not_fatal() {
    let script = vec![
        Reply::Decide(Decision::proceed(click("#missing"), "click it", 60.0)),
        Reply::Decide(Decision::proceed(
            Action::Extract {
                selector: ".price".into(),
            },
            "read price",
            80.0,
        )),
        Reply::Decide(Decision::complete(Some(json!("$9.99")), "got it", 90.0)),
    ];
    let mut surface = FakeSurface::new();
    surface.failing_kinds = vec![ActionKind::Click];
    let mut executor = executor(ScriptedOracle::new(script), surface);

    let result = executor.run_task(GOAL, START_URL, 10, true).await.unwrap();

    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(result.metrics.errors_encountered, 1);
    assert_eq!(result.metrics.actions_executed, 2);

    let failed = &result.history[0].result;
    assert!(!failed.is_success());
    assert_eq!(failed.attempts(), 3);
    assert_eq!(result.history[1].result.data(), Some(&json!(["$9.99"])));
    assert_eq!(result.history[1].url, START_URL);
}

#[tokio::test]
async fn oracle_sees_growing_history() {
    let script = vec![
        Reply::Decide(Decision::proceed(click("#a"), "a", 50.0)),
        Reply::Decide(Decision::proceed(click("#b"), "b", 50.0)),
        Reply::Decide(Decision::complete(None, "done", 90.0)),
    ];
    let mut executor = executor(ScriptedOracle::new(script), FakeSurface::new());

    executor.run_task(GOAL, START_URL, 10, true).await.unwrap();

    let (oracle, _) = executor.into_parts();
    assert_eq!(oracle.history_lengths(), vec![0, 1, 2]);
}

#[tokio::test]
async fn capture_failures_are_counted_and_skipped() {
    let mut surface = FakeSurface::new();
    surface.capture_failures = 2;
    let script = vec![Reply::Decide(Decision::complete(None, "done", 90.0))];
    let mut executor = executor(ScriptedOracle::new(script), surface);

    let result = executor.run_task(GOAL, START_URL, 10, true).await.unwrap();

    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(result.steps_taken, 3);
    assert_eq!(result.metrics.errors_encountered, 2);
    assert_eq!(result.metrics.screenshots_taken, 1);
    assert_eq!(result.metrics.oracle_calls, 1);
}

#[tokio::test]
async fn launch_failure_is_fatal_but_cleans_up() {
    let mut surface = FakeSurface::new();
    surface.fail_launch = true;
    let mut executor = executor(ScriptedOracle::new(vec![]), surface);

    let err = executor.run_task(GOAL, START_URL, 10, true).await.unwrap_err();

    assert!(matches!(err, AgentError::Initialization(_)));
    assert!(executor.surface().closed);
}

#[tokio::test]
async fn start_navigation_failure_is_fatal_but_cleans_up() {
    let mut surface = FakeSurface::new();
    surface.fail_navigation = true;
    let mut executor = executor(ScriptedOracle::new(vec![]), surface);

    let err = executor.run_task(GOAL, START_URL, 10, true).await.unwrap_err();

    assert!(matches!(err, AgentError::Initialization(_)));
    assert!(executor.surface().closed);
    assert!(executor.surface().performed.is_empty());
}

#[tokio::test]
async fn invalid_start_url_is_rejected_before_launch() {
    let mut executor = executor(ScriptedOracle::new(vec![]), FakeSurface::new());

    let err = executor.run_task(GOAL, "not a url", 10, true).await.unwrap_err();

    assert!(matches!(err, AgentError::Initialization(_)));
    assert!(executor.surface().navigations.is_empty());
}

#[tokio::test]
async fn strict_start_navigation_falls_back_to_loose() {
    let mut surface = FakeSurface::new();
    surface.strict_times_out = true;
    let script = vec![Reply::Decide(Decision::complete(None, "done", 90.0))];
    let mut executor = executor(ScriptedOracle::new(script), surface);

    let result = executor.run_task(GOAL, START_URL, 10, true).await.unwrap();

    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(
        executor.surface().navigations,
        vec![
            (START_URL.to_string(), WaitPolicy::Strict),
            (START_URL.to_string(), WaitPolicy::Loose),
        ]
    );
}

#[tokio::test]
async fn task_result_serializes_for_reporting() {
    let script = vec![
        Reply::Decide(Decision::proceed(click("#a"), "a", 50.0)),
        Reply::Decide(Decision::complete(Some(json!({"ok": true})), "done", 90.0)),
    ];
    let mut executor = executor(ScriptedOracle::new(script), FakeSurface::new());

    let result = executor.run_task(GOAL, START_URL, 10, true).await.unwrap();
    let value = serde_json::to_value(&result).unwrap();

    assert_eq!(value["status"], "success");
    assert_eq!(value["steps_taken"], 2);
    assert_eq!(value["history"][0]["action"]["type"], "click");
    assert_eq!(value["metrics"]["actions_executed"], 1);
    assert!(value["metrics"]["duration_ms"].is_u64());
    assert_eq!(result.metrics.duration_ms, Some(result.metrics.duration().as_millis() as u64));
}

#[tokio::test]
async fn panicking_oracle_is_contained_and_the_surface_released() {
    let script = vec![
        Reply::Panic("index out of bounds: the len is 0 but the index is 3"),
        Reply::Decide(Decision::complete(Some(json!("$9.99")), "found", 90.0)),
    ];
    let mut executor = executor(ScriptedOracle::new(script), FakeSurface::new());

    let result = executor.run_task(GOAL, START_URL, 3, true).await.unwrap();

    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(result.steps_taken, 2);
    assert_eq!(result.metrics.errors_encountered, 1);
    assert_eq!(result.metrics.oracle_calls, 2);
    assert!(executor.surface().closed);
}

#[tokio::test]
async fn panic_during_startup_fails_the_run_but_cleans_up() {
    let mut surface = FakeSurface::new();
    surface.panic_on_launch = true;
    let mut executor = executor(ScriptedOracle::new(vec![]), surface);

    let err = executor.run_task(GOAL, START_URL, 3, true).await.unwrap_err();

    assert!(matches!(err, AgentError::Initialization(ref m) if m.contains("sideways")));
    assert!(executor.surface().closed);
}

#[tokio::test(start_paused = true)]
async fn settle_delay_runs_between_steps_only() {
    let delay = Duration::from_millis(750);
    let mut executor = settling_executor(ScriptedOracle::new(vec![]), FakeSurface::new(), delay);

    let started = tokio::time::Instant::now();
    let result = executor.run_task(GOAL, START_URL, 4, true).await.unwrap();

    assert_eq!(result.status, TaskStatus::Partial);
    assert_eq!(started.elapsed(), delay * 3);
}

#[tokio::test(start_paused = true)]
async fn no_settle_delay_after_a_terminal_step() {
    let delay = Duration::from_secs(1);
    let script = vec![Reply::Decide(Decision::complete(None, "done", 90.0))];
    let mut executor = settling_executor(ScriptedOracle::new(script), FakeSurface::new(), delay);

    let started = tokio::time::Instant::now();
    executor.run_task(GOAL, START_URL, 4, true).await.unwrap();

    assert_eq!(started.elapsed(), Duration::ZERO);
}
