//! Scheduler integration tests against the SQLite store and a scripted executor.

mod common;

use std::sync::Arc;
use std::time::Duration;

use taskloop::adapters::executors::{MockExecutor, MockResponse};
use taskloop::adapters::sqlite::SqliteWorkStore;
use taskloop::domain::models::{
    CompletionReason, Config, ExecutionMode, IterationSession, WorkItem, WorkStatus, MAX_CONTEXT_EXTENSIONS,
};
use taskloop::domain::ports::{ExecutionResult, WorkStore};
use taskloop::services::{DispatchOutcome, Scheduler};

use common::{setup_store, test_config};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type TestScheduler = Scheduler<SqliteWorkStore, MockExecutor>;

fn scheduler(store: &Arc<SqliteWorkStore>, executor: &Arc<MockExecutor>, config: &Config) -> TestScheduler {
    Scheduler::new(Arc::clone(store), Arc::clone(executor), config).expect("valid scheduler config")
}

async fn reload(store: &SqliteWorkStore, item: &WorkItem) -> WorkItem {
    store.get(item.id).await.unwrap().expect("item exists")
}

fn saved_session(item: &WorkItem) -> IterationSession {
    item.context.last_session.clone().expect("session saved on item")
}

const PROMISE_PROMPT: &str = "Refactor the parser. Output <promise>PARSER_REFACTORED</promise> when finished.";

// ---------------------------------------------------------------------------
// Direct execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_direct_item_completes() {
    let store = setup_store().await;
    let executor = Arc::new(MockExecutor::scripted([MockResponse::Result(
        ExecutionResult::success("all done").with_files(["src/lib.rs"]),
    )]));
    let item = WorkItem::new("Say hi", "Print a greeting");
    store.add(item.clone()).await.unwrap();

    let stats = scheduler(&store, &executor, &test_config()).run_until_idle().await.unwrap();
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.completed, 1);

    let done = reload(&store, &item).await;
    assert_eq!(done.status, WorkStatus::Completed);
    let result = done.result.expect("result stored");
    assert_eq!(result.content, "all done");
    assert_eq!(result.files_changed, vec!["src/lib.rs".to_string()]);
    assert_eq!(executor.prompts().await, vec!["Print a greeting".to_string()]);
}

#[tokio::test]
async fn test_direct_failures_retry_until_exhausted() {
    let store = setup_store().await;
    let executor = Arc::new(MockExecutor::with_fallback(MockResponse::failure("compile error")));
    let item = WorkItem::new("Build", "Build the project");
    store.add(item.clone()).await.unwrap();

    let stats = scheduler(&store, &executor, &test_config()).run_until_idle().await.unwrap();
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.failed, 1);

    let failed = reload(&store, &item).await;
    assert_eq!(failed.status, WorkStatus::Failed);
    assert_eq!(failed.attempts, 3);
    assert_eq!(failed.error_message.as_deref(), Some("compile error"));
    assert_eq!(executor.call_count().await, 3);
}

#[tokio::test]
async fn test_executor_timeout_fails_the_attempt() {
    let store = setup_store().await;
    let executor = Arc::new(MockExecutor::scripted([MockResponse::Delayed(
        Duration::from_millis(500),
        ExecutionResult::success("too late"),
    )]));
    let item = WorkItem::new("Slow", "Slow job");
    store.add(item.clone()).await.unwrap();

    let claimed = store.claim_next().await.unwrap().unwrap();
    let outcome = scheduler(&store, &executor, &test_config())
        .with_iteration_timeout(Duration::from_millis(20))
        .process(claimed)
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Retrying);

    let retried = reload(&store, &item).await;
    assert_eq!(retried.status, WorkStatus::Pending);
    assert!(retried.error_message.unwrap().contains("timed out"));
    assert!(retried.total_execution_time >= Duration::from_millis(20));
}

// ---------------------------------------------------------------------------
// Convergent execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_convergent_item_completes_on_promise() {
    let store = setup_store().await;
    let executor = Arc::new(MockExecutor::scripted([
        MockResponse::success("Renamed the lexer module"),
        MockResponse::success("Split expression parsing; tests still red"),
        MockResponse::Result(
            ExecutionResult::success("Tests green. <promise>PARSER_REFACTORED</promise>").with_files(["src/parser.rs"]),
        ),
    ]));
    let item = WorkItem::new("Refactor parser", PROMISE_PROMPT).convergent(None, None);
    store.add(item.clone()).await.unwrap();

    let stats = scheduler(&store, &executor, &test_config()).run_until_idle().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(executor.call_count().await, 3);
    assert!(executor.prompts().await.iter().all(|p| p == PROMISE_PROMPT));

    let done = reload(&store, &item).await;
    assert_eq!(done.status, WorkStatus::Completed);
    assert_eq!(done.attempts, 1);
    let result = done.result.unwrap();
    assert_eq!(result.files_changed, vec!["src/parser.rs".to_string()]);
    let session = result.session.expect("session recorded");
    assert_eq!(session.current_iteration, 3);
    assert_eq!(session.completion_reason, Some(CompletionReason::Promise));
    assert!(session.is_complete);
}

#[tokio::test]
async fn test_other_promise_text_does_not_complete() {
    let store = setup_store().await;
    let executor = Arc::new(MockExecutor::scripted([
        MockResponse::success("<promise>DONE</promise>"),
        MockResponse::success("<promise>parser_refactored</promise>"),
    ]));
    let item = WorkItem::new("Refactor parser", PROMISE_PROMPT).convergent(Some(4), None);
    store.add(item.clone()).await.unwrap();

    scheduler(&store, &executor, &test_config()).run_until_idle().await.unwrap();

    let done = reload(&store, &item).await;
    assert_eq!(done.status, WorkStatus::Completed);
    assert_eq!(done.result.unwrap().session.unwrap().current_iteration, 2);
}

#[tokio::test]
async fn test_item_promise_overrides_prompt() {
    let store = setup_store().await;
    let executor = Arc::new(MockExecutor::scripted([MockResponse::success("<promise>SHIP_IT</promise>")]));
    let item = WorkItem::new("Release", "Cut the release branch").convergent(Some(3), Some("SHIP_IT".into()));
    store.add(item.clone()).await.unwrap();

    scheduler(&store, &executor, &test_config()).run_until_idle().await.unwrap();
    assert_eq!(reload(&store, &item).await.status, WorkStatus::Completed);
}

#[tokio::test]
async fn test_stuck_loop_escalates_to_hold() {
    let store = setup_store().await;
    let executor = Arc::new(MockExecutor::scripted([
        MockResponse::success("Tried the migration"),
        MockResponse::success("I am stuck: the staging credentials are missing"),
    ]));
    let item = WorkItem::new("Migrate", PROMISE_PROMPT).convergent(None, None);
    store.add(item.clone()).await.unwrap();

    let stats = scheduler(&store, &executor, &test_config()).run_until_idle().await.unwrap();
    assert_eq!(stats.escalated, 1);
    assert_eq!(executor.call_count().await, 2);

    let held = reload(&store, &item).await;
    assert_eq!(held.status, WorkStatus::Hold);
    assert!(held.context.hold_reason.as_deref().unwrap().contains("stuck after 2 iterations"));

    let session = saved_session(&held);
    assert_eq!(session.completion_reason, Some(CompletionReason::Stuck));
    assert!(session.last_record().unwrap().stuck);
}

#[tokio::test]
async fn test_stuck_on_last_attempt_fails() {
    let store = setup_store().await;
    let executor = Arc::new(MockExecutor::with_fallback(MockResponse::success("Cannot proceed without access")));
    let item = WorkItem::new("Migrate", PROMISE_PROMPT).convergent(None, None);
    store.add(item.clone()).await.unwrap();

    let mut config = test_config();
    config.scheduler.max_retries = 1;
    let stats = scheduler(&store, &executor, &config).run_until_idle().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(reload(&store, &item).await.status, WorkStatus::Failed);
}

#[tokio::test]
async fn test_iteration_cap_fails_the_attempt() {
    let store = setup_store().await;
    let executor = Arc::new(MockExecutor::with_fallback(MockResponse::success("still working")));
    let prompt = "Tighten the types --max-iterations 2. Output <promise>TYPES_TIGHT</promise> when done.";
    let item = WorkItem::new("Types", prompt).convergent(None, None);
    store.add(item.clone()).await.unwrap();

    let claimed = store.claim_next().await.unwrap().unwrap();
    let outcome = scheduler(&store, &executor, &test_config()).process(claimed).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Retrying);
    assert_eq!(executor.call_count().await, 2);

    let retried = reload(&store, &item).await;
    assert_eq!(retried.status, WorkStatus::Pending);
    assert!(retried
        .error_message
        .as_deref()
        .unwrap()
        .contains("no completion signal after 2 iterations"));
    let session = saved_session(&retried);
    assert_eq!(session.current_iteration, 2);
    assert_eq!(session.completion_reason, Some(CompletionReason::MaxIterations));
}

#[tokio::test]
async fn test_timeouts_consume_iterations() {
    let store = setup_store().await;
    let executor = Arc::new(MockExecutor::scripted([
        MockResponse::Delayed(Duration::from_millis(300), ExecutionResult::success("late")),
        MockResponse::success("<promise>PARSER_REFACTORED</promise>"),
    ]));
    let item = WorkItem::new("Refactor", PROMISE_PROMPT).convergent(Some(3), None);
    store.add(item.clone()).await.unwrap();

    let claimed = store.claim_next().await.unwrap().unwrap();
    let outcome = scheduler(&store, &executor, &test_config())
        .with_iteration_timeout(Duration::from_millis(20))
        .process(claimed)
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Completed);

    let session = reload(&store, &item).await.result.unwrap().session.unwrap();
    assert_eq!(session.current_iteration, 2);
    assert_eq!(session.error_count(), 1);
}

#[tokio::test]
async fn test_executor_error_fails_attempt_and_keeps_session() {
    let store = setup_store().await;
    let executor = Arc::new(MockExecutor::scripted([
        MockResponse::success("first pass"),
        MockResponse::Error("connection reset".into()),
    ]));
    let item = WorkItem::new("Refactor", PROMISE_PROMPT).convergent(None, None);
    store.add(item.clone()).await.unwrap();

    let claimed = store.claim_next().await.unwrap().unwrap();
    let outcome = scheduler(&store, &executor, &test_config()).process(claimed).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Retrying);

    let retried = reload(&store, &item).await;
    assert!(retried.error_message.as_deref().unwrap().contains("connection reset"));
    let session = saved_session(&retried);
    assert_eq!(session.current_iteration, 2);
    assert_eq!(session.error_count(), 1);
}

#[tokio::test]
async fn test_session_saved_when_extensions_are_full() {
    let store = setup_store().await;
    let executor = Arc::new(MockExecutor::scripted([MockResponse::Error("connection reset".into())]));
    let mut item = WorkItem::new("Refactor", PROMISE_PROMPT).convergent(None, None);
    for i in 0..MAX_CONTEXT_EXTENSIONS {
        item.context.set_extension(format!("key_{i}"), serde_json::json!(i)).unwrap();
    }
    store.add(item.clone()).await.unwrap();

    let claimed = store.claim_next().await.unwrap().unwrap();
    scheduler(&store, &executor, &test_config()).process(claimed).await.unwrap();

    let retried = reload(&store, &item).await;
    assert_eq!(retried.context.extensions.len(), MAX_CONTEXT_EXTENSIONS);
    assert_eq!(saved_session(&retried).error_count(), 1);
    assert_eq!(saved_session(&retried).current_iteration, 1);
}

#[tokio::test]
async fn test_zero_iteration_cap_falls_back_to_default() {
    let store = setup_store().await;
    let executor = Arc::new(MockExecutor::scripted([
        MockResponse::success("working"),
        MockResponse::success("<promise>PARSER_REFACTORED</promise>"),
    ]));
    let item = WorkItem::new("Refactor", PROMISE_PROMPT).convergent(None, None);
    store.add(item.clone()).await.unwrap();

    // Rows written before zero caps were rejected can still carry one
    let mut claimed = store.claim_next().await.unwrap().unwrap();
    claimed.context.execution_mode = ExecutionMode::Convergent {
        max_iterations: Some(0),
        completion_promise: None,
    };
    let mut config = test_config();
    config.convergence.require_completion_criteria = false;

    let outcome = scheduler(&store, &executor, &config).process(claimed).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Completed);
    assert_eq!(executor.call_count().await, 2);

    let done = reload(&store, &item).await;
    let session = done.result.unwrap().session.unwrap();
    assert_eq!(session.max_iterations, config.convergence.default_max_iterations);
}

#[tokio::test]
async fn test_zero_iteration_cap_is_rejected_on_add() {
    let store = setup_store().await;
    let item = WorkItem::new("Refactor", PROMISE_PROMPT).convergent(Some(0), None);
    assert!(store.add(item).await.is_err());
}

#[tokio::test]
async fn test_prompt_without_completion_criteria_is_rejected() {
    let store = setup_store().await;
    let executor = Arc::new(MockExecutor::new());
    let item = WorkItem::new("Improve", "Make the code better").convergent(None, None);
    store.add(item.clone()).await.unwrap();

    let stats = scheduler(&store, &executor, &test_config()).run_until_idle().await.unwrap();
    assert_eq!(stats.rejected, 1);
    assert_eq!(executor.call_count().await, 0);

    let rejected = reload(&store, &item).await;
    assert_eq!(rejected.status, WorkStatus::Failed);
    assert_eq!(rejected.attempts, 1);
    assert!(rejected.error_message.unwrap().contains("completion criteria"));
}

#[tokio::test]
async fn test_cancelled_loop_fails_before_first_iteration() {
    let store = setup_store().await;
    let executor = Arc::new(MockExecutor::new());
    let item = WorkItem::new("Refactor", PROMISE_PROMPT).convergent(None, None);
    store.add(item.clone()).await.unwrap();

    let claimed = store.claim_next().await.unwrap().unwrap();
    let scheduler = scheduler(&store, &executor, &test_config());
    scheduler.cancellation_token().cancel();
    let outcome = scheduler.process(claimed).await.unwrap();

    assert_eq!(outcome, DispatchOutcome::Retrying);
    assert_eq!(executor.call_count().await, 0);
    let retried = reload(&store, &item).await;
    assert_eq!(retried.error_message.as_deref(), Some("cancelled after 0 iterations"));
}

// ---------------------------------------------------------------------------
// Worker loops and subtasks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_run_stops_when_cancelled() {
    let store = setup_store().await;
    let executor = Arc::new(MockExecutor::new());
    store.add(WorkItem::new("One", "one")).await.unwrap();
    store.add(WorkItem::new("Two", "two")).await.unwrap();

    let mut config = test_config();
    config.scheduler.workers = 2;
    let scheduler = scheduler(&store, &executor, &config);
    let token = scheduler.cancellation_token();

    let (stats, ()) = tokio::join!(scheduler.run(), async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });
    let stats = stats.unwrap();
    assert_eq!(stats.completed, 2);
}

#[tokio::test]
async fn test_run_subtasks_respects_dependency_order() {
    let store = setup_store().await;
    let executor = Arc::new(MockExecutor::new());
    let parent = store.add(WorkItem::new("Feature", "Ship the feature")).await.unwrap();

    let schema = WorkItem::new("Schema", "schema").with_parent(parent);
    let api = WorkItem::new("API", "api").with_parent(parent).blocked_by(schema.id);
    let ui = WorkItem::new("UI", "ui").with_parent(parent).blocked_by(api.id);
    for item in [ui.clone(), api.clone(), schema.clone()] {
        store.add(item).await.unwrap();
    }

    let report = scheduler(&store, &executor, &test_config())
        .run_subtasks(parent)
        .await
        .unwrap();

    assert_eq!(report.dispatched, 3);
    assert!(report.all_complete);
    assert!(report.cycle.is_none());
    assert_eq!(executor.prompts().await, vec!["schema", "api", "ui"]);
    // The parent itself is not a subtask
    assert_eq!(store.get(parent).await.unwrap().unwrap().status, WorkStatus::Pending);
}

#[tokio::test]
async fn test_run_subtasks_reports_unready_after_failed_blocker() {
    let store = setup_store().await;
    let executor = Arc::new(MockExecutor::with_fallback(MockResponse::failure("nope")));
    let parent = store.add(WorkItem::new("Feature", "f")).await.unwrap();
    let base = WorkItem::new("Base", "base").with_parent(parent);
    let top = WorkItem::new("Top", "top").with_parent(parent).blocked_by(base.id);
    store.add(base.clone()).await.unwrap();
    store.add(top.clone()).await.unwrap();

    let report = scheduler(&store, &executor, &test_config())
        .run_subtasks(parent)
        .await
        .unwrap();

    assert_eq!(report.failed, vec![base.id]);
    assert_eq!(report.unready, vec![top.id]);
    assert!(!report.all_complete);
    assert!(executor.prompts().await.iter().all(|p| p == "base"));
}

#[tokio::test]
async fn test_run_subtasks_reports_cycle() {
    let store = setup_store().await;
    let executor = Arc::new(MockExecutor::new());
    let parent = store.add(WorkItem::new("Feature", "f")).await.unwrap();

    let a = WorkItem::new("A", "a").with_parent(parent);
    let b = WorkItem::new("B", "b").with_parent(parent).blocked_by(a.id);
    let a = a.blocked_by(b.id);
    store.add(a.clone()).await.unwrap();
    store.add(b.clone()).await.unwrap();

    let report = scheduler(&store, &executor, &test_config())
        .run_subtasks(parent)
        .await
        .unwrap();

    assert_eq!(report.dispatched, 0);
    assert_eq!(report.unready.len(), 2);
    let cycle = report.cycle.expect("cycle reported");
    assert_eq!(cycle.first(), cycle.last());
    assert!(cycle.contains(&a.id) && cycle.contains(&b.id));
    assert_eq!(executor.call_count().await, 0);
}
