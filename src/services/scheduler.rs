//! Worker loops that claim work items and drive them to an outcome.
//!
//! The scheduler is the only place failures are routed: executor errors,
//! timeouts, stuck sessions and missing completion criteria all end in one
//! of the store's transitions (`complete`, `fail` or `escalate`).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    CompletionReason, Config, ConvergenceConfig, ExecutionMode, IterationSession, SchedulerConfig,
    ValidationConfig, WorkItem, WorkItemPatch, WorkResult, WorkStatus,
};
use crate::domain::ports::{ExecutionResult, Executor, WorkStore};
use crate::services::convergence_validator::{extract_completion_signal, find_max_iterations, validate};
use crate::services::dependency_resolver::{detect_cycle, DependencyResolver};
use crate::services::iteration_controller::IterationController;
use crate::services::stuck_detection::{matchers_from_patterns, StuckMatcher};

/// What happened to one claimed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Completed,
    /// Failed and re-queued as pending
    Retrying,
    /// Failed with retries exhausted
    Failed,
    /// Stuck and parked on hold for review
    Escalated,
    /// Prompt declared no completion criteria
    Rejected,
}

impl DispatchOutcome {
    fn from_failure(item: &WorkItem) -> Self {
        match item.status {
            WorkStatus::Failed => Self::Failed,
            WorkStatus::Hold => Self::Escalated,
            _ => Self::Retrying,
        }
    }
}

/// Counters over the lifetime of one scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub dispatched: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub escalated: u64,
    pub rejected: u64,
}

impl SchedulerStats {
    fn record(&mut self, outcome: DispatchOutcome) {
        self.dispatched += 1;
        match outcome {
            DispatchOutcome::Completed => self.completed += 1,
            DispatchOutcome::Retrying => self.retried += 1,
            DispatchOutcome::Failed => self.failed += 1,
            DispatchOutcome::Escalated => self.escalated += 1,
            DispatchOutcome::Rejected => self.rejected += 1,
        }
    }
}

/// Final state of a parent's subtasks after [`Scheduler::run_subtasks`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubtaskReport {
    pub parent_id: Uuid,
    pub dispatched: usize,
    pub completed: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    pub held: Vec<Uuid>,
    /// Pending subtasks whose blockers never completed
    pub unready: Vec<Uuid>,
    /// Dependency cycle among the unfinished subtasks
    pub cycle: Option<Vec<Uuid>>,
    pub all_complete: bool,
}

pub struct Scheduler<S: ?Sized, E: ?Sized> {
    store: Arc<S>,
    executor: Arc<E>,
    config: SchedulerConfig,
    convergence: ConvergenceConfig,
    iteration_timeout: Duration,
    matchers: Arc<Vec<Box<dyn StuckMatcher>>>,
    cancel: CancellationToken,
    stats: Mutex<SchedulerStats>,
}

impl<S, E> Scheduler<S, E>
where
    S: WorkStore + ?Sized,
    E: Executor + ?Sized,
{
    /// Build a scheduler from configuration. Fails when a configured stuck
    /// pattern does not compile.
    pub fn new(store: Arc<S>, executor: Arc<E>, config: &Config) -> DomainResult<Self> {
        let matchers = matchers_from_patterns(&config.convergence.stuck_patterns)?;
        Ok(Self {
            store,
            executor,
            iteration_timeout: config.scheduler.iteration_timeout(),
            config: config.scheduler.clone(),
            convergence: config.convergence.clone(),
            matchers: Arc::new(matchers),
            cancel: CancellationToken::new(),
            stats: Mutex::new(SchedulerStats::default()),
        })
    }

    /// Replace the stuck matchers.
    #[must_use]
    pub fn with_matchers(mut self, matchers: Vec<Box<dyn StuckMatcher>>) -> Self {
        self.matchers = Arc::new(matchers);
        self
    }

    /// Override the per-call executor timeout.
    #[must_use]
    pub fn with_iteration_timeout(mut self, iteration_timeout: Duration) -> Self {
        self.iteration_timeout = iteration_timeout;
        self
    }

    /// Token that stops the worker loops when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.stats.lock().await.clone()
    }

    /// Run the worker loops until cancelled.
    pub async fn run(&self) -> DomainResult<SchedulerStats> {
        self.run_workers(false).await
    }

    /// Run the worker loops until no claimable item is left (or cancelled).
    pub async fn run_until_idle(&self) -> DomainResult<SchedulerStats> {
        self.run_workers(true).await
    }

    async fn run_workers(&self, drain: bool) -> DomainResult<SchedulerStats> {
        let workers = self.config.workers.max(1);
        info!(workers, drain, executor = self.executor.name(), "scheduler starting");

        let results = futures::future::join_all((0..workers).map(|worker| self.worker_loop(worker, drain))).await;
        let stats = self.stats().await;
        info!(
            dispatched = stats.dispatched,
            completed = stats.completed,
            failed = stats.failed,
            escalated = stats.escalated,
            "scheduler stopped"
        );

        results.into_iter().collect::<DomainResult<Vec<()>>>()?;
        Ok(stats)
    }

    async fn worker_loop(&self, worker: usize, drain: bool) -> DomainResult<()> {
        loop {
            if self.cancel.is_cancelled() {
                debug!(worker, "worker cancelled");
                return Ok(());
            }

            match self.store.claim_next().await {
                Ok(Some(item)) => {
                    self.dispatch(item).await;
                }
                Ok(None) if drain => {
                    debug!(worker, "queue drained");
                    return Ok(());
                }
                Ok(None) => self.idle().await,
                Err(e) if drain => return Err(e),
                Err(e) => {
                    error!(worker, error = %e, "claim failed");
                    self.idle().await;
                }
            }
        }
    }

    async fn idle(&self) {
        tokio::select! {
            () = self.cancel.cancelled() => {}
            () = tokio::time::sleep(self.config.poll_interval()) => {}
        }
    }

    /// Process an already-claimed item and record the outcome.
    async fn dispatch(&self, item: WorkItem) -> Option<DispatchOutcome> {
        let id = item.id;
        match self.process(item).await {
            Ok(outcome) => {
                self.stats.lock().await.record(outcome);
                Some(outcome)
            }
            Err(e) => {
                error!(item_id = %id, error = %e, "failed to record work item outcome");
                None
            }
        }
    }

    /// Execute one claimed (`active`) item and write back its outcome.
    #[instrument(skip(self, item), fields(item_id = %item.id, attempt = item.attempts), err)]
    pub async fn process(&self, item: WorkItem) -> DomainResult<DispatchOutcome> {
        match item.context.execution_mode.clone() {
            ExecutionMode::Direct => self.execute_direct(item).await,
            ExecutionMode::Convergent {
                max_iterations,
                completion_promise,
            } => self.execute_convergent(item, max_iterations, completion_promise).await,
        }
    }

    async fn call_executor(&self, prompt: &str) -> (Result<DomainResult<ExecutionResult>, Duration>, Duration) {
        let started = Instant::now();
        let call = timeout(self.iteration_timeout, self.executor.execute(prompt))
            .await
            .map_err(|_| self.iteration_timeout);
        (call, started.elapsed())
    }

    async fn fail_item(&self, item: &WorkItem, error: &str, execution_time: Duration) -> DomainResult<DispatchOutcome> {
        let failed = self
            .store
            .fail(item.id, error, self.config.max_retries, execution_time)
            .await?;
        Ok(DispatchOutcome::from_failure(&failed))
    }

    async fn execute_direct(&self, item: WorkItem) -> DomainResult<DispatchOutcome> {
        let (call, elapsed) = self.call_executor(item.prompt()).await;

        match call {
            Ok(Ok(result)) if result.success => {
                let work_result = WorkResult {
                    content: result.content,
                    files_changed: result.files_changed,
                    session: None,
                };
                self.store.complete(item.id, work_result, elapsed).await?;
                Ok(DispatchOutcome::Completed)
            }
            Ok(Ok(result)) => {
                let error = result
                    .error
                    .unwrap_or_else(|| "executor reported failure".to_string());
                self.fail_item(&item, &error, elapsed).await
            }
            Ok(Err(e)) => self.fail_item(&item, &e.to_string(), elapsed).await,
            Err(limit) => {
                let error = format!("executor timed out after {}s", limit.as_secs_f64());
                self.fail_item(&item, &error, elapsed).await
            }
        }
    }

    async fn execute_convergent(
        &self,
        item: WorkItem,
        max_iterations: Option<u32>,
        completion_promise: Option<String>,
    ) -> DomainResult<DispatchOutcome> {
        let prompt = item.prompt().to_string();

        let max_iterations = max_iterations.filter(|n| *n > 0);
        let mut declared_cap = max_iterations;
        if self.convergence.require_completion_criteria {
            let validation = validate(
                &prompt,
                &ValidationConfig {
                    max_iterations,
                    strict: self.convergence.strict,
                },
            );
            if !validation.is_valid {
                let err = DomainError::MissingCompletionCriteria {
                    suggestions: validation.suggestions,
                };
                warn!(item_id = %item.id, "convergent item rejected: {err}");
                // Replaying an unchanged prompt cannot fix it
                self.store.fail(item.id, &err.to_string(), 0, Duration::ZERO).await?;
                return Ok(DispatchOutcome::Rejected);
            }
            declared_cap = validation.max_iterations;
        }

        let cap = declared_cap
            .or_else(|| find_max_iterations(&prompt))
            .unwrap_or(self.convergence.default_max_iterations);
        let expected_promise = completion_promise
            .or_else(|| self.convergence.completion_promise.clone())
            .or_else(|| extract_completion_signal(&prompt));

        info!(item_id = %item.id, max_iterations = cap, "starting convergence loop");

        let mut controller = IterationController::new(cap, Arc::clone(&self.matchers), expected_promise);
        let mut execution_time = Duration::ZERO;
        let mut files_changed = BTreeSet::new();
        let mut last_content = String::new();

        while controller.should_continue() {
            if self.cancel.is_cancelled() {
                let iterations = controller.session().current_iteration;
                self.save_session(&item, controller.session()).await;
                return self
                    .fail_item(&item, &format!("cancelled after {iterations} iterations"), execution_time)
                    .await;
            }

            let (call, elapsed) = self.call_executor(&prompt).await;
            execution_time += elapsed;

            match call {
                Ok(Ok(result)) => {
                    files_changed.extend(result.files_changed);
                    let record = if result.success {
                        let record = controller.process_output(&result.content);
                        last_content = result.content;
                        record
                    } else {
                        controller.record_error(result.error.as_deref().unwrap_or("executor reported failure"))
                    };
                    debug!(
                        item_id = %item.id,
                        iteration = record.iteration,
                        stuck = record.stuck,
                        promise = record.promise_text.is_some(),
                        summary = %record.summary,
                        "iteration finished"
                    );
                }
                Ok(Err(e)) => {
                    controller.record_error(&e.to_string());
                    self.save_session(&item, controller.session()).await;
                    return self.fail_item(&item, &e.to_string(), execution_time).await;
                }
                Err(limit) => {
                    let record = controller.record_error(&format!("executor timed out after {}s", limit.as_secs_f64()));
                    warn!(item_id = %item.id, iteration = record.iteration, "iteration timed out");
                }
            }
        }

        let session = controller.into_session();
        let iterations = session.current_iteration;
        match session.completion_reason {
            Some(CompletionReason::Promise) => {
                info!(item_id = %item.id, iterations, "convergence loop completed");
                let result = WorkResult {
                    content: last_content,
                    files_changed: files_changed.into_iter().collect(),
                    session: Some(session),
                };
                self.store.complete(item.id, result, execution_time).await?;
                Ok(DispatchOutcome::Completed)
            }
            Some(CompletionReason::Stuck) => {
                let reason = match session.last_record() {
                    Some(record) => format!(
                        "stuck after {iterations} iterations ({}): {}",
                        record.matched_pattern.as_deref().unwrap_or("stuck"),
                        record.summary
                    ),
                    None => format!("stuck after {iterations} iterations"),
                };
                warn!(item_id = %item.id, iterations, "convergence loop stuck, escalating");
                self.save_session(&item, &session).await;
                let escalated = self
                    .store
                    .escalate(item.id, &reason, self.config.max_retries, execution_time)
                    .await?;
                Ok(DispatchOutcome::from_failure(&escalated))
            }
            Some(CompletionReason::MaxIterations) | None => {
                warn!(item_id = %item.id, iterations, "convergence loop exhausted its iteration budget");
                self.save_session(&item, &session).await;
                let error = format!("no completion signal after {iterations} iterations");
                self.fail_item(&item, &error, execution_time).await
            }
        }
    }

    /// Keep the session of an unfinished loop on the item for review.
    async fn save_session(&self, item: &WorkItem, session: &IterationSession) {
        let patch = WorkItemPatch {
            last_session: Some(session.clone()),
            ..Default::default()
        };
        if let Err(e) = self.store.update(item.id, patch).await {
            warn!(item_id = %item.id, error = %e, "could not save convergence session");
        }
    }

    /// Dispatch the ready subtasks of `parent_id` with bounded concurrency
    /// until none is left, then report what remains.
    ///
    /// Subtasks that can never become ready (a failed or missing blocker, or
    /// a dependency cycle) are reported rather than waited on.
    #[instrument(skip(self), err)]
    pub async fn run_subtasks(&self, parent_id: Uuid) -> DomainResult<SubtaskReport> {
        let resolver = DependencyResolver::new(Arc::clone(&self.store));
        let concurrency = self.config.subtask_concurrency.max(1);
        let mut dispatched = 0;

        while !self.cancel.is_cancelled() {
            let ready: Vec<WorkItem> = resolver
                .ready_subtasks(parent_id)
                .await?
                .into_iter()
                .filter(|item| item.status == WorkStatus::Pending)
                .collect();
            if ready.is_empty() {
                break;
            }

            let round = stream::iter(ready)
                .map(|item| async move {
                    if self.cancel.is_cancelled() {
                        return Ok::<_, DomainError>(None);
                    }
                    match self.store.claim(item.id).await? {
                        Some(claimed) => Ok(self.dispatch(claimed).await.map(|_| ())),
                        None => Ok(None),
                    }
                })
                .buffer_unordered(concurrency)
                .collect::<Vec<_>>()
                .await;

            let progressed = round
                .into_iter()
                .collect::<DomainResult<Vec<_>>>()?
                .into_iter()
                .flatten()
                .count();
            if progressed == 0 {
                break;
            }
            dispatched += progressed;
        }

        let subtasks = resolver.subtasks(parent_id).await?;
        let mut report = SubtaskReport {
            parent_id,
            dispatched,
            all_complete: resolver.all_complete(parent_id).await?,
            ..Default::default()
        };
        for item in &subtasks {
            match item.status {
                WorkStatus::Completed => report.completed.push(item.id),
                WorkStatus::Failed => report.failed.push(item.id),
                WorkStatus::Hold => report.held.push(item.id),
                WorkStatus::Pending => report.unready.push(item.id),
                WorkStatus::Active => {}
            }
        }

        report.cycle = detect_cycle(subtasks.iter().filter(|item| !item.is_terminal()));
        if let Some(cycle) = &report.cycle {
            warn!(%parent_id, "{}", DomainError::DependencyCycle(cycle.clone()));
        } else if !report.unready.is_empty() && !self.cancel.is_cancelled() {
            warn!(%parent_id, unready = report.unready.len(), "subtasks left with unsatisfiable blockers");
        }

        info!(
            %parent_id,
            dispatched,
            completed = report.completed.len(),
            failed = report.failed.len(),
            held = report.held.len(),
            "subtask run finished"
        );
        Ok(report)
    }
}
