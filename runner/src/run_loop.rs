//! The run loop: select a task, run it through the harness, record the
//! outcome, repeat until a stop condition fires.
//!
//! The loop is single-threaded. It produces an ordered event sequence that is
//! delivered to the caller's callback as it happens and retained in the
//! returned [`RunResult`].

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, trace, warn};

use crate::core::budget::BudgetState;
use crate::core::cancel::CancellationToken;
use crate::core::escalation::{AttemptTracker, model_for_attempt};
use crate::core::event::{Counters, RunEvent, RunEventKind, RunPhase, RunResult, StopReason};
use crate::core::selector::next_ready;
use crate::core::types::{ErrorKind, RunError, Task, TaskStatus, Usage};
use crate::io::backend::TaskBackend;
use crate::io::breaker::CircuitBreaker;
use crate::io::harness::{Harness, HarnessOutcome, HarnessRequest};
use crate::io::hooks::{HookContext, HookName, HookRunner};
use crate::io::ledger::{AttemptEnd, AttemptStart, Ledger, TaskClose, TaskStart};
use crate::io::config::RunConfig;
use crate::io::prompt::{PromptBuilder, PromptInputs};
use crate::io::status::{StatusSnapshot, StatusWriter, TaskState};

const PAUSE_SLICE: Duration = Duration::from_millis(50);

/// External collaborators a run loop drives.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub backend: &'a dyn TaskBackend,
    /// `None` when no harness could be resolved; the run fails before iterating.
    pub harness: Option<&'a dyn Harness>,
    pub hooks: &'a dyn HookRunner,
    pub ledger: &'a dyn Ledger,
    pub status: Option<&'a StatusWriter>,
}

pub struct RunLoop<'a> {
    config: RunConfig,
    workdir: PathBuf,
    deps: Collaborators<'a>,
    prompts: PromptBuilder,
}

/// How one attempt ended.
enum AttemptOutcome {
    Succeeded {
        usage: Usage,
        duration: Duration,
    },
    Failed {
        kind: ErrorKind,
        message: String,
        usage: Usage,
        duration: Duration,
    },
}

/// What the iteration body asks the loop to do next.
enum Flow {
    Continue,
    Stop(RunPhase, StopReason),
    Fatal(RunError),
}

impl<'a> RunLoop<'a> {
    pub fn new(config: RunConfig, workdir: impl Into<PathBuf>, deps: Collaborators<'a>) -> Self {
        let prompts = PromptBuilder::new(config.prompt_budget_bytes);
        Self {
            config,
            workdir: workdir.into(),
            deps,
            prompts,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run until a stop condition, delivering every event to `on_event`.
    ///
    /// Task-level failures never surface as errors; they are recorded in the
    /// event log and counters. Run-level failures end the run in `Failed`.
    #[instrument(skip_all, fields(run_id = %self.config.run_id))]
    pub fn run<F: FnMut(&RunEvent)>(&self, cancel: &CancellationToken, on_event: F) -> RunResult {
        let mut session = Session::new(&self.config, on_event);
        session.emit(RunEventKind::RunStarted {
            run_id: self.config.run_id.clone(),
        });

        let flow = self.start(&mut session);
        let flow = match flow {
            Flow::Continue => {
                session.phase = RunPhase::Running;
                self.iterate(&mut session, cancel)
            }
            other => other,
        };

        match flow {
            Flow::Stop(phase, reason) => session.stop(phase, reason),
            Flow::Fatal(error) => session.fail(error),
            Flow::Continue => session.stop(RunPhase::Completed, StopReason::NoTasksRemaining),
        }

        if self.config.hooks_enabled {
            let ctx = HookContext::for_run(&self.config.run_id);
            if !self.deps.hooks.run(HookName::PostLoop, &ctx) {
                warn!("post_loop hook failed");
            }
        }
        session.finish()
    }

    /// Pre-loop validation and the `pre_loop` hook.
    fn start<F: FnMut(&RunEvent)>(&self, session: &mut Session<'_, F>) -> Flow {
        match self.deps.harness {
            None => {
                return Flow::Fatal(RunError::validation(format!(
                    "no harness available (configured '{}')",
                    self.config.harness
                )));
            }
            Some(harness) if !harness.is_available() => {
                return Flow::Fatal(RunError::validation(format!(
                    "harness '{}' is not available",
                    harness.name()
                )));
            }
            Some(harness) => debug!(
                harness = harness.name(),
                streaming = harness.capabilities().streaming,
                "harness ready"
            ),
        }

        if self.config.hooks_enabled {
            let ctx = HookContext::for_run(&self.config.run_id);
            if !self.deps.hooks.run(HookName::PreLoop, &ctx) {
                session.emit(RunEventKind::HookFailed {
                    hook: HookName::PreLoop.to_string(),
                });
                if self.config.fail_fast_hooks {
                    return Flow::Fatal(RunError::new(
                        ErrorKind::HookFailure,
                        "pre_loop hook failed",
                    ));
                }
            }
        }
        Flow::Continue
    }

    fn iterate<F: FnMut(&RunEvent)>(
        &self,
        session: &mut Session<'_, F>,
        cancel: &CancellationToken,
    ) -> Flow {
        let max_iterations = self.config.max_iterations.filter(|n| *n > 0);
        loop {
            if cancel.is_cancelled() {
                session.emit(RunEventKind::InterruptReceived);
                return Flow::Stop(RunPhase::Stopped, StopReason::Interrupted);
            }
            if let Some(resource) = session.budget.check_limit() {
                info!(resource = %resource, "budget exhausted");
                session.emit(RunEventKind::BudgetExhausted { resource });
                return Flow::Stop(RunPhase::Completed, StopReason::BudgetExhausted { resource });
            }

            session.counters.iteration += 1;
            let iteration = session.counters.iteration;
            session.emit(RunEventKind::IterationStarted { iteration });

            match self.iteration(session, cancel) {
                Flow::Continue => {}
                other => return other,
            }
            if cancel.is_cancelled() {
                continue;
            }

            if self.config.single_task {
                return Flow::Stop(RunPhase::Completed, StopReason::SingleTaskDone);
            }
            if let Some(max) = max_iterations.filter(|max| iteration >= *max) {
                return Flow::Stop(
                    RunPhase::Completed,
                    StopReason::MaxIterationsReached {
                        max_iterations: max,
                    },
                );
            }
            pause(self.config.iteration_delay, cancel);
        }
    }

    /// One iteration: select, run, record.
    fn iteration<F: FnMut(&RunEvent)>(
        &self,
        session: &mut Session<'_, F>,
        cancel: &CancellationToken,
    ) -> Flow {
        let task = match self.select(session) {
            Ok(task) => task,
            Err(flow) => return flow,
        };
        session.emit(RunEventKind::TaskSelected {
            task_id: task.id.clone(),
            title: task.title.clone(),
        });

        let next_attempt = session.attempts.attempts(&task.id) + 1;
        if self.config.hooks_enabled
            && !self
                .deps
                .hooks
                .run(HookName::PreTask, &self.hook_ctx(&task, next_attempt))
        {
            session.emit(RunEventKind::HookFailed {
                hook: HookName::PreTask.to_string(),
            });
            if self.config.fail_fast_hooks {
                return Flow::Fatal(RunError::new(
                    ErrorKind::HookFailure,
                    format!("pre_task hook failed for {}", task.id),
                ));
            }
        }

        if let Err(err) = self.deps.backend.update_task(
            &task.id,
            TaskStatus::InProgress,
            Some(&self.config.run_id),
        ) {
            warn!(task_id = %task.id, err = %format!("{err:#}"), "failed to mark task in progress");
        }

        let model = model_for_attempt(
            &task,
            next_attempt,
            &self.config.escalation,
            self.config.model.as_deref(),
        );
        let attempt = session.attempts.begin(&task.id, model.as_deref());
        session.emit(RunEventKind::TaskStarted {
            task_id: task.id.clone(),
            attempt,
            model: model.clone(),
        });
        self.ledger_task_start(&task, attempt, model.as_deref());

        let outcome = self.attempt(session, &task, attempt, model.as_deref(), cancel);
        match outcome {
            AttemptOutcome::Succeeded { usage, duration } => {
                self.record_success(session, &task, attempt, model, usage, duration);
                Flow::Continue
            }
            AttemptOutcome::Failed {
                kind,
                message,
                usage,
                duration,
            } => self.record_failure(session, &task, attempt, model, kind, message, usage, duration),
        }
    }

    /// Resolve the task for this iteration, or the flow that ends the run.
    fn select<F: FnMut(&RunEvent)>(&self, session: &mut Session<'_, F>) -> Result<Task, Flow> {
        let backend = self.deps.backend;
        if let Some(task_id) = &self.config.task_id {
            let task = backend
                .get_task(task_id)
                .map_err(|err| Flow::Fatal(backend_error("get task", &err)))?
                .ok_or_else(|| {
                    Flow::Fatal(RunError::validation(format!("task not found: {task_id}")))
                })?;
            if task.is_closed() {
                info!(task_id = %task.id, "requested task already closed");
                return Err(Flow::Stop(
                    RunPhase::Completed,
                    StopReason::TaskAlreadyClosed { task_id: task.id },
                ));
            }
            return Ok(task);
        }

        let ready = backend
            .get_ready_tasks(self.config.epic.as_deref(), self.config.label.as_deref())
            .map_err(|err| Flow::Fatal(backend_error("query ready tasks", &err)))?;
        if let Some(task) = next_ready(&ready, &session.exhausted) {
            debug!(task_id = %task.id, ready = ready.len(), "selected task");
            return Ok(task.clone());
        }

        let counts = backend
            .get_task_counts()
            .map_err(|err| Flow::Fatal(backend_error("count tasks", &err)))?;
        if counts.remaining == 0 {
            Err(Flow::Stop(RunPhase::Completed, StopReason::NoTasksRemaining))
        } else {
            info!(remaining = counts.remaining, "tasks remain but none are ready");
            Err(Flow::Stop(
                RunPhase::Completed,
                StopReason::Blocked {
                    remaining: counts.remaining,
                },
            ))
        }
    }

    /// Build prompts and invoke the harness under the circuit breaker.
    #[instrument(skip_all, fields(task_id = %task.id, attempt = attempt, model = ?model))]
    fn attempt<F: FnMut(&RunEvent)>(
        &self,
        session: &mut Session<'_, F>,
        task: &Task,
        attempt: u32,
        model: Option<&str>,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let started = Instant::now();
        let Some(harness) = self.deps.harness else {
            return AttemptOutcome::Failed {
                kind: ErrorKind::Validation,
                message: "no harness available".to_string(),
                usage: Usage::default(),
                duration: started.elapsed(),
            };
        };

        let pack = match self.prompts.build(&PromptInputs {
            run_id: &self.config.run_id,
            task,
            attempt,
            model,
            previous_error: session.last_error.get(&task.id).map(String::as_str),
        }) {
            Ok(pack) => pack,
            Err(err) => {
                return AttemptOutcome::Failed {
                    kind: ErrorKind::Validation,
                    message: format!("build prompt: {err:#}"),
                    usage: Usage::default(),
                    duration: started.elapsed(),
                };
            }
        };
        if let Some(status) = self.deps.status {
            if let Err(err) = status.write_prompt(&task.id, attempt, &pack.render()) {
                warn!(err = %format!("{err:#}"), "failed to write prompt artifact");
            }
            self.write_snapshot(session, task, attempt, model, TaskState::Running, None);
        }

        let attempt_id = format!("{}-{}-{}", self.config.run_id, task.id, attempt);
        let breaker = CircuitBreaker::new(self.config.breaker_timeout);
        let task_id = task.id.as_str();
        let result = breaker.call_cancellable(cancel, |slot| {
            let request = HarnessRequest {
                system_prompt: pack.system.clone(),
                task_prompt: pack.task.clone(),
                model: model.map(str::to_string),
                workdir: self.workdir.clone(),
                attempt_id: attempt_id.clone(),
                slot: slot.clone(),
            };
            harness.invoke_streaming(&request, &mut |line| trace!(task_id, line, "agent output"))
        });

        match result {
            Err(tripped) => {
                let timeout_secs = tripped.timeout.as_secs();
                warn!(timeout_secs, "attempt exceeded its deadline");
                session.emit(RunEventKind::CircuitBreakerTripped {
                    task_id: task.id.clone(),
                    timeout_secs,
                });
                AttemptOutcome::Failed {
                    kind: ErrorKind::CircuitBreakerTimeout,
                    message: tripped.to_string(),
                    usage: Usage::default(),
                    duration: started.elapsed(),
                }
            }
            Ok(Err(err)) => AttemptOutcome::Failed {
                kind: ErrorKind::HarnessFailure,
                message: format!("{err:#}"),
                usage: Usage::default(),
                duration: started.elapsed(),
            },
            Ok(Ok(outcome)) if !outcome.success && cancel.is_cancelled() => {
                self.write_attempt_log(task, attempt, &outcome);
                info!("attempt interrupted by cancellation");
                AttemptOutcome::Failed {
                    kind: ErrorKind::HarnessFailure,
                    message: "attempt interrupted".to_string(),
                    usage: outcome.usage,
                    duration: started.elapsed(),
                }
            }
            Ok(Ok(outcome)) => {
                self.write_attempt_log(task, attempt, &outcome);
                classify(outcome)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_success<F: FnMut(&RunEvent)>(
        &self,
        session: &mut Session<'_, F>,
        task: &Task,
        attempt: u32,
        model: Option<String>,
        usage: Usage,
        duration: Duration,
    ) {
        session.budget.record_usage(usage.tokens, usage.cost);
        session.budget.record_task_completion();
        session.counters.tasks_completed += 1;
        info!(task_id = %task.id, attempt, tokens = usage.tokens, "task completed");

        let reason = format!("completed by {}", self.config.run_id);
        if let Err(err) = self.deps.backend.close_task(&task.id, &reason) {
            warn!(task_id = %task.id, err = %format!("{err:#}"), "failed to close task");
            session.exhausted.insert(task.id.clone());
        }
        if self.config.hooks_enabled {
            self.deps
                .hooks
                .fire_and_forget(HookName::PostTask, &self.hook_ctx(task, attempt));
        }
        if self.config.sync_enabled {
            if let Err(err) = self.deps.backend.sync() {
                warn!(err = %format!("{err:#}"), "task backend sync failed");
            }
        }

        let history = session.attempts.history(&task.id);
        self.ledger_attempt_end(task, attempt, true, None, None, usage, duration);
        self.ledger_log(
            "task close",
            self.deps.ledger.on_task_close(&TaskClose {
                run_id: self.config.run_id.clone(),
                task_id: task.id.clone(),
                success: true,
                attempts: history.attempts(),
                escalated: history.escalated(),
                model_path: history.model_path().to_vec(),
            }),
        );

        session.emit(RunEventKind::TaskCompleted {
            task_id: task.id.clone(),
            usage,
            duration_ms: millis(duration),
            escalated: history.escalated(),
        });
        session.emit_budget(self.config.budget_warning_threshold);
        self.write_snapshot(session, task, attempt, model.as_deref(), TaskState::Completed, None);
    }

    #[allow(clippy::too_many_arguments)]
    fn record_failure<F: FnMut(&RunEvent)>(
        &self,
        session: &mut Session<'_, F>,
        task: &Task,
        attempt: u32,
        model: Option<String>,
        kind: ErrorKind,
        message: String,
        usage: Usage,
        duration: Duration,
    ) -> Flow {
        session.budget.record_usage(usage.tokens, usage.cost);
        session.counters.tasks_failed += 1;
        warn!(task_id = %task.id, attempt, kind = %kind, message = %message, "task attempt failed");

        session.emit(RunEventKind::TaskFailed {
            task_id: task.id.clone(),
            kind,
            message: message.clone(),
        });
        if self.config.hooks_enabled {
            let ctx = HookContext {
                error: Some(message.clone()),
                ..self.hook_ctx(task, attempt)
            };
            self.deps.hooks.fire_and_forget(HookName::OnError, &ctx);
        }
        self.ledger_attempt_end(
            task,
            attempt,
            false,
            Some(kind),
            Some(summarize(&message)),
            usage,
            duration,
        );

        if let Err(err) = self
            .deps
            .backend
            .update_task(&task.id, TaskStatus::Open, None)
        {
            warn!(task_id = %task.id, err = %format!("{err:#}"), "failed to reopen task");
        }
        session.last_error.insert(task.id.clone(), message.clone());

        let history = session.attempts.history(&task.id);
        let exhausted = history.attempts() >= self.config.max_attempts_per_task;
        if exhausted {
            info!(task_id = %task.id, attempts = history.attempts(), "attempts exhausted");
            session.exhausted.insert(task.id.clone());
        }
        if exhausted || self.config.single_task {
            self.ledger_log(
                "task close",
                self.deps.ledger.on_task_close(&TaskClose {
                    run_id: self.config.run_id.clone(),
                    task_id: task.id.clone(),
                    success: false,
                    attempts: history.attempts(),
                    escalated: history.escalated(),
                    model_path: history.model_path().to_vec(),
                }),
            );
        }

        if usage != Usage::default() {
            session.emit_budget(self.config.budget_warning_threshold);
        }
        let error = RunError::new(kind, message);
        self.write_snapshot(
            session,
            task,
            attempt,
            model.as_deref(),
            TaskState::Failed,
            Some(error),
        );

        if self.config.stop_on_failure {
            return Flow::Stop(
                RunPhase::Failed,
                StopReason::TaskFailed {
                    task_id: task.id.clone(),
                },
            );
        }
        Flow::Continue
    }

    fn hook_ctx(&self, task: &Task, attempt: u32) -> HookContext {
        HookContext {
            task_id: Some(task.id.clone()),
            task_title: Some(task.title.clone()),
            attempt: Some(attempt),
            ..HookContext::for_run(&self.config.run_id)
        }
    }

    fn ledger_task_start(&self, task: &Task, attempt: u32, model: Option<&str>) {
        if attempt == 1 {
            self.ledger_log(
                "task start",
                self.deps.ledger.on_task_start(&TaskStart {
                    run_id: self.config.run_id.clone(),
                    task_id: task.id.clone(),
                    title: task.title.clone(),
                }),
            );
        }
        self.ledger_log(
            "attempt start",
            self.deps.ledger.on_attempt_start(&AttemptStart {
                run_id: self.config.run_id.clone(),
                task_id: task.id.clone(),
                attempt,
                model: model.map(str::to_string),
            }),
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn ledger_attempt_end(
        &self,
        task: &Task,
        attempt: u32,
        success: bool,
        error_kind: Option<ErrorKind>,
        summary: Option<String>,
        usage: Usage,
        duration: Duration,
    ) {
        self.ledger_log(
            "attempt end",
            self.deps.ledger.on_attempt_end(&AttemptEnd {
                run_id: self.config.run_id.clone(),
                task_id: task.id.clone(),
                attempt,
                success,
                error_kind,
                summary,
                usage,
                duration_ms: millis(duration),
            }),
        );
    }

    fn ledger_log(&self, what: &str, result: anyhow::Result<()>) {
        if let Err(err) = result {
            warn!(entry = what, err = %format!("{err:#}"), "ledger write failed");
        }
    }

    fn write_snapshot<F: FnMut(&RunEvent)>(
        &self,
        session: &Session<'_, F>,
        task: &Task,
        attempt: u32,
        model: Option<&str>,
        state: TaskState,
        error: Option<RunError>,
    ) {
        let Some(status) = self.deps.status else {
            return;
        };
        let snapshot = StatusSnapshot {
            run_id: self.config.run_id.clone(),
            task_id: task.id.clone(),
            state,
            attempt,
            model: model.map(str::to_string),
            tokens: session.budget.tokens_used(),
            cost: session.budget.cost_used(),
            error,
        };
        if let Err(err) = status.write_snapshot(&snapshot) {
            warn!(err = %format!("{err:#}"), "failed to write status snapshot");
        }
    }

    fn write_attempt_log(&self, task: &Task, attempt: u32, outcome: &HarnessOutcome) {
        let Some(status) = self.deps.status else {
            return;
        };
        if let Err(err) = status.write_attempt_log(&task.id, attempt, &outcome.output) {
            warn!(err = %format!("{err:#}"), "failed to write attempt log");
        }
    }
}

/// Mutable state of one run; never shared.
struct Session<'c, F> {
    run_id: &'c str,
    started: Instant,
    phase: RunPhase,
    stop_reason: Option<StopReason>,
    fatal: Option<RunError>,
    events: Vec<RunEvent>,
    counters: Counters,
    budget: BudgetState,
    attempts: AttemptTracker,
    /// Tasks that may not be selected again in this run.
    exhausted: HashSet<String>,
    last_error: HashMap<String, String>,
    on_event: F,
}

impl<'c, F: FnMut(&RunEvent)> Session<'c, F> {
    fn new(config: &'c RunConfig, on_event: F) -> Self {
        Self {
            run_id: &config.run_id,
            started: Instant::now(),
            phase: RunPhase::Initializing,
            stop_reason: None,
            fatal: None,
            events: Vec::new(),
            counters: Counters::default(),
            budget: BudgetState::new(config.budget),
            attempts: AttemptTracker::new(),
            exhausted: HashSet::new(),
            last_error: HashMap::new(),
            on_event,
        }
    }

    fn emit(&mut self, kind: RunEventKind) {
        self.counters.tokens = self.budget.tokens_used();
        self.counters.cost = self.budget.cost_used();
        let event = RunEvent {
            seq: self.events.len() as u64,
            elapsed_ms: millis(self.started.elapsed()),
            kind,
            counters: self.counters,
        };
        debug!(event = event.kind.name(), seq = event.seq, "run event");
        (self.on_event)(&event);
        self.events.push(event);
    }

    fn emit_budget(&mut self, warning_threshold: f64) {
        self.emit(RunEventKind::BudgetUpdated {
            tokens: self.budget.tokens_used(),
            cost: self.budget.cost_used(),
        });
        if let Some((resource, utilization)) = self.budget.check_warning_threshold(warning_threshold)
        {
            warn!(resource = %resource, utilization, "budget warning threshold crossed");
            self.emit(RunEventKind::BudgetWarning {
                resource,
                utilization,
            });
        }
    }

    fn stop(&mut self, phase: RunPhase, reason: StopReason) {
        info!(phase = ?phase, reason = ?reason, "run stopped");
        self.phase = phase;
        self.stop_reason = Some(reason.clone());
        self.emit(RunEventKind::RunStopped { phase, reason });
    }

    fn fail(&mut self, error: RunError) {
        warn!(error = %error, "run failed");
        self.emit(RunEventKind::RunFailed {
            error: error.clone(),
        });
        if self.fatal.is_none() {
            self.fatal = Some(error.clone());
        }
        self.stop(RunPhase::Failed, StopReason::Fatal { error });
    }

    fn finish(self) -> RunResult {
        RunResult {
            run_id: self.run_id.to_string(),
            phase: self.phase,
            stop_reason: self.stop_reason,
            tasks_completed: self.counters.tasks_completed,
            tasks_failed: self.counters.tasks_failed,
            tokens: self.budget.tokens_used(),
            cost: self.budget.cost_used(),
            duration: self.started.elapsed(),
            error: self.fatal,
            events: self.events,
        }
    }
}

fn classify(outcome: HarnessOutcome) -> AttemptOutcome {
    if outcome.success {
        AttemptOutcome::Succeeded {
            usage: outcome.usage,
            duration: outcome.duration,
        }
    } else {
        AttemptOutcome::Failed {
            kind: ErrorKind::HarnessFailure,
            message: outcome
                .error
                .unwrap_or_else(|| format!("agent exited with status {:?}", outcome.exit_code)),
            usage: outcome.usage,
            duration: outcome.duration,
        }
    }
}

fn backend_error(what: &str, err: &anyhow::Error) -> RunError {
    RunError::validation(format!("task backend: {what}: {err:#}"))
}

/// First line of a failure message, bounded for ledger records.
fn summarize(message: &str) -> String {
    let line = message.lines().next().unwrap_or_default();
    line.chars().take(200).collect()
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Sleep for `delay`, waking early on cancellation.
fn pause(delay: Duration, cancel: &CancellationToken) {
    let deadline = Instant::now() + delay;
    while !cancel.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(PAUSE_SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_keeps_first_line() {
        assert_eq!(summarize("first\nsecond"), "first");
        assert_eq!(summarize(&"x".repeat(500)).len(), 200);
        assert_eq!(summarize(""), "");
    }

    #[test]
    fn unsuccessful_outcome_is_a_harness_failure() {
        let outcome = HarnessOutcome {
            success: false,
            exit_code: Some(2),
            usage: Usage::new(5, 0.1),
            ..HarnessOutcome::default()
        };
        match classify(outcome) {
            AttemptOutcome::Failed {
                kind,
                message,
                usage,
                ..
            } => {
                assert_eq!(kind, ErrorKind::HarnessFailure);
                assert!(message.contains("Some(2)"));
                assert_eq!(usage.tokens, 5);
            }
            AttemptOutcome::Succeeded { .. } => panic!("expected failure"),
        }
    }

    #[test]
    fn pause_returns_early_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = Instant::now();
        pause(Duration::from_secs(5), &cancel);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
