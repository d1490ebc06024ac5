//! Parallel execution of independent tasks.
//!
//! Each task gets its own worktree and runs in a separate `runner worker`
//! process. A bounded pool of scoped threads supervises the children; results
//! arrive over a channel in completion order.

use std::collections::{HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancellationToken;
use crate::core::selector::independent_subset;
use crate::core::types::{ErrorKind, Task, TaskStatus};
use crate::io::backend::TaskBackend;
use crate::io::handoff::{WorkerReport, read_report};
use crate::io::process::run_command_until;
use crate::io::status::{StatusWriter, TaskState};
use crate::io::worktree::{WorktreeManager, sanitize_task_id};

/// Everything a launcher needs to start one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub task_id: String,
    /// Run id the worker's own run loop uses.
    pub run_id: String,
    /// Working directory of the worker process.
    pub worktree: PathBuf,
    /// Main repository root holding the shared task store, ledger and status.
    pub repo_root: PathBuf,
    pub result_file: PathBuf,
    pub log_file: PathBuf,
    pub timeout: Option<Duration>,
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerExit {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
}

/// Starts one worker and waits for it.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, spec: &WorkerSpec, cancel: &CancellationToken) -> Result<WorkerExit>;
}

/// Time a stopped worker gets to shut down its agent before it is killed.
pub const WORKER_STOP_GRACE: Duration = Duration::from_secs(10);

/// Launches `<program> worker ...` children, normally the current executable.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    output_limit_bytes: usize,
    stop_grace: Duration,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, output_limit_bytes: usize) -> Self {
        Self {
            program: program.into(),
            output_limit_bytes,
            stop_grace: WORKER_STOP_GRACE,
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn current_exe(output_limit_bytes: usize) -> Result<Self> {
        let program = std::env::current_exe().context("locate runner executable")?;
        Ok(Self::new(program, output_limit_bytes))
    }
}

impl WorkerLauncher for ProcessLauncher {
    #[instrument(skip_all, fields(task_id = %spec.task_id))]
    fn launch(&self, spec: &WorkerSpec, cancel: &CancellationToken) -> Result<WorkerExit> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("worker")
            .arg("--task")
            .arg(&spec.task_id)
            .arg("--result-file")
            .arg(&spec.result_file)
            .arg("--run-id")
            .arg(&spec.run_id)
            .arg("--root")
            .arg(&spec.repo_root)
            .current_dir(&spec.worktree);

        let output = run_command_until(
            cmd,
            spec.timeout,
            self.stop_grace,
            self.output_limit_bytes,
            &|| cancel.is_cancelled(),
        )?;
        if let Some(parent) = spec.log_file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        std::fs::write(&spec.log_file, output.render_log("worker"))
            .with_context(|| format!("write worker log {}", spec.log_file.display()))?;

        Ok(WorkerExit {
            exit_code: output.status.code(),
            timed_out: output.timed_out,
            cancelled: output.cancelled,
        })
    }
}

/// Outcome of one task in a parallel run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub task_id: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub tokens: u64,
    pub cost: f64,
    pub worktree_path: Option<PathBuf>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl WorkerResult {
    fn failed(task_id: &str, kind: ErrorKind, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            task_id: task_id.to_string(),
            success: false,
            exit_code: None,
            duration,
            tokens: 0,
            cost: 0.0,
            worktree_path: None,
            error: Some(error.into()),
            error_kind: Some(kind),
        }
    }
}

/// Aggregate of a parallel run; one [`WorkerResult`] per submitted task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelRunResult {
    pub run_id: String,
    /// Completion order; tasks that never started come last.
    pub results: Vec<WorkerResult>,
    pub succeeded: usize,
    pub failed: usize,
    pub tokens: u64,
    pub cost: f64,
    pub duration: Duration,
    pub cancelled: bool,
}

impl ParallelRunResult {
    fn new(run_id: &str, results: Vec<WorkerResult>, duration: Duration, cancelled: bool) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        Self {
            run_id: run_id.to_string(),
            succeeded,
            failed: results.len() - succeeded,
            tokens: results.iter().map(|r| r.tokens).sum(),
            cost: results.iter().map(|r| r.cost).sum(),
            duration,
            cancelled,
            results,
        }
    }

    pub fn success(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }
}

#[derive(Debug, Clone)]
pub struct ParallelOptions {
    pub run_id: String,
    /// Result files and worker logs go here.
    pub artifacts_dir: PathBuf,
    pub worker_timeout: Option<Duration>,
    pub keep_worktrees: bool,
}

pub struct ParallelRunner<'a> {
    backend: &'a dyn TaskBackend,
    worktrees: &'a WorktreeManager,
    launcher: &'a dyn WorkerLauncher,
    status: Option<&'a StatusWriter>,
    options: ParallelOptions,
}

impl<'a> ParallelRunner<'a> {
    pub fn new(
        backend: &'a dyn TaskBackend,
        worktrees: &'a WorktreeManager,
        launcher: &'a dyn WorkerLauncher,
        options: ParallelOptions,
    ) -> Self {
        Self {
            backend,
            worktrees,
            launcher,
            status: None,
            options,
        }
    }

    /// Fall back to status snapshots when a worker leaves no report.
    pub fn with_status(mut self, status: &'a StatusWriter) -> Self {
        self.status = Some(status);
        self
    }

    /// Up to `count` ready tasks with no dependency edge between any two.
    pub fn find_independent_tasks(
        &self,
        count: usize,
        epic: Option<&str>,
        label: Option<&str>,
    ) -> Result<Vec<Task>> {
        let ready = self.backend.get_ready_tasks(epic, label)?;
        let picked = independent_subset(&ready, count);
        debug!(ready = ready.len(), picked = picked.len(), "independent tasks");
        Ok(picked)
    }

    /// Run `tasks` on at most `max_workers` concurrent worker processes.
    ///
    /// Always returns exactly one result per task. Worktrees created here are
    /// removed afterwards unless `keep_worktrees` is set.
    #[instrument(skip_all, fields(run_id = %self.options.run_id, tasks = tasks.len()))]
    pub fn run(
        &self,
        tasks: &[Task],
        max_workers: usize,
        cancel: &CancellationToken,
    ) -> ParallelRunResult {
        let started = Instant::now();
        let pool = max_workers.max(1).min(tasks.len());
        info!(pool, "starting parallel run");

        let queue = Mutex::new(tasks.iter().cloned().collect::<VecDeque<_>>());
        let registry = Mutex::new(Vec::<PathBuf>::new());
        let mut results = Vec::with_capacity(tasks.len());

        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel();
            for worker in 0..pool {
                let tx = tx.clone();
                let queue = &queue;
                let registry = &registry;
                scope.spawn(move || {
                    loop {
                        if cancel.is_cancelled() {
                            debug!(worker, "cancelled, not taking more tasks");
                            break;
                        }
                        let next = queue
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .pop_front();
                        let Some(task) = next else {
                            break;
                        };
                        let task_started = Instant::now();
                        let result = catch_unwind(AssertUnwindSafe(|| {
                            self.run_task(&task, registry, cancel)
                        }))
                        .unwrap_or_else(|payload| {
                            let message = panic_message(payload.as_ref());
                            warn!(task_id = %task.id, message = %message, "worker panicked");
                            self.release_task(&task.id);
                            WorkerResult::failed(
                                &task.id,
                                ErrorKind::HarnessFailure,
                                format!("worker panicked: {message}"),
                                task_started.elapsed(),
                            )
                        });
                        if tx.send(result).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);
            results.extend(rx);
        });

        let seen: HashSet<String> = results.iter().map(|r| r.task_id.clone()).collect();
        for task in tasks.iter().filter(|t| !seen.contains(&t.id)) {
            let reason = if cancel.is_cancelled() {
                "cancelled before start"
            } else {
                "worker never started"
            };
            results.push(WorkerResult::failed(
                &task.id,
                ErrorKind::HarnessFailure,
                reason,
                Duration::ZERO,
            ));
        }

        let registered = registry.into_inner().unwrap_or_else(PoisonError::into_inner);
        if self.options.keep_worktrees {
            info!(count = registered.len(), "keeping worktrees");
        } else {
            self.cleanup(&registered);
        }

        let result =
            ParallelRunResult::new(&self.options.run_id, results, started.elapsed(), cancel.is_cancelled());
        info!(succeeded = result.succeeded, failed = result.failed, "parallel run finished");
        result
    }

    #[instrument(skip_all, fields(task_id = %task.id))]
    fn run_task(
        &self,
        task: &Task,
        registry: &Mutex<Vec<PathBuf>>,
        cancel: &CancellationToken,
    ) -> WorkerResult {
        let started = Instant::now();
        let (worktree, created) = match self.worktrees.get_or_create_for_task(&task.id) {
            Ok((info, created)) => (info.path, created),
            Err(err) => {
                warn!(err = %err, "worktree allocation failed");
                return WorkerResult::failed(
                    &task.id,
                    ErrorKind::WorktreeError,
                    err.to_string(),
                    started.elapsed(),
                );
            }
        };
        if created {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(worktree.clone());
        } else {
            debug!(path = %worktree.display(), "reusing existing worktree, leaving it in place");
        }

        let spec = self.spec_for(task, worktree.clone());
        if spec.result_file.exists() {
            if let Err(err) = std::fs::remove_file(&spec.result_file) {
                warn!(err = %err, "failed to remove stale result file");
            }
        }

        let exit = match self.launcher.launch(&spec, cancel) {
            Ok(exit) => exit,
            Err(err) => {
                let mut result = WorkerResult::failed(
                    &task.id,
                    ErrorKind::HarnessFailure,
                    format!("launch worker: {err:#}"),
                    started.elapsed(),
                );
                result.worktree_path = Some(worktree);
                self.release_task(&task.id);
                return result;
            }
        };
        let mut result = self.collect(&spec, exit);
        result.duration = started.elapsed();
        result.worktree_path = Some(worktree);
        if !result.success {
            self.release_task(&task.id);
        }
        info!(success = result.success, exit_code = ?result.exit_code, "worker finished");
        result
    }

    /// Reopen a task a failed or killed worker left `in_progress`.
    fn release_task(&self, task_id: &str) {
        match self.backend.get_task(task_id) {
            Ok(Some(task)) if task.status == TaskStatus::InProgress => {
                match self.backend.update_task(task_id, TaskStatus::Open, None) {
                    Ok(()) => info!(task_id, "reopened task left in progress by worker"),
                    Err(err) => warn!(task_id, err = %format!("{err:#}"), "failed to reopen task"),
                }
            }
            Ok(_) => {}
            Err(err) => warn!(task_id, err = %format!("{err:#}"), "failed to read task state"),
        }
    }

    fn spec_for(&self, task: &Task, worktree: PathBuf) -> WorkerSpec {
        let stem = sanitize_task_id(&task.id);
        WorkerSpec {
            task_id: task.id.clone(),
            run_id: format!("{}-{stem}", self.options.run_id),
            worktree,
            repo_root: self.worktrees.repo_root().to_path_buf(),
            result_file: self.options.artifacts_dir.join(format!("{stem}.result.json")),
            log_file: self.options.artifacts_dir.join(format!("{stem}.log")),
            timeout: self.options.worker_timeout,
        }
    }

    /// Merge the exit status with the worker's report, or its status snapshot.
    fn collect(&self, spec: &WorkerSpec, exit: WorkerExit) -> WorkerResult {
        let exited_cleanly = exit.exit_code == Some(0) && !exit.timed_out && !exit.cancelled;
        let mut result = WorkerResult {
            task_id: spec.task_id.clone(),
            success: false,
            exit_code: exit.exit_code,
            duration: Duration::ZERO,
            tokens: 0,
            cost: 0.0,
            worktree_path: None,
            error: None,
            error_kind: None,
        };

        match read_report(&spec.result_file) {
            Ok(report) => apply_report(&mut result, &report, exited_cleanly),
            Err(err) => {
                debug!(err = %format!("{err:#}"), "no usable worker report");
                self.apply_snapshot(&mut result, spec, exited_cleanly);
            }
        }

        if exit.timed_out {
            result.success = false;
            result.error = Some(format!(
                "worker timed out after {}s",
                spec.timeout.map_or(0, |t| t.as_secs())
            ));
            result.error_kind = Some(ErrorKind::CircuitBreakerTimeout);
        } else if exit.cancelled {
            result.success = false;
            result.error = Some("worker cancelled".to_string());
        } else if !result.success && result.error.is_none() {
            result.error = Some(match exit.exit_code {
                Some(code) => format!("worker exited with code {code}"),
                None => "worker terminated by signal".to_string(),
            });
        }
        if !result.success && result.error_kind.is_none() {
            result.error_kind = Some(ErrorKind::HarnessFailure);
        }
        result
    }

    fn apply_snapshot(&self, result: &mut WorkerResult, spec: &WorkerSpec, exited_cleanly: bool) {
        let Some(status) = self.status else {
            return;
        };
        match status.read_snapshot(&spec.task_id) {
            Ok(Some(snapshot)) if snapshot.run_id == spec.run_id => {
                result.tokens = snapshot.tokens;
                result.cost = snapshot.cost;
                result.success = exited_cleanly && snapshot.state == TaskState::Completed;
                if let Some(error) = snapshot.error {
                    result.error = Some(error.message);
                    result.error_kind = Some(error.kind);
                }
            }
            Ok(_) => debug!("no status snapshot for this worker run"),
            Err(err) => warn!(err = %format!("{err:#}"), "failed to read status snapshot"),
        }
    }

    fn cleanup(&self, paths: &[PathBuf]) {
        for path in paths {
            match self.worktrees.remove(path, true) {
                Ok(()) => debug!(path = %path.display(), "removed worker worktree"),
                Err(err) => warn!(path = %path.display(), err = %err, "worktree cleanup failed"),
            }
        }
    }
}

fn apply_report(result: &mut WorkerResult, report: &WorkerReport, exited_cleanly: bool) {
    result.tokens = report.tokens;
    result.cost = report.cost;
    result.success = exited_cleanly && report.success;
    result.error = report.error.clone();
    result.error_kind = report.error_kind;
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Per-run directory for worker result files and logs.
pub fn artifacts_dir(runner_dir: &Path, run_id: &str) -> PathBuf {
    runner_dir.join("parallel").join(run_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::RunPhase;

    fn spec(dir: &Path) -> WorkerSpec {
        WorkerSpec {
            task_id: "t-1".to_string(),
            run_id: "run-1-t-1".to_string(),
            worktree: dir.to_path_buf(),
            repo_root: dir.to_path_buf(),
            result_file: dir.join("t-1.result.json"),
            log_file: dir.join("t-1.log"),
            timeout: Some(Duration::from_secs(9)),
        }
    }

    #[test]
    fn report_usage_flows_into_result() {
        let mut result = WorkerResult::failed("t-1", ErrorKind::HarnessFailure, "x", Duration::ZERO);
        let report = WorkerReport {
            task_id: "t-1".to_string(),
            run_id: "run-1-t-1".to_string(),
            success: true,
            phase: RunPhase::Completed,
            tokens: 40,
            cost: 0.25,
            duration_ms: 10,
            error: None,
            error_kind: None,
        };
        apply_report(&mut result, &report, true);
        assert!(result.success);
        assert_eq!(result.tokens, 40);
        assert_eq!(result.error, None);

        apply_report(&mut result, &report, false);
        assert!(!result.success);
    }

    #[test]
    fn timeout_overrides_report() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = spec(temp.path());
        let runner = ParallelRunnerFixture::new(temp.path());
        let result = runner.runner().collect(
            &spec,
            WorkerExit {
                exit_code: None,
                timed_out: true,
                cancelled: false,
            },
        );
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::CircuitBreakerTimeout));
        assert_eq!(result.error.as_deref(), Some("worker timed out after 9s"));
    }

    #[test]
    fn missing_report_and_snapshot_reports_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = spec(temp.path());
        let runner = ParallelRunnerFixture::new(temp.path());
        let result = runner.runner().collect(
            &spec,
            WorkerExit {
                exit_code: Some(2),
                ..WorkerExit::default()
            },
        );
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("worker exited with code 2"));
        assert_eq!(result.error_kind, Some(ErrorKind::HarnessFailure));
    }

    #[test]
    fn panic_payloads_render() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&"boom".to_string()), "boom");
        assert_eq!(panic_message(&5_u8), "unknown panic");
    }

    struct ParallelRunnerFixture {
        backend: crate::test_support::MemoryBackend,
        _repo: crate::test_support::TestRepo,
        worktrees: WorktreeManager,
        launcher: crate::test_support::FakeLauncher,
        artifacts: PathBuf,
    }

    impl ParallelRunnerFixture {
        fn new(artifacts: &Path) -> Self {
            let repo = crate::test_support::TestRepo::new().expect("repo");
            let worktrees =
                WorktreeManager::new(repo.path(), ".worktrees", "runner/").expect("manager");
            Self {
                backend: crate::test_support::MemoryBackend::new(Vec::new()),
                _repo: repo,
                worktrees,
                launcher: crate::test_support::FakeLauncher::succeeding(),
                artifacts: artifacts.to_path_buf(),
            }
        }

        fn runner(&self) -> ParallelRunner<'_> {
            ParallelRunner::new(
                &self.backend,
                &self.worktrees,
                &self.launcher,
                ParallelOptions {
                    run_id: "run-1".to_string(),
                    artifacts_dir: self.artifacts.clone(),
                    worker_timeout: None,
                    keep_worktrees: false,
                },
            )
        }
    }
}
