//! Test-only helpers: deterministic tasks, in-memory collaborators and a
//! throwaway git repository.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::cancel::CancellationToken;
use crate::core::event::RunPhase;
use crate::core::selector::{count_tasks, ready_tasks};
use crate::core::types::{Task, TaskCounts, TaskStatus, Usage};
use crate::io::backend::TaskBackend;
use crate::io::handoff::{WorkerReport, write_report};
use crate::io::harness::{Harness, HarnessOutcome, HarnessRequest};
use crate::io::hooks::{HookContext, HookName, HookRunner};
use crate::io::ledger::{AttemptEnd, AttemptStart, Ledger, TaskClose, TaskStart};
use crate::parallel::{WorkerExit, WorkerLauncher, WorkerSpec};

/// Create a deterministic open task with default fields.
pub fn task(id: &str, priority: u32) -> Task {
    Task {
        id: id.to_string(),
        title: format!("{} title", id),
        description: String::new(),
        priority,
        task_type: "task".to_string(),
        status: TaskStatus::Open,
        labels: Vec::new(),
        dependencies: Vec::new(),
        blocked_by: Vec::new(),
        parent: None,
        model: None,
        assignee: None,
    }
}

/// Create an open task depending on `deps`.
pub fn task_with_deps(id: &str, priority: u32, deps: &[&str]) -> Task {
    Task {
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        ..task(id, priority)
    }
}

/// In-memory task store.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tasks: Mutex<Vec<Task>>,
    syncs: AtomicUsize,
}

impl MemoryBackend {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: Mutex::new(tasks),
            syncs: AtomicUsize::new(0),
        }
    }

    pub fn snapshot(&self, id: &str) -> Option<Task> {
        self.lock().iter().find(|t| t.id == id).cloned()
    }

    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.snapshot(id).map(|t| t.status)
    }

    pub fn sync_count(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Task>> {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn mutate(&self, id: &str, f: impl FnOnce(&mut Task)) -> Result<()> {
        let mut tasks = self.lock();
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| anyhow!("unknown task {id}"))?;
        f(task);
        Ok(())
    }
}

impl TaskBackend for MemoryBackend {
    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.snapshot(id))
    }

    fn get_ready_tasks(&self, parent: Option<&str>, label: Option<&str>) -> Result<Vec<Task>> {
        Ok(ready_tasks(&self.lock(), parent, label))
    }

    fn get_task_counts(&self) -> Result<TaskCounts> {
        Ok(count_tasks(&self.lock()))
    }

    fn update_task(&self, id: &str, status: TaskStatus, assignee: Option<&str>) -> Result<()> {
        self.mutate(id, |task| {
            task.status = status;
            task.assignee = assignee.map(str::to_string);
        })
    }

    fn close_task(&self, id: &str, _reason: &str) -> Result<()> {
        self.mutate(id, |task| task.status = TaskStatus::Closed)
    }

    fn sync(&self) -> Result<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One scripted harness invocation.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    Succeed(Usage),
    Fail { message: String, usage: Usage },
    /// The harness itself errors (e.g. the agent could not be spawned).
    Error(String),
    /// Block until the breaker terminates the attempt or `Duration` passes.
    Hang(Duration),
}

/// What the harness was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessCall {
    pub attempt_id: String,
    pub model: Option<String>,
    pub task_prompt: String,
    pub workdir: PathBuf,
}

/// Harness replaying a fixed script; succeeds with zero usage once exhausted.
#[derive(Debug)]
pub struct ScriptedHarness {
    available: bool,
    steps: Mutex<VecDeque<ScriptedStep>>,
    calls: Mutex<Vec<HarnessCall>>,
}

impl ScriptedHarness {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            available: true,
            steps: Mutex::new(steps.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(Vec::new())
        }
    }

    pub fn calls(&self) -> Vec<HarnessCall> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Harness for ScriptedHarness {
    fn name(&self) -> &str {
        "scripted"
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn invoke(&self, request: &HarnessRequest) -> Result<HarnessOutcome> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(HarnessCall {
                attempt_id: request.attempt_id.clone(),
                model: request.model.clone(),
                task_prompt: request.task_prompt.clone(),
                workdir: request.workdir.clone(),
            });
        let step = self
            .steps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
            .unwrap_or(ScriptedStep::Succeed(Usage::default()));

        match step {
            ScriptedStep::Succeed(usage) => Ok(HarnessOutcome {
                success: true,
                usage,
                exit_code: Some(0),
                ..HarnessOutcome::default()
            }),
            ScriptedStep::Fail { message, usage } => Ok(HarnessOutcome {
                success: false,
                usage,
                exit_code: Some(1),
                error: Some(message),
                ..HarnessOutcome::default()
            }),
            ScriptedStep::Error(message) => Err(anyhow!(message)),
            ScriptedStep::Hang(limit) => {
                let started = Instant::now();
                while !request.slot.is_terminated() && started.elapsed() < limit {
                    thread::sleep(Duration::from_millis(10));
                }
                Ok(HarnessOutcome {
                    success: false,
                    error: Some("killed".to_string()),
                    ..HarnessOutcome::default()
                })
            }
        }
    }
}

/// Hook runner that records every call; hooks in `failing` report failure.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    failing: HashSet<HookName>,
    calls: Mutex<Vec<(HookName, HookContext)>>,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(hooks: &[HookName]) -> Self {
        Self {
            failing: hooks.iter().copied().collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn names(&self) -> Vec<HookName> {
        self.calls().into_iter().map(|(hook, _)| hook).collect()
    }

    pub fn calls(&self) -> Vec<(HookName, HookContext)> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl HookRunner for RecordingHooks {
    fn run(&self, hook: HookName, ctx: &HookContext) -> bool {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((hook, ctx.clone()));
        !self.failing.contains(&hook)
    }
}

/// Ledger keeping each record as a short line, e.g. `attempt_end t1 #2 ok`.
#[derive(Debug, Default)]
pub struct RecordingLedger {
    lines: Mutex<Vec<String>>,
    closes: Mutex<Vec<TaskClose>>,
}

impl RecordingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn closes(&self) -> Vec<TaskClose> {
        self.closes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn push(&self, line: String) {
        self.lines
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(line);
    }
}

impl Ledger for RecordingLedger {
    fn on_task_start(&self, record: &TaskStart) -> Result<()> {
        self.push(format!("task_start {}", record.task_id));
        Ok(())
    }

    fn on_attempt_start(&self, record: &AttemptStart) -> Result<()> {
        self.push(format!("attempt_start {} #{}", record.task_id, record.attempt));
        Ok(())
    }

    fn on_attempt_end(&self, record: &AttemptEnd) -> Result<()> {
        let outcome = if record.success { "ok" } else { "failed" };
        self.push(format!(
            "attempt_end {} #{} {outcome}",
            record.task_id, record.attempt
        ));
        Ok(())
    }

    fn on_task_close(&self, record: &TaskClose) -> Result<()> {
        let outcome = if record.success { "ok" } else { "failed" };
        self.push(format!("task_close {} {outcome}", record.task_id));
        self.closes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

type LaunchFn = dyn Fn(&WorkerSpec) -> Result<WorkerExit> + Send + Sync;

/// Worker launcher that runs a closure in-process instead of a child.
pub struct FakeLauncher {
    behavior: Box<LaunchFn>,
    launched: Mutex<Vec<WorkerSpec>>,
}

impl FakeLauncher {
    pub fn new(behavior: impl Fn(&WorkerSpec) -> Result<WorkerExit> + Send + Sync + 'static) -> Self {
        Self {
            behavior: Box::new(behavior),
            launched: Mutex::new(Vec::new()),
        }
    }

    /// Every worker writes a successful report with 10 tokens and cost 0.1.
    pub fn succeeding() -> Self {
        Self::new(|spec| {
            write_report(&spec.result_file, &worker_report(spec, true, 10, 0.1))?;
            Ok(WorkerExit {
                exit_code: Some(0),
                ..WorkerExit::default()
            })
        })
    }

    pub fn launched(&self) -> Vec<WorkerSpec> {
        self.launched
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl WorkerLauncher for FakeLauncher {
    fn launch(&self, spec: &WorkerSpec, _cancel: &CancellationToken) -> Result<WorkerExit> {
        self.launched
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(spec.clone());
        (self.behavior)(spec)
    }
}

/// A report as a worker for `spec` would write it.
pub fn worker_report(spec: &WorkerSpec, success: bool, tokens: u64, cost: f64) -> WorkerReport {
    WorkerReport {
        task_id: spec.task_id.clone(),
        run_id: spec.run_id.clone(),
        success,
        phase: RunPhase::Completed,
        tokens,
        cost,
        duration_ms: 1,
        error: (!success).then(|| "scripted failure".to_string()),
        error_kind: None,
    }
}

/// Git repository in a temp dir with one commit on its default branch.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "runner@example.com"])?;
        repo.git(&["config", "user.name", "Runner Tests"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        fs::write(repo.path().join("README.md"), "test repo\n").context("write README")?;
        fs::write(repo.path().join(".gitignore"), ".runner/\n.worktrees/\n")
            .context("write .gitignore")?;
        Self::commit_all_in(repo.path(), "initial commit")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Run git in the repository; returns trimmed stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        git_in(self.path(), args)
    }

    pub fn current_branch(&self) -> Result<String> {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    /// Stage everything under `dir` and commit it.
    pub fn commit_all_in(dir: &Path, message: &str) -> Result<()> {
        git_in(dir, &["add", "-A"])?;
        git_in(
            dir,
            &[
                "-c",
                "user.email=runner@example.com",
                "-c",
                "user.name=Runner Tests",
                "commit",
                "-q",
                "-m",
                message,
            ],
        )?;
        Ok(())
    }
}

fn git_in(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
