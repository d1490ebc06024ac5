//! Autonomous coding agent runner.
//!
//! Picks ready tasks from `.runner/tasks.json`, runs each through an agent
//! harness and records the outcome, either one task at a time (`run`) or as
//! isolated worker processes in per-task git worktrees (`parallel`).

use std::env;
use std::path::{Path, PathBuf};

use agent_runner::core::cancel::CancellationToken;
use agent_runner::core::event::{RunEvent, RunEventKind, StopReason};
use agent_runner::exit_codes;
use agent_runner::io::backend::{JsonTaskBackend, TASKS_FILE, TaskBackend};
use agent_runner::io::config::{
    RunConfig, RunOverrides, RunnerConfig, config_path, load_config, new_run_id, runner_dir,
    write_config,
};
use agent_runner::io::git::Git;
use agent_runner::io::handoff::{WorkerReport, write_report};
use agent_runner::io::harness::{CommandHarness, Harness};
use agent_runner::io::hooks::{CommandHookRunner, HookRunner, NoopHooks};
use agent_runner::io::ledger::{JsonlLedger, Ledger, NoopLedger};
use agent_runner::io::status::StatusWriter;
use agent_runner::io::worktree::WorktreeManager;
use agent_runner::logging;
use agent_runner::parallel::{ParallelOptions, ParallelRunner, ProcessLauncher, artifacts_dir};
use agent_runner::run_loop::{Collaborators, RunLoop};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "runner",
    version,
    about = "Autonomous coding agent task runner"
)]
struct Cli {
    /// Repository root holding `.runner/` (defaults to the current directory).
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.runner/config.toml` and an empty `.runner/tasks.json` if missing.
    Init {
        /// Overwrite the existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run ready tasks one at a time until a stop condition fires.
    Run(RunArgs),
    /// Run independent tasks concurrently, each in its own worktree.
    Parallel(ParallelArgs),
    /// Run one task inside a worktree and write a result file (used by `parallel`).
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        task: String,
        #[arg(long)]
        result_file: PathBuf,
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Inspect and clean up task worktrees.
    Worktree {
        #[command(subcommand)]
        action: WorktreeAction,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Run exactly this task.
    #[arg(long)]
    task: Option<String>,
    /// Stop after the first task.
    #[arg(long)]
    once: bool,
    #[arg(long)]
    max_iterations: Option<u32>,
    /// Only tasks under this epic.
    #[arg(long)]
    epic: Option<String>,
    #[arg(long)]
    label: Option<String>,
    #[arg(long)]
    harness: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    max_tokens: Option<u64>,
    #[arg(long)]
    max_cost: Option<f64>,
    #[arg(long)]
    max_tasks: Option<u32>,
    #[arg(long)]
    no_hooks: bool,
    #[arg(long)]
    no_ledger: bool,
    /// Sync the task store after every completed task.
    #[arg(long)]
    sync: bool,
    #[arg(long)]
    stop_on_failure: bool,
}

impl RunArgs {
    fn overrides(self) -> RunOverrides {
        RunOverrides {
            run_id: None,
            task_id: self.task,
            once: self.once,
            max_iterations: self.max_iterations,
            epic: self.epic,
            label: self.label,
            harness: self.harness,
            model: self.model,
            max_tokens: self.max_tokens,
            max_cost: self.max_cost,
            max_tasks: self.max_tasks,
            no_hooks: self.no_hooks,
            no_ledger: self.no_ledger,
            sync: self.sync,
            stop_on_failure: self.stop_on_failure,
        }
    }
}

#[derive(Args, Debug)]
struct ParallelArgs {
    /// How many tasks to pick (defaults to the worker count).
    #[arg(long)]
    count: Option<usize>,
    /// Concurrent worker processes (defaults to `parallel.max_workers`).
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    epic: Option<String>,
    #[arg(long)]
    label: Option<String>,
    #[arg(long)]
    keep_worktrees: bool,
}

#[derive(Subcommand)]
enum WorktreeAction {
    /// List every worktree of the repository.
    List,
    /// Remove one worktree.
    Remove {
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Remove worktrees whose branch is merged into the base branch.
    Cleanup {
        /// Defaults to the current branch.
        #[arg(long)]
        base: Option<String>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => env::current_dir().context("resolve current directory")?,
    };
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Run(args) => {
            let config = load_config(&config_path(&root))?;
            cmd_run(&root, &config, args)
        }
        Command::Parallel(args) => {
            let config = load_config(&config_path(&root))?;
            cmd_parallel(&root, &config, args)
        }
        Command::Worker {
            task,
            result_file,
            run_id,
        } => {
            let config = load_config(&config_path(&root))?;
            cmd_worker(&root, &config, task, &result_file, run_id)
        }
        Command::Worktree { action } => {
            let config = load_config(&config_path(&root))?;
            cmd_worktree(&root, &config, action)
        }
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let path = config_path(root);
    if force || !path.exists() {
        write_config(&path, &RunnerConfig::default())?;
        println!("wrote {}", path.display());
    }
    let backend = task_backend(root);
    if !backend.path().exists() {
        backend.write_tasks(&[])?;
        println!("wrote {}", backend.path().display());
    }
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, config: &RunnerConfig, args: RunArgs) -> Result<i32> {
    let run = RunConfig::from_config(config, args.overrides());
    let cancel = CancellationToken::new();
    install_interrupt_handler(&cancel);

    let result = execute(root, root, config, run, &cancel)?;
    println!(
        "run {}: {:?} ({}) completed={} failed={} tokens={} cost={:.4}",
        result.run_id,
        result.phase,
        result
            .stop_reason
            .as_ref()
            .map_or_else(|| "unknown".to_string(), describe_reason),
        result.tasks_completed,
        result.tasks_failed,
        result.tokens,
        result.cost
    );
    Ok(exit_codes::for_run(&result))
}

fn cmd_worker(
    root: &Path,
    config: &RunnerConfig,
    task: String,
    result_file: &Path,
    run_id: Option<String>,
) -> Result<i32> {
    let workdir = env::current_dir().context("resolve worker directory")?;
    let run = RunConfig::from_config(
        config,
        RunOverrides {
            run_id,
            task_id: Some(task.clone()),
            once: true,
            ..RunOverrides::default()
        },
    );
    let cancel = CancellationToken::new();
    install_interrupt_handler(&cancel);

    let result = execute(root, &workdir, config, run, &cancel)?;
    let report = WorkerReport::from_run(&task, &result);
    write_report(result_file, &report)?;
    info!(task_id = %task, success = report.success, "worker finished");
    Ok(match exit_codes::for_run(&result) {
        exit_codes::OK if !report.success => exit_codes::TASK_FAILED,
        code => code,
    })
}

fn cmd_parallel(root: &Path, config: &RunnerConfig, args: ParallelArgs) -> Result<i32> {
    let workers = args.workers.unwrap_or(config.parallel.max_workers).max(1);
    let count = args.count.unwrap_or(workers);
    let run_id = new_run_id();
    let backend = task_backend(root);
    let status = StatusWriter::new(&runner_dir(root));
    let worktrees = WorktreeManager::new(
        root,
        &config.worktree.base_dir,
        config.worktree.branch_prefix.clone(),
    )?;
    let launcher = ProcessLauncher::current_exe(config.output_limit_bytes)?.with_stop_grace(
        std::time::Duration::from_secs(config.parallel.worker_stop_grace_secs),
    );
    let runner = ParallelRunner::new(
        &backend,
        &worktrees,
        &launcher,
        ParallelOptions {
            run_id: run_id.clone(),
            artifacts_dir: artifacts_dir(&runner_dir(root), &run_id),
            worker_timeout: config
                .parallel
                .worker_timeout_secs
                .map(std::time::Duration::from_secs),
            keep_worktrees: args.keep_worktrees || config.parallel.keep_worktrees,
        },
    )
    .with_status(&status);

    let tasks = runner.find_independent_tasks(count, args.epic.as_deref(), args.label.as_deref())?;
    if tasks.is_empty() {
        let counts = backend.get_task_counts()?;
        println!("no ready tasks ({} remaining)", counts.remaining);
        return Ok(if counts.remaining > 0 {
            exit_codes::BLOCKED
        } else {
            exit_codes::OK
        });
    }

    let cancel = CancellationToken::new();
    install_interrupt_handler(&cancel);
    let result = runner.run(&tasks, workers, &cancel);
    for worker in &result.results {
        let outcome = if worker.success { "ok" } else { "failed" };
        println!(
            "{} {outcome} tokens={} cost={:.4}{}",
            worker.task_id,
            worker.tokens,
            worker.cost,
            worker
                .error
                .as_deref()
                .map(|e| format!(" error={e}"))
                .unwrap_or_default()
        );
    }
    println!(
        "parallel {}: succeeded={} failed={} tokens={} cost={:.4}",
        result.run_id, result.succeeded, result.failed, result.tokens, result.cost
    );
    Ok(exit_codes::for_parallel(&result))
}

fn cmd_worktree(root: &Path, config: &RunnerConfig, action: WorktreeAction) -> Result<i32> {
    let worktrees = WorktreeManager::new(
        root,
        &config.worktree.base_dir,
        config.worktree.branch_prefix.clone(),
    )?;
    match action {
        WorktreeAction::List => {
            for info in worktrees.list()? {
                let short = info.commit.get(..8).unwrap_or(&info.commit);
                let branch = info.branch.as_deref().unwrap_or("(detached)");
                let lock = if info.locked { " locked" } else { "" };
                println!("{}\t{branch}\t{short}{lock}", info.path.display());
            }
        }
        WorktreeAction::Remove { path, force } => {
            worktrees.remove(&path, force)?;
            println!("removed {}", path.display());
        }
        WorktreeAction::Cleanup { base } => {
            let base = match base {
                Some(base) => base,
                None => Git::new(root).current_branch()?,
            };
            for info in worktrees.cleanup_merged(&base)? {
                println!("removed {}", info.path.display());
            }
        }
    }
    Ok(exit_codes::OK)
}

/// Wire production collaborators and run the loop.
fn execute(
    root: &Path,
    workdir: &Path,
    config: &RunnerConfig,
    run: RunConfig,
    cancel: &CancellationToken,
) -> Result<agent_runner::core::event::RunResult> {
    let backend = task_backend(root);
    let status = StatusWriter::new(&runner_dir(root));
    let harness = config
        .harness_config(&run.harness)
        .cloned()
        .map(|cfg| CommandHarness::new(run.harness.clone(), cfg, config.output_limit_bytes));
    let hooks: Box<dyn HookRunner> = if run.hooks_enabled {
        Box::new(
            CommandHookRunner::new(config.hooks.clone(), workdir, config.output_limit_bytes)
                .with_log_dir(runner_dir(root).join("hooks")),
        )
    } else {
        Box::new(NoopHooks)
    };
    let ledger: Box<dyn Ledger> = if run.ledger_enabled {
        Box::new(JsonlLedger::new(root.join(&config.ledger.path)))
    } else {
        Box::new(NoopLedger)
    };

    let deps = Collaborators {
        backend: &backend,
        harness: harness.as_ref().map(|h| h as &dyn Harness),
        hooks: hooks.as_ref(),
        ledger: ledger.as_ref(),
        status: Some(&status),
    };
    info!(run_id = %run.run_id, harness = %run.harness, "starting run");
    let run_loop = RunLoop::new(run, workdir, deps);
    Ok(run_loop.run(cancel, render_event))
}

fn task_backend(root: &Path) -> JsonTaskBackend {
    JsonTaskBackend::new(runner_dir(root).join(TASKS_FILE))
}

/// Cancel on SIGINT, SIGTERM or SIGHUP; the run loop then stops any agent in flight.
fn install_interrupt_handler(cancel: &CancellationToken) {
    let token = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || token.cancel()) {
        warn!(err = %err, "failed to install interrupt handler");
    }
}

fn render_event(event: &RunEvent) {
    let detail = match &event.kind {
        RunEventKind::RunStarted { run_id } => run_id.clone(),
        RunEventKind::RunStopped { reason, .. } => describe_reason(reason),
        RunEventKind::RunFailed { error } => error.to_string(),
        RunEventKind::IterationStarted { iteration } => format!("#{iteration}"),
        RunEventKind::TaskSelected { task_id, title } => format!("{task_id} {title}"),
        RunEventKind::TaskStarted {
            task_id,
            attempt,
            model,
        } => format!(
            "{task_id} attempt {attempt} model {}",
            model.as_deref().unwrap_or("default")
        ),
        RunEventKind::TaskCompleted {
            task_id,
            usage,
            duration_ms,
            escalated,
        } => format!(
            "{task_id} tokens={} cost={:.4} {duration_ms}ms{}",
            usage.tokens,
            usage.cost,
            if *escalated { " escalated" } else { "" }
        ),
        RunEventKind::TaskFailed {
            task_id,
            kind,
            message,
        } => format!("{task_id} {kind}: {message}"),
        RunEventKind::BudgetUpdated { tokens, cost } => format!("tokens={tokens} cost={cost:.4}"),
        RunEventKind::BudgetWarning {
            resource,
            utilization,
        } => format!("{resource} at {:.0}%", utilization * 100.0),
        RunEventKind::BudgetExhausted { resource } => resource.to_string(),
        RunEventKind::CircuitBreakerTripped {
            task_id,
            timeout_secs,
        } => format!("{task_id} after {timeout_secs}s"),
        RunEventKind::HookFailed { hook } => hook.clone(),
        RunEventKind::InterruptReceived => String::new(),
    };
    println!("[{:>3}] {} {}", event.seq, event.kind.name(), detail);
}

fn describe_reason(reason: &StopReason) -> String {
    match reason {
        StopReason::NoTasksRemaining => "no tasks remaining".to_string(),
        StopReason::Blocked { remaining } => format!("blocked, {remaining} remaining"),
        StopReason::TaskAlreadyClosed { task_id } => format!("{task_id} already closed"),
        StopReason::BudgetExhausted { resource } => format!("{resource} budget exhausted"),
        StopReason::MaxIterationsReached { max_iterations } => {
            format!("reached {max_iterations} iterations")
        }
        StopReason::SingleTaskDone => "single task done".to_string(),
        StopReason::Interrupted => "interrupted".to_string(),
        StopReason::TaskFailed { task_id } => format!("{task_id} failed"),
        StopReason::Fatal { error } => error.to_string(),
    }
}
