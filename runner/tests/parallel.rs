//! Parallel runner tests against a real git repository and in-process workers.

use std::time::Duration;

use agent_runner::core::cancel::CancellationToken;
use agent_runner::core::types::{ErrorKind, Task, TaskStatus};
use agent_runner::io::backend::{JsonTaskBackend, TASKS_FILE, TaskBackend};
use agent_runner::io::config::{HarnessConfig, RunnerConfig, config_path, runner_dir, write_config};
use agent_runner::io::handoff::write_report;
use agent_runner::io::worktree::WorktreeManager;
use agent_runner::parallel::{
    ParallelOptions, ParallelRunResult, ParallelRunner, ProcessLauncher, WorkerExit, WorkerResult,
};
use agent_runner::test_support::{
    FakeLauncher, MemoryBackend, TestRepo, task, task_with_deps, worker_report,
};
use tempfile::TempDir;

struct Fixture {
    repo: TestRepo,
    worktrees: WorktreeManager,
    backend: MemoryBackend,
    artifacts: TempDir,
}

impl Fixture {
    fn new(tasks: Vec<Task>) -> Self {
        let repo = TestRepo::new().expect("repo");
        let worktrees = WorktreeManager::new(repo.path(), ".worktrees", "runner/").expect("manager");
        Self {
            repo,
            worktrees,
            backend: MemoryBackend::new(tasks),
            artifacts: tempfile::tempdir().expect("artifacts"),
        }
    }

    fn runner<'a>(&'a self, launcher: &'a FakeLauncher, keep_worktrees: bool) -> ParallelRunner<'a> {
        ParallelRunner::new(
            &self.backend,
            &self.worktrees,
            launcher,
            ParallelOptions {
                run_id: "par-1".to_string(),
                artifacts_dir: self.artifacts.path().to_path_buf(),
                worker_timeout: Some(Duration::from_secs(30)),
                keep_worktrees,
            },
        )
    }
}

fn result_for<'a>(run: &'a ParallelRunResult, id: &str) -> &'a WorkerResult {
    run.results
        .iter()
        .find(|r| r.task_id == id)
        .unwrap_or_else(|| panic!("no result for {id}"))
}

#[test]
fn independent_tasks_skip_dependents() {
    let fx = Fixture::new(vec![
        task("T1", 0),
        task("T2", 1),
        task_with_deps("T3", 1, &["T2"]),
    ]);
    let launcher = FakeLauncher::succeeding();
    let picked = fx
        .runner(&launcher, false)
        .find_independent_tasks(3, None, None)
        .expect("find");
    let ids: Vec<&str> = picked.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, ["T1", "T2"]);
}

#[test]
fn all_workers_succeed_and_usage_is_summed() {
    let tasks = vec![task("t1", 0), task("t2", 0), task("t3", 0)];
    let fx = Fixture::new(tasks.clone());
    let launcher = FakeLauncher::succeeding();
    let run = fx
        .runner(&launcher, false)
        .run(&tasks, 2, &CancellationToken::new());

    assert_eq!(run.results.len(), 3);
    assert_eq!(run.succeeded, 3);
    assert_eq!(run.failed, 0);
    assert!(run.success());
    assert_eq!(run.tokens, 30);
    assert!((run.cost - 0.3).abs() < 1e-9);
    assert_eq!(launcher.launched().len(), 3);

    for spec in launcher.launched() {
        assert_eq!(spec.run_id, format!("par-1-{}", spec.task_id));
        assert!(spec.result_file.starts_with(fx.artifacts.path()));
        assert_ne!(spec.worktree, spec.repo_root);
    }
}

#[test]
fn worktrees_are_removed_after_the_run() {
    let tasks = vec![task("t1", 0), task("t2", 0)];
    let fx = Fixture::new(tasks.clone());
    let launcher = FakeLauncher::new(|spec| {
        assert!(spec.worktree.join("README.md").is_file());
        write_report(&spec.result_file, &worker_report(spec, true, 1, 0.0))?;
        Ok(WorkerExit {
            exit_code: Some(0),
            ..WorkerExit::default()
        })
    });
    let run = fx
        .runner(&launcher, false)
        .run(&tasks, 2, &CancellationToken::new());
    assert!(run.success());

    for id in ["t1", "t2"] {
        assert!(!fx.worktrees.path_for(id).exists());
    }
    let listed = fx.worktrees.list().expect("list");
    assert_eq!(listed.len(), 1, "only the main worktree remains");
}

#[test]
fn worktrees_survive_when_kept() {
    let tasks = vec![task("t1", 0)];
    let fx = Fixture::new(tasks.clone());
    let launcher = FakeLauncher::succeeding();
    let run = fx
        .runner(&launcher, true)
        .run(&tasks, 1, &CancellationToken::new());

    let kept = result_for(&run, "t1").worktree_path.clone().expect("path");
    assert!(kept.is_dir());
    let branch = fx.worktrees.branch_for("t1");
    let branches = fx.repo.git(&["branch", "--list", &branch]).expect("branches");
    assert!(branches.contains(&branch));
}

#[test]
fn failures_and_panics_still_yield_one_result_per_task() {
    let tasks = vec![task("ok", 0), task("bad", 0), task("boom", 0)];
    let fx = Fixture::new(tasks.clone());
    let launcher = FakeLauncher::new(|spec| match spec.task_id.as_str() {
        "ok" => {
            write_report(&spec.result_file, &worker_report(spec, true, 5, 0.05))?;
            Ok(WorkerExit {
                exit_code: Some(0),
                ..WorkerExit::default()
            })
        }
        "bad" => Ok(WorkerExit {
            exit_code: Some(3),
            ..WorkerExit::default()
        }),
        _ => panic!("launcher exploded"),
    });
    let run = fx
        .runner(&launcher, false)
        .run(&tasks, 3, &CancellationToken::new());

    assert_eq!(run.results.len(), 3);
    assert_eq!(run.succeeded, 1);
    assert_eq!(run.failed, 2);
    assert!(!run.success());

    let bad = result_for(&run, "bad");
    assert_eq!(bad.exit_code, Some(3));
    assert_eq!(bad.error.as_deref(), Some("worker exited with code 3"));
    assert_eq!(bad.error_kind, Some(ErrorKind::HarnessFailure));

    let boom = result_for(&run, "boom");
    assert!(!boom.success);
    assert!(
        boom.error
            .as_deref()
            .is_some_and(|e| e.contains("launcher exploded"))
    );

    assert!(result_for(&run, "ok").success);
    for id in ["ok", "bad", "boom"] {
        assert!(!fx.worktrees.path_for(id).exists());
    }
}

#[test]
fn failed_report_is_not_success_even_on_clean_exit() {
    let tasks = vec![task("t1", 0)];
    let fx = Fixture::new(tasks.clone());
    let launcher = FakeLauncher::new(|spec| {
        write_report(&spec.result_file, &worker_report(spec, false, 7, 0.0))?;
        Ok(WorkerExit {
            exit_code: Some(0),
            ..WorkerExit::default()
        })
    });
    let run = fx
        .runner(&launcher, false)
        .run(&tasks, 1, &CancellationToken::new());

    let result = result_for(&run, "t1");
    assert!(!result.success);
    assert_eq!(result.tokens, 7);
    assert_eq!(result.error.as_deref(), Some("scripted failure"));
}

#[test]
fn pre_cancelled_run_reports_every_task() {
    let tasks = vec![task("t1", 0), task("t2", 0)];
    let fx = Fixture::new(tasks.clone());
    let launcher = FakeLauncher::succeeding();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let run = fx.runner(&launcher, false).run(&tasks, 2, &cancel);

    assert!(run.cancelled);
    assert!(launcher.launched().is_empty());
    assert_eq!(run.results.len(), 2);
    assert!(run.results.iter().all(|r| !r.success));
    assert!(
        run.results
            .iter()
            .all(|r| r.error.as_deref() == Some("cancelled before start"))
    );
}

#[test]
fn killed_worker_leaves_its_task_reopened() {
    let mut claimed = task("t1", 0);
    claimed.status = TaskStatus::InProgress;
    let tasks = vec![claimed, task("t2", 0)];
    let fx = Fixture::new(tasks.clone());
    let launcher = FakeLauncher::new(|spec| {
        if spec.task_id == "t1" {
            return Ok(WorkerExit {
                exit_code: None,
                timed_out: true,
                cancelled: false,
            });
        }
        write_report(&spec.result_file, &worker_report(spec, true, 1, 0.0))?;
        Ok(WorkerExit {
            exit_code: Some(0),
            ..WorkerExit::default()
        })
    });
    let run = fx
        .runner(&launcher, false)
        .run(&tasks, 2, &CancellationToken::new());

    let timed_out = result_for(&run, "t1");
    assert_eq!(timed_out.error_kind, Some(ErrorKind::CircuitBreakerTimeout));
    assert_eq!(fx.backend.status_of("t1"), Some(TaskStatus::Open));
    assert!(result_for(&run, "t2").success);
}

#[test]
fn existing_worktree_is_reused_and_kept() {
    let tasks = vec![task("t1", 0)];
    let fx = Fixture::new(tasks.clone());
    let branch = fx.worktrees.branch_for("t1");
    let existing = fx
        .worktrees
        .create("t1", Some(&branch), true)
        .expect("pre-existing worktree");
    std::fs::write(existing.path.join("notes.txt"), "in progress\n").expect("write");

    let launcher = FakeLauncher::succeeding();
    let run = fx
        .runner(&launcher, false)
        .run(&tasks, 1, &CancellationToken::new());

    assert!(run.success());
    let used = std::fs::canonicalize(&launcher.launched()[0].worktree).expect("used path");
    assert_eq!(used, std::fs::canonicalize(&existing.path).expect("existing path"));
    assert!(existing.path.join("notes.txt").is_file());
    assert_eq!(fx.worktrees.list().expect("list").len(), 2);
}

/// Whether `pid` still names a live (or unreaped) process.
#[cfg(unix)]
fn process_exists(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

#[cfg(unix)]
#[test]
fn timed_out_worker_process_stops_its_agent() {
    let repo = TestRepo::new().expect("repo");
    let root = repo.path();
    let scratch = tempfile::tempdir().expect("scratch");
    let pid_file = scratch.path().join("agent.pid");

    let mut config = RunnerConfig {
        harness: "shell".to_string(),
        ..RunnerConfig::default()
    };
    config.harnesses.insert(
        "shell".to_string(),
        HarnessConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!(
                    "cat > /dev/null; echo $$ > {}; exec sleep 30",
                    pid_file.display()
                ),
            ],
            ..HarnessConfig::default()
        },
    );
    write_config(&config_path(root), &config).expect("config");
    let backend = JsonTaskBackend::new(runner_dir(root).join(TASKS_FILE));
    let tasks = vec![task("t1", 0)];
    backend.write_tasks(&tasks).expect("tasks");

    let worktrees = WorktreeManager::new(root, ".worktrees", "runner/").expect("manager");
    let artifacts = tempfile::tempdir().expect("artifacts");
    let launcher = ProcessLauncher::new(env!("CARGO_BIN_EXE_runner"), 64 * 1024)
        .with_stop_grace(Duration::from_secs(20));
    let runner = ParallelRunner::new(
        &backend,
        &worktrees,
        &launcher,
        ParallelOptions {
            run_id: "par-kill".to_string(),
            artifacts_dir: artifacts.path().to_path_buf(),
            worker_timeout: Some(Duration::from_secs(3)),
            keep_worktrees: false,
        },
    );

    let started = std::time::Instant::now();
    let run = runner.run(&tasks, 1, &CancellationToken::new());
    let elapsed = started.elapsed();

    let result = result_for(&run, "t1");
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::CircuitBreakerTimeout));
    // The worker shut down on SIGTERM rather than waiting out the grace period.
    assert!(elapsed < Duration::from_secs(15), "took {elapsed:?}");

    let pid: i32 = std::fs::read_to_string(&pid_file)
        .expect("agent started")
        .trim()
        .parse()
        .expect("pid");
    assert!(!process_exists(pid), "agent {pid} outlived its worker");

    let stored = backend.get_task("t1").expect("get").expect("task");
    assert_eq!(stored.status, TaskStatus::Open);
}
