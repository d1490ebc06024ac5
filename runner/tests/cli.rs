//! End-to-end tests of the `runner` binary with a shell-based agent.

use std::path::Path;
use std::process::{Command, Output};

use agent_runner::core::types::TaskStatus;
use agent_runner::exit_codes;
use agent_runner::io::backend::{JsonTaskBackend, TASKS_FILE, TaskBackend};
use agent_runner::io::config::{HarnessConfig, config_path, load_config, runner_dir, write_config};
use agent_runner::test_support::{TestRepo, task};

fn runner(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_runner"))
        .arg("--root")
        .arg(root)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("spawn runner")
}

fn code(output: &Output) -> i32 {
    output.status.code().expect("exit code")
}

/// Initialize `root` and point it at an agent that swallows its prompt and exits 0.
fn init_with_shell_agent(root: &Path) {
    let output = runner(root, &["init"]);
    assert_eq!(code(&output), exit_codes::OK, "{output:?}");

    let path = config_path(root);
    let mut config = load_config(&path).expect("load config");
    config.harness = "shell".to_string();
    config.harnesses.insert(
        "shell".to_string(),
        HarnessConfig {
            command: ["sh", "-c", "cat > /dev/null"].map(str::to_string).to_vec(),
            ..HarnessConfig::default()
        },
    );
    write_config(&path, &config).expect("write config");
}

fn backend(root: &Path) -> JsonTaskBackend {
    JsonTaskBackend::new(runner_dir(root).join(TASKS_FILE))
}

#[test]
fn init_writes_config_and_task_store() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = runner(temp.path(), &["init"]);
    assert_eq!(code(&output), exit_codes::OK);
    assert!(config_path(temp.path()).is_file());
    assert!(backend(temp.path()).path().is_file());

    let config = load_config(&config_path(temp.path())).expect("load");
    assert_eq!(config.harness, "claude");
}

#[test]
fn run_completes_ready_tasks() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_with_shell_agent(temp.path());
    backend(temp.path())
        .write_tasks(&[task("t1", 0), task("t2", 1)])
        .expect("tasks");

    let output = runner(temp.path(), &["run"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(code(&output), exit_codes::OK, "{stdout}");
    assert!(stdout.contains("TASK_COMPLETED"));
    assert!(stdout.contains("completed=2"));

    let store = backend(temp.path());
    for id in ["t1", "t2"] {
        let task = store.get_task(id).expect("get").expect("task");
        assert_eq!(task.status, TaskStatus::Closed);
    }
    assert!(runner_dir(temp.path()).join("ledger.jsonl").is_file());
}

#[test]
fn run_with_unknown_task_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_with_shell_agent(temp.path());

    let output = runner(temp.path(), &["run", "--task", "missing"]);
    assert_eq!(code(&output), exit_codes::INVALID);
}

#[test]
fn run_with_failing_agent_reports_task_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_with_shell_agent(temp.path());
    let path = config_path(temp.path());
    let mut config = load_config(&path).expect("load");
    config.harnesses.insert(
        "shell".to_string(),
        HarnessConfig {
            command: ["sh", "-c", "cat > /dev/null; echo broken >&2; exit 3"]
                .map(str::to_string)
                .to_vec(),
            ..HarnessConfig::default()
        },
    );
    write_config(&path, &config).expect("write");
    backend(temp.path())
        .write_tasks(&[task("t1", 0)])
        .expect("tasks");

    let output = runner(temp.path(), &["run", "--once"]);
    assert_eq!(code(&output), exit_codes::TASK_FAILED);
    let task = backend(temp.path())
        .get_task("t1")
        .expect("get")
        .expect("task");
    assert_eq!(task.status, TaskStatus::Open);
}

#[test]
fn unknown_harness_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_with_shell_agent(temp.path());
    backend(temp.path())
        .write_tasks(&[task("t1", 0)])
        .expect("tasks");

    let output = runner(temp.path(), &["run", "--harness", "nope"]);
    assert_eq!(code(&output), exit_codes::INVALID);
    assert!(String::from_utf8_lossy(&output.stdout).contains("RUN_FAILED"));
}

#[test]
fn parallel_runs_worker_in_a_worktree() {
    let repo = TestRepo::new().expect("repo");
    init_with_shell_agent(repo.path());
    backend(repo.path())
        .write_tasks(&[task("t1", 0)])
        .expect("tasks");

    let output = runner(repo.path(), &["parallel", "--workers", "1"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(code(&output), exit_codes::OK, "{stdout}");

    let task = backend(repo.path())
        .get_task("t1")
        .expect("get")
        .expect("task");
    assert_eq!(task.status, TaskStatus::Closed);
    assert!(!repo.path().join(".worktrees").join("t1").exists());
}

#[test]
fn parallel_without_ready_tasks_is_ok() {
    let repo = TestRepo::new().expect("repo");
    init_with_shell_agent(repo.path());

    let output = runner(repo.path(), &["parallel"]);
    assert_eq!(code(&output), exit_codes::OK);
}
