//! Lifecycle hook runner.
//!
//! Hooks are user commands configured in `[hooks]`. Each receives the run
//! context as `RUNNER_*` environment variables and as JSON on stdin.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::config::HooksConfig;
use super::process::run_command_with_timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookName {
    PreLoop,
    PreTask,
    PostTask,
    OnError,
    PostLoop,
}

impl HookName {
    pub fn as_str(self) -> &'static str {
        match self {
            HookName::PreLoop => "pre_loop",
            HookName::PreTask => "pre_task",
            HookName::PostTask => "post_task",
            HookName::OnError => "on_error",
            HookName::PostLoop => "post_loop",
        }
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a hook is told about the moment it fires.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HookContext {
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HookContext {
    pub fn for_run(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Self::default()
        }
    }
}

pub trait HookRunner: Send + Sync {
    /// Run `hook` to completion; `true` means success (or nothing to run).
    fn run(&self, hook: HookName, ctx: &HookContext) -> bool;

    /// Start `hook` without waiting on its result.
    fn fire_and_forget(&self, hook: HookName, ctx: &HookContext) {
        if !self.run(hook, ctx) {
            warn!(hook = %hook, "hook failed");
        }
    }
}

/// Runs configured hook commands as subprocesses.
#[derive(Debug, Clone)]
pub struct CommandHookRunner {
    config: HooksConfig,
    workdir: PathBuf,
    output_limit_bytes: usize,
    /// When set, each hook's output is written to `<log_dir>/<hook>.log`.
    log_dir: Option<PathBuf>,
}

impl CommandHookRunner {
    pub fn new(config: HooksConfig, workdir: impl Into<PathBuf>, output_limit_bytes: usize) -> Self {
        Self {
            config,
            workdir: workdir.into(),
            output_limit_bytes,
            log_dir: None,
        }
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    fn command_for(&self, hook: HookName) -> &[String] {
        match hook {
            HookName::PreLoop => &self.config.pre_loop,
            HookName::PreTask => &self.config.pre_task,
            HookName::PostTask => &self.config.post_task,
            HookName::OnError => &self.config.on_error,
            HookName::PostLoop => &self.config.post_loop,
        }
    }

    fn execute(&self, hook: HookName, ctx: &HookContext) -> Result<bool> {
        let Some((program, args)) = self.command_for(hook).split_first() else {
            debug!(hook = %hook, "no command configured");
            return Ok(true);
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("RUNNER_HOOK", hook.as_str())
            .env("RUNNER_RUN_ID", &ctx.run_id);
        if let Some(task_id) = &ctx.task_id {
            cmd.env("RUNNER_TASK_ID", task_id);
        }
        if let Some(title) = &ctx.task_title {
            cmd.env("RUNNER_TASK_TITLE", title);
        }
        if let Some(attempt) = ctx.attempt {
            cmd.env("RUNNER_ATTEMPT", attempt.to_string());
        }
        if let Some(error) = &ctx.error {
            cmd.env("RUNNER_ERROR", error);
        }

        let payload = serde_json::to_vec(ctx).context("serialize hook context")?;
        let output = run_command_with_timeout(
            cmd,
            Some(&payload),
            Duration::from_secs(self.config.timeout_secs),
            self.output_limit_bytes,
        )
        .with_context(|| format!("run {hook} hook"))?;

        if let Some(dir) = &self.log_dir {
            fs::create_dir_all(dir).with_context(|| format!("create hook log dir {}", dir.display()))?;
            let path = dir.join(format!("{hook}.log"));
            fs::write(&path, output.render_log(hook.as_str()))
                .with_context(|| format!("write hook log {}", path.display()))?;
        }

        let ok = output.status.success() && !output.timed_out;
        if !ok {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                hook = %hook,
                exit_code = ?output.status.code(),
                timed_out = output.timed_out,
                stderr = %stderr.trim(),
                "hook command failed"
            );
        }
        Ok(ok)
    }
}

impl HookRunner for CommandHookRunner {
    fn run(&self, hook: HookName, ctx: &HookContext) -> bool {
        info!(hook = %hook, task_id = ?ctx.task_id, "running hook");
        match self.execute(hook, ctx) {
            Ok(ok) => ok,
            Err(err) => {
                warn!(hook = %hook, err = %format!("{err:#}"), "hook could not run");
                false
            }
        }
    }

    fn fire_and_forget(&self, hook: HookName, ctx: &HookContext) {
        if self.command_for(hook).is_empty() {
            return;
        }
        let runner = self.clone();
        let ctx = ctx.clone();
        let spawned = thread::Builder::new()
            .name(format!("hook-{hook}"))
            .spawn(move || {
                if !runner.run(hook, &ctx) {
                    warn!(hook = %hook, "background hook failed");
                }
            });
        if let Err(err) = spawned {
            warn!(hook = %hook, err = %err, "failed to start background hook");
        }
    }
}

/// Hook runner used when hooks are disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl HookRunner for NoopHooks {
    fn run(&self, _hook: HookName, _ctx: &HookContext) -> bool {
        true
    }

    fn fire_and_forget(&self, _hook: HookName, _ctx: &HookContext) {}
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn runner(dir: &std::path::Path, config: HooksConfig) -> CommandHookRunner {
        CommandHookRunner::new(config, dir, 10_000).with_log_dir(dir.join("logs"))
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn unconfigured_hook_succeeds() {
        let temp = tempfile::tempdir().expect("tempdir");
        let hooks = runner(temp.path(), HooksConfig::default());
        assert!(hooks.run(HookName::PreTask, &HookContext::for_run("run-1")));
    }

    #[test]
    fn hook_sees_env_and_stdin_context() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = HooksConfig {
            pre_task: sh(r#"cat > ctx.json; printf '%s %s %s' "$RUNNER_HOOK" "$RUNNER_TASK_ID" "$RUNNER_ATTEMPT" > env.txt"#),
            ..HooksConfig::default()
        };
        let hooks = runner(temp.path(), config);
        let ctx = HookContext {
            task_id: Some("t-1".to_string()),
            attempt: Some(2),
            ..HookContext::for_run("run-1")
        };
        assert!(hooks.run(HookName::PreTask, &ctx));

        let env = fs::read_to_string(temp.path().join("env.txt")).expect("env");
        assert_eq!(env, "pre_task t-1 2");
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(temp.path().join("ctx.json")).expect("ctx"))
                .expect("json");
        assert_eq!(json["run_id"], "run-1");
        assert_eq!(json["attempt"], 2);
        assert!(temp.path().join("logs").join("pre_task.log").is_file());
    }

    #[test]
    fn failing_or_slow_hook_reports_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = HooksConfig {
            on_error: sh("exit 1"),
            post_loop: sh("sleep 30"),
            timeout_secs: 1,
            ..HooksConfig::default()
        };
        let hooks = runner(temp.path(), config);
        assert!(!hooks.run(HookName::OnError, &HookContext::for_run("run-1")));
        assert!(!hooks.run(HookName::PostLoop, &HookContext::for_run("run-1")));
    }
}
