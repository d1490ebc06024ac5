//! Harness abstraction for external agent invocation.
//!
//! The [`Harness`] trait decouples the run loop from the concrete agent binary.
//! Tests use scripted harnesses that return predetermined outcomes without
//! spawning processes; the binary uses [`CommandHarness`].

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::breaker::ProcessSlot;
use super::config::HarnessConfig;
use super::process::run_command_streaming;
use crate::core::types::Usage;

/// What a harness can do beyond a plain blocking invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Output is delivered line by line while the agent runs.
    pub streaming: bool,
}

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct HarnessRequest {
    pub system_prompt: String,
    pub task_prompt: String,
    pub model: Option<String>,
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// `<run_id>-<task_id>-<attempt>`.
    pub attempt_id: String,
    /// Where the spawned process group is published for the circuit breaker.
    pub slot: ProcessSlot,
}

/// Result of one invocation. `success == false` is a normal outcome, not an `Err`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HarnessOutcome {
    pub success: bool,
    pub usage: Usage,
    pub duration: Duration,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    /// Bounded stdout/stderr log of the invocation.
    pub output: String,
}

pub trait Harness: Send + Sync {
    fn name(&self) -> &str;

    /// True when the backing agent can be started at all.
    fn is_available(&self) -> bool;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Run the agent to completion. `Err` means it could not be started.
    fn invoke(&self, request: &HarnessRequest) -> Result<HarnessOutcome>;

    /// Run the agent, forwarding output lines as they arrive.
    fn invoke_streaming(
        &self,
        request: &HarnessRequest,
        _on_line: &mut (dyn FnMut(&str) + Send),
    ) -> Result<HarnessOutcome> {
        self.invoke(request)
    }
}

/// Harness that spawns a configured agent CLI.
///
/// The task prompt is written to stdin; model and system prompt are passed via
/// the configured flags (the system prompt is prepended to stdin when no flag
/// is configured). Usage is read from JSON result lines on stdout.
#[derive(Debug, Clone)]
pub struct CommandHarness {
    name: String,
    config: HarnessConfig,
    output_limit_bytes: usize,
}

impl CommandHarness {
    pub fn new(name: impl Into<String>, config: HarnessConfig, output_limit_bytes: usize) -> Self {
        Self {
            name: name.into(),
            config,
            output_limit_bytes,
        }
    }

    fn build_command(&self, request: &HarnessRequest) -> Result<(Command, String)> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("harness '{}' has an empty command", self.name))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        cmd.env("RUNNER_ATTEMPT_ID", &request.attempt_id);

        if let (Some(flag), Some(model)) = (&self.config.model_arg, &request.model) {
            cmd.arg(flag).arg(model);
        }

        let system = request.system_prompt.trim();
        let stdin = match &self.config.system_prompt_arg {
            Some(flag) if !system.is_empty() => {
                cmd.arg(flag).arg(system);
                request.task_prompt.clone()
            }
            _ if !system.is_empty() => format!("{system}\n\n{}", request.task_prompt),
            _ => request.task_prompt.clone(),
        };
        Ok((cmd, stdin))
    }
}

impl Harness for CommandHarness {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        match self.config.command.first() {
            Some(program) => program_on_path(program),
            None => false,
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: self.config.stream_json,
        }
    }

    fn invoke(&self, request: &HarnessRequest) -> Result<HarnessOutcome> {
        self.invoke_streaming(request, &mut |_| {})
    }

    #[instrument(skip_all, fields(harness = %self.name, attempt_id = %request.attempt_id, model = ?request.model))]
    fn invoke_streaming(
        &self,
        request: &HarnessRequest,
        on_line: &mut (dyn FnMut(&str) + Send),
    ) -> Result<HarnessOutcome> {
        let (cmd, stdin) = self.build_command(request)?;
        info!(workdir = %request.workdir.display(), "starting agent");

        let started = Instant::now();
        let mut scan = UsageScan::default();
        let output = run_command_streaming(
            cmd,
            Some(stdin.as_bytes()),
            self.output_limit_bytes,
            &request.slot,
            &mut |line| {
                scan.observe(line);
                on_line(line);
            },
        )
        .with_context(|| format!("run harness '{}'", self.name))?;
        let duration = started.elapsed();

        let exit_code = output.status.code();
        let success = output.status.success() && !output.timed_out;
        let error = if success {
            None
        } else if output.timed_out {
            Some("agent terminated by circuit breaker".to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = stderr.trim().lines().last().unwrap_or_default().to_string();
            warn!(exit_code = ?exit_code, "agent exited unsuccessfully");
            Some(format!("agent exited with status {exit_code:?}: {tail}"))
        };

        debug!(success, tokens = scan.usage().tokens, "agent finished");
        Ok(HarnessOutcome {
            success,
            usage: scan.usage(),
            duration,
            exit_code,
            error,
            output: output.render_log(&self.name),
        })
    }
}

/// Tracks the most authoritative usage report seen on stdout.
///
/// A `{"type":"result"}` line carries run totals and wins over any
/// intermediate per-message report.
#[derive(Debug, Default)]
struct UsageScan {
    usage: Option<Usage>,
    final_seen: bool,
}

impl UsageScan {
    fn observe(&mut self, line: &str) {
        let Some((usage, is_final)) = parse_usage_line(line) else {
            return;
        };
        if is_final || !self.final_seen {
            self.usage = Some(usage);
            self.final_seen |= is_final;
        }
    }

    fn usage(&self) -> Usage {
        self.usage.unwrap_or_default()
    }
}

/// Extract usage from one JSON output line.
///
/// Tokens are `usage.input_tokens + usage.output_tokens` (or `usage.total_tokens`);
/// cost is `total_cost_usd` or `cost_usd`. Returns the usage and whether the
/// line is a final result record.
pub fn parse_usage_line(line: &str) -> Option<(Usage, bool)> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(line).ok()?;
    let usage = value.get("usage");
    let tokens = usage.and_then(|u| {
        let input = u.get("input_tokens").and_then(Value::as_u64);
        let output = u.get("output_tokens").and_then(Value::as_u64);
        match (input, output) {
            (None, None) => u.get("total_tokens").and_then(Value::as_u64),
            (i, o) => Some(i.unwrap_or(0).saturating_add(o.unwrap_or(0))),
        }
    });
    let cost = value
        .get("total_cost_usd")
        .or_else(|| value.get("cost_usd"))
        .and_then(Value::as_f64);
    if tokens.is_none() && cost.is_none() {
        return None;
    }
    let is_final = value.get("type").and_then(Value::as_str) == Some("result");
    Some((Usage::new(tokens.unwrap_or(0), cost.unwrap_or(0.0)), is_final))
}

fn program_on_path(program: &str) -> bool {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file();
    }
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}
