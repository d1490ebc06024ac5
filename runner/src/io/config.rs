//! Runner configuration stored under `.runner/config.toml`, and the immutable
//! per-run snapshot derived from it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::budget::BudgetLimits;

pub const RUNNER_DIR: &str = ".runner";
pub const CONFIG_FILE: &str = "config.toml";

/// `.runner/` under the repository root.
pub fn runner_dir(root: &Path) -> PathBuf {
    root.join(RUNNER_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    runner_dir(root).join(CONFIG_FILE)
}

/// Runner configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values in the `Default` impls below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Key into `harnesses`.
    pub harness: String,
    /// Default model when neither the task nor the escalation ladder names one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Model used for attempt n is `escalation[n-1]`, clamped to the last rung.
    pub escalation: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    pub max_attempts_per_task: u32,
    /// Pause between iterations.
    pub iteration_delay_ms: u64,
    pub stop_on_failure: bool,
    /// Upper bound for the rendered task prompt.
    pub prompt_budget_bytes: usize,
    /// Truncate captured agent/hook/worker output beyond this many bytes.
    pub output_limit_bytes: usize,

    pub budget: BudgetConfig,
    pub breaker: BreakerConfig,
    pub hooks: HooksConfig,
    pub ledger: LedgerConfig,
    pub sync: SyncConfig,
    pub worktree: WorktreeConfig,
    pub parallel: ParallelConfig,
    pub harnesses: BTreeMap<String, HarnessConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BudgetConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tasks: Option<u32>,
    /// Fraction (0, 1] at which a single budget warning is emitted.
    pub warning_threshold: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens: None,
            max_cost: None,
            max_tasks: None,
            warning_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BreakerConfig {
    pub enabled: bool,
    /// Per-attempt wall-clock limit.
    pub timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 30 * 60,
        }
    }
}

/// Lifecycle hook commands. An empty array disables that hook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HooksConfig {
    pub enabled: bool,
    /// Treat `pre_loop`/`pre_task` failures as fatal.
    pub fail_fast: bool,
    pub timeout_secs: u64,
    pub pre_loop: Vec<String>,
    pub pre_task: Vec<String>,
    pub post_task: Vec<String>,
    pub on_error: Vec<String>,
    pub post_loop: Vec<String>,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_fast: false,
            timeout_secs: 5 * 60,
            pre_loop: Vec::new(),
            pre_task: Vec::new(),
            post_task: Vec::new(),
            on_error: Vec::new(),
            post_loop: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    pub enabled: bool,
    /// Relative paths resolve against the repository root.
    pub path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from(".runner/ledger.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorktreeConfig {
    pub base_dir: PathBuf,
    pub branch_prefix: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(super::worktree::DEFAULT_BASE_DIR),
            branch_prefix: super::worktree::DEFAULT_BRANCH_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ParallelConfig {
    pub max_workers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_timeout_secs: Option<u64>,
    /// Seconds a stopped worker gets to shut down before it is killed.
    pub worker_stop_grace_secs: u64,
    pub keep_worktrees: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            worker_timeout_secs: None,
            worker_stop_grace_secs: crate::parallel::WORKER_STOP_GRACE.as_secs(),
            keep_worktrees: false,
        }
    }
}

/// How to start one agent CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Program and leading arguments (e.g. `["claude","-p"]`).
    pub command: Vec<String>,
    /// Flag that precedes the model name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_arg: Option<String>,
    /// Flag that precedes the system prompt; when unset it is prepended to stdin.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt_arg: Option<String>,
    /// The agent emits one JSON object per line.
    pub stream_json: bool,
}

fn default_harnesses() -> BTreeMap<String, HarnessConfig> {
    let mut harnesses = BTreeMap::new();
    harnesses.insert(
        "claude".to_string(),
        HarnessConfig {
            command: ["claude", "-p", "--output-format", "stream-json", "--verbose"]
                .map(str::to_string)
                .to_vec(),
            model_arg: Some("--model".to_string()),
            system_prompt_arg: Some("--append-system-prompt".to_string()),
            stream_json: true,
        },
    );
    harnesses.insert(
        "codex".to_string(),
        HarnessConfig {
            command: ["codex", "exec", "--json", "-"].map(str::to_string).to_vec(),
            model_arg: Some("--model".to_string()),
            system_prompt_arg: None,
            stream_json: true,
        },
    );
    harnesses
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            harness: "claude".to_string(),
            model: None,
            escalation: Vec::new(),
            max_iterations: None,
            max_attempts_per_task: 3,
            iteration_delay_ms: 0,
            stop_on_failure: false,
            prompt_budget_bytes: 60_000,
            output_limit_bytes: 100_000,
            budget: BudgetConfig::default(),
            breaker: BreakerConfig::default(),
            hooks: HooksConfig::default(),
            ledger: LedgerConfig::default(),
            sync: SyncConfig::default(),
            worktree: WorktreeConfig::default(),
            parallel: ParallelConfig::default(),
            harnesses: default_harnesses(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.harness.trim().is_empty() {
            return Err(anyhow!("harness must be non-empty"));
        }
        if self.max_attempts_per_task == 0 {
            return Err(anyhow!("max_attempts_per_task must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        let threshold = self.budget.warning_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(anyhow!("budget.warning_threshold must be in (0, 1]"));
        }
        if self
            .budget
            .max_cost
            .is_some_and(|cost| !(cost.is_finite() && cost >= 0.0))
        {
            return Err(anyhow!("budget.max_cost must be a non-negative number"));
        }
        if self.breaker.enabled && self.breaker.timeout_secs == 0 {
            return Err(anyhow!("breaker.timeout_secs must be > 0 when enabled"));
        }
        if self.hooks.timeout_secs == 0 {
            return Err(anyhow!("hooks.timeout_secs must be > 0"));
        }
        if self.parallel.max_workers == 0 {
            return Err(anyhow!("parallel.max_workers must be > 0"));
        }
        if self.worktree.base_dir.as_os_str().is_empty() {
            return Err(anyhow!("worktree.base_dir must be non-empty"));
        }
        for (name, harness) in &self.harnesses {
            if harness.command.is_empty() || harness.command[0].trim().is_empty() {
                return Err(anyhow!("harnesses.{name}.command must be a non-empty array"));
            }
        }
        Ok(())
    }

    pub fn harness_config(&self, name: &str) -> Option<&HarnessConfig> {
        self.harnesses.get(name)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

/// Per-invocation overrides (CLI flags). `None`/`false` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub run_id: Option<String>,
    pub task_id: Option<String>,
    pub once: bool,
    pub max_iterations: Option<u32>,
    pub epic: Option<String>,
    pub label: Option<String>,
    pub harness: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u64>,
    pub max_cost: Option<f64>,
    pub max_tasks: Option<u32>,
    pub no_hooks: bool,
    pub no_ledger: bool,
    pub sync: bool,
    pub stop_on_failure: bool,
}

/// Immutable settings for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub run_id: String,
    pub harness: String,
    pub model: Option<String>,
    pub escalation: Vec<String>,
    pub budget: BudgetLimits,
    pub budget_warning_threshold: f64,
    /// `None` runs until another stop condition fires.
    pub max_iterations: Option<u32>,
    pub max_attempts_per_task: u32,
    /// Run exactly this task.
    pub task_id: Option<String>,
    /// Stop after the first task attempt.
    pub single_task: bool,
    pub epic: Option<String>,
    pub label: Option<String>,
    pub hooks_enabled: bool,
    pub fail_fast_hooks: bool,
    pub ledger_enabled: bool,
    pub sync_enabled: bool,
    pub stop_on_failure: bool,
    /// `None` disables the circuit breaker.
    pub breaker_timeout: Option<Duration>,
    pub iteration_delay: Duration,
    pub prompt_budget_bytes: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::from_config(&RunnerConfig::default(), RunOverrides::default())
    }
}

impl RunConfig {
    /// Merge file config and CLI overrides into a run snapshot.
    pub fn from_config(cfg: &RunnerConfig, overrides: RunOverrides) -> Self {
        let single_task = overrides.once || overrides.task_id.is_some();
        Self {
            run_id: overrides.run_id.unwrap_or_else(new_run_id),
            harness: overrides.harness.unwrap_or_else(|| cfg.harness.clone()),
            model: overrides.model.or_else(|| cfg.model.clone()),
            escalation: cfg.escalation.clone(),
            budget: BudgetLimits {
                max_tokens: overrides.max_tokens.or(cfg.budget.max_tokens),
                max_cost: overrides.max_cost.or(cfg.budget.max_cost),
                max_tasks: overrides.max_tasks.or(cfg.budget.max_tasks),
            },
            budget_warning_threshold: cfg.budget.warning_threshold,
            max_iterations: overrides.max_iterations.or(cfg.max_iterations),
            max_attempts_per_task: cfg.max_attempts_per_task,
            task_id: overrides.task_id,
            single_task,
            epic: overrides.epic,
            label: overrides.label,
            hooks_enabled: cfg.hooks.enabled && !overrides.no_hooks,
            fail_fast_hooks: cfg.hooks.fail_fast,
            ledger_enabled: cfg.ledger.enabled && !overrides.no_ledger,
            sync_enabled: cfg.sync.enabled || overrides.sync,
            stop_on_failure: cfg.stop_on_failure || overrides.stop_on_failure,
            breaker_timeout: cfg
                .breaker
                .enabled
                .then(|| Duration::from_secs(cfg.breaker.timeout_secs)),
            iteration_delay: Duration::from_millis(cfg.iteration_delay_ms),
            prompt_budget_bytes: cfg.prompt_budget_bytes,
        }
    }
}

/// Fresh run identifier, unique per process start.
pub fn new_run_id() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("run-{secs:x}-{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RunnerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = config_path(temp.path());
        let mut cfg = RunnerConfig::default();
        cfg.escalation = vec!["sonnet".to_string(), "opus".to_string()];
        cfg.budget.max_cost = Some(2.5);
        cfg.hooks.pre_task = vec!["just".to_string(), "lint".to_string()];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "harness = \"codex\"\n[budget]\nmax_tasks = 5\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.harness, "codex");
        assert_eq!(cfg.budget.max_tasks, Some(5));
        assert_eq!(cfg.max_attempts_per_task, 3);
        assert!(cfg.harness_config("claude").is_some());
    }

    #[test]
    fn rejects_invalid_threshold() {
        let mut cfg = RunnerConfig::default();
        cfg.budget.warning_threshold = 1.5;
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("warning_threshold"));
    }

    #[test]
    fn overrides_win_over_file_values() {
        let mut cfg = RunnerConfig::default();
        cfg.budget.max_tokens = Some(1_000);
        cfg.breaker.enabled = false;
        let run = RunConfig::from_config(
            &cfg,
            RunOverrides {
                run_id: Some("run-x".to_string()),
                task_id: Some("t-1".to_string()),
                max_tokens: Some(50),
                no_hooks: true,
                ..RunOverrides::default()
            },
        );
        assert_eq!(run.run_id, "run-x");
        assert_eq!(run.budget.max_tokens, Some(50));
        assert!(run.single_task);
        assert!(!run.hooks_enabled);
        assert_eq!(run.breaker_timeout, None);
    }
}
