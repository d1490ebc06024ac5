//! Shared deterministic types for the execution engine.
//!
//! These types define stable contracts between the run loop, the parallel
//! runner and the collaborator adapters. They carry no I/O and serialize to a
//! stable JSON shape (snake_case tags) so persisted artifacts stay diffable.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task as reported by the task backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Closed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Closed => "closed",
        }
    }
}

/// A unit of work in the task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Lower is more urgent (P0 before P1).
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default = "default_task_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Ids this task depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Ids currently blocking this task.
    #[serde(default)]
    pub blocked_by: Vec<String>,
    /// Owning epic, if any.
    #[serde(default)]
    pub parent: Option<String>,
    /// Explicit model requested for this task; overrides run defaults.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
}

fn default_task_type() -> String {
    "task".to_string()
}

fn default_task_status() -> TaskStatus {
    TaskStatus::Open
}

impl Task {
    pub fn is_closed(&self) -> bool {
        self.status == TaskStatus::Closed
    }

    /// True if this task names `other` as a dependency or blocker.
    pub fn references(&self, other: &str) -> bool {
        self.dependencies.iter().any(|id| id == other)
            || self.blocked_by.iter().any(|id| id == other)
    }
}

/// Aggregate task counts from the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: u32,
    pub open: u32,
    pub in_progress: u32,
    pub closed: u32,
    /// Open plus in-progress.
    pub remaining: u32,
}

/// Resource consumption reported by one harness invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub tokens: u64,
    pub cost: f64,
}

impl Usage {
    pub fn new(tokens: u64, cost: f64) -> Self {
        Self { tokens, cost }
    }
}

/// Error taxonomy shared by the run loop, ledger records and worker results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad configuration or request (fatal before or during selection).
    Validation,
    /// The external agent errored or exited non-zero.
    HarnessFailure,
    /// The attempt exceeded its deadline and was terminated.
    CircuitBreakerTimeout,
    /// A lifecycle hook reported failure.
    HookFailure,
    /// Worktree creation or removal failed.
    WorktreeError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::HarnessFailure => "harness_failure",
            ErrorKind::CircuitBreakerTimeout => "circuit_breaker_timeout",
            ErrorKind::HookFailure => "hook_failure",
            ErrorKind::WorktreeError => "worktree_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified engine error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RunError {}
