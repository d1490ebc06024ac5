//! Run events and the terminal run result.
//!
//! A run loop produces an ordered, append-only sequence of [`RunEvent`]s.
//! Each event carries the loop's cumulative counters at emission time so a
//! consumer can render progress without tracking state itself.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::budget::Resource;
use super::types::{ErrorKind, RunError, Usage};

/// Run loop lifecycle phase. Terminal phases are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Initializing,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunPhase::Completed | RunPhase::Failed | RunPhase::Stopped
        )
    }
}

/// Why a run loop stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// No ready tasks and nothing left to do.
    NoTasksRemaining,
    /// Tasks remain but none are ready (unmet dependencies or exhausted attempts).
    Blocked { remaining: u32 },
    /// The explicitly requested task is already closed.
    TaskAlreadyClosed { task_id: String },
    BudgetExhausted { resource: Resource },
    MaxIterationsReached { max_iterations: u32 },
    /// Single-task mode finished its one task.
    SingleTaskDone,
    Interrupted,
    /// A task failed and `stop_on_failure` is set.
    TaskFailed { task_id: String },
    /// A fatal run-level error ended the loop.
    Fatal { error: RunError },
}

/// Cumulative counters attached to every event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Counters {
    pub iteration: u32,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub tokens: u64,
    pub cost: f64,
}

/// One state transition of the run loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEventKind {
    RunStarted {
        run_id: String,
    },
    RunStopped {
        phase: RunPhase,
        reason: StopReason,
    },
    RunFailed {
        error: RunError,
    },
    IterationStarted {
        iteration: u32,
    },
    TaskSelected {
        task_id: String,
        title: String,
    },
    TaskStarted {
        task_id: String,
        attempt: u32,
        model: Option<String>,
    },
    TaskCompleted {
        task_id: String,
        usage: Usage,
        duration_ms: u64,
        escalated: bool,
    },
    TaskFailed {
        task_id: String,
        kind: ErrorKind,
        message: String,
    },
    BudgetUpdated {
        tokens: u64,
        cost: f64,
    },
    BudgetWarning {
        resource: Resource,
        utilization: f64,
    },
    BudgetExhausted {
        resource: Resource,
    },
    CircuitBreakerTripped {
        task_id: String,
        timeout_secs: u64,
    },
    HookFailed {
        hook: String,
    },
    InterruptReceived,
}

impl RunEventKind {
    /// Stable event name used by renderers and logs.
    pub fn name(&self) -> &'static str {
        match self {
            RunEventKind::RunStarted { .. } => "RUN_STARTED",
            RunEventKind::RunStopped { .. } => "RUN_STOPPED",
            RunEventKind::RunFailed { .. } => "RUN_FAILED",
            RunEventKind::IterationStarted { .. } => "ITERATION_STARTED",
            RunEventKind::TaskSelected { .. } => "TASK_SELECTED",
            RunEventKind::TaskStarted { .. } => "TASK_STARTED",
            RunEventKind::TaskCompleted { .. } => "TASK_COMPLETED",
            RunEventKind::TaskFailed { .. } => "TASK_FAILED",
            RunEventKind::BudgetUpdated { .. } => "BUDGET_UPDATED",
            RunEventKind::BudgetWarning { .. } => "BUDGET_WARNING",
            RunEventKind::BudgetExhausted { .. } => "BUDGET_EXHAUSTED",
            RunEventKind::CircuitBreakerTripped { .. } => "CIRCUIT_BREAKER_TRIPPED",
            RunEventKind::HookFailed { .. } => "HOOK_FAILED",
            RunEventKind::InterruptReceived => "INTERRUPT_RECEIVED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Position in the run's event sequence (0-indexed).
    pub seq: u64,
    /// Milliseconds since the run started.
    pub elapsed_ms: u64,
    #[serde(flatten)]
    pub kind: RunEventKind,
    pub counters: Counters,
}

/// Terminal snapshot of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub run_id: String,
    pub phase: RunPhase,
    pub stop_reason: Option<StopReason>,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub tokens: u64,
    pub cost: f64,
    pub duration: Duration,
    /// First fatal error, if the run ended on one.
    pub error: Option<RunError>,
    pub events: Vec<RunEvent>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.phase == RunPhase::Completed && self.tasks_failed == 0
    }

    /// Count events with the given stable name.
    pub fn count_events(&self, name: &str) -> usize {
        self.events
            .iter()
            .filter(|event| event.kind.name() == name)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(phase: RunPhase, failed: u32) -> RunResult {
        RunResult {
            run_id: "run-1".to_string(),
            phase,
            stop_reason: None,
            tasks_completed: 1,
            tasks_failed: failed,
            tokens: 0,
            cost: 0.0,
            duration: Duration::ZERO,
            error: None,
            events: Vec::new(),
        }
    }

    #[test]
    fn success_requires_completed_phase_without_failures() {
        assert!(result(RunPhase::Completed, 0).success());
        assert!(!result(RunPhase::Completed, 1).success());
        assert!(!result(RunPhase::Stopped, 0).success());
        assert!(!result(RunPhase::Failed, 0).success());
    }

    #[test]
    fn event_serializes_with_flat_tag() {
        let event = RunEvent {
            seq: 3,
            elapsed_ms: 10,
            kind: RunEventKind::IterationStarted { iteration: 2 },
            counters: Counters::default(),
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["event"], "iteration_started");
        assert_eq!(value["iteration"], 2);
        assert_eq!(value["seq"], 3);
    }

    #[test]
    fn terminal_phases() {
        assert!(!RunPhase::Initializing.is_terminal());
        assert!(!RunPhase::Running.is_terminal());
        assert!(RunPhase::Stopped.is_terminal());
    }
}
