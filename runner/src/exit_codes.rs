//! Stable exit codes for runner CLI commands.

use crate::core::event::{RunPhase, RunResult, StopReason};
use crate::parallel::ParallelRunResult;

/// Every task the command ran succeeded, or there was nothing to do.
pub const OK: i32 = 0;
/// Invalid config, unknown task, unavailable harness or another fatal error.
pub const INVALID: i32 = 1;
/// At least one task attempt failed.
pub const TASK_FAILED: i32 = 2;
/// Tasks remain but none of them are ready.
pub const BLOCKED: i32 = 3;
/// Stopped by Ctrl-C.
pub const INTERRUPTED: i32 = 4;

/// Exit code summarizing a run loop result.
pub fn for_run(result: &RunResult) -> i32 {
    if result.error.is_some() {
        return INVALID;
    }
    if matches!(result.stop_reason, Some(StopReason::Interrupted))
        || result.phase == RunPhase::Stopped
    {
        return INTERRUPTED;
    }
    if result.tasks_failed > 0 || result.phase == RunPhase::Failed {
        return TASK_FAILED;
    }
    if matches!(result.stop_reason, Some(StopReason::Blocked { .. })) {
        return BLOCKED;
    }
    OK
}

/// Exit code summarizing a parallel run.
pub fn for_parallel(result: &ParallelRunResult) -> i32 {
    if result.cancelled {
        INTERRUPTED
    } else if result.failed > 0 {
        TASK_FAILED
    } else {
        OK
    }
}
