//! Per-task attempt bookkeeping and model escalation.

use std::collections::HashMap;

use super::types::Task;

/// Models used across the attempts of one task, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptHistory {
    attempts: u32,
    models: Vec<String>,
}

impl AttemptHistory {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Ordered model path, one entry per attempt that named a model.
    pub fn model_path(&self) -> &[String] {
        &self.models
    }

    /// True when the task moved to a different model at some point.
    pub fn escalated(&self) -> bool {
        self.models.windows(2).any(|pair| pair[0] != pair[1])
    }

    fn record(&mut self, model: Option<&str>) -> u32 {
        self.attempts += 1;
        if let Some(model) = model {
            self.models.push(model.to_string());
        }
        self.attempts
    }
}

/// Tracks attempts for every task a run touches.
#[derive(Debug, Clone, Default)]
pub struct AttemptTracker {
    by_task: HashMap<String, AttemptHistory>,
}

impl AttemptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attempts already made for `task_id`.
    pub fn attempts(&self, task_id: &str) -> u32 {
        self.by_task.get(task_id).map_or(0, AttemptHistory::attempts)
    }

    /// Record the start of an attempt; returns its 1-based attempt number.
    pub fn begin(&mut self, task_id: &str, model: Option<&str>) -> u32 {
        self.by_task
            .entry(task_id.to_string())
            .or_default()
            .record(model)
    }

    pub fn history(&self, task_id: &str) -> AttemptHistory {
        self.by_task.get(task_id).cloned().unwrap_or_default()
    }
}

/// Resolve the model for the given 1-based attempt of `task`.
///
/// Order: the task's explicit model, then the escalation ladder rung for this
/// attempt (clamped to the last rung), then the run default.
pub fn model_for_attempt(
    task: &Task,
    attempt: u32,
    ladder: &[String],
    default_model: Option<&str>,
) -> Option<String> {
    if let Some(model) = task.model.as_deref().filter(|m| !m.trim().is_empty()) {
        return Some(model.to_string());
    }
    if !ladder.is_empty() {
        let idx = (attempt.saturating_sub(1) as usize).min(ladder.len() - 1);
        return Some(ladder[idx].clone());
    }
    default_model.map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::task;

    #[test]
    fn failed_then_escalated_success_is_marked_escalated() {
        let mut tracker = AttemptTracker::new();
        assert_eq!(tracker.begin("t-1", Some("sonnet")), 1);
        assert_eq!(tracker.begin("t-1", Some("opus")), 2);
        let history = tracker.history("t-1");
        assert!(history.escalated());
        assert_eq!(history.model_path(), ["sonnet", "opus"]);
    }

    #[test]
    fn same_model_attempts_are_not_escalated() {
        let mut tracker = AttemptTracker::new();
        tracker.begin("t-1", Some("sonnet"));
        tracker.begin("t-1", Some("sonnet"));
        let history = tracker.history("t-1");
        assert!(!history.escalated());
        assert_eq!(history.attempts(), 2);
        assert_eq!(tracker.attempts("other"), 0);
    }

    #[test]
    fn ladder_is_clamped_and_task_model_wins() {
        let ladder = vec!["small".to_string(), "large".to_string()];
        let plain = task("a", 0);
        assert_eq!(
            model_for_attempt(&plain, 1, &ladder, Some("default")).as_deref(),
            Some("small")
        );
        assert_eq!(
            model_for_attempt(&plain, 5, &ladder, None).as_deref(),
            Some("large")
        );
        assert_eq!(
            model_for_attempt(&plain, 1, &[], Some("default")).as_deref(),
            Some("default")
        );

        let mut pinned = task("b", 0);
        pinned.model = Some("pinned".to_string());
        assert_eq!(
            model_for_attempt(&pinned, 3, &ladder, None).as_deref(),
            Some("pinned")
        );
    }
}
