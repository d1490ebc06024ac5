//! Deterministic task selection over backend-ordered ready lists.

use std::collections::{HashMap, HashSet};

use super::types::{Task, TaskCounts, TaskStatus};

/// Tasks that can start now, in backend order (priority, then insertion).
///
/// A task is ready when it is open, not an epic, and every dependency and
/// blocker it names is closed. Ids that are not in `all` do not block.
/// `parent` and `label` narrow the result to one epic or one label.
pub fn ready_tasks(all: &[Task], parent: Option<&str>, label: Option<&str>) -> Vec<Task> {
    let status_by_id: HashMap<&str, TaskStatus> =
        all.iter().map(|t| (t.id.as_str(), t.status)).collect();
    let satisfied = |id: &String| {
        status_by_id
            .get(id.as_str())
            .is_none_or(|status| *status == TaskStatus::Closed)
    };

    let mut ready: Vec<Task> = all
        .iter()
        .filter(|t| t.status == TaskStatus::Open && t.task_type != "epic")
        .filter(|t| parent.is_none_or(|p| t.parent.as_deref() == Some(p)))
        .filter(|t| label.is_none_or(|l| t.labels.iter().any(|have| have == l)))
        .filter(|t| t.dependencies.iter().all(satisfied) && t.blocked_by.iter().all(satisfied))
        .cloned()
        .collect();
    // Stable sort keeps insertion order within a priority.
    ready.sort_by_key(|t| t.priority);
    ready
}

/// Count tasks by status. Epics are containers and are not counted.
pub fn count_tasks(all: &[Task]) -> TaskCounts {
    let mut counts = TaskCounts::default();
    for task in all.iter().filter(|t| t.task_type != "epic") {
        counts.total += 1;
        match task.status {
            TaskStatus::Open => counts.open += 1,
            TaskStatus::InProgress => counts.in_progress += 1,
            TaskStatus::Closed => counts.closed += 1,
        }
    }
    counts.remaining = counts.open + counts.in_progress;
    counts
}

/// Pick the first ready task that is not closed and not excluded.
///
/// `ready` must already be in backend order (priority, then insertion).
pub fn next_ready<'a>(ready: &'a [Task], excluded: &HashSet<String>) -> Option<&'a Task> {
    ready
        .iter()
        .find(|task| !task.is_closed() && !excluded.contains(&task.id))
}

/// Greedily build a set of at most `count` tasks with no direct dependency
/// edge, in either direction, between any two selected tasks.
pub fn independent_subset(ready: &[Task], count: usize) -> Vec<Task> {
    let mut selected: Vec<Task> = Vec::new();
    for candidate in ready {
        if selected.len() >= count {
            break;
        }
        if candidate.is_closed() {
            continue;
        }
        let conflicts = selected.iter().any(|chosen| {
            chosen.id == candidate.id
                || candidate.references(&chosen.id)
                || chosen.references(&candidate.id)
        });
        if !conflicts {
            selected.push(candidate.clone());
        }
    }
    selected
}
