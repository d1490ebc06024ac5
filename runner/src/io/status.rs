//! Live status snapshots under `.runner/status/<task_id>/`.
//!
//! The snapshot is rewritten atomically after every attempt so an observer
//! (or the parallel parent, when a worker exits without its report) can read
//! a consistent view. Prompts and attempt logs sit next to it.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::worktree::sanitize_task_id;
use crate::core::types::RunError;

pub const STATUS_DIR: &str = "status";
pub const SNAPSHOT_FILE: &str = "status.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Running,
    Completed,
    Failed,
}

/// Persisted view of one task within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub run_id: String,
    pub task_id: String,
    pub state: TaskState,
    pub attempt: u32,
    pub model: Option<String>,
    /// Run-cumulative consumption at the time of writing.
    pub tokens: u64,
    pub cost: f64,
    pub error: Option<RunError>,
}

/// Writes snapshots, prompts and attempt logs below one status root.
#[derive(Debug, Clone)]
pub struct StatusWriter {
    root: PathBuf,
}

impl StatusWriter {
    /// `runner_dir` is the `.runner/` directory of the main repository.
    pub fn new(runner_dir: &Path) -> Self {
        Self {
            root: runner_dir.join(STATUS_DIR),
        }
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(sanitize_task_id(task_id))
    }

    pub fn snapshot_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join(SNAPSHOT_FILE)
    }

    pub fn write_snapshot(&self, snapshot: &StatusSnapshot) -> Result<()> {
        let path = self.snapshot_path(&snapshot.task_id);
        debug!(path = %path.display(), state = ?snapshot.state, "writing status snapshot");
        let mut buf = serde_json::to_string_pretty(snapshot)?;
        buf.push('\n');
        write_atomic(&path, &buf)
    }

    pub fn write_prompt(&self, task_id: &str, attempt: u32, prompt: &str) -> Result<PathBuf> {
        let path = self
            .task_dir(task_id)
            .join(format!("attempt-{attempt}.prompt.md"));
        write_text(&path, prompt)?;
        Ok(path)
    }

    pub fn write_attempt_log(&self, task_id: &str, attempt: u32, log: &str) -> Result<PathBuf> {
        let path = self.task_dir(task_id).join(format!("attempt-{attempt}.log"));
        write_text(&path, log)?;
        Ok(path)
    }

    /// Read the snapshot for `task_id`; `None` when none was written.
    pub fn read_snapshot(&self, task_id: &str) -> Result<Option<StatusSnapshot>> {
        let path = self.snapshot_path(task_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read status {}", path.display()))?;
        let snapshot = serde_json::from_str(&contents)
            .with_context(|| format!("parse status {}", path.display()))?;
        Ok(Some(snapshot))
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("status path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp status {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace status {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ErrorKind;

    #[test]
    fn snapshot_round_trips_and_missing_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let writer = StatusWriter::new(temp.path());
        assert!(writer.read_snapshot("t-1").expect("read").is_none());

        let snapshot = StatusSnapshot {
            run_id: "run-1".to_string(),
            task_id: "t-1".to_string(),
            state: TaskState::Failed,
            attempt: 2,
            model: Some("opus".to_string()),
            tokens: 42,
            cost: 0.5,
            error: Some(RunError::new(ErrorKind::HarnessFailure, "exit 1")),
        };
        writer.write_snapshot(&snapshot).expect("write");
        let loaded = writer.read_snapshot("t-1").expect("read").expect("some");
        assert_eq!(loaded, snapshot);
        assert!(!writer.snapshot_path("t-1").with_extension("json.tmp").exists());
    }

    #[test]
    fn attempt_artifacts_are_numbered() {
        let temp = tempfile::tempdir().expect("tempdir");
        let writer = StatusWriter::new(temp.path());
        let prompt = writer.write_prompt("a/b", 1, "prompt").expect("prompt");
        let log = writer.write_attempt_log("a/b", 1, "log").expect("log");
        assert!(prompt.ends_with(Path::new("status/a_b/attempt-1.prompt.md")));
        assert!(log.ends_with(Path::new("status/a_b/attempt-1.log")));
    }
}
