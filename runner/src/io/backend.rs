//! Task backend seam and a local JSON-file adapter.
//!
//! The run loop only talks to [`TaskBackend`]. [`JsonTaskBackend`] keeps the
//! task graph in `.runner/tasks.json`; mutations take an exclusive lock file
//! and rewrite the document atomically so parallel workers can share it.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::selector::{count_tasks, ready_tasks};
use crate::core::types::{Task, TaskCounts, TaskStatus};

pub const TASKS_FILE: &str = "tasks.json";
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_POLL: Duration = Duration::from_millis(20);
/// A lock older than this is abandoned even if its holder still runs.
const STALE_LOCK_AGE: Duration = Duration::from_secs(60);

/// Storage and query interface for the work-item graph.
pub trait TaskBackend: Send + Sync {
    fn get_task(&self, id: &str) -> Result<Option<Task>>;

    /// Ready tasks ordered by priority, then insertion.
    fn get_ready_tasks(&self, parent: Option<&str>, label: Option<&str>) -> Result<Vec<Task>>;

    fn get_task_counts(&self) -> Result<TaskCounts>;

    fn update_task(&self, id: &str, status: TaskStatus, assignee: Option<&str>) -> Result<()>;

    fn close_task(&self, id: &str, reason: &str) -> Result<()>;

    /// Push local changes to wherever the backend syncs. No-op by default.
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// On-disk document: `{"tasks": [...]}` in insertion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDocument {
    #[serde(default)]
    pub tasks: Vec<StoredTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTask {
    #[serde(flatten)]
    pub task: Task,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JsonTaskBackend {
    path: PathBuf,
}

impl JsonTaskBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole document. A missing file is an empty graph.
    pub fn load(&self) -> Result<TaskDocument> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "task file missing, treating as empty");
            return Ok(TaskDocument::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read tasks {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse tasks {}", self.path.display()))
    }

    fn tasks(&self) -> Result<Vec<Task>> {
        Ok(self.load()?.tasks.into_iter().map(|s| s.task).collect())
    }

    /// Apply `f` to the task `id` under the file lock and persist the result.
    fn mutate(&self, id: &str, f: impl FnOnce(&mut StoredTask)) -> Result<()> {
        let _lock = FileLock::acquire(&self.path.with_extension("json.lock"))?;
        let mut doc = self.load()?;
        let stored = doc
            .tasks
            .iter_mut()
            .find(|s| s.task.id == id)
            .ok_or_else(|| anyhow!("task not found: {id}"))?;
        f(stored);
        self.write(&doc)
    }

    fn write(&self, doc: &TaskDocument) -> Result<()> {
        let parent = self
            .path
            .parent()
            .with_context(|| format!("tasks path missing parent {}", self.path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
        let mut buf = serde_json::to_string_pretty(doc)?;
        buf.push('\n');
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, buf)
            .with_context(|| format!("write temp tasks {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("replace tasks {}", self.path.display()))?;
        Ok(())
    }

    /// Replace the whole document (used to seed a task file).
    pub fn write_tasks(&self, tasks: &[Task]) -> Result<()> {
        let _lock = FileLock::acquire(&self.path.with_extension("json.lock"))?;
        let doc = TaskDocument {
            tasks: tasks
                .iter()
                .cloned()
                .map(|task| StoredTask {
                    task,
                    close_reason: None,
                })
                .collect(),
        };
        self.write(&doc)
    }
}

impl TaskBackend for JsonTaskBackend {
    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.tasks()?.into_iter().find(|t| t.id == id))
    }

    fn get_ready_tasks(&self, parent: Option<&str>, label: Option<&str>) -> Result<Vec<Task>> {
        Ok(ready_tasks(&self.tasks()?, parent, label))
    }

    fn get_task_counts(&self) -> Result<TaskCounts> {
        Ok(count_tasks(&self.tasks()?))
    }

    #[instrument(skip(self))]
    fn update_task(&self, id: &str, status: TaskStatus, assignee: Option<&str>) -> Result<()> {
        self.mutate(id, |stored| {
            stored.task.status = status;
            stored.task.assignee = assignee.map(str::to_string);
        })
    }

    #[instrument(skip(self))]
    fn close_task(&self, id: &str, reason: &str) -> Result<()> {
        self.mutate(id, |stored| {
            stored.task.status = TaskStatus::Closed;
            stored.close_reason = Some(reason.to_string());
        })
    }
}

/// Exclusive advisory lock held as a `create_new` file; removed on drop.
///
/// The file records the holder's pid. A lock whose holder has exited, or that
/// is older than [`STALE_LOCK_AGE`], is broken.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    if let Err(err) = writeln!(file, "{}", std::process::id()) {
                        warn!(path = %path.display(), err = %err, "failed to record lock holder");
                    }
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == IoErrorKind::AlreadyExists => {
                    if let Some(reason) = stale_reason(path) {
                        warn!(path = %path.display(), reason, "breaking stale lock");
                        match fs::remove_file(path) {
                            Ok(()) => continue,
                            Err(err) if err.kind() == IoErrorKind::NotFound => continue,
                            Err(err) => {
                                return Err(err)
                                    .with_context(|| format!("remove stale lock {}", path.display()));
                            }
                        }
                    }
                    if Instant::now() >= deadline {
                        return Err(anyhow!("timed out waiting for lock {}", path.display()));
                    }
                    thread::sleep(LOCK_POLL);
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("create lock {}", path.display()));
                }
            }
        }
    }
}

fn stale_reason(path: &Path) -> Option<&'static str> {
    let holder = fs::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().parse::<u32>().ok());
    if holder.is_some_and(|pid| !process_alive(pid)) {
        return Some("holder exited");
    }
    let age = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())?;
    (age > STALE_LOCK_AGE).then_some("lock expired")
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), err = %err, "failed to release lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{task, task_with_deps};

    fn seeded(dir: &Path) -> JsonTaskBackend {
        let backend = JsonTaskBackend::new(dir.join(".runner").join(TASKS_FILE));
        backend
            .write_tasks(&[
                task("t1", 0),
                task("t2", 1),
                task_with_deps("t3", 1, &["t2"]),
            ])
            .expect("seed");
        backend
    }

    fn ids(tasks: &[Task]) -> Vec<String> {
        tasks.iter().map(|t| t.id.clone()).collect()
    }

    #[test]
    fn missing_file_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = JsonTaskBackend::new(temp.path().join("none.json"));
        assert!(backend.get_ready_tasks(None, None).expect("ready").is_empty());
        assert_eq!(backend.get_task_counts().expect("counts").total, 0);
    }

    #[test]
    fn closing_dependency_unblocks_dependent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = seeded(temp.path());
        assert_eq!(ids(&backend.get_ready_tasks(None, None).expect("ready")), ["t1", "t2"]);

        backend.close_task("t2", "done").expect("close");
        assert_eq!(ids(&backend.get_ready_tasks(None, None).expect("ready")), ["t1", "t3"]);

        let doc = backend.load().expect("load");
        let closed = doc.tasks.iter().find(|s| s.task.id == "t2").expect("t2");
        assert_eq!(closed.close_reason.as_deref(), Some("done"));
        assert!(!backend.path().with_extension("json.lock").exists());
    }

    #[test]
    fn update_sets_status_and_assignee() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = seeded(temp.path());
        backend
            .update_task("t1", TaskStatus::InProgress, Some("run-1"))
            .expect("update");
        let t1 = backend.get_task("t1").expect("get").expect("t1");
        assert_eq!(t1.status, TaskStatus::InProgress);
        assert_eq!(t1.assignee.as_deref(), Some("run-1"));

        let counts = backend.get_task_counts().expect("counts");
        assert_eq!(counts.in_progress, 1);
        assert_eq!(counts.remaining, 3);
    }

    #[test]
    fn unknown_task_mutation_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = seeded(temp.path());
        let err = backend.close_task("nope", "x").expect_err("missing");
        assert!(err.to_string().contains("task not found"));
    }

    #[test]
    fn concurrent_closes_are_not_lost() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = seeded(temp.path());
        thread::scope(|scope| {
            for id in ["t1", "t2", "t3"] {
                let backend = &backend;
                scope.spawn(move || backend.close_task(id, "done").expect("close"));
            }
        });
        assert_eq!(backend.get_task_counts().expect("counts").closed, 3);
    }

    #[cfg(unix)]
    #[test]
    fn lock_left_by_exited_process_is_broken() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = seeded(temp.path());
        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        child.wait().expect("wait");
        let lock = backend.path().with_extension("json.lock");
        fs::write(&lock, format!("{}\n", child.id())).expect("lock");

        let started = Instant::now();
        backend.close_task("t1", "done").expect("close");
        assert!(started.elapsed() < LOCK_TIMEOUT);
        assert!(!lock.exists());
    }

    #[test]
    fn expired_lock_is_broken_even_if_holder_lives() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = seeded(temp.path());
        let lock = backend.path().with_extension("json.lock");
        fs::write(&lock, format!("{}\n", std::process::id())).expect("lock");
        let old = std::time::SystemTime::now() - STALE_LOCK_AGE * 2;
        fs::File::options()
            .write(true)
            .open(&lock)
            .expect("open lock")
            .set_modified(old)
            .expect("age lock");

        backend
            .update_task("t1", TaskStatus::InProgress, None)
            .expect("update");
        assert!(!lock.exists());
    }

    #[test]
    fn lock_file_records_holder_pid() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock_path = temp.path().join("x.lock");
        let lock = FileLock::acquire(&lock_path).expect("acquire");
        let content = fs::read_to_string(&lock_path).expect("read");
        assert_eq!(content.trim(), std::process::id().to_string());
        drop(lock);
        assert!(!lock_path.exists());
    }
}
