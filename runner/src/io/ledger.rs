//! Execution history ledger.
//!
//! The run loop reports task and attempt boundaries through [`Ledger`].
//! [`JsonlLedger`] appends one JSON object per call to a shared file; a ledger
//! error is logged by the caller and never stops a run.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::core::types::{ErrorKind, Usage};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStart {
    pub run_id: String,
    pub task_id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptStart {
    pub run_id: String,
    pub task_id: String,
    pub attempt: u32,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptEnd {
    pub run_id: String,
    pub task_id: String,
    pub attempt: u32,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    /// One-line failure summary.
    pub summary: Option<String>,
    pub usage: Usage,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskClose {
    pub run_id: String,
    pub task_id: String,
    pub success: bool,
    pub attempts: u32,
    pub escalated: bool,
    pub model_path: Vec<String>,
}

pub trait Ledger: Send + Sync {
    fn on_task_start(&self, record: &TaskStart) -> Result<()>;
    fn on_attempt_start(&self, record: &AttemptStart) -> Result<()>;
    fn on_attempt_end(&self, record: &AttemptEnd) -> Result<()>;
    fn on_task_close(&self, record: &TaskClose) -> Result<()>;
}

/// Ledger used when the ledger toggle is off.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLedger;

impl Ledger for NoopLedger {
    fn on_task_start(&self, _record: &TaskStart) -> Result<()> {
        Ok(())
    }

    fn on_attempt_start(&self, _record: &AttemptStart) -> Result<()> {
        Ok(())
    }

    fn on_attempt_end(&self, _record: &AttemptEnd) -> Result<()> {
        Ok(())
    }

    fn on_task_close(&self, _record: &TaskClose) -> Result<()> {
        Ok(())
    }
}

/// Append-only JSON Lines ledger.
#[derive(Debug, Clone)]
pub struct JsonlLedger {
    path: PathBuf,
}

#[derive(Serialize)]
struct Line<'a, T: Serialize> {
    entry: &'static str,
    at_ms: u64,
    #[serde(flatten)]
    record: &'a T,
}

impl JsonlLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append<T: Serialize>(&self, entry: &'static str, record: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create ledger dir {}", parent.display()))?;
        }
        let mut buf = serde_json::to_string(&Line {
            entry,
            at_ms: now_ms(),
            record,
        })?;
        buf.push('\n');
        // One write per line so concurrent appenders do not interleave.
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open ledger {}", self.path.display()))?;
        file.write_all(buf.as_bytes())
            .with_context(|| format!("append ledger {}", self.path.display()))?;
        debug!(entry, "ledger entry appended");
        Ok(())
    }
}

impl Ledger for JsonlLedger {
    fn on_task_start(&self, record: &TaskStart) -> Result<()> {
        self.append("task_start", record)
    }

    fn on_attempt_start(&self, record: &AttemptStart) -> Result<()> {
        self.append("attempt_start", record)
    }

    fn on_attempt_end(&self, record: &AttemptEnd) -> Result<()> {
        self.append("attempt_end", record)
    }

    fn on_task_close(&self, record: &TaskClose) -> Result<()> {
        self.append("task_close", record)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
