//! Worker result hand-off between a `runner worker` child and its parent.
//!
//! The child writes a [`WorkerReport`] to the path it was given; the parent
//! validates it against `schemas/worker_report.schema.json` before use.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::event::{RunEventKind, RunPhase, RunResult};
use crate::core::types::ErrorKind;

const REPORT_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/worker_report.schema.json"
));

static REPORT_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(REPORT_SCHEMA).map_err(|err| err.to_string())?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| err.to_string())
});

/// What one worker process achieved for its single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub task_id: String,
    pub run_id: String,
    pub success: bool,
    pub phase: RunPhase,
    pub tokens: u64,
    pub cost: f64,
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
}

impl WorkerReport {
    /// Summarize a finished single-task run.
    pub fn from_run(task_id: &str, result: &RunResult) -> Self {
        let failed_attempt = result.events.iter().rev().find_map(|event| match &event.kind {
            RunEventKind::TaskFailed { kind, message, .. } => {
                Some((*kind, message.clone()))
            }
            _ => None,
        });
        let (error_kind, error) = match (&result.error, failed_attempt) {
            (Some(fatal), _) => (Some(fatal.kind), Some(fatal.message.clone())),
            (None, Some((kind, message))) if result.tasks_completed == 0 => {
                (Some(kind), Some(message))
            }
            _ => (None, None),
        };
        Self {
            task_id: task_id.to_string(),
            run_id: result.run_id.clone(),
            success: result.success() && result.tasks_completed > 0,
            phase: result.phase,
            tokens: result.tokens,
            cost: result.cost,
            duration_ms: u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            error,
            error_kind,
        }
    }
}

/// Atomically write the report (temp file + rename).
pub fn write_report(path: &Path, report: &WorkerReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(report)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp report {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace report {}", path.display()))?;
    debug!(path = %path.display(), success = report.success, "worker report written");
    Ok(())
}

/// Read and schema-validate a report.
pub fn read_report(path: &Path) -> Result<WorkerReport> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read report {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&contents).with_context(|| format!("parse report {}", path.display()))?;
    validate_report(&value)?;
    serde_json::from_value(value).with_context(|| format!("deserialize report {}", path.display()))
}

fn validate_report(instance: &Value) -> Result<()> {
    let validator = REPORT_VALIDATOR
        .as_ref()
        .map_err(|err| anyhow!("compile worker report schema: {err}"))?;
    let messages: Vec<String> = validator
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("worker report schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> WorkerReport {
        WorkerReport {
            task_id: "t-1".to_string(),
            run_id: "run-1".to_string(),
            success: true,
            phase: RunPhase::Completed,
            tokens: 120,
            cost: 0.5,
            duration_ms: 900,
            error: None,
            error_kind: None,
        }
    }

    #[test]
    fn written_report_reads_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("result.json");
        write_report(&path, &report()).expect("write");
        assert_eq!(read_report(&path).expect("read"), report());
    }

    #[test]
    fn schema_rejects_malformed_report() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("result.json");
        fs::write(&path, r#"{"task_id":"t-1","success":"yes"}"#).expect("write");
        let err = read_report(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn schema_rejects_negative_usage() {
        let mut value = serde_json::to_value(report()).expect("value");
        value["tokens"] = serde_json::json!(-5);
        assert!(validate_report(&value).is_err());
    }
}
