//! Append-only session log.
//!
//! One newline-delimited JSON stream per run at
//! `PROJECT/.takt/runs/<run-id>/logs/<run-id>.jsonl`. The writer appends each
//! record synchronously before the engine proceeds, never rewrites earlier
//! lines, and is the system of record for everything the UI and metrics show.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{json, Value};

use crate::error::TaktError;

/// Record kinds emitted by the engine.
pub const TYPE_PIECE_START: &str = "piece_start";
pub const TYPE_STEP_START: &str = "step_start";
pub const TYPE_STEP_COMPLETE: &str = "step_complete";
pub const TYPE_PIECE_COMPLETE: &str = "piece_complete";
pub const TYPE_PIECE_ABORT: &str = "piece_abort";
pub const TYPE_HEALTH: &str = "health";

/// Append-only writer for one run's session log.
pub struct SessionLogWriter {
    path: PathBuf,
    file: File,
    run_id: String,
}

impl SessionLogWriter {
    /// Create the run directory layout and open the log for appending.
    pub fn create(project_root: &Path, run_id: &str) -> Result<Self, TaktError> {
        let dir = project_root
            .join(".takt")
            .join("runs")
            .join(run_id)
            .join("logs");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{run_id}.jsonl"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            run_id: run_id.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Append one record. `extra` fields are merged in; `type` and
    /// `timestamp` are always present.
    pub fn append(&mut self, record_type: &str, extra: Value) -> Result<(), TaktError> {
        let mut record = json!({
            "type": record_type,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let (Some(base), Value::Object(extra)) = (record.as_object_mut(), extra) {
            for (k, v) in extra {
                base.insert(k, v);
            }
        }
        let line = serde_json::to_string(&record)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        Ok(())
    }

    pub fn piece_start(&mut self, piece: &str, task: &str) -> Result<(), TaktError> {
        self.append(
            TYPE_PIECE_START,
            json!({ "piece": piece, "task": task, "run_id": self.run_id }),
        )
    }

    pub fn step_start(&mut self, step: &str, iteration: u32) -> Result<(), TaktError> {
        self.append(TYPE_STEP_START, json!({ "step": step, "iteration": iteration }))
    }

    pub fn step_complete(&mut self, step: &str, content: &str) -> Result<(), TaktError> {
        self.append(TYPE_STEP_COMPLETE, json!({ "step": step, "content": content }))
    }

    pub fn piece_complete(&mut self) -> Result<(), TaktError> {
        self.append(TYPE_PIECE_COMPLETE, json!({}))
    }

    pub fn piece_abort(&mut self, reason: &str) -> Result<(), TaktError> {
        self.append(TYPE_PIECE_ABORT, json!({ "reason": reason }))
    }
}

/// Read all records of a session log (consumer-side helper).
pub fn read_records(path: &Path) -> Result<Vec<Value>, TaktError> {
    let contents = std::fs::read_to_string(path)?;
    let mut records = Vec::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(line)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_records_appear_in_order() {
        let tmp = TempDir::new().unwrap();
        let mut log = SessionLogWriter::create(tmp.path(), "run-1").unwrap();
        log.piece_start("default", "fix the bug").unwrap();
        log.step_start("plan", 1).unwrap();
        log.step_complete("plan", "a plan").unwrap();
        log.piece_complete().unwrap();

        let records = read_records(log.path()).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0]["type"], TYPE_PIECE_START);
        assert_eq!(records[1]["type"], TYPE_STEP_START);
        assert_eq!(records[2]["type"], TYPE_STEP_COMPLETE);
        assert_eq!(records[2]["step"], "plan");
        assert_eq!(records[2]["content"], "a plan");
        assert_eq!(records[3]["type"], TYPE_PIECE_COMPLETE);
    }

    #[test]
    fn test_every_record_has_timestamp() {
        let tmp = TempDir::new().unwrap();
        let mut log = SessionLogWriter::create(tmp.path(), "run-2").unwrap();
        log.piece_abort("No matching rule").unwrap();

        let records = read_records(log.path()).unwrap();
        let ts = records[0]["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
        assert_eq!(records[0]["reason"], "No matching rule");
    }

    #[test]
    fn test_append_only_across_writers() {
        let tmp = TempDir::new().unwrap();
        {
            let mut log = SessionLogWriter::create(tmp.path(), "run-3").unwrap();
            log.piece_start("p", "t").unwrap();
        }
        let mut log = SessionLogWriter::create(tmp.path(), "run-3").unwrap();
        log.piece_complete().unwrap();

        let records = read_records(log.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["type"], TYPE_PIECE_START);
    }

    #[test]
    fn test_log_path_layout() {
        let tmp = TempDir::new().unwrap();
        let log = SessionLogWriter::create(tmp.path(), "abc").unwrap();
        assert!(log
            .path()
            .ends_with(PathBuf::from(".takt/runs/abc/logs/abc.jsonl")));
    }
}
