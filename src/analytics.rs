//! Analytics events and retention.
//!
//! Events are appended to `USER_HOME/.takt/analytics/events/<YYYY-MM-DD>.jsonl`,
//! one file per UTC day. Finding IDs are extracted from free-form agent text
//! by a fixed pattern and deduplicated per emission. The purge deletes files
//! strictly older than the retention cutoff; the cutoff day itself is kept.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::TaktError;

/// Pattern for reviewer finding IDs, e.g. `REV-001`, `SEC-AUTH-2`.
pub const FINDING_ID_PATTERN: &str = r"[A-Z]{2,}-[A-Z0-9-]+";

pub const EVENT_MOVEMENT_RESULT: &str = "movement_result";
pub const EVENT_REVIEW_FINDING: &str = "review_finding";
pub const EVENT_FIX_ACTION: &str = "fix_action";

/// Extract finding IDs from free-form text, deduplicated, in order of first
/// appearance.
pub fn extract_finding_ids(text: &str) -> Vec<String> {
    let re = Regex::new(FINDING_ID_PATTERN).expect("finding id pattern");
    let mut seen = Vec::new();
    for m in re.find_iter(text) {
        let id = m.as_str().to_string();
        if !seen.contains(&id) {
            seen.push(id);
        }
    }
    seen
}

/// Append-mode analytics writer rooted at the events directory.
pub struct AnalyticsWriter {
    events_dir: PathBuf,
}

impl AnalyticsWriter {
    pub fn new(user_dir: &Path) -> Self {
        Self {
            events_dir: user_dir.join("analytics").join("events"),
        }
    }

    pub fn events_dir(&self) -> &Path {
        &self.events_dir
    }

    fn append(&self, event: Value) -> Result<(), TaktError> {
        std::fs::create_dir_all(&self.events_dir)?;
        let day = Utc::now().format("%Y-%m-%d");
        let path = self.events_dir.join(format!("{day}.jsonl"));
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(serde_json::to_string(&event)?.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    pub fn movement_result(
        &self,
        piece: &str,
        movement: &str,
        outcome: &str,
    ) -> Result<(), TaktError> {
        self.append(json!({
            "type": EVENT_MOVEMENT_RESULT,
            "timestamp": Utc::now().to_rfc3339(),
            "piece": piece,
            "movement": movement,
            "outcome": outcome,
        }))
    }

    /// Record one review finding per extracted ID.
    pub fn review_findings(&self, piece: &str, content: &str) -> Result<Vec<String>, TaktError> {
        let ids = extract_finding_ids(content);
        for id in &ids {
            self.append(json!({
                "type": EVENT_REVIEW_FINDING,
                "timestamp": Utc::now().to_rfc3339(),
                "piece": piece,
                "finding_id": id,
            }))?;
        }
        Ok(ids)
    }

    pub fn fix_action(&self, finding_id: &str, action: FixAction) -> Result<(), TaktError> {
        self.append(json!({
            "type": EVENT_FIX_ACTION,
            "timestamp": Utc::now().to_rfc3339(),
            "finding_id": finding_id,
            "action": action.as_str(),
        }))
    }
}

/// What happened to a finding during a fix movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixAction {
    Fixed,
    Rebutted,
}

impl FixAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Rebutted => "rebutted",
        }
    }
}

/// Delete event files strictly older than `today - retention_days`. Files at
/// the cutoff date itself are kept. Monotone: a second pass with the same
/// cutoff removes nothing.
pub fn purge(events_dir: &Path, retention_days: u32, today: NaiveDate) -> Result<usize, TaktError> {
    let cutoff = today - chrono::Duration::days(retention_days as i64);
    let mut removed = 0;

    if !events_dir.is_dir() {
        return Ok(0);
    }

    for entry in std::fs::read_dir(events_dir)? {
        let path = entry?.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") else {
            debug!("Skipping non-event file {}", path.display());
            continue;
        };
        if date < cutoff {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }

    if removed > 0 {
        info!("Purged {} analytics file(s) older than {}", removed, cutoff);
    }
    Ok(removed)
}

/// Aggregated view over review events for `metrics review`.
#[derive(Debug, Default)]
pub struct ReviewMetrics {
    /// Occurrences per finding id
    pub findings: HashMap<String, usize>,
    pub fixed: usize,
    pub rebutted: usize,
    pub movement_results: usize,
}

/// Aggregate events on or after `since` (inclusive).
pub fn aggregate_review(
    events_dir: &Path,
    since: Option<NaiveDate>,
) -> Result<ReviewMetrics, TaktError> {
    let mut metrics = ReviewMetrics::default();
    if !events_dir.is_dir() {
        return Ok(metrics);
    }

    for entry in std::fs::read_dir(events_dir)? {
        let path = entry?.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") else {
            continue;
        };
        if let Some(since) = since {
            if date < since {
                continue;
            }
        }
        let contents = std::fs::read_to_string(&path)?;
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            let Ok(event) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            match event["type"].as_str() {
                Some(EVENT_REVIEW_FINDING) => {
                    if let Some(id) = event["finding_id"].as_str() {
                        *metrics.findings.entry(id.to_string()).or_insert(0) += 1;
                    }
                }
                Some(EVENT_FIX_ACTION) => match event["action"].as_str() {
                    Some("fixed") => metrics.fixed += 1,
                    Some("rebutted") => metrics.rebutted += 1,
                    _ => {}
                },
                Some(EVENT_MOVEMENT_RESULT) => metrics.movement_results += 1,
                _ => {}
            }
        }
    }
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_extract_finding_ids_dedup() {
        let text = "Found REV-001 and SEC-AUTH-2. REV-001 is severe. rev-002 is lowercase.";
        let ids = extract_finding_ids(text);
        assert_eq!(ids, vec!["REV-001", "SEC-AUTH-2"]);
    }

    #[test]
    fn test_extract_requires_two_letter_prefix() {
        assert!(extract_finding_ids("A-1 is not a finding").is_empty());
        assert_eq!(extract_finding_ids("AB-1 is"), vec!["AB-1"]);
    }

    #[test]
    fn test_events_written_to_daily_file() {
        let tmp = TempDir::new().unwrap();
        let writer = AnalyticsWriter::new(tmp.path());
        writer.movement_result("default", "review", "approved").unwrap();
        writer
            .review_findings("default", "REV-001: broken test")
            .unwrap();

        let day = Utc::now().format("%Y-%m-%d").to_string();
        let path = writer.events_dir().join(format!("{day}.jsonl"));
        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains(EVENT_MOVEMENT_RESULT));
        assert!(contents.contains("REV-001"));
    }

    #[test]
    fn test_purge_keeps_cutoff_day() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("events");
        std::fs::create_dir_all(&dir).unwrap();

        let today = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        // retention 30 days -> cutoff 2026-07-02
        std::fs::write(dir.join("2026-07-01.jsonl"), "{}\n").unwrap();
        std::fs::write(dir.join("2026-07-02.jsonl"), "{}\n").unwrap();
        std::fs::write(dir.join("2026-08-01.jsonl"), "{}\n").unwrap();
        std::fs::write(dir.join("notes.txt"), "keep me").unwrap();

        let removed = purge(&dir, 30, today).unwrap();
        assert_eq!(removed, 1);
        assert!(!dir.join("2026-07-01.jsonl").exists());
        assert!(dir.join("2026-07-02.jsonl").exists());
        assert!(dir.join("2026-08-01.jsonl").exists());
        assert!(dir.join("notes.txt").exists());
    }

    #[test]
    fn test_purge_is_monotone() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("events");
        std::fs::create_dir_all(&dir).unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        std::fs::write(dir.join("2026-01-01.jsonl"), "{}\n").unwrap();

        assert_eq!(purge(&dir, 30, today).unwrap(), 1);
        assert_eq!(purge(&dir, 30, today).unwrap(), 0);
    }

    #[test]
    fn test_aggregate_review_counts() {
        let tmp = TempDir::new().unwrap();
        let writer = AnalyticsWriter::new(tmp.path());
        writer
            .review_findings("default", "REV-001 REV-002 REV-001")
            .unwrap();
        writer.fix_action("REV-001", FixAction::Fixed).unwrap();
        writer.fix_action("REV-002", FixAction::Rebutted).unwrap();

        let metrics = aggregate_review(writer.events_dir(), None).unwrap();
        assert_eq!(metrics.findings.get("REV-001"), Some(&1));
        assert_eq!(metrics.findings.get("REV-002"), Some(&1));
        assert_eq!(metrics.fixed, 1);
        assert_eq!(metrics.rebutted, 1);
    }
}
