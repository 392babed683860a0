//! Finding tracker and health monitor.
//!
//! After each movement that reports findings, the incoming set of finding IDs
//! is diffed against the tracked records and a verdict is computed as a pure
//! function of the record map and the previous active count. A finding that
//! was resolved and later returns bumps its recurrence count; enough
//! recurrence or persistence escalates the verdict.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Lifecycle state of one tracked finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingStatus {
    New,
    Persists,
    Resolved,
}

/// Per-finding trend classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingTrend {
    New,
    Improving,
    Stagnating,
    Looping,
}

/// One tracked finding across iterations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindingRecord {
    pub finding_id: String,
    pub status: FindingStatus,
    /// Consecutive iterations the finding has been present after first seen
    pub consecutive_persists: u32,
    /// Times the finding came back after being resolved
    pub recurrence_count: u32,
    pub trend: FindingTrend,
}

/// Overall health verdict, highest severity wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthVerdict {
    Converging,
    Improving,
    NeedsAttention,
    Stagnating,
    Looping,
    Misaligned,
}

/// Snapshot captured after each finding-reporting movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub movement_name: String,
    pub iteration: u32,
    pub max_movements: u32,
    pub findings: Vec<FindingRecord>,
    pub verdict: HealthVerdict,
}

/// Tracks findings across the iterations of one run.
#[derive(Debug, Default)]
pub struct FindingTracker {
    records: HashMap<String, FindingRecord>,
    previous_active: Option<usize>,
}

impl FindingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one iteration's extracted finding IDs and compute the snapshot.
    pub fn observe(
        &mut self,
        movement_name: &str,
        iteration: u32,
        max_movements: u32,
        incoming: &[String],
        phase_error: bool,
    ) -> HealthSnapshot {
        for id in incoming {
            match self.records.get_mut(id) {
                None => {
                    self.records.insert(
                        id.clone(),
                        FindingRecord {
                            finding_id: id.clone(),
                            status: FindingStatus::New,
                            consecutive_persists: 0,
                            recurrence_count: 0,
                            trend: FindingTrend::New,
                        },
                    );
                }
                Some(record) => {
                    if record.status == FindingStatus::Resolved {
                        record.recurrence_count += 1;
                        record.consecutive_persists = 0;
                    } else {
                        record.consecutive_persists += 1;
                    }
                    record.status = FindingStatus::Persists;
                }
            }
        }

        for (id, record) in self.records.iter_mut() {
            if !incoming.contains(id) && record.status != FindingStatus::Resolved {
                record.status = FindingStatus::Resolved;
                record.consecutive_persists = 0;
            }
        }

        for record in self.records.values_mut() {
            record.trend = if record.recurrence_count >= 1 {
                FindingTrend::Looping
            } else if record.consecutive_persists >= 3 {
                FindingTrend::Stagnating
            } else if record.status == FindingStatus::New {
                FindingTrend::New
            } else {
                FindingTrend::Improving
            };
        }

        let verdict = self.compute_verdict(phase_error);
        self.previous_active = Some(self.active_count());

        debug!(
            "Health after '{}' (iteration {}): {:?}, {} active finding(s)",
            movement_name,
            iteration,
            verdict,
            self.active_count()
        );

        HealthSnapshot {
            movement_name: movement_name.to_string(),
            iteration,
            max_movements,
            findings: self.sorted_records(),
            verdict,
        }
    }

    fn active_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.status != FindingStatus::Resolved)
            .count()
    }

    fn compute_verdict(&self, phase_error: bool) -> HealthVerdict {
        if self.records.values().any(|r| r.recurrence_count >= 2) {
            return HealthVerdict::Looping;
        }
        if self.records.values().any(|r| r.consecutive_persists >= 3) {
            return HealthVerdict::Stagnating;
        }
        let active = self.active_count();
        let increased = self
            .previous_active
            .map(|prev| active > prev)
            .unwrap_or(false);
        if increased || phase_error {
            return HealthVerdict::NeedsAttention;
        }
        if active == 0 {
            return HealthVerdict::Converging;
        }
        HealthVerdict::Improving
    }

    fn sorted_records(&self) -> Vec<FindingRecord> {
        let mut records: Vec<FindingRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.finding_id.cmp(&b.finding_id));
        records
    }

    pub fn records(&self) -> &HashMap<String, FindingRecord> {
        &self.records
    }
}

/// Upgrade a snapshot when the secondary alignment call reports a mismatch.
/// Never downgrades `looping` or `stagnating`.
pub fn apply_alignment_verdict(snapshot: &mut HealthSnapshot, misaligned: bool) {
    if misaligned
        && !matches!(
            snapshot.verdict,
            HealthVerdict::Looping | HealthVerdict::Stagnating
        )
    {
        snapshot.verdict = HealthVerdict::Misaligned;
    }
}
