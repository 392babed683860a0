//! The piece engine: drives the movement state machine one atomic tick at a
//! time, enforcing the iteration cap, evaluating transitions, watching loop
//! monitors, and feeding the health monitor. Every engine-visible event is
//! appended to the session log before the engine proceeds.

use std::sync::Arc;

use tracing::{info, warn};

use crate::analytics::AnalyticsWriter;
use crate::engine::health::{apply_alignment_verdict, FindingTracker, HealthSnapshot};
use crate::engine::movement::{extract_status_line, MovementEngine};
use crate::engine::team;
use crate::error::TaktError;
use crate::piece::{
    AgentResponse, AgentStatus, LoopMonitor, Movement, Piece, PieceState, PieceStatus, Transition,
};
use crate::session::SessionLogWriter;

/// Bound on the transition history kept for loop monitors.
const HISTORY_LIMIT: usize = 64;

/// Result of a completed run.
pub struct RunOutcome {
    pub status: PieceStatus,
    pub state: PieceState,
    /// Reason recorded with the final piece_abort, when aborted or failed
    pub abort_reason: Option<String>,
}

/// Drives one piece to completion. Exclusively owns the run's `PieceState`
/// and session log.
pub struct PieceRunner {
    piece: Arc<Piece>,
    engine: MovementEngine,
    log: SessionLogWriter,
    analytics: Option<AnalyticsWriter>,
    tracker: FindingTracker,
    alignment_check: bool,
    history: Vec<String>,
    /// Finding IDs active after the previous health observation
    active_findings: Vec<String>,
}

enum Tick {
    Continue,
    Finished(PieceStatus, Option<String>),
}

impl PieceRunner {
    pub fn new(
        piece: Arc<Piece>,
        engine: MovementEngine,
        log: SessionLogWriter,
        analytics: Option<AnalyticsWriter>,
        alignment_check: bool,
    ) -> Self {
        Self {
            piece,
            engine,
            log,
            analytics,
            tracker: FindingTracker::new(),
            alignment_check,
            history: Vec::new(),
            active_findings: Vec::new(),
        }
    }

    /// Run the piece to a terminal status.
    pub async fn run(mut self) -> Result<RunOutcome, TaktError> {
        let mut state = self.piece.create_state();
        let task = self.engine.ctx.task.clone();
        self.log.piece_start(&self.piece.name, &task)?;
        info!(
            "Starting piece '{}' at movement '{}'",
            self.piece.name, state.current_movement
        );

        loop {
            match self.tick(&mut state).await? {
                Tick::Continue => {}
                Tick::Finished(status, reason) => {
                    state.status = status;
                    return Ok(RunOutcome {
                        status,
                        state,
                        abort_reason: reason,
                    });
                }
            }
        }
    }

    /// One atomic tick: execute the current movement, record its outcome,
    /// and transition.
    async fn tick(&mut self, state: &mut PieceState) -> Result<Tick, TaktError> {
        let movement = match self.piece.get_movement(&state.current_movement) {
            Some(m) => m.clone(),
            None => {
                let reason = format!("Movement '{}' not found", state.current_movement);
                self.log.piece_abort(&reason)?;
                return Ok(Tick::Finished(PieceStatus::Failed, Some(reason)));
            }
        };

        state.iteration += 1;
        *state
            .movement_iterations
            .entry(movement.name.clone())
            .or_insert(0) += 1;

        if state.iteration > self.piece.max_movements {
            let reason = "Max movements reached".to_string();
            warn!("Piece '{}': {}", self.piece.name, reason);
            self.log.piece_abort(&reason)?;
            return Ok(Tick::Finished(PieceStatus::Aborted, Some(reason)));
        }

        self.log.step_start(&movement.name, state.iteration)?;

        let (response, sub_results) = self.execute(&movement, state).await;

        // Sub-movement records land strictly before the parent's.
        for (name, sub) in &sub_results {
            self.log.step_complete(name, &sub.content)?;
        }
        self.log.step_complete(&movement.name, &response.content)?;
        state
            .movement_outputs
            .insert(movement.name.clone(), response.clone());
        if let Some(session_id) = &response.session_id {
            state
                .persona_sessions
                .insert(response.persona.clone(), session_id.clone());
        }

        if response.status == AgentStatus::Error {
            let reason = response
                .error
                .clone()
                .unwrap_or_else(|| "movement failed".to_string());
            self.log.piece_abort(&reason)?;
            let status = if reason == "aborted" {
                PieceStatus::Aborted
            } else {
                PieceStatus::Failed
            };
            return Ok(Tick::Finished(status, Some(reason)));
        }

        if movement.output_contract.is_some() {
            self.observe_health(&movement, state, &response).await?;
        }

        let matched = response.matched_rule_index;
        self.record_analytics(&movement, matched);

        let Some(index) = matched else {
            let reason = "No matching rule".to_string();
            self.log.piece_abort(&reason)?;
            return Ok(Tick::Finished(PieceStatus::Aborted, Some(reason)));
        };

        match &movement.rules[index].next {
            Transition::Complete => {
                self.log.piece_complete()?;
                info!("Piece '{}' completed", self.piece.name);
                Ok(Tick::Finished(PieceStatus::Completed, None))
            }
            Transition::Abort => {
                let reason = format!("Aborted by rule '{}'", movement.rules[index].condition);
                self.log.piece_abort(&reason)?;
                Ok(Tick::Finished(PieceStatus::Aborted, Some(reason)))
            }
            Transition::Next(next) => {
                state.current_movement = next.clone();
                self.push_history(movement.name.clone());
                if let Some(verdict) = self.check_loop_monitors(state).await? {
                    return Ok(verdict);
                }
                Ok(Tick::Continue)
            }
        }
    }

    /// Dispatch by movement kind.
    async fn execute(
        &self,
        movement: &Movement,
        state: &PieceState,
    ) -> (AgentResponse, Vec<(String, AgentResponse)>) {
        if let Some(config) = &movement.team_leader {
            let result =
                team::run_team_leader(&self.engine, &self.piece, movement, state, config).await;
            return (result.response, result.sub_results);
        }
        if !movement.parallel.is_empty() {
            let result = team::run_static_parallel(&self.engine, &self.piece, movement, state).await;
            return (result.response, result.sub_results);
        }
        (
            self.engine.run_single(&self.piece, movement, state).await,
            vec![],
        )
    }

    fn push_history(&mut self, name: String) {
        self.history.push(name);
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }

    /// Check every loop monitor against the history tail; a triggered monitor
    /// inserts an out-of-band judge movement.
    async fn check_loop_monitors(&mut self, state: &PieceState) -> Result<Option<Tick>, TaktError> {
        let triggered: Option<LoopMonitor> = self
            .piece
            .loop_monitors
            .iter()
            .find(|monitor| tail_repeats(&self.history, &monitor.cycle, monitor.threshold))
            .cloned();

        let Some(monitor) = triggered else {
            return Ok(None);
        };

        let judge_name = monitor.judge_movement_name();
        warn!(
            "Loop monitor triggered for cycle {:?}; consulting '{}'",
            monitor.cycle, judge_name
        );

        // Accumulated conversation of the cycling movements as judge context.
        let mut context = String::new();
        for name in &monitor.cycle {
            if let Some(output) = state.movement_outputs.get(name) {
                context.push_str(&format!("### {}\n{}\n\n", name, output.content));
            }
        }
        let prompt = format!(
            "The movements {:?} have repeated {} times. Decide whether this \
             cycle is making real progress.\n\n{}\
             Answer with STATUS: CONTINUE or STATUS: ABORT.",
            monitor.cycle, monitor.threshold, context
        );

        let judge_persona = crate::piece::facet::builtin_facet(
            crate::piece::facet::FacetKind::Persona,
            "judge",
        );

        self.log.step_start(&judge_name, state.iteration)?;
        let current = self
            .piece
            .get_movement(&state.current_movement)
            .cloned()
            .unwrap_or_else(|| self.piece.movements[0].clone());
        let judgment = self
            .engine
            .run_named_aux(&self.piece, &current, &judge_name, "judge", judge_persona, &prompt)
            .await?;
        self.log.step_complete(&judge_name, &judgment.content)?;

        let verdict = extract_status_line(&judgment.content)
            .unwrap_or_else(|| judgment.content.clone())
            .to_uppercase();

        if verdict.contains("ABORT") {
            let reason = "loop_detected".to_string();
            self.log.piece_abort(&reason)?;
            return Ok(Some(Tick::Finished(PieceStatus::Aborted, Some(reason))));
        }

        // Productive cycle: clear the counter and stay on the same movement.
        info!("Judge allowed the cycle to continue");
        self.history.clear();
        Ok(None)
    }

    async fn observe_health(
        &mut self,
        movement: &Movement,
        state: &PieceState,
        response: &AgentResponse,
    ) -> Result<(), TaktError> {
        let ids = crate::analytics::extract_finding_ids(&response.content);
        let mut snapshot = self.tracker.observe(
            &movement.name,
            state.iteration,
            self.piece.max_movements,
            &ids,
            false,
        );

        if self.alignment_check {
            let misaligned = self.run_alignment_check(movement, response).await;
            apply_alignment_verdict(&mut snapshot, misaligned);
        }

        self.log_health(&snapshot)?;

        if let Some(analytics) = &self.analytics {
            let _ = analytics.review_findings(&self.piece.name, &response.content);
            // Findings that were active last round and are gone now were
            // fixed in between.
            for id in &self.active_findings {
                if !ids.contains(id) {
                    let _ = analytics.fix_action(id, crate::analytics::FixAction::Fixed);
                }
            }
        }
        self.active_findings = ids;
        Ok(())
    }

    /// Secondary LLM pass comparing findings against fixes. Forced readonly;
    /// any failure counts as "aligned" so it can never break a run.
    async fn run_alignment_check(&self, movement: &Movement, response: &AgentResponse) -> bool {
        let prompt = format!(
            "Compare the review findings and the fixes described below. Reply \
             STATUS: MISALIGNED if the fixes do not address the findings, \
             otherwise STATUS: ALIGNED.\n\n{}",
            response.content
        );
        match self
            .engine
            .run_aux(&self.piece, movement, "judge", None, &prompt)
            .await
        {
            Ok(result) => extract_status_line(&result.content)
                .map(|s| s.to_uppercase().contains("MISALIGNED"))
                .unwrap_or(false),
            Err(e) => {
                warn!("Alignment check failed: {}", e);
                false
            }
        }
    }

    fn log_health(&mut self, snapshot: &HealthSnapshot) -> Result<(), TaktError> {
        self.log.append(
            crate::session::TYPE_HEALTH,
            serde_json::json!({
                "step": snapshot.movement_name,
                "iteration": snapshot.iteration,
                "verdict": snapshot.verdict,
                "findings": snapshot.findings,
            }),
        )
    }

    fn record_analytics(&self, movement: &Movement, matched: Option<usize>) {
        if let Some(analytics) = &self.analytics {
            let outcome = matched
                .and_then(|i| movement.rules.get(i))
                .map(|r| r.condition.clone())
                .unwrap_or_else(|| "no_match".to_string());
            let _ = analytics.movement_result(&self.piece.name, &movement.name, &outcome);
        }
    }
}

/// Whether the tail of `history` is `pattern` repeated at least `threshold`
/// times.
fn tail_repeats(history: &[String], pattern: &[String], threshold: u32) -> bool {
    if pattern.is_empty() || threshold == 0 {
        return false;
    }
    let needed = pattern.len() * threshold as usize;
    if history.len() < needed {
        return false;
    }
    let tail = &history[history.len() - needed..];
    tail.chunks(pattern.len()).all(|chunk| chunk == pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_tail_repeats_detection() {
        let history = strings(&["plan", "review", "fix", "review", "fix"]);
        let pattern = strings(&["review", "fix"]);
        assert!(tail_repeats(&history, &pattern, 2));
        assert!(!tail_repeats(&history, &pattern, 3));
    }

    #[test]
    fn test_tail_repeats_needs_exact_tail() {
        let history = strings(&["review", "fix", "plan"]);
        let pattern = strings(&["review", "fix"]);
        assert!(!tail_repeats(&history, &pattern, 1));
    }

    #[test]
    fn test_tail_repeats_short_history() {
        let history = strings(&["review"]);
        let pattern = strings(&["review", "fix"]);
        assert!(!tail_repeats(&history, &pattern, 1));
    }

    #[test]
    fn test_tail_repeats_single_movement_cycle() {
        let history = strings(&["fix", "fix", "fix"]);
        let pattern = strings(&["fix"]);
        assert!(tail_repeats(&history, &pattern, 3));
        assert!(!tail_repeats(&history, &pattern, 4));
    }
}
