//! Movement execution: prompt assembly, provider invocation, and outcome
//! detection.
//!
//! The engine renders the instruction template, prepends an execution-context
//! header, invokes the resolved provider, and matches the response against
//! the movement's rules in order. Aggregate rules (`all(...)` / `any(...)`)
//! are evaluated over sub-movement outcomes and never against raw content.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::TaktConfig;
use crate::error::TaktError;
use crate::piece::{AgentResponse, Movement, PermissionMode, Piece, PieceState};
use crate::provider::resolve::{self, Layer, ResolutionInputs};
use crate::provider::{AgentInvoker, InvocationRequest, ProviderKind};

/// Per-run context shared by every movement invocation.
#[derive(Clone)]
pub struct ExecutionContext {
    pub project_root: PathBuf,
    /// Where agents actually run (the clone root when isolated)
    pub working_dir: PathBuf,
    pub language: String,
    /// Bare report directory name for `{report_dir}` substitution
    pub report_dir: String,
    pub task: String,
    pub cli_provider: Option<String>,
    pub cli_model: Option<String>,
    pub project_provider: Option<String>,
    pub project_model: Option<String>,
    pub global_provider: Option<String>,
    pub global_model: Option<String>,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(
        config: &TaktConfig,
        working_dir: PathBuf,
        task: String,
        report_dir: String,
        cli_provider: Option<String>,
        cli_model: Option<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            project_root: config.project_root.clone(),
            working_dir,
            language: config.language.clone(),
            report_dir,
            task,
            cli_provider,
            cli_model,
            project_provider: config.project_provider.clone(),
            project_model: config.project_model.clone(),
            global_provider: config.global_provider.clone(),
            global_model: config.global_model.clone(),
            timeout: crate::provider::DEFAULT_TIMEOUT,
            cancel,
        }
    }
}

/// Executes exactly one movement (fan-out movements delegate to
/// [`crate::engine::team`]).
pub struct MovementEngine {
    invoker: Arc<dyn AgentInvoker>,
    pub ctx: ExecutionContext,
}

impl MovementEngine {
    pub fn new(invoker: Arc<dyn AgentInvoker>, ctx: ExecutionContext) -> Self {
        Self { invoker, ctx }
    }

    /// Clone of this engine wired to a different abort token (used by worker
    /// pools so a failing part tears down only its siblings).
    pub fn with_cancel(&self, cancel: CancellationToken) -> MovementEngine {
        let mut ctx = self.ctx.clone();
        ctx.cancel = cancel;
        MovementEngine::new(self.invoker.clone(), ctx)
    }

    /// Run one non-fanout movement and detect its outcome.
    pub async fn run_single(
        &self,
        piece: &Piece,
        movement: &Movement,
        state: &PieceState,
    ) -> AgentResponse {
        let persona = movement.persona.clone().unwrap_or_else(|| "agent".to_string());

        let instruction = self.render_instruction(movement, state);
        let prompt = self.build_prompt(movement, &instruction);

        let (provider, model) = match self.resolve_provider(piece, movement) {
            Ok(pair) => pair,
            Err(e) => return AgentResponse::failed(persona, e.to_string()),
        };

        let request = InvocationRequest {
            movement: movement.name.clone(),
            persona: persona.clone(),
            prompt,
            provider,
            model,
            permission_mode: movement.permission_mode.unwrap_or_default(),
            allowed_tools: movement.tools.clone(),
            working_dir: self.ctx.working_dir.clone(),
            session_id: state.persona_sessions.get(&persona).cloned(),
            timeout: self.ctx.timeout,
            cancel: self.ctx.cancel.clone(),
        };

        let mut response = match self.invoker.invoke(&request).await {
            Ok(reply) => {
                let mut response = AgentResponse::done(persona, reply.content);
                response.session_id = reply.session_id;
                response
            }
            Err(e) if e.is_aborted() => AgentResponse::failed(persona, "aborted"),
            Err(e) => AgentResponse::failed(persona, e.to_string()),
        };

        if response.status == crate::piece::AgentStatus::Done {
            response.matched_rule_index = detect_outcome(&response.content, movement, None);
        }
        response
    }

    /// Auxiliary report/status-judgment call: forced readonly with an empty
    /// allowed-tools set regardless of the movement's configured permissions.
    pub async fn run_aux(
        &self,
        piece: &Piece,
        movement: &Movement,
        persona: &str,
        persona_content: Option<&str>,
        prompt: &str,
    ) -> Result<AgentResponse, TaktError> {
        let (provider, model) = self.resolve_provider(piece, movement)?;

        let mut full_prompt = String::new();
        if let Some(content) = persona_content {
            full_prompt.push_str(content);
            full_prompt.push_str("\n\n");
        }
        full_prompt.push_str(prompt);

        let request = InvocationRequest {
            movement: movement.name.clone(),
            persona: persona.to_string(),
            prompt: full_prompt,
            provider,
            model,
            permission_mode: PermissionMode::Readonly,
            allowed_tools: vec![],
            working_dir: self.ctx.working_dir.clone(),
            session_id: None,
            timeout: self.ctx.timeout,
            cancel: self.ctx.cancel.clone(),
        };

        let reply = self.invoker.invoke(&request).await?;
        Ok(AgentResponse::done(persona, reply.content))
    }

    /// Invoke with an explicit movement name (used by judge insertions so the
    /// mock provider and the session log see the synthetic step name).
    pub async fn run_named_aux(
        &self,
        piece: &Piece,
        movement: &Movement,
        step_name: &str,
        persona: &str,
        persona_content: Option<&str>,
        prompt: &str,
    ) -> Result<AgentResponse, TaktError> {
        let mut named = movement.clone();
        named.name = step_name.to_string();
        self.run_aux(piece, &named, persona, persona_content, prompt).await
    }

    /// Resolve the effective (provider, model) for a movement.
    pub fn resolve_provider(
        &self,
        piece: &Piece,
        movement: &Movement,
    ) -> Result<(ProviderKind, Option<String>), TaktError> {
        let persona = piece.persona_override(movement);
        let inputs = ResolutionInputs {
            cli: Layer {
                provider: self.ctx.cli_provider.as_deref(),
                model: self.ctx.cli_model.as_deref(),
            },
            persona: Layer {
                provider: persona.and_then(|p| p.provider.as_deref()),
                model: persona.and_then(|p| p.model.as_deref()),
            },
            movement: Layer {
                provider: movement.provider.as_deref(),
                model: movement.model.as_deref(),
            },
            project: Layer {
                provider: self.ctx.project_provider.as_deref(),
                model: self.ctx.project_model.as_deref(),
            },
            global: Layer {
                provider: self.ctx.global_provider.as_deref(),
                model: self.ctx.global_model.as_deref(),
            },
        };
        let resolved = resolve::resolve(&inputs);
        let kind = ProviderKind::parse(&resolved.provider).ok_or_else(|| {
            TaktError::validation(format!("Unknown provider '{}'", resolved.provider))
        })?;
        debug!(
            "Movement '{}' resolved to provider={} model={:?}",
            movement.name,
            kind.name(),
            resolved.model
        );
        Ok((kind, resolved.model))
    }

    /// Substitute instruction placeholders.
    ///
    /// `{report_dir}` inside a `.takt/reports/...` path expands to the
    /// absolute path under the project root (not the clone root); standalone
    /// it expands to the bare directory name.
    pub fn render_instruction(&self, movement: &Movement, state: &PieceState) -> String {
        let step_iteration = state
            .movement_iterations
            .get(&movement.name)
            .copied()
            .unwrap_or(0)
            .max(1);

        let previous = if movement.pass_previous_response {
            state
                .movement_outputs
                .values()
                .max_by_key(|r| r.timestamp)
                .map(|r| r.content.clone())
                .unwrap_or_default()
        } else {
            String::new()
        };

        let absolute_reports = format!(
            "{}/.takt/reports/{}",
            self.ctx.project_root.display(),
            self.ctx.report_dir
        );

        movement
            .instruction
            .replace(".takt/reports/{report_dir}", &absolute_reports)
            .replace("{report_dir}", &self.ctx.report_dir)
            .replace("{task}", &self.ctx.task)
            .replace("{iteration}", &state.iteration.to_string())
            .replace("{step_iteration}", &step_iteration.to_string())
            .replace("{previous_response}", &previous)
    }

    /// Assemble the full prompt: execution context, persona, knowledge,
    /// instruction, policy, output contract, quality gates, and the status
    /// tag instructions derived from the rules.
    pub fn build_prompt(&self, movement: &Movement, instruction: &str) -> String {
        let mut parts = Vec::new();

        // Never include the project root here; agents inside a clone must not
        // be tempted to write back into the original working copy.
        parts.push(format!(
            "## Execution Context\n\nWorking directory: {}\nLanguage: {}",
            self.ctx.working_dir.display(),
            self.ctx.language
        ));

        if let Some(persona) = &movement.facets.persona {
            parts.push(persona.trim_end().to_string());
        }
        if let Some(knowledge) = &movement.facets.knowledge {
            parts.push(format!("## Context\n\n{}", knowledge.trim_end()));
        }

        parts.push(format!("## Task\n\n{}", instruction.trim_end()));

        if let Some(policy) = &movement.facets.policy {
            parts.push(format!("## Constraints\n\n{}", policy.trim_end()));
        }
        if !movement.quality_gates.is_empty() {
            let gates: Vec<String> = movement
                .quality_gates
                .iter()
                .map(|g| format!("- {g}"))
                .collect();
            parts.push(format!("## Quality Gates\n\n{}", gates.join("\n")));
        }
        if let Some(contract) = &movement.facets.output_contract {
            parts.push(format!("## Output Format\n\n{}", contract.trim_end()));
        }

        if !movement.rules.is_empty() {
            parts.push(status_tag_instructions(movement));
        }

        parts.join("\n\n")
    }
}

/// Tell the agent which status tags route where.
fn status_tag_instructions(movement: &Movement) -> String {
    let mut lines = vec![
        "## Status".to_string(),
        String::new(),
        "End your response with exactly one status line:".to_string(),
    ];
    for rule in &movement.rules {
        if parse_aggregate(&rule.condition).is_none() {
            lines.push(format!("STATUS: {}", rule.condition));
        }
    }
    lines.join("\n")
}

/// Match the response content against the movement's rules in order; the
/// first matching rule wins. `sub_outcomes` carries each sub-movement's
/// matched condition text for aggregate evaluation.
pub fn detect_outcome(
    content: &str,
    movement: &Movement,
    sub_outcomes: Option<&[Option<String>]>,
) -> Option<usize> {
    let status_line = extract_status_line(content);

    for (index, rule) in movement.rules.iter().enumerate() {
        if let Some(aggregate) = parse_aggregate(&rule.condition) {
            if let Some(subs) = sub_outcomes {
                if evaluate_aggregate(&aggregate, subs) {
                    return Some(index);
                }
            }
            continue;
        }

        if condition_matches(&rule.condition, content, status_line.as_deref()) {
            return Some(index);
        }
    }
    None
}

/// The dedicated status line: the last `STATUS:` line of the document.
pub fn extract_status_line(content: &str) -> Option<String> {
    content
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| {
            let lower = line.to_lowercase();
            lower.starts_with("status:") || lower.starts_with("status :")
        })
        .and_then(|line| line.splitn(2, ':').nth(1))
        .map(|s| s.trim().to_string())
}

/// Case-insensitive substring on the status line, else regex over the
/// document.
fn condition_matches(condition: &str, content: &str, status_line: Option<&str>) -> bool {
    if let Some(status) = status_line {
        if status.to_lowercase().contains(&condition.to_lowercase()) {
            return true;
        }
    }

    match regex::RegexBuilder::new(condition).case_insensitive(true).build() {
        Ok(re) => re.is_match(content),
        Err(_) => {
            warn!("Condition '{}' is not a valid regex, using substring", condition);
            content.to_lowercase().contains(&condition.to_lowercase())
        }
    }
}

/// Aggregate condition kinds for parallel parents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateKind {
    All,
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateCondition {
    pub kind: AggregateKind,
    pub tags: Vec<String>,
    /// Whether the list form `all([a, b])` was used
    pub multi: bool,
}

/// Parse `all(tag)`, `all([t1, t2])`, `any(tag)`, `any([t1, t2])`.
pub fn parse_aggregate(condition: &str) -> Option<AggregateCondition> {
    let trimmed = condition.trim();
    let (kind, inner) = if let Some(inner) = strip_call(trimmed, "all") {
        (AggregateKind::All, inner)
    } else if let Some(inner) = strip_call(trimmed, "any") {
        (AggregateKind::Any, inner)
    } else {
        return None;
    };

    let inner = inner.trim();
    if let Some(list) = inner.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        let tags: Vec<String> = list
            .split(',')
            .map(|t| strip_quotes(t.trim()).to_string())
            .filter(|t| !t.is_empty())
            .collect();
        Some(AggregateCondition {
            kind,
            tags,
            multi: true,
        })
    } else {
        Some(AggregateCondition {
            kind,
            tags: vec![strip_quotes(inner).to_string()],
            multi: false,
        })
    }
}

fn strip_call<'a>(input: &'a str, name: &str) -> Option<&'a str> {
    input
        .strip_prefix(name)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
}

fn strip_quotes(input: &str) -> &str {
    input
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| input.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(input)
}

/// Evaluate an aggregate over the sub-movements' matched condition texts.
/// When no sub-movement matched anything, aggregates yield no match.
pub fn evaluate_aggregate(aggregate: &AggregateCondition, subs: &[Option<String>]) -> bool {
    if subs.iter().all(Option::is_none) {
        return false;
    }

    match (&aggregate.kind, aggregate.multi) {
        (AggregateKind::All, false) => {
            let tag = &aggregate.tags[0];
            !subs.is_empty() && subs.iter().all(|s| s.as_deref() == Some(tag.as_str()))
        }
        (AggregateKind::All, true) => {
            // Order-aligned pairwise equality; lengths must match exactly.
            aggregate.tags.len() == subs.len()
                && aggregate
                    .tags
                    .iter()
                    .zip(subs.iter())
                    .all(|(tag, sub)| sub.as_deref() == Some(tag.as_str()))
        }
        (AggregateKind::Any, false) => {
            let tag = &aggregate.tags[0];
            subs.iter().any(|s| s.as_deref() == Some(tag.as_str()))
        }
        (AggregateKind::Any, true) => subs.iter().any(|s| {
            s.as_deref()
                .map(|matched| aggregate.tags.iter().any(|t| t == matched))
                .unwrap_or(false)
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::{Rule, Transition};

    fn movement_with_rules(conditions: &[&str]) -> Movement {
        Movement {
            name: "m".to_string(),
            persona: None,
            instruction: String::new(),
            pass_previous_response: false,
            rules: conditions
                .iter()
                .map(|c| Rule {
                    condition: c.to_string(),
                    next: Transition::Complete,
                })
                .collect(),
            parallel: vec![],
            team_leader: None,
            permission_mode: None,
            tools: vec![],
            provider: None,
            model: None,
            policy: None,
            knowledge: None,
            output_contract: None,
            quality_gates: vec![],
            facets: Default::default(),
        }
    }

    #[test]
    fn test_status_line_extraction() {
        let content = "Work done.\nSTATUS: approved\n";
        assert_eq!(extract_status_line(content).as_deref(), Some("approved"));

        let content = "intermediate\nstatus: fixes_needed\nmore text\nSTATUS: approved";
        assert_eq!(extract_status_line(content).as_deref(), Some("approved"));

        assert_eq!(extract_status_line("no status here"), None);
    }

    #[test]
    fn test_detect_outcome_status_line_first_match_wins() {
        let movement = movement_with_rules(&["approved", "fixes_needed"]);
        let content = "Review complete.\nSTATUS: fixes_needed";
        assert_eq!(detect_outcome(content, &movement, None), Some(1));
    }

    #[test]
    fn test_detect_outcome_case_insensitive() {
        let movement = movement_with_rules(&["APPROVED"]);
        let content = "STATUS: Approved";
        assert_eq!(detect_outcome(content, &movement, None), Some(0));
    }

    #[test]
    fn test_detect_outcome_regex_over_document() {
        let movement = movement_with_rules(&[r"tests? (are )?passing"]);
        let content = "All 14 tests are passing now.";
        assert_eq!(detect_outcome(content, &movement, None), Some(0));
    }

    #[test]
    fn test_detect_outcome_no_match() {
        let movement = movement_with_rules(&["approved"]);
        assert_eq!(detect_outcome("STATUS: rejected", &movement, None), None);
    }

    #[test]
    fn test_parse_aggregate_forms() {
        let parsed = parse_aggregate("all(approved)").unwrap();
        assert_eq!(parsed.kind, AggregateKind::All);
        assert_eq!(parsed.tags, vec!["approved"]);
        assert!(!parsed.multi);

        let parsed = parse_aggregate("all([a, b, c])").unwrap();
        assert!(parsed.multi);
        assert_eq!(parsed.tags, vec!["a", "b", "c"]);

        let parsed = parse_aggregate("any(\"rejected\")").unwrap();
        assert_eq!(parsed.kind, AggregateKind::Any);
        assert_eq!(parsed.tags, vec!["rejected"]);

        assert!(parse_aggregate("approved").is_none());
        assert!(parse_aggregate("allow_this").is_none());
    }

    #[test]
    fn test_aggregate_all_single() {
        let agg = parse_aggregate("all(done)").unwrap();
        let subs = vec![Some("done".to_string()), Some("done".to_string())];
        assert!(evaluate_aggregate(&agg, &subs));

        let subs = vec![Some("done".to_string()), Some("failed".to_string())];
        assert!(!evaluate_aggregate(&agg, &subs));
    }

    #[test]
    fn test_aggregate_all_multi_requires_matching_lengths() {
        let agg = parse_aggregate("all([a, b])").unwrap();
        assert!(evaluate_aggregate(
            &agg,
            &[Some("a".to_string()), Some("b".to_string())]
        ));
        // Order matters
        assert!(!evaluate_aggregate(
            &agg,
            &[Some("b".to_string()), Some("a".to_string())]
        ));
        // Length mismatch
        assert!(!evaluate_aggregate(
            &agg,
            &[Some("a".to_string()), Some("b".to_string()), Some("a".to_string())]
        ));
    }

    #[test]
    fn test_aggregate_any() {
        let agg = parse_aggregate("any(failed)").unwrap();
        assert!(evaluate_aggregate(
            &agg,
            &[Some("done".to_string()), Some("failed".to_string())]
        ));
        assert!(!evaluate_aggregate(&agg, &[Some("done".to_string()), None]));

        let agg = parse_aggregate("any([x, y])").unwrap();
        assert!(evaluate_aggregate(&agg, &[Some("y".to_string())]));
    }

    #[test]
    fn test_aggregate_no_sub_matches_yields_no_match() {
        let agg = parse_aggregate("all(done)").unwrap();
        assert!(!evaluate_aggregate(&agg, &[None, None]));
        let agg = parse_aggregate("any(done)").unwrap();
        assert!(!evaluate_aggregate(&agg, &[None, None]));
    }

    #[test]
    fn test_aggregate_rules_skip_content_matching() {
        let mut movement = movement_with_rules(&["all(done)", "done"]);
        movement.parallel.push(movement_with_rules(&["done"]));
        // Content mentions all(done) textually, but without sub outcomes the
        // aggregate cannot match; the plain rule still can.
        let content = "STATUS: done";
        assert_eq!(detect_outcome(content, &movement, None), Some(1));
    }
}
