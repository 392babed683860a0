//! Fan-out movements: static parallel and the team-leader worker pool.
//!
//! Static parallel launches every declared sub-movement concurrently and
//! aggregates the ordered results. The team-leader mode first asks a leader
//! persona to decompose the task into parts, then drains them through a
//! bounded pool with threshold-triggered refills, re-invoking the leader when
//! its plan declared the work unfinished.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::movement::{detect_outcome, MovementEngine};
use crate::piece::{
    AgentResponse, AgentStatus, Movement, Piece, PieceState, TeamLeaderConfig,
};

/// One unit of work produced by the leader's decomposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    pub title: String,
    pub instruction: String,
}

/// A completed part with its worker response.
#[derive(Debug, Clone)]
pub struct PartResult {
    pub part: Part,
    pub response: AgentResponse,
}

/// Parsed leader plan.
#[derive(Debug, Clone)]
pub struct LeaderPlan {
    pub parts: Vec<Part>,
    /// The continuation marker: the leader stated the work is not done
    pub wants_more: bool,
}

/// Outcome of a fan-out movement: the parent response plus the per-sub
/// responses in emission order (for sub step_complete records).
pub struct FanOutResult {
    pub response: AgentResponse,
    pub sub_results: Vec<(String, AgentResponse)>,
}

/// Launch all declared sub-movements concurrently. Results keep the declared
/// order; aggregate rules then decide the parent outcome.
pub async fn run_static_parallel(
    engine: &MovementEngine,
    piece: &Piece,
    movement: &Movement,
    state: &PieceState,
) -> FanOutResult {
    let persona = movement
        .persona
        .clone()
        .unwrap_or_else(|| "parallel".to_string());

    let futures = movement
        .parallel
        .iter()
        .map(|sub| engine.run_single(piece, sub, state));
    let responses: Vec<AgentResponse> = futures::future::join_all(futures).await;

    if let Some(failed) = responses.iter().find(|r| r.status == AgentStatus::Error) {
        let error = failed
            .error
            .clone()
            .unwrap_or_else(|| "sub-movement failed".to_string());
        return FanOutResult {
            response: AgentResponse::failed(persona, error),
            sub_results: pair_names(&movement.parallel, responses),
        };
    }

    let matched_conditions: Vec<Option<String>> = movement
        .parallel
        .iter()
        .zip(responses.iter())
        .map(|(sub, response)| {
            response
                .matched_rule_index
                .and_then(|i| sub.rules.get(i))
                .map(|rule| rule.condition.clone())
        })
        .collect();

    let mut sections = Vec::new();
    for (sub, response) in movement.parallel.iter().zip(responses.iter()) {
        let title = sub.persona.as_deref().unwrap_or(sub.name.as_str());
        sections.push(format!("## {}: {}\n{}", sub.name, title, response.content));
    }
    let content = sections.join("\n\n");

    let mut response = AgentResponse::done(persona, content);
    response.matched_rule_index =
        detect_outcome(&response.content, movement, Some(&matched_conditions));

    FanOutResult {
        response,
        sub_results: pair_names(&movement.parallel, responses),
    }
}

fn pair_names(subs: &[Movement], responses: Vec<AgentResponse>) -> Vec<(String, AgentResponse)> {
    subs.iter()
        .map(|s| s.name.clone())
        .zip(responses)
        .collect()
}

/// Run a team-leader movement: decompose, drain the pool, refill, aggregate.
pub async fn run_team_leader(
    engine: &MovementEngine,
    piece: &Piece,
    movement: &Movement,
    state: &PieceState,
    config: &TeamLeaderConfig,
) -> FanOutResult {
    let persona = movement
        .persona
        .clone()
        .unwrap_or_else(|| "team-leader".to_string());

    // Phase 1: decomposition.
    let leader_response = engine.run_single(piece, movement, state).await;
    if leader_response.status == AgentStatus::Error {
        let error = leader_response
            .error
            .clone()
            .unwrap_or_else(|| "leader failed".to_string());
        return FanOutResult {
            response: AgentResponse::failed(persona, error),
            sub_results: vec![],
        };
    }

    let mut plan = parse_leader_plan(&leader_response.content);
    let cap = config.cumulative_cap() as usize;
    if plan.parts.len() > config.max_parts as usize {
        warn!(
            "Leader proposed {} parts, truncating to max_parts={}",
            plan.parts.len(),
            config.max_parts
        );
        plan.parts.truncate(config.max_parts as usize);
    }

    if plan.parts.is_empty() {
        return FanOutResult {
            response: AgentResponse::failed(persona, "leader produced no parts"),
            sub_results: vec![],
        };
    }

    let mut all_parts = plan.parts.clone();
    let mut results: Vec<Option<PartResult>> = Vec::new();
    let mut wants_more = plan.wants_more;

    // Phases 2-3: pool execution with leader refills under the hard cap.
    loop {
        let round_start = results.len();
        results.resize(all_parts.len(), None);
        if let Err(error) = run_pool(
            engine,
            piece,
            state,
            config,
            &all_parts,
            round_start,
            &mut results,
        )
        .await
        {
            return FanOutResult {
                response: AgentResponse::failed(persona, error),
                sub_results: collect_sub_results(&results),
            };
        }

        if !wants_more || all_parts.len() >= cap {
            if wants_more {
                warn!(
                    "Leader requested more parts but the cumulative cap ({}) is reached",
                    cap
                );
            }
            break;
        }

        // Refill: ask the leader for more parts, with prior titles as context.
        let done_titles: Vec<String> = all_parts.iter().map(|p| p.title.clone()).collect();
        let refill_prompt = format!(
            "The following parts are complete:\n{}\n\nPlan the remaining work. \
             Use the same DECOMPOSITION: format, or reply CONTINUE: no if everything is done.",
            done_titles
                .iter()
                .map(|t| format!("- {t}"))
                .collect::<Vec<_>>()
                .join("\n")
        );
        let refill = match engine
            .run_aux(piece, movement, &persona, movement.facets.persona.as_deref(), &refill_prompt)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return FanOutResult {
                    response: AgentResponse::failed(persona, e.to_string()),
                    sub_results: collect_sub_results(&results),
                };
            }
        };

        let mut next_plan = parse_leader_plan(&refill.content);
        if next_plan.parts.len() > config.max_parts as usize {
            next_plan.parts.truncate(config.max_parts as usize);
        }
        let room = cap.saturating_sub(all_parts.len());
        next_plan.parts.truncate(room);

        if next_plan.parts.is_empty() {
            break;
        }
        info!("Leader refill added {} part(s)", next_plan.parts.len());
        all_parts.extend(next_plan.parts);
        wants_more = next_plan.wants_more;
    }

    // Phase 4: aggregation, in the leader's declared order (refills after).
    let completed: Vec<&PartResult> = results.iter().flatten().collect();
    let mut content = format!("## decomposition\n{}", leader_response.content.trim_end());
    for result in &completed {
        content.push_str(&format!(
            "\n\n## {}: {}\n{}",
            result.part.id, result.part.title, result.response.content
        ));
    }

    let mut response = AgentResponse::done(persona, content);
    response.matched_rule_index = detect_outcome(&response.content, movement, None);

    FanOutResult {
        response,
        sub_results: collect_sub_results(&results),
    }
}

fn collect_sub_results(results: &[Option<PartResult>]) -> Vec<(String, AgentResponse)> {
    results
        .iter()
        .flatten()
        .map(|r| (r.part.id.clone(), r.response.clone()))
        .collect()
}

/// Drain `parts[start..]` through a pool of `max_parts` workers. When a
/// running part completes and occupancy falls to or below the refill
/// threshold, the next undispatched part starts. A failing part cancels the
/// rest of the pool.
async fn run_pool(
    engine: &MovementEngine,
    piece: &Piece,
    state: &PieceState,
    config: &TeamLeaderConfig,
    parts: &[Part],
    start: usize,
    results: &mut [Option<PartResult>],
) -> Result<(), String> {
    let pool_cancel = CancellationToken::new();
    let pool_engine = engine.with_cancel(pool_cancel.clone());
    let threshold = config.effective_refill_threshold() as usize;

    let mut pool: FuturesUnordered<BoxFuture<'_, (usize, AgentResponse)>> =
        FuturesUnordered::new();
    let mut next = start;

    while next < parts.len() && pool.len() < config.max_parts as usize {
        pool.push(dispatch_part(&pool_engine, piece, state, config, parts, next));
        next += 1;
    }

    while let Some((index, response)) = pool.next().await {
        if response.status == AgentStatus::Error {
            let error = response
                .error
                .clone()
                .unwrap_or_else(|| format!("part '{}' failed", parts[index].id));
            pool_cancel.cancel();
            // Drain the cancelled siblings so their subprocesses are gone.
            while pool.next().await.is_some() {}
            return Err(error);
        }

        debug!("Part '{}' completed", parts[index].id);
        results[index] = Some(PartResult {
            part: parts[index].clone(),
            response,
        });

        if next < parts.len() && pool.len() <= threshold {
            pool.push(dispatch_part(&pool_engine, piece, state, config, parts, next));
            next += 1;
        }
    }

    Ok(())
}

fn dispatch_part<'a>(
    engine: &'a MovementEngine,
    piece: &'a Piece,
    state: &'a PieceState,
    config: &'a TeamLeaderConfig,
    parts: &'a [Part],
    index: usize,
) -> BoxFuture<'a, (usize, AgentResponse)> {
    Box::pin(async move {
        let part = &parts[index];
        let worker = Movement {
            name: part.id.clone(),
            persona: config.part_persona.clone(),
            instruction: part.instruction.clone(),
            pass_previous_response: false,
            rules: vec![],
            parallel: vec![],
            team_leader: None,
            permission_mode: config.part_permission_mode,
            tools: config.part_allowed_tools.clone(),
            provider: None,
            model: None,
            policy: None,
            knowledge: None,
            output_contract: None,
            quality_gates: vec![],
            facets: Default::default(),
        };
        let response = engine.run_single(piece, &worker, state).await;
        (index, response)
    })
}

/// Parse the leader's plan.
///
/// After a `DECOMPOSITION:` marker line, one part per line in the form
/// `id | title | instruction`. A `CONTINUE: yes` line is the continuation
/// marker.
pub fn parse_leader_plan(content: &str) -> LeaderPlan {
    let mut parts = Vec::new();
    let mut wants_more = false;
    let mut in_plan = false;

    for line in content.lines() {
        let trimmed = line.trim();
        let lower = trimmed.to_lowercase();

        if lower.starts_with("decomposition:") {
            in_plan = true;
            continue;
        }
        if lower.starts_with("continue:") {
            wants_more = lower.contains("yes");
            continue;
        }
        if !in_plan {
            continue;
        }

        let fields: Vec<&str> = trimmed
            .trim_start_matches('-')
            .trim()
            .splitn(3, '|')
            .map(str::trim)
            .collect();
        if fields.len() == 3 && !fields[0].is_empty() {
            parts.push(Part {
                id: fields[0].to_string(),
                title: fields[1].to_string(),
                instruction: fields[2].to_string(),
            });
        }
    }

    LeaderPlan { parts, wants_more }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_leader_plan_basic() {
        let content = "\
I split the work as follows.

DECOMPOSITION:
p1 | Create module A | Write src/a.rs with the parser
p2 | Create module B | Write src/b.rs with the writer

CONTINUE: no
";
        let plan = parse_leader_plan(content);
        assert_eq!(plan.parts.len(), 2);
        assert_eq!(plan.parts[0].id, "p1");
        assert_eq!(plan.parts[0].title, "Create module A");
        assert!(plan.parts[1].instruction.contains("src/b.rs"));
        assert!(!plan.wants_more);
    }

    #[test]
    fn test_parse_leader_plan_continuation() {
        let content = "DECOMPOSITION:\np1 | First | Do the first thing\nCONTINUE: yes\n";
        let plan = parse_leader_plan(content);
        assert_eq!(plan.parts.len(), 1);
        assert!(plan.wants_more);
    }

    #[test]
    fn test_parse_leader_plan_ignores_prose() {
        let content = "Here is my | analysis | with pipes\n\nDECOMPOSITION:\np1 | Title | Inst\n";
        let plan = parse_leader_plan(content);
        assert_eq!(plan.parts.len(), 1);
        assert_eq!(plan.parts[0].id, "p1");
    }

    #[test]
    fn test_parse_leader_plan_bulleted_lines() {
        let content = "DECOMPOSITION:\n- p1 | Title one | Inst one\n- p2 | Title two | Inst two\n";
        let plan = parse_leader_plan(content);
        assert_eq!(plan.parts.len(), 2);
        assert_eq!(plan.parts[1].id, "p2");
    }

    #[test]
    fn test_parse_leader_plan_empty() {
        let plan = parse_leader_plan("No structured plan at all.");
        assert!(plan.parts.is_empty());
        assert!(!plan.wants_more);
    }

    #[test]
    fn test_section_header_pattern_contract() {
        // The `## <part-id>: <part-title>` shape is part of the external
        // contract; consumers grep for it.
        let re = regex::Regex::new(r"(?m)^## [^:\n]+: .+$").unwrap();
        let section = format!("## {}: {}\n{}", "p1", "Create module A", "body");
        assert!(re.is_match(&section));
    }
}
