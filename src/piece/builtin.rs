//! Built-in pieces shipped with the binary.
//!
//! These are stored as YAML so `eject` can copy them verbatim into a
//! project's `.takt/pieces/` directory for customization.

/// Names of standard pieces excluded from hybrid-codex generation.
/// Research has no `coder` persona to repoint.
pub const HYBRID_CODEX_SKIP: &[&str] = &["research"];

pub const SUFFIX_HYBRID_CODEX: &str = "-hybrid-codex";

/// (name, yaml) pairs for every built-in piece.
pub fn builtin_piece_sources() -> &'static [(&'static str, &'static str)] {
    &[
        ("default", PIECE_DEFAULT),
        ("review-fix", PIECE_REVIEW_FIX),
        ("research", PIECE_RESEARCH),
    ]
}

pub fn builtin_piece_source(name: &str) -> Option<&'static str> {
    builtin_piece_sources()
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, yaml)| *yaml)
}

const PIECE_DEFAULT: &str = r#"name: default
description: "Standard development flow: plan, implement, review, fix"
max_movements: 30
initial_movement: plan

movements:
  - name: plan
    persona: planner
    permission_mode: readonly
    instruction: |
      Analyze the following task and produce an ordered implementation plan.

      Task: {task}
    rules:
      - condition: done
        next: implement

  - name: implement
    persona: coder
    permission_mode: edit
    pass_previous_response: true
    instruction: |
      Implement this plan. Keep changes minimal.

      {previous_response}
    rules:
      - condition: done
        next: review
      - condition: blocked
        next: ABORT

  - name: review
    persona: reviewer
    permission_mode: readonly
    output_contract: review-findings
    instruction: |
      Review the changes made for the task below. Write your report under
      .takt/reports/{report_dir}/review.md.

      Task: {task}
    rules:
      - condition: approved
        next: COMPLETE
      - condition: fixes_needed
        next: fix

  - name: fix
    persona: coder
    permission_mode: edit
    pass_previous_response: true
    instruction: |
      Address every finding from this review, then summarize what changed.

      {previous_response}
    rules:
      - condition: done
        next: review

loop_monitors:
  - cycle: [review, fix]
    threshold: 3
"#;

const PIECE_REVIEW_FIX: &str = r#"name: review-fix
description: "Minimal review and fix cycle"
max_movements: 10
initial_movement: review

movements:
  - name: review
    persona: reviewer
    permission_mode: readonly
    output_contract: review-findings
    instruction: |
      Review the current changes for the task: {task}
    rules:
      - condition: fixes_needed
        next: fix
      - condition: approved
        next: COMPLETE

  - name: fix
    persona: coder
    permission_mode: edit
    pass_previous_response: true
    instruction: |
      Fix the findings below.

      {previous_response}
    rules:
      - condition: done
        next: review

loop_monitors:
  - cycle: [review, fix]
    threshold: 2
"#;

const PIECE_RESEARCH: &str = r#"name: research
description: "Read-only investigation producing a report"
max_movements: 10
initial_movement: investigate

movements:
  - name: investigate
    persona: planner
    permission_mode: readonly
    instruction: |
      Investigate the following question and gather evidence from the
      repository. Question: {task}
    rules:
      - condition: done
        next: summarize

  - name: summarize
    persona: reviewer
    permission_mode: readonly
    pass_previous_response: true
    instruction: |
      Summarize the investigation into a report under
      .takt/reports/{report_dir}/research.md.

      {previous_response}
    rules:
      - condition: done
        next: COMPLETE
"#;
