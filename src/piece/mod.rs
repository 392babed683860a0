//! Piece/Movement data model.
//!
//! A **Piece** is a declarative YAML-defined state machine containing:
//! - Named **Movements** (agent invocations with persona/provider/instruction)
//! - **Rules** for conditional routing between movements
//! - **Loop monitors** for runtime cycle detection
//!
//! Example YAML:
//! ```yaml
//! name: default
//! max_movements: 30
//! initial_movement: plan
//!
//! movements:
//!   - name: plan
//!     persona: planner
//!     instruction: "Analyze {task} and produce a plan"
//!     rules:
//!       - condition: done
//!         next: implement
//!   - name: implement
//!     persona: coder
//!     instruction: "Implement the plan"
//!     rules:
//!       - condition: done
//!         next: COMPLETE
//! ```
//!
//! Rule targets are normalized into [`Transition`] at parse time, so a loaded
//! piece can only transition to another movement, `COMPLETE`, or `ABORT`.

pub mod builtin;
pub mod facet;
pub mod loader;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A Piece is a complete state machine definition loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Piece {
    /// Piece name (unique identifier)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Iteration cap: total movement executions before abort
    #[serde(default = "default_max_movements")]
    pub max_movements: u32,

    /// Name of the first movement to execute
    pub initial_movement: String,

    /// Movements in declaration order
    pub movements: Vec<Movement>,

    /// Runtime cycle-detection rules
    #[serde(default)]
    pub loop_monitors: Vec<LoopMonitor>,

    /// Per-persona overrides (provider/model pinning)
    #[serde(default)]
    pub personas: HashMap<String, PersonaOverride>,
}

fn default_max_movements() -> u32 {
    30
}

/// One node of the state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Movement {
    /// Unique movement name within the piece
    pub name: String,

    /// Display identity; also keys into the piece-level persona overrides
    #[serde(default)]
    pub persona: Option<String>,

    /// Instruction template with `{task}`, `{iteration}`, `{step_iteration}`,
    /// `{report_dir}`, `{previous_response}` placeholders
    #[serde(default)]
    pub instruction: String,

    /// Whether `{previous_response}` is fed from the preceding movement
    #[serde(default)]
    pub pass_previous_response: bool,

    /// Routing rules, first-match-wins
    #[serde(default)]
    pub rules: Vec<Rule>,

    /// Sub-movements executed concurrently (static fan-out)
    #[serde(default)]
    pub parallel: Vec<Movement>,

    /// Worker-pool decomposition config
    #[serde(default)]
    pub team_leader: Option<TeamLeaderConfig>,

    /// Permission level for the agent invocation
    #[serde(default)]
    pub permission_mode: Option<PermissionMode>,

    /// Tools granted to the agent invocation
    #[serde(default)]
    pub tools: Vec<String>,

    /// Provider override for this movement
    #[serde(default)]
    pub provider: Option<String>,

    /// Model override for this movement
    #[serde(default)]
    pub model: Option<String>,

    /// Policy facet reference
    #[serde(default)]
    pub policy: Option<String>,

    /// Knowledge facet reference
    #[serde(default)]
    pub knowledge: Option<String>,

    /// Output-contract facet reference; a movement with one that yields
    /// finding IDs feeds the health monitor
    #[serde(default)]
    pub output_contract: Option<String>,

    /// Quality gates appended by the config overlay
    #[serde(default)]
    pub quality_gates: Vec<String>,

    /// Facet contents resolved by the loader (not part of the YAML surface)
    #[serde(skip)]
    pub facets: ResolvedFacets,
}

/// Resolved facet contents attached to a movement after loading.
#[derive(Debug, Clone, Default)]
pub struct ResolvedFacets {
    pub persona: Option<String>,
    pub policy: Option<String>,
    pub knowledge: Option<String>,
    pub output_contract: Option<String>,
}

/// Permission level for a movement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    /// Read-only access (can read files, search, but not modify)
    Readonly,
    /// Edit access (can modify existing files)
    #[default]
    Edit,
    /// Full access (can create, delete, execute commands)
    Full,
}

/// Per-persona provider/model pinning at piece level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonaOverride {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Worker-pool decomposition config for a team-leader movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamLeaderConfig {
    /// Pool size; also the per-plan part limit
    pub max_parts: u32,

    /// Persona used for part workers (defaults to the movement's persona)
    #[serde(default)]
    pub part_persona: Option<String>,

    /// Tools granted to part workers
    #[serde(default)]
    pub part_allowed_tools: Vec<String>,

    /// Permission mode for part workers
    #[serde(default)]
    pub part_permission_mode: Option<PermissionMode>,

    /// Refill trigger: dispatch the next part when the number of running
    /// parts falls to or below this. Default: `max_parts / 2`, minimum 1.
    #[serde(default)]
    pub refill_threshold: Option<u32>,
}

impl TeamLeaderConfig {
    /// Effective refill threshold.
    pub fn effective_refill_threshold(&self) -> u32 {
        self.refill_threshold
            .unwrap_or_else(|| (self.max_parts / 2).max(1))
            .max(1)
    }

    /// Cumulative hard cap on parts across all refills.
    pub fn cumulative_cap(&self) -> u32 {
        self.max_parts.saturating_mul(4)
    }
}

/// A routing rule: condition tag plus transition target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Tag matched against the agent output (status line substring or
    /// document regex), or an aggregate form `all(...)` / `any(...)`
    pub condition: String,

    /// Transition taken when the condition matches; omitted means COMPLETE
    #[serde(default)]
    pub next: Transition,
}

/// Where a matched rule sends the state machine. Terminal tokens parse into
/// dedicated variants so invalid targets are unrepresentable after load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Transition {
    /// Move to another movement by name
    Next(String),
    /// Finish the piece successfully
    Complete,
    /// Abort the piece
    Abort,
}

impl Default for Transition {
    fn default() -> Self {
        Transition::Complete
    }
}

impl From<String> for Transition {
    fn from(value: String) -> Self {
        match value.as_str() {
            "COMPLETE" => Transition::Complete,
            "ABORT" => Transition::Abort,
            _ => Transition::Next(value),
        }
    }
}

impl From<Transition> for String {
    fn from(value: Transition) -> Self {
        match value {
            Transition::Next(name) => name,
            Transition::Complete => "COMPLETE".to_string(),
            Transition::Abort => "ABORT".to_string(),
        }
    }
}

/// Runtime cycle-detection rule: abort or adjudicate when the tail of the
/// transition history repeats `cycle` at least `threshold` times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopMonitor {
    pub cycle: Vec<String>,
    pub threshold: u32,
}

impl LoopMonitor {
    /// Name of the out-of-band judge movement inserted for this monitor.
    pub fn judge_movement_name(&self) -> String {
        format!("_loop_judge_{}", self.cycle.join("_"))
    }
}

/// Outcome status of one agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Done,
    Error,
}

/// The result of one movement execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub persona: String,
    pub status: AgentStatus,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub matched_rule_index: Option<usize>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl AgentResponse {
    pub fn done(persona: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
            status: AgentStatus::Done,
            content: content.into(),
            timestamp: Utc::now(),
            matched_rule_index: None,
            error: None,
            session_id: None,
        }
    }

    pub fn failed(persona: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            persona: persona.into(),
            status: AgentStatus::Error,
            content: String::new(),
            timestamp: Utc::now(),
            matched_rule_index: None,
            error: Some(error),
            session_id: None,
        }
    }
}

/// Piece execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PieceStatus {
    Running,
    Completed,
    Aborted,
    Failed,
}

/// Mutable per-run state, exclusively owned by one piece engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PieceState {
    /// Movement the engine is currently on
    pub current_movement: String,

    /// Global 1-indexed iteration counter
    pub iteration: u32,

    /// Per-movement execution counts
    pub movement_iterations: HashMap<String, u32>,

    /// Last response per movement
    pub movement_outputs: HashMap<String, AgentResponse>,

    /// History of interactive prompt answers
    pub user_inputs: Vec<String>,

    /// Opaque provider session id per persona, for resume
    pub persona_sessions: HashMap<String, String>,

    pub status: PieceStatus,
}

impl Piece {
    /// Get a movement by name.
    pub fn get_movement(&self, name: &str) -> Option<&Movement> {
        self.movements.iter().find(|m| m.name == name)
    }

    /// Create the initial runtime state for this piece.
    pub fn create_state(&self) -> PieceState {
        PieceState {
            current_movement: self.initial_movement.clone(),
            iteration: 0,
            movement_iterations: HashMap::new(),
            movement_outputs: HashMap::new(),
            user_inputs: Vec::new(),
            persona_sessions: HashMap::new(),
            status: PieceStatus::Running,
        }
    }

    /// Persona-level provider override for a movement, if any.
    pub fn persona_override(&self, movement: &Movement) -> Option<&PersonaOverride> {
        movement
            .persona
            .as_deref()
            .and_then(|p| self.personas.get(p))
    }
}
