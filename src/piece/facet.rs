//! Facet resolution: the three-layer filesystem lookup.
//!
//! A facet is one of persona / policy / knowledge / instruction /
//! output-contract, stored as markdown. References are resolved in priority
//! order: project `.takt/<type>/<name>.md`, user `~/.takt/<type>/<name>.md`,
//! then the builtin set shipped with the binary. First hit wins; the original
//! name is retained for diagnostics.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TaktError;

/// Facet categories, each with a dedicated directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FacetKind {
    Persona,
    Policy,
    Knowledge,
    Instruction,
    OutputContract,
}

impl FacetKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Persona => "personas",
            Self::Policy => "policies",
            Self::Knowledge => "knowledge",
            Self::Instruction => "instructions",
            Self::OutputContract => "output-contracts",
        }
    }

    pub fn all() -> [FacetKind; 5] {
        [
            Self::Persona,
            Self::Policy,
            Self::Knowledge,
            Self::Instruction,
            Self::OutputContract,
        ]
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "personas" | "persona" => Some(Self::Persona),
            "policies" | "policy" => Some(Self::Policy),
            "knowledge" => Some(Self::Knowledge),
            "instructions" | "instruction" => Some(Self::Instruction),
            "output-contracts" | "output-contract" => Some(Self::OutputContract),
            _ => None,
        }
    }
}

impl std::fmt::Display for FacetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Which layer satisfied a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacetLayer {
    Project,
    User,
    Builtin,
}

/// A resolved facet with its content read eagerly.
#[derive(Debug, Clone)]
pub struct ResolvedFacet {
    pub name: String,
    pub kind: FacetKind,
    pub layer: FacetLayer,
    pub content: String,
}

/// Three-layer facet resolver.
#[derive(Debug, Clone)]
pub struct FacetResolver {
    project_dir: PathBuf,
    user_dir: PathBuf,
}

impl FacetResolver {
    pub fn new(project_dir: impl Into<PathBuf>, user_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            user_dir: user_dir.into(),
        }
    }

    /// Resolve a facet by kind and name. Missing at every layer is a
    /// `ResourceMissing` error.
    pub fn resolve(&self, kind: FacetKind, name: &str) -> Result<ResolvedFacet, TaktError> {
        for (layer, dir) in [
            (FacetLayer::Project, &self.project_dir),
            (FacetLayer::User, &self.user_dir),
        ] {
            let path = dir.join(kind.dir_name()).join(format!("{name}.md"));
            if path.is_file() {
                let content = std::fs::read_to_string(&path)?;
                debug!("Resolved {} facet '{}' from {}", kind, name, path.display());
                return Ok(ResolvedFacet {
                    name: name.to_string(),
                    kind,
                    layer,
                    content,
                });
            }
        }

        if let Some(content) = builtin_facet(kind, name) {
            return Ok(ResolvedFacet {
                name: name.to_string(),
                kind,
                layer: FacetLayer::Builtin,
                content: content.to_string(),
            });
        }

        Err(TaktError::ResourceMissing {
            kind: "facet",
            name: format!("{}/{}", kind.dir_name(), name),
        })
    }

    /// List facet names available for a kind across all layers, deduplicated,
    /// project layer first.
    pub fn catalog(&self, kind: FacetKind) -> Vec<String> {
        let mut names = Vec::new();
        for dir in [&self.project_dir, &self.user_dir] {
            let facet_dir = dir.join(kind.dir_name());
            if let Ok(entries) = std::fs::read_dir(&facet_dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) == Some("md") {
                        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                            if !names.contains(&stem.to_string()) {
                                names.push(stem.to_string());
                            }
                        }
                    }
                }
            }
        }
        for name in builtin_facet_names(kind) {
            if !names.contains(&name.to_string()) {
                names.push(name.to_string());
            }
        }
        names.sort();
        names
    }
}

/// Built-in facet lookup. These ship with the binary and form the last
/// resolution layer.
pub fn builtin_facet(kind: FacetKind, name: &str) -> Option<&'static str> {
    match (kind, name) {
        (FacetKind::Persona, "planner") => Some(BUILTIN_PERSONA_PLANNER),
        (FacetKind::Persona, "coder") => Some(BUILTIN_PERSONA_CODER),
        (FacetKind::Persona, "reviewer") => Some(BUILTIN_PERSONA_REVIEWER),
        (FacetKind::Persona, "judge") => Some(BUILTIN_PERSONA_JUDGE),
        (FacetKind::Persona, "team-leader") => Some(BUILTIN_PERSONA_TEAM_LEADER),
        (FacetKind::Policy, "coding") => Some(BUILTIN_POLICY_CODING),
        (FacetKind::Policy, "review") => Some(BUILTIN_POLICY_REVIEW),
        (FacetKind::OutputContract, "review-findings") => Some(BUILTIN_CONTRACT_REVIEW_FINDINGS),
        _ => None,
    }
}

pub fn builtin_facet_names(kind: FacetKind) -> &'static [&'static str] {
    match kind {
        FacetKind::Persona => &["planner", "coder", "reviewer", "judge", "team-leader"],
        FacetKind::Policy => &["coding", "review"],
        FacetKind::Knowledge => &[],
        FacetKind::Instruction => &[],
        FacetKind::OutputContract => &["review-findings"],
    }
}

const BUILTIN_PERSONA_PLANNER: &str = "\
# Planner

You analyze the task and produce a concrete, ordered implementation plan.
Read the code before planning. Do not modify files.
";

const BUILTIN_PERSONA_CODER: &str = "\
# Coder

You implement the plan with minimal, focused changes. Follow existing code
conventions. Run the project's checks when available.
";

const BUILTIN_PERSONA_REVIEWER: &str = "\
# Reviewer

You review the changes for correctness and quality. Report each issue with a
short uppercase finding ID (e.g. REV-001) so it can be tracked across
iterations.
";

const BUILTIN_PERSONA_JUDGE: &str = "\
# Judge

You are given the recent conversation of a repeating movement cycle. Decide
whether the loop is making real progress. Answer with a final status line:
STATUS: CONTINUE when the cycle is productive, STATUS: ABORT when it is not.
";

const BUILTIN_PERSONA_TEAM_LEADER: &str = "\
# Team Leader

You decompose the task into independent parts for parallel workers. Output a
DECOMPOSITION: section with one part per line in the form
`id | title | instruction`. If more parts will be needed after these finish,
end with `CONTINUE: yes`.
";

const BUILTIN_POLICY_CODING: &str = "\
- Keep changes minimal and reversible.
- Never commit secrets.
- Prefer the project's existing libraries over new dependencies.
";

const BUILTIN_POLICY_REVIEW: &str = "\
- Verify claims against the actual code, not the diff summary.
- Report real defects only; style nits are not findings.
";

const BUILTIN_CONTRACT_REVIEW_FINDINGS: &str = "\
Report each finding on its own line as `<ID>: <summary>` where ID matches
`[A-Z]{2,}-[A-Z0-9-]+`. End with a status line: `STATUS: approved` or
`STATUS: fixes_needed`.
";

/// Validate that a relative facet/package path does not escape its root.
pub fn is_traversal_free(path: &str) -> bool {
    let p = Path::new(path);
    !p.is_absolute()
        && !p
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
}
