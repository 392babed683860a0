//! Piece loading: YAML → normalized, validated, facet-resolved graph.
//!
//! Lookup order for a piece name: project `.takt/pieces/<name>.yaml`, user
//! `~/.takt/pieces/<name>.yaml`, then the builtin set (including generated
//! hybrid-codex variants). A project piece file may instead be a reference
//! (`from: @owner/repo`) into an installed repertoire package.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use crate::config::TaktConfig;
use crate::error::TaktError;
use crate::piece::builtin::{
    builtin_piece_source, builtin_piece_sources, HYBRID_CODEX_SKIP, SUFFIX_HYBRID_CODEX,
};
use crate::piece::facet::{FacetKind, FacetResolver};
use crate::piece::{Movement, PersonaOverride, Piece, Transition};

/// Reference-style piece file pointing into a repertoire package.
#[derive(Debug, Deserialize)]
struct PieceReference {
    from: String,
    name: String,
}

/// Loads pieces and resolves their facet references.
pub struct PieceLoader {
    project_dir: PathBuf,
    user_dir: PathBuf,
    resolver: FacetResolver,
    quality_gates: Vec<String>,
}

impl PieceLoader {
    pub fn new(config: &TaktConfig) -> Self {
        let project_dir = TaktConfig::project_dir(&config.project_root);
        let user_dir = TaktConfig::user_dir();
        Self {
            resolver: FacetResolver::new(&project_dir, &user_dir),
            project_dir,
            user_dir,
            quality_gates: config.quality_gates.clone(),
        }
    }

    pub fn facet_resolver(&self) -> &FacetResolver {
        &self.resolver
    }

    /// Load a piece by name through the layered lookup.
    pub fn load_by_name(&self, name: &str) -> Result<Piece, TaktError> {
        for dir in [&self.project_dir, &self.user_dir] {
            for ext in ["yaml", "yml"] {
                let path = dir.join("pieces").join(format!("{name}.{ext}"));
                if path.is_file() {
                    return self.load_from_path(&path);
                }
            }
        }

        if let Some(source) = builtin_piece_source(name) {
            return self.load_from_str(source);
        }

        // Generated hybrid-codex variants of the standard pieces.
        if let Some(base) = name.strip_suffix(SUFFIX_HYBRID_CODEX) {
            if !HYBRID_CODEX_SKIP.contains(&base) {
                if let Some(source) = builtin_piece_source(base) {
                    let piece = self.load_from_str(source)?;
                    return Ok(hybrid_codex_variant(piece));
                }
            }
        }

        Err(TaktError::missing("piece", name))
    }

    /// Load a piece from an explicit file path. The file may be a full piece
    /// definition or a `from: @owner/repo` reference.
    pub fn load_from_path(&self, path: &Path) -> Result<Piece, TaktError> {
        let contents = std::fs::read_to_string(path)?;

        if let Ok(reference) = serde_yaml::from_str::<PieceReference>(&contents) {
            return self.load_from_package(&reference.from, &reference.name);
        }

        self.load_from_str(&contents)
    }

    /// Resolve a `from: @owner/repo` reference into the repertoire store.
    fn load_from_package(&self, package: &str, name: &str) -> Result<Piece, TaktError> {
        let mut package_dir = self.user_dir.join("repertoire");
        for part in package.split('/') {
            package_dir.push(part);
        }
        for ext in ["yaml", "yml"] {
            let path = package_dir.join("pieces").join(format!("{name}.{ext}"));
            if path.is_file() {
                debug!("Loading piece '{}' from package {}", name, package);
                return self.load_from_path(&path);
            }
        }
        Err(TaktError::missing("piece", format!("{package}/{name}")))
    }

    /// Parse, validate, resolve facets, and apply the quality-gate overlay.
    pub fn load_from_str(&self, yaml: &str) -> Result<Piece, TaktError> {
        let mut piece: Piece = serde_yaml::from_str(yaml)?;
        validate(&piece)?;

        for movement in &mut piece.movements {
            self.resolve_movement_facets(movement)?;
            apply_quality_gates(movement, &self.quality_gates);
            for sub in &mut movement.parallel {
                self.resolve_movement_facets(sub)?;
            }
        }

        info!(
            "Loaded piece '{}' with {} movements",
            piece.name,
            piece.movements.len()
        );
        Ok(piece)
    }

    /// List piece names visible through the lookup, project layer first.
    pub fn catalog(&self) -> Vec<String> {
        let mut names = Vec::new();
        for dir in [&self.project_dir, &self.user_dir] {
            let pieces_dir = dir.join("pieces");
            if let Ok(entries) = std::fs::read_dir(&pieces_dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    let is_yaml = matches!(
                        path.extension().and_then(|e| e.to_str()),
                        Some("yaml") | Some("yml")
                    );
                    if is_yaml {
                        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                            if !names.contains(&stem.to_string()) {
                                names.push(stem.to_string());
                            }
                        }
                    }
                }
            }
        }
        for (name, _) in builtin_piece_sources() {
            if !names.contains(&name.to_string()) {
                names.push(name.to_string());
            }
            if !HYBRID_CODEX_SKIP.contains(name) {
                let hybrid = format!("{name}{SUFFIX_HYBRID_CODEX}");
                if !names.contains(&hybrid) {
                    names.push(hybrid);
                }
            }
        }
        names
    }

    fn resolve_movement_facets(&self, movement: &mut Movement) -> Result<(), TaktError> {
        if let Some(name) = &movement.persona {
            movement.facets.persona =
                Some(self.resolver.resolve(FacetKind::Persona, name)?.content);
        }
        if let Some(name) = &movement.policy {
            movement.facets.policy = Some(self.resolver.resolve(FacetKind::Policy, name)?.content);
        }
        if let Some(name) = &movement.knowledge {
            movement.facets.knowledge =
                Some(self.resolver.resolve(FacetKind::Knowledge, name)?.content);
        }
        if let Some(name) = &movement.output_contract {
            movement.facets.output_contract = Some(
                self.resolver
                    .resolve(FacetKind::OutputContract, name)?
                    .content,
            );
        }
        Ok(())
    }
}

/// The deterministic hybrid-codex transform: rename and pin the `coder`
/// persona to the codex provider, everything else preserved.
pub fn hybrid_codex_variant(mut piece: Piece) -> Piece {
    piece.name = format!("{}{}", piece.name, SUFFIX_HYBRID_CODEX);
    piece
        .personas
        .entry("coder".to_string())
        .or_insert_with(PersonaOverride::default)
        .provider = Some("codex".to_string());
    piece
}

/// Structural validation of a parsed piece.
pub fn validate(piece: &Piece) -> Result<(), TaktError> {
    if piece.get_movement(&piece.initial_movement).is_none() {
        return Err(TaktError::validation(format!(
            "Initial movement '{}' not found in piece '{}'",
            piece.initial_movement, piece.name
        )));
    }

    let mut seen = std::collections::HashSet::new();
    for movement in &piece.movements {
        if !seen.insert(&movement.name) {
            return Err(TaktError::validation(format!(
                "Duplicate movement name '{}' in piece '{}'",
                movement.name, piece.name
            )));
        }

        for rule in &movement.rules {
            if let Transition::Next(target) = &rule.next {
                if piece.get_movement(target).is_none() {
                    return Err(TaktError::validation(format!(
                        "Rule in movement '{}' references unknown movement '{}'",
                        movement.name, target
                    )));
                }
            }
        }

        if !movement.parallel.is_empty() && movement.team_leader.is_some() {
            return Err(TaktError::validation(format!(
                "Movement '{}' cannot combine parallel and team_leader",
                movement.name
            )));
        }

        for sub in &movement.parallel {
            if !sub.parallel.is_empty() || sub.team_leader.is_some() {
                return Err(TaktError::validation(format!(
                    "Sub-movement '{}' of '{}' cannot itself fan out",
                    sub.name, movement.name
                )));
            }
        }
    }

    for monitor in &piece.loop_monitors {
        if monitor.cycle.is_empty() || monitor.threshold == 0 {
            return Err(TaktError::validation(
                "Loop monitor needs a non-empty cycle and threshold >= 1".to_string(),
            ));
        }
        for name in &monitor.cycle {
            if piece.get_movement(name).is_none() {
                return Err(TaktError::validation(format!(
                    "Loop monitor references unknown movement '{}'",
                    name
                )));
            }
        }
    }

    Ok(())
}

fn apply_quality_gates(movement: &mut Movement, config_gates: &[String]) {
    for gate in config_gates {
        if !movement.quality_gates.contains(gate) {
            movement.quality_gates.push(gate.clone());
        }
    }
}
