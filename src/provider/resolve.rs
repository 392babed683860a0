//! Effective (provider, model) resolution.
//!
//! Each axis resolves independently by priority: CLI flag, per-persona piece
//! override, movement override, project config, global config — first defined
//! wins. At the config layers a `model` is eligible only when the provider it
//! was paired with matches the already-resolved provider; a model pinned next
//! to `provider: claude` must not leak onto a codex run.

use crate::config::TaktConfig;
use crate::piece::{Movement, Piece};

/// One layer's contribution to resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct Layer<'a> {
    pub provider: Option<&'a str>,
    pub model: Option<&'a str>,
}

/// All inputs to resolution, in priority order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolutionInputs<'a> {
    pub cli: Layer<'a>,
    pub persona: Layer<'a>,
    pub movement: Layer<'a>,
    pub project: Layer<'a>,
    pub global: Layer<'a>,
}

/// The resolved pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub provider: String,
    pub model: Option<String>,
}

pub const DEFAULT_PROVIDER: &str = "claude";

/// Pure resolution over the five layers.
pub fn resolve(inputs: &ResolutionInputs<'_>) -> Resolved {
    let provider = [
        inputs.cli.provider,
        inputs.persona.provider,
        inputs.movement.provider,
        inputs.project.provider,
        inputs.global.provider,
    ]
    .into_iter()
    .flatten()
    .next()
    .unwrap_or(DEFAULT_PROVIDER)
    .to_string();

    // The explicit layers (CLI, persona, movement) apply unconditionally;
    // config-layer models are gated on their paired provider.
    let model = [
        (inputs.cli.model, None),
        (inputs.persona.model, None),
        (inputs.movement.model, None),
        (inputs.project.model, Some(inputs.project.provider)),
        (inputs.global.model, Some(inputs.global.provider)),
    ]
    .into_iter()
    .find_map(|(model, paired_provider)| {
        let model = model?;
        match paired_provider {
            Some(Some(paired)) if paired != provider => None,
            _ => Some(model.to_string()),
        }
    });

    Resolved { provider, model }
}

/// Build the resolution inputs for one movement of a piece.
pub fn inputs_for_movement<'a>(
    cli_provider: Option<&'a str>,
    cli_model: Option<&'a str>,
    piece: &'a Piece,
    movement: &'a Movement,
    config: &'a TaktConfig,
) -> ResolutionInputs<'a> {
    let persona = piece.persona_override(movement);
    ResolutionInputs {
        cli: Layer {
            provider: cli_provider,
            model: cli_model,
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
            provider: config.project_provider.as_deref(),
            model: config.project_model.as_deref(),
        },
        global: Layer {
            provider: config.global_provider.as_deref(),
            model: config.global_model.as_deref(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_when_nothing_defined() {
        let resolved = resolve(&ResolutionInputs::default());
        assert_eq!(resolved.provider, "claude");
        assert_eq!(resolved.model, None);
    }

    #[test]
    fn test_cli_wins_over_everything() {
        let inputs = ResolutionInputs {
            cli: Layer {
                provider: Some("codex"),
                model: Some("o3"),
            },
            persona: Layer {
                provider: Some("claude"),
                model: Some("opus"),
            },
            movement: Layer {
                provider: Some("cursor"),
                model: None,
            },
            ..Default::default()
        };
        let resolved = resolve(&inputs);
        assert_eq!(resolved.provider, "codex");
        assert_eq!(resolved.model.as_deref(), Some("o3"));
    }

    #[test]
    fn test_persona_wins_over_movement() {
        // The tightened precedence: persona beats the movement's own setting.
        let inputs = ResolutionInputs {
            persona: Layer {
                provider: Some("codex"),
                model: None,
            },
            movement: Layer {
                provider: Some("claude"),
                model: None,
            },
            ..Default::default()
        };
        assert_eq!(resolve(&inputs).provider, "codex");
    }

    #[test]
    fn test_config_model_gated_on_paired_provider() {
        // Global config says claude+opus; movement forces codex. The opus
        // model must not apply.
        let inputs = ResolutionInputs {
            movement: Layer {
                provider: Some("codex"),
                model: None,
            },
            global: Layer {
                provider: Some("claude"),
                model: Some("opus"),
            },
            ..Default::default()
        };
        let resolved = resolve(&inputs);
        assert_eq!(resolved.provider, "codex");
        assert_eq!(resolved.model, None);
    }

    #[test]
    fn test_config_model_applies_when_provider_matches() {
        let inputs = ResolutionInputs {
            project: Layer {
                provider: Some("claude"),
                model: Some("sonnet"),
            },
            ..Default::default()
        };
        let resolved = resolve(&inputs);
        assert_eq!(resolved.provider, "claude");
        assert_eq!(resolved.model.as_deref(), Some("sonnet"));
    }

    #[test]
    fn test_config_model_without_paired_provider_applies() {
        // A bare model at the global layer has no accompanying provider to
        // mismatch, so it applies.
        let inputs = ResolutionInputs {
            movement: Layer {
                provider: Some("codex"),
                model: None,
            },
            global: Layer {
                provider: None,
                model: Some("o3"),
            },
            ..Default::default()
        };
        let resolved = resolve(&inputs);
        assert_eq!(resolved.model.as_deref(), Some("o3"));
    }

    #[test]
    fn test_axes_resolve_independently() {
        // Provider from movement, model from persona.
        let inputs = ResolutionInputs {
            persona: Layer {
                provider: None,
                model: Some("opus"),
            },
            movement: Layer {
                provider: Some("claude"),
                model: None,
            },
            ..Default::default()
        };
        let resolved = resolve(&inputs);
        assert_eq!(resolved.provider, "claude");
        assert_eq!(resolved.model.as_deref(), Some("opus"));
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let inputs = ResolutionInputs {
            project: Layer {
                provider: Some("claude"),
                model: Some("sonnet"),
            },
            ..Default::default()
        };
        assert_eq!(resolve(&inputs), resolve(&inputs));
    }
}
