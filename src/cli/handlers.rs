//! Command handlers behind the CLI surface.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::analytics;
use crate::cli::{Cli, Commands, MetricsAction, RepertoireAction, ResetTarget};
use crate::config::{validate_path_env, TaktConfig};
use crate::engine::MovementEngine;
use crate::error::TaktError;
use crate::piece::builtin::{builtin_piece_source, builtin_piece_sources};
use crate::piece::facet::FacetKind;
use crate::piece::loader::PieceLoader;
use crate::provider::mock::MockInvoker;
use crate::provider::{AgentInvoker, CliInvoker, ProviderKind};
use crate::repertoire::{PackageSpec, RepertoireStore};
use crate::task::scheduler::{PieceTaskRunner, Scheduler, TaskRunner};
use crate::task::{TaskQueue, TaskRecord, TaskStatus};

/// Entry point called from `main`; returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32> {
    let project_root = cli
        .project
        .canonicalize()
        .unwrap_or_else(|_| cli.project.clone());
    let config = TaktConfig::load(&project_root)?;

    let runner = CliRunner {
        config,
        project_root,
        cli_provider: cli
            .provider
            .clone()
            .or_else(|| std::env::var("TAKT_E2E_PROVIDER").ok().filter(|v| !v.is_empty())),
        cli_model: cli.model.clone(),
    };

    match cli.command {
        None => match cli.task {
            Some(task) => runner.run_direct(task, cli.piece, cli.create_worktree).await,
            None => {
                eprintln!("Nothing to do: pass a task or a subcommand (see --help)");
                Ok(1)
            }
        },
        Some(Commands::Add { task, pr, piece }) => runner.add(task, pr, piece).await,
        Some(Commands::Run) => runner.run_queue().await,
        Some(Commands::Watch) => runner.watch().await,
        Some(Commands::List) => runner.list(),
        Some(Commands::Clear) => runner.clear(),
        Some(Commands::Config { mode }) => runner.set_permission_mode(&mode),
        Some(Commands::Switch { piece }) => runner.switch(&piece),
        Some(Commands::Eject { name }) => runner.eject(name.as_deref()),
        Some(Commands::Catalog { facet_type }) => runner.catalog(facet_type.as_deref()),
        Some(Commands::Prompt { piece }) => runner.prompt(&piece),
        Some(Commands::Reset { target }) => runner.reset(target),
        Some(Commands::ExportCc) => runner.export_cc(),
        Some(Commands::Repertoire { action }) => runner.repertoire(action).await,
        Some(Commands::Metrics { action }) => runner.metrics(action),
    }
}

pub struct CliRunner {
    config: TaktConfig,
    project_root: PathBuf,
    cli_provider: Option<String>,
    cli_model: Option<String>,
}

impl CliRunner {
    /// Build the invoker: the mock provider runs in-process, everything else
    /// shells out to its CLI.
    fn build_invoker(&self) -> Result<Arc<dyn AgentInvoker>, TaktError> {
        let uses_mock = self.cli_provider.as_deref() == Some("mock")
            || std::env::var(crate::provider::mock::SCENARIO_ENV_VAR).is_ok();
        if uses_mock {
            return Ok(Arc::new(MockInvoker::from_env()?));
        }

        let mut tokens = HashMap::new();
        for kind in [
            ProviderKind::Claude,
            ProviderKind::Codex,
            ProviderKind::Opencode,
            ProviderKind::Copilot,
            ProviderKind::Cursor,
        ] {
            if let Some(var) = kind.token_env_var() {
                if let Some(secret) = self.config.resolve_secret(var) {
                    tokens.insert(kind, secret);
                }
            }
        }

        let mut binary_overrides = HashMap::new();
        if let Some(path) = validate_path_env("TAKT_CODEX_CLI_PATH")? {
            binary_overrides.insert(ProviderKind::Codex, path);
        }

        Ok(Arc::new(CliInvoker::new(tokens, binary_overrides)))
    }

    fn task_runner(&self) -> Result<Arc<dyn TaskRunner>, TaktError> {
        Ok(Arc::new(PieceTaskRunner {
            config: self.config.clone(),
            invoker: self.build_invoker()?,
            cli_provider: self.cli_provider.clone(),
            cli_model: self.cli_model.clone(),
        }))
    }

    /// `takt <task> --piece P`: run one task immediately, in place.
    async fn run_direct(
        &self,
        task: String,
        piece: Option<String>,
        create_worktree: Option<String>,
    ) -> Result<i32> {
        if create_worktree.is_some() {
            eprintln!(
                "--create-worktree has been removed. Set `worktree:` on a queued task \
                 record instead (takt add ... then edit .takt/tasks.yaml), or run with \
                 a concurrency > 1 to get clone isolation automatically."
            );
            return Ok(2);
        }

        let mut record = TaskRecord::new("direct", task);
        record.piece = piece.or_else(|| Some(self.config.default_piece.clone()));

        let runner = self.task_runner()?;
        let cancel = CancellationToken::new();
        wire_ctrl_c(cancel.clone());

        let text = record.resolve_content(&self.project_root)?;
        match runner
            .run_task(&record, &text, &self.project_root, false, cancel)
            .await
        {
            Ok(()) => {
                println!("{}", "Piece completed".green());
                Ok(0)
            }
            Err(e) => {
                eprintln!("{}", e.to_string().red());
                Ok(1)
            }
        }
    }

    /// `takt add`: enqueue a task, optionally built from PR review comments.
    async fn add(&self, task: String, pr: Option<u64>, piece: Option<String>) -> Result<i32> {
        let content = match pr {
            None => task.clone(),
            Some(number) => match fetch_pr_review(number).await {
                Ok(Some(review)) => format!("{task}\n\n{review}"),
                Ok(None) => {
                    eprintln!("PR #{number} has no review comments; queue unchanged");
                    return Ok(0);
                }
                Err(e) => {
                    eprintln!("Could not fetch PR #{number}: {e}");
                    return Ok(0);
                }
            },
        };

        let mut queue = TaskQueue::load(&self.project_root)?;
        let name = queue.next_auto_name();
        let mut record = TaskRecord::new(name.clone(), content);
        record.piece = piece;
        queue.add(record);
        queue.save()?;
        println!("Enqueued {}", name.bold());
        Ok(0)
    }

    /// `takt run`: drain the queue. Batch semantics: always exit 0, per-task
    /// failures are recorded in tasks.yaml.
    async fn run_queue(&self) -> Result<i32> {
        let cancel = CancellationToken::new();
        wire_ctrl_c(cancel.clone());
        let scheduler = Scheduler::new(
            self.config.clone(),
            self.task_runner()?,
            cancel,
            !TaktConfig::no_tty(),
        );
        let summary = scheduler.drain().await?;
        println!(
            "{} completed, {} failed, {} skipped",
            summary.completed.to_string().green(),
            summary.failed.to_string().red(),
            summary.skipped
        );
        Ok(0)
    }

    async fn watch(&self) -> Result<i32> {
        let cancel = CancellationToken::new();
        wire_ctrl_c(cancel.clone());
        let scheduler = Scheduler::new(
            self.config.clone(),
            self.task_runner()?,
            cancel.clone(),
            false,
        );
        let executed =
            crate::task::watch::watch(&self.project_root, &scheduler, cancel).await?;
        println!("Watch finished after {executed} task(s)");
        Ok(0)
    }

    fn list(&self) -> Result<i32> {
        let queue = TaskQueue::load(&self.project_root)?;
        if queue.tasks.is_empty() {
            println!("No tasks");
            return Ok(0);
        }
        for (status, label) in [
            (TaskStatus::Running, "Running".yellow()),
            (TaskStatus::Pending, "Pending".cyan()),
            (TaskStatus::Failed, "Failed".red()),
            (TaskStatus::Completed, "Completed".green()),
        ] {
            let tasks: Vec<&TaskRecord> =
                queue.tasks.iter().filter(|t| t.status == status).collect();
            if tasks.is_empty() {
                continue;
            }
            println!("{label}");
            for task in tasks {
                let piece = task.piece.as_deref().unwrap_or(&self.config.default_piece);
                let mut line = format!("  {} [{}]", task.name.bold(), piece);
                if let Some(failure) = &task.failure {
                    line.push_str(&format!(" - {failure}"));
                }
                println!("{line}");
            }
        }
        Ok(0)
    }

    /// `takt clear`: drop run logs and reports.
    fn clear(&self) -> Result<i32> {
        let runs = self.project_root.join(".takt").join("runs");
        if runs.is_dir() {
            std::fs::remove_dir_all(&runs)?;
            println!("Cleared session state under {}", runs.display());
        } else {
            println!("No session state to clear");
        }
        Ok(0)
    }

    fn set_permission_mode(&self, mode: &str) -> Result<i32> {
        if !matches!(mode, "default" | "sacrifice-my-pc") {
            eprintln!("Invalid mode: {mode}");
            return Ok(0);
        }
        update_project_config(&self.project_root, |doc| {
            doc.permission_mode = Some(mode.to_string());
        })?;
        println!("Permission mode set to {mode}");
        Ok(0)
    }

    fn switch(&self, piece: &str) -> Result<i32> {
        let loader = PieceLoader::new(&self.config);
        if loader.load_by_name(piece).is_err() {
            eprintln!("Piece '{piece}' not found");
            return Ok(0);
        }
        update_project_config(&self.project_root, |doc| {
            doc.default_piece = Some(piece.to_string());
        })?;
        println!("Default piece set to {}", piece.bold());
        Ok(0)
    }

    fn eject(&self, name: Option<&str>) -> Result<i32> {
        let targets: Vec<&str> = match name {
            Some(name) => {
                if builtin_piece_source(name).is_none() {
                    eprintln!("Builtin piece '{name}' not found");
                    return Ok(0);
                }
                vec![name]
            }
            None => builtin_piece_sources().iter().map(|(n, _)| *n).collect(),
        };

        let pieces_dir = self.project_root.join(".takt").join("pieces");
        std::fs::create_dir_all(&pieces_dir)?;
        for name in targets {
            let dest = pieces_dir.join(format!("{name}.yaml"));
            if dest.exists() {
                warn!("Piece '{}' already ejected, not overwriting", name);
                eprintln!("{} already exists, skipping", dest.display());
                continue;
            }
            std::fs::write(&dest, builtin_piece_source(name).expect("builtin"))?;
            println!("Ejected {} to {}", name.bold(), dest.display());
        }
        Ok(0)
    }

    fn catalog(&self, facet_type: Option<&str>) -> Result<i32> {
        let loader = PieceLoader::new(&self.config);

        if let Some(facet_type) = facet_type {
            let Some(kind) = FacetKind::parse(facet_type) else {
                eprintln!("Unknown facet type: {facet_type}");
                return Ok(0);
            };
            for name in loader.facet_resolver().catalog(kind) {
                println!("{name}");
            }
            return Ok(0);
        }

        println!("{}", "pieces".bold());
        for name in loader.catalog() {
            println!("  {name}");
        }
        for kind in FacetKind::all() {
            let names = loader.facet_resolver().catalog(kind);
            if names.is_empty() {
                continue;
            }
            println!("{}", kind.dir_name().bold());
            for name in names {
                println!("  {name}");
            }
        }
        Ok(0)
    }

    /// `takt prompt <piece-or-path>`: render the first movement's prompt.
    fn prompt(&self, piece_name: &str) -> Result<i32> {
        let loader = PieceLoader::new(&self.config);
        let piece = if Path::new(piece_name).is_file() {
            loader.load_from_path(Path::new(piece_name))
        } else {
            loader.load_by_name(piece_name)
        };
        let piece = match piece {
            Ok(piece) => piece,
            Err(_) => {
                eprintln!("Piece '{piece_name}' not found");
                return Ok(0);
            }
        };

        let movement = piece
            .get_movement(&piece.initial_movement)
            .context("validated piece has an initial movement")?;

        let ctx = crate::engine::ExecutionContext::new(
            &self.config,
            self.project_root.clone(),
            "{task}".to_string(),
            "<report-dir>".to_string(),
            self.cli_provider.clone(),
            self.cli_model.clone(),
            CancellationToken::new(),
        );
        let engine = MovementEngine::new(Arc::new(NullInvoker), ctx);
        let mut state = piece.create_state();
        state.iteration = 1;
        let instruction = engine.render_instruction(movement, &state);
        println!("{}", engine.build_prompt(movement, &instruction));
        Ok(0)
    }

    fn reset(&self, target: ResetTarget) -> Result<i32> {
        match target {
            ResetTarget::Config => {
                let config_path = self.project_root.join(".takt").join("config.yaml");
                if config_path.is_file() {
                    let backup = config_path.with_file_name(format!(
                        "config.yaml.{}.old",
                        Utc::now().format("%Y%m%d-%H%M%S")
                    ));
                    std::fs::rename(&config_path, &backup)?;
                    println!("Backed up old config to {}", backup.display());
                }
                std::fs::create_dir_all(config_path.parent().context("config parent")?)?;
                std::fs::write(&config_path, DEFAULT_PROJECT_CONFIG)?;
                println!("Restored builtin config at {}", config_path.display());
            }
            ResetTarget::Categories => {
                let path = self
                    .project_root
                    .join(".takt")
                    .join("preferences")
                    .join("piece-categories.yaml");
                std::fs::create_dir_all(path.parent().context("preferences dir")?)?;
                std::fs::write(&path, "categories: {}\n")?;
                println!("Wrote empty category overlay at {}", path.display());
            }
        }
        Ok(0)
    }

    fn export_cc(&self) -> Result<i32> {
        let skills_dir = dirs::home_dir()
            .context("no home directory")?
            .join(".claude")
            .join("skills")
            .join("takt");
        std::fs::create_dir_all(&skills_dir)?;
        std::fs::write(skills_dir.join("SKILL.md"), CLAUDE_SKILL)?;
        println!("Deployed skill files under {}", skills_dir.display());
        Ok(0)
    }

    async fn repertoire(&self, action: RepertoireAction) -> Result<i32> {
        let store = RepertoireStore::new(&TaktConfig::user_dir());
        match action {
            RepertoireAction::Add { source } => {
                let spec = PackageSpec::parse(&source)?;
                store.recover(&spec)?;

                if !interactive_confirm(&format!("Install {}?", spec.source_string())) {
                    println!("Cancelled");
                    return Ok(0);
                }
                if store.package_dir(&spec).exists()
                    && !interactive_confirm(&format!(
                        "{} is already installed. Overwrite?",
                        spec.installed_name()
                    ))
                {
                    println!("Cancelled");
                    return Ok(0);
                }

                let lock = store.install(&spec).await?;
                println!(
                    "Installed {} @ {}",
                    spec.installed_name().bold(),
                    &lock.commit[..lock.commit.len().min(7)]
                );
                Ok(0)
            }
            RepertoireAction::Remove { name } => {
                let spec = PackageSpec::parse_installed(&name)?;
                store.recover(&spec)?;

                let references = store.find_references(&spec, &self.project_root)?;
                if !references.is_empty() {
                    eprintln!(
                        "{} file(s) still reference {}:",
                        references.len(),
                        spec.installed_name()
                    );
                    for path in &references {
                        eprintln!("  {}", path.display());
                    }
                }

                if !interactive_confirm(&format!("Remove {}?", spec.installed_name())) {
                    println!("Cancelled");
                    return Ok(0);
                }
                store.remove(&spec)?;
                println!("Removed {}", spec.installed_name());
                Ok(0)
            }
            RepertoireAction::List => {
                let packages = store.list()?;
                if packages.is_empty() {
                    println!("No packages installed");
                    return Ok(0);
                }
                for package in packages {
                    match package.lock {
                        Some(lock) => println!(
                            "{}  {}  {}  {}",
                            package.name.bold(),
                            &lock.commit[..lock.commit.len().min(7)],
                            lock.git_ref,
                            lock.imported_at.format("%Y-%m-%d")
                        ),
                        None => println!("{}  (no lockfile)", package.name.bold()),
                    }
                }
                Ok(0)
            }
        }
    }

    fn metrics(&self, action: MetricsAction) -> Result<i32> {
        let events_dir = TaktConfig::user_dir().join("analytics").join("events");
        match action {
            MetricsAction::Review { since } => {
                let since_date = match since {
                    Some(window) => Some(parse_since(&window)?),
                    None => None,
                };
                let metrics = analytics::aggregate_review(&events_dir, since_date)?;
                println!(
                    "{} finding(s), {} fixed, {} rebutted, {} movement result(s)",
                    metrics.findings.len(),
                    metrics.fixed,
                    metrics.rebutted,
                    metrics.movement_results
                );
                let mut findings: Vec<(&String, &usize)> = metrics.findings.iter().collect();
                findings.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
                for (id, count) in findings {
                    println!("  {id}: {count}");
                }
                Ok(0)
            }
            MetricsAction::Purge => {
                let removed = analytics::purge(
                    &events_dir,
                    self.config.retention_days,
                    Utc::now().date_naive(),
                )?;
                println!("Purged {removed} file(s)");
                Ok(0)
            }
        }
    }
}

/// Interactive confirmation that respects TAKT_NO_TTY.
fn interactive_confirm(prompt: &str) -> bool {
    crate::cli::interactive::confirm(prompt)
}

fn wire_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, aborting");
            cancel.cancel();
        }
    });
}

/// Parse a `--since` window like `30d` into a date.
fn parse_since(window: &str) -> Result<chrono::NaiveDate, TaktError> {
    let days: i64 = window
        .strip_suffix('d')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| {
            TaktError::validation(format!("--since expects a window like '30d', got '{window}'"))
        })?;
    Ok(Utc::now().date_naive() - chrono::Duration::days(days))
}

/// Fetch a PR's review comments via the `gh` CLI. `Ok(None)` means the review
/// is empty.
async fn fetch_pr_review(number: u64) -> Result<Option<String>, TaktError> {
    let output = tokio::process::Command::new("gh")
        .args([
            "pr",
            "view",
            &number.to_string(),
            "--json",
            "reviews,title",
        ])
        .output()
        .await
        .map_err(TaktError::Io)?;
    if !output.status.success() {
        return Err(TaktError::Network {
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    let mut sections = Vec::new();
    if let Some(reviews) = parsed["reviews"].as_array() {
        for review in reviews {
            if let Some(body) = review["body"].as_str() {
                if !body.trim().is_empty() {
                    sections.push(body.trim().to_string());
                }
            }
        }
    }
    if sections.is_empty() {
        return Ok(None);
    }
    Ok(Some(format!(
        "Address the following review comments on PR #{number}:\n\n{}",
        sections.join("\n\n---\n\n")
    )))
}

/// Apply one mutation to the project config file.
fn update_project_config(
    project_root: &Path,
    mutate: impl FnOnce(&mut crate::config::ConfigFile),
) -> Result<(), TaktError> {
    let path = TaktConfig::project_dir(project_root).join(crate::config::CONFIG_FILE);
    let mut doc = if path.is_file() {
        serde_yaml::from_str(&std::fs::read_to_string(&path)?)?
    } else {
        crate::config::ConfigFile::default()
    };
    mutate(&mut doc);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_yaml::to_string(&doc)?)?;
    Ok(())
}

/// Invoker used when a prompt is rendered but never executed.
struct NullInvoker;

#[async_trait::async_trait]
impl AgentInvoker for NullInvoker {
    async fn invoke(
        &self,
        _request: &crate::provider::InvocationRequest,
    ) -> Result<crate::provider::AgentReply, TaktError> {
        Err(TaktError::validation("This invoker cannot execute".to_string()))
    }
}

const DEFAULT_PROJECT_CONFIG: &str = "\
# takt project configuration
default_piece: default
# provider: claude
# model: sonnet
concurrency: 1
auto_fetch: true
permission_mode: default
";

const CLAUDE_SKILL: &str = "\
# takt

Run declarative pieces of LLM agent movements against this repository.

Usage:
- `takt \"<task>\" --piece <piece>` runs a piece directly.
- `takt add \"<task>\"` then `takt run` drains the queue.
- `takt catalog` lists available pieces and facets.

Session logs land under `.takt/runs/<run-id>/logs/` as JSONL; reports under
`.takt/reports/`.
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_since() {
        let date = parse_since("30d").unwrap();
        assert_eq!(date, Utc::now().date_naive() - chrono::Duration::days(30));
        assert!(parse_since("30").is_err());
        assert!(parse_since("monthly").is_err());
    }

    #[test]
    fn test_update_project_config_creates_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        update_project_config(tmp.path(), |doc| {
            doc.default_piece = Some("review-fix".to_string());
        })
        .unwrap();

        let written =
            std::fs::read_to_string(tmp.path().join(".takt/config.yaml")).unwrap();
        assert!(written.contains("review-fix"));
    }
}
