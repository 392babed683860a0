//! CLI surface: verbs, flags, and dispatch.

pub mod handlers;
pub mod interactive;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// takt - piece-driven multi-agent orchestration
#[derive(Parser)]
#[command(name = "takt")]
#[command(about = "Run declarative pieces of LLM agent movements against a repository")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    /// Task to run directly (when no subcommand is given)
    pub task: Option<String>,

    /// Piece to run the task with
    #[arg(long)]
    pub piece: Option<String>,

    /// Provider override (claude, codex, opencode, copilot, cursor, mock)
    #[arg(long, global = true)]
    pub provider: Option<String>,

    /// Model override
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Deprecated; kept for argument compatibility only
    #[arg(long, value_name = "yes|no", hide = true)]
    pub create_worktree: Option<String>,

    /// Project root
    #[arg(long, default_value = ".", global = true)]
    pub project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Enqueue a task
    Add {
        /// Task text (or a title when --pr builds the content)
        task: String,

        /// Build the task from a pull request's review comments
        #[arg(long)]
        pr: Option<u64>,

        /// Piece to use for this task
        #[arg(long)]
        piece: Option<String>,
    },

    /// Drain pending tasks per the concurrency setting
    Run,

    /// Poll the tasks/ directory for new task files
    Watch,

    /// Browse pending, failed, and completed tasks
    List,

    /// Remove session state (run logs)
    Clear,

    /// Set the permission mode (default | sacrifice-my-pc)
    Config { mode: String },

    /// Set the default piece
    Switch { piece: String },

    /// Copy a builtin piece into .takt/pieces/ for customization
    Eject { name: Option<String> },

    /// List facets (personas, policies, knowledge, ...)
    Catalog { facet_type: Option<String> },

    /// Render the first movement's prompt of a piece
    Prompt { piece: String },

    /// Reset configuration or category overlays
    Reset {
        #[command(subcommand)]
        target: ResetTarget,
    },

    /// Deploy Claude Code skill files
    ExportCc,

    /// Manage repertoire packages
    Repertoire {
        #[command(subcommand)]
        action: RepertoireAction,
    },

    /// Analytics metrics
    Metrics {
        #[command(subcommand)]
        action: MetricsAction,
    },
}

#[derive(Subcommand)]
pub enum ResetTarget {
    /// Back up the current config and restore the builtin one
    Config,
    /// Write an empty piece-categories overlay
    Categories,
}

#[derive(Subcommand)]
pub enum RepertoireAction {
    /// Install github:<owner>/<repo>[@<ref>]
    Add { source: String },
    /// Remove @<owner>/<repo>
    Remove { name: String },
    /// List installed packages
    List,
}

#[derive(Subcommand)]
pub enum MetricsAction {
    /// Aggregate review-finding events
    Review {
        /// Window like `30d`; default is everything
        #[arg(long)]
        since: Option<String>,
    },
    /// Delete analytics files past the retention window
    Purge,
}
