//! Short-lived git clones for task isolation.
//!
//! Each task runs in a sibling clone of the project, on a dedicated
//! `takt/...` branch, with the origin remote removed so nothing can be pushed
//! upstream by accident. All git access shells out to the `git` binary.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::TaktError;

/// Submodule handling for the clone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SubmoduleSpec {
    #[default]
    None,
    All,
    Paths(Vec<String>),
}

/// Options for one clone.
#[derive(Debug, Clone, Default)]
pub struct CloneOptions {
    /// Issue identifier, folded into directory and branch names
    pub issue: Option<String>,
    /// Short slug derived from the task name
    pub slug: String,
    /// Explicit destination; a sibling directory is derived when absent
    pub destination: Option<PathBuf>,
    /// Sync the clone to origin's tip before running
    pub auto_fetch: bool,
    pub submodules: SubmoduleSpec,
}

/// A created clone.
#[derive(Debug, Clone)]
pub struct CloneHandle {
    pub path: PathBuf,
    pub branch: String,
}

/// Creates and destroys task clones of one source repository.
#[derive(Debug, Clone)]
pub struct CloneManager {
    source: PathBuf,
}

impl CloneManager {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Repository readiness: a git repo with at least one commit.
    pub async fn is_repo_ready(path: &Path) -> bool {
        let is_repo = git(path, &["rev-parse", "--git-dir"]).await.is_ok();
        if !is_repo {
            return false;
        }
        git(path, &["rev-parse", "HEAD"]).await.is_ok()
    }

    /// Base branch: origin's default branch when discoverable, else the
    /// current branch.
    pub async fn resolve_base_branch(&self) -> Result<String, TaktError> {
        if let Ok(output) = git(
            &self.source,
            &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"],
        )
        .await
        {
            if let Some(branch) = output.trim().strip_prefix("origin/") {
                return Ok(branch.to_string());
            }
        }
        let current = git(&self.source, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(current.trim().to_string())
    }

    /// Create the clone, following the fixed step order.
    pub async fn create(&self, options: &CloneOptions) -> Result<CloneHandle, TaktError> {
        let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
        let dir_name = match &options.issue {
            Some(issue) => format!("{}-{}-{}", timestamp, issue, options.slug),
            None => format!("{}-{}", timestamp, options.slug),
        };
        let destination = match &options.destination {
            Some(dest) => dest.clone(),
            None => self
                .source
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(dir_name),
        };

        if destination.exists() {
            return Err(TaktError::Concurrency {
                message: format!(
                    "Clone directory already exists: {}",
                    destination.display()
                ),
            });
        }

        let base = self.resolve_base_branch().await?;
        let branch = match &options.issue {
            Some(issue) => format!("takt/{}/{}", issue, options.slug),
            None => format!("takt/{}-{}", timestamp, options.slug),
        };

        self.clone_repo(&destination, &base, &options.submodules).await?;

        // Resolve where the work branch continues from while the clone's
        // origin remote and its tracking refs still exist.
        let branch_start = self.capture_branch_start(&destination, &branch).await;

        // Keep accidental pushes to the real upstream impossible.
        git(&destination, &["remote", "remove", "origin"]).await?;

        self.propagate_user_config(&destination).await;

        if options.auto_fetch {
            self.sync_to_origin(&destination, &base).await;
        }

        self.setup_branch(&destination, &branch, branch_start.as_deref())
            .await?;

        info!(
            "Created clone {} on branch {}",
            destination.display(),
            branch
        );
        Ok(CloneHandle {
            path: destination,
            branch,
        })
    }

    /// `git clone --reference <source> --dissociate`, retrying without the
    /// reference when the source repository is shallow.
    async fn clone_repo(
        &self,
        destination: &Path,
        base: &str,
        submodules: &SubmoduleSpec,
    ) -> Result<(), TaktError> {
        let source = self.source.display().to_string();
        let dest = destination.display().to_string();

        let mut args: Vec<String> = vec![
            "clone".into(),
            "--reference".into(),
            source.clone(),
            "--dissociate".into(),
            "--branch".into(),
            base.to_string(),
        ];
        append_submodule_args(&mut args, submodules);
        args.push(source.clone());
        args.push(dest.clone());

        match git_owned(&self.source, &args).await {
            Ok(_) => Ok(()),
            Err(TaktError::Network { message }) if message.contains("reference repository is shallow") => {
                warn!("Source is shallow, retrying clone without --reference");
                let mut args: Vec<String> =
                    vec!["clone".into(), "--branch".into(), base.to_string()];
                append_submodule_args(&mut args, submodules);
                args.push(source);
                args.push(dest);
                git_owned(&self.source, &args).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Copy user.name / user.email from the source's local config. Missing
    /// values are silently skipped.
    async fn propagate_user_config(&self, destination: &Path) {
        for key in ["user.name", "user.email"] {
            if let Ok(value) = git(&self.source, &["config", "--local", key]).await {
                let value = value.trim();
                if !value.is_empty() {
                    let _ = git(destination, &["config", key, value]).await;
                }
            }
        }
    }

    /// Fetch origin in the source and hard-reset the clone to origin's tip.
    /// Network failures are non-fatal.
    async fn sync_to_origin(&self, destination: &Path, base: &str) {
        if let Err(e) = git(&self.source, &["fetch", "origin"]).await {
            warn!("auto_fetch: fetch failed, continuing with local state: {}", e);
            return;
        }
        let remote_ref = format!("origin/{base}");
        match git(&self.source, &["rev-parse", &remote_ref]).await {
            Ok(commit) => {
                let commit = commit.trim().to_string();
                if let Err(e) = git(destination, &["reset", "--hard", &commit]).await {
                    warn!("auto_fetch: reset to {} failed: {}", commit, e);
                }
            }
            Err(e) => warn!("auto_fetch: could not resolve {}: {}", remote_ref, e),
        }
    }

    /// Find the commit the work branch should start from: an existing local
    /// branch in the source, else a remote-tracking ref of the same name.
    /// Runs before the clone's origin remote is removed, because the source's
    /// local heads only exist in the clone as `origin/*` tracking refs.
    async fn capture_branch_start(&self, destination: &Path, branch: &str) -> Option<String> {
        let local_ref = format!("refs/heads/{branch}");
        if git(&self.source, &["show-ref", "--verify", &local_ref])
            .await
            .is_ok()
        {
            let tracking_ref = format!("refs/remotes/origin/{branch}");
            match git(destination, &["rev-parse", &tracking_ref]).await {
                Ok(commit) => {
                    debug!("Branch {} exists locally in source", branch);
                    return Some(commit.trim().to_string());
                }
                Err(e) => warn!("Could not resolve {} in the clone: {}", tracking_ref, e),
            }
        }

        let remote_ref = format!("refs/remotes/origin/{branch}");
        if git(&self.source, &["show-ref", "--verify", &remote_ref])
            .await
            .is_ok()
        {
            // Only the source's remote-tracking ref has it; its objects were
            // not part of the clone, so fetch them in explicitly.
            if let Err(e) = git(destination, &["fetch", "origin", &remote_ref]).await {
                warn!("Could not fetch {}: {}", remote_ref, e);
                return None;
            }
            match git(destination, &["rev-parse", "FETCH_HEAD"]).await {
                Ok(commit) => {
                    debug!("Branch {} tracked on origin, reusing the name", branch);
                    return Some(commit.trim().to_string());
                }
                Err(e) => warn!("Could not resolve FETCH_HEAD: {}", e),
            }
        }

        None
    }

    /// Check out the work branch, continuing from the captured start point
    /// when the branch already existed, else creating it at the base.
    async fn setup_branch(
        &self,
        destination: &Path,
        branch: &str,
        start: Option<&str>,
    ) -> Result<(), TaktError> {
        match start {
            Some(commit) => {
                debug!("Branch {} continues from {}", branch, commit);
                git(destination, &["checkout", "-b", branch, commit]).await?;
            }
            None => {
                git(destination, &["checkout", "-b", branch]).await?;
            }
        }
        Ok(())
    }

    /// Remove the clone directory.
    pub async fn destroy(handle: &CloneHandle) -> Result<(), TaktError> {
        if handle.path.exists() {
            tokio::fs::remove_dir_all(&handle.path).await?;
            info!("Removed clone {}", handle.path.display());
        }
        Ok(())
    }
}

fn append_submodule_args(args: &mut Vec<String>, submodules: &SubmoduleSpec) {
    match submodules {
        SubmoduleSpec::None => {}
        SubmoduleSpec::All => args.push("--recurse-submodules".into()),
        SubmoduleSpec::Paths(paths) => {
            for path in paths {
                args.push(format!("--recurse-submodules={path}"));
            }
        }
    }
}

/// Run one git command, returning trimmed stdout. Failures map to
/// `NetworkFailure` so callers can pick local fall-backs.
async fn git(dir: &Path, args: &[&str]) -> Result<String, TaktError> {
    let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    git_owned(dir, &owned).await
}

async fn git_owned(dir: &Path, args: &[String]) -> Result<String, TaktError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(TaktError::Io)?;

    if !output.status.success() {
        return Err(TaktError::Network {
            message: format!(
                "git {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
