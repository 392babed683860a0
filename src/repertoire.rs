//! The repertoire package store.
//!
//! Externally-sourced packages of pieces and facets are installed under
//! `USER_HOME/.takt/repertoire/@<owner>/<repo>/`. Installs are atomic via a
//! two-step rename (`.tmp` staging, `.bak` swap) so the filesystem never
//! exposes a half-installed package; recovery at the next invocation cleans
//! any residue from a crash.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::TaktError;
use crate::piece::facet::is_traversal_free;

pub const MANIFEST_FILE: &str = "takt-repertoire.yaml";
pub const LOCK_FILE: &str = ".takt-repertoire-lock.yaml";

/// A `github:<owner>/<repo>[@<ref>]` package source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    pub owner: String,
    pub repo: String,
    pub git_ref: Option<String>,
}

impl PackageSpec {
    /// Parse `github:<owner>/<repo>[@<ref>]`.
    pub fn parse(input: &str) -> Result<Self, TaktError> {
        let rest = input.strip_prefix("github:").ok_or_else(|| {
            TaktError::validation(format!(
                "Package source must start with 'github:', got '{input}'"
            ))
        })?;
        let (path, git_ref) = match rest.split_once('@') {
            Some((path, r)) if !r.is_empty() => (path, Some(r.to_string())),
            Some((path, _)) => (path, None),
            None => (rest, None),
        };
        let (owner, repo) = path.split_once('/').ok_or_else(|| {
            TaktError::validation(format!("Expected <owner>/<repo> in '{input}'"))
        })?;
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return Err(TaktError::validation(format!(
                "Expected <owner>/<repo> in '{input}'"
            )));
        }
        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            git_ref,
        })
    }

    /// Parse the installed name `@<owner>/<repo>`.
    pub fn parse_installed(input: &str) -> Result<Self, TaktError> {
        let rest = input.strip_prefix('@').ok_or_else(|| {
            TaktError::validation(format!("Package name must start with '@', got '{input}'"))
        })?;
        let (owner, repo) = rest.split_once('/').ok_or_else(|| {
            TaktError::validation(format!("Expected @<owner>/<repo> in '{input}'"))
        })?;
        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            git_ref: None,
        })
    }

    pub fn source_string(&self) -> String {
        format!("github:{}/{}", self.owner, self.repo)
    }

    pub fn installed_name(&self) -> String {
        format!("@{}/{}", self.owner, self.repo)
    }

    pub fn clone_url(&self) -> String {
        format!("https://github.com/{}/{}.git", self.owner, self.repo)
    }
}

/// The package manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Location of the package content inside the repository, relative and
    /// non-traversing
    pub path: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub takt: Option<TaktSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaktSection {
    #[serde(default)]
    pub min_version: Option<String>,
}

/// The lockfile written into every installed package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lockfile {
    pub source: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub commit: String,
    pub imported_at: DateTime<Utc>,
}

/// An installed package as shown by `repertoire list`.
#[derive(Debug, Clone)]
pub struct InstalledPackage {
    pub name: String,
    pub lock: Option<Lockfile>,
}

/// Strict `MAJOR.MINOR.PATCH` parse: no leading `v`, no pre-release.
pub fn parse_strict_version(version: &str) -> Result<(u64, u64, u64), TaktError> {
    let parts: Vec<&str> = version.split('.').collect();
    let invalid = || {
        TaktError::validation(format!(
            "min_version must be MAJOR.MINOR.PATCH, got '{version}'"
        ))
    };
    if parts.len() != 3 {
        return Err(invalid());
    }
    let mut numbers = [0u64; 3];
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        numbers[i] = part.parse().map_err(|_| invalid())?;
    }
    Ok((numbers[0], numbers[1], numbers[2]))
}

/// The local package store.
#[derive(Debug, Clone)]
pub struct RepertoireStore {
    root: PathBuf,
}

impl RepertoireStore {
    /// Store root: `<user takt dir>/repertoire`.
    pub fn new(user_dir: &Path) -> Self {
        Self {
            root: user_dir.join("repertoire"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn package_dir(&self, spec: &PackageSpec) -> PathBuf {
        self.root
            .join(format!("@{}", spec.owner))
            .join(&spec.repo)
    }

    fn tmp_dir(&self, spec: &PackageSpec) -> PathBuf {
        let dir = self.package_dir(spec);
        dir.with_file_name(format!("{}.tmp", spec.repo))
    }

    fn bak_dir(&self, spec: &PackageSpec) -> PathBuf {
        let dir = self.package_dir(spec);
        dir.with_file_name(format!("{}.bak", spec.repo))
    }

    /// Crash recovery, run on every invocation: a leftover `.tmp` is removed;
    /// a `.bak` without a completed package is restored. The end state is
    /// target-only or nothing.
    pub fn recover(&self, spec: &PackageSpec) -> Result<(), TaktError> {
        let tmp = self.tmp_dir(spec);
        if tmp.exists() {
            warn!("Removing stale staging directory {}", tmp.display());
            std::fs::remove_dir_all(&tmp)?;
        }

        let target = self.package_dir(spec);
        let bak = self.bak_dir(spec);
        if bak.exists() {
            if target.exists() {
                // The install completed; the backup is residue.
                std::fs::remove_dir_all(&bak)?;
            } else {
                warn!("Restoring {} from backup", target.display());
                std::fs::rename(&bak, &target)?;
            }
        }
        Ok(())
    }

    /// Fetch the package source via git and install it atomically.
    pub async fn install(&self, spec: &PackageSpec) -> Result<Lockfile, TaktError> {
        self.recover(spec)?;

        let tmp = self.tmp_dir(spec);
        if let Some(parent) = tmp.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let commit = fetch_into(spec, &tmp).await.inspect_err(|_| {
            let _ = std::fs::remove_dir_all(&tmp);
        })?;

        let result = self.install_staged(spec, &commit).await;
        if result.is_err() {
            let _ = std::fs::remove_dir_all(&tmp);
        }
        result
    }

    /// Validate the staged tree and run the rename dance. Split from
    /// [`Self::install`] so tests can stage a directory without git.
    pub async fn install_staged(
        &self,
        spec: &PackageSpec,
        commit: &str,
    ) -> Result<Lockfile, TaktError> {
        let tmp = self.tmp_dir(spec);
        let manifest = validate_package(&tmp)?;
        debug!(
            "Manifest ok for {}: path='{}'",
            spec.installed_name(),
            manifest.path
        );

        let target = self.package_dir(spec);
        let bak = self.bak_dir(spec);

        if target.exists() {
            std::fs::rename(&target, &bak)?;
        }
        std::fs::rename(&tmp, &target)?;
        if bak.exists() {
            std::fs::remove_dir_all(&bak)?;
        }

        let lock = Lockfile {
            source: spec.source_string(),
            git_ref: spec.git_ref.clone().unwrap_or_else(|| "HEAD".to_string()),
            commit: commit.to_string(),
            imported_at: Utc::now(),
        };
        std::fs::write(target.join(LOCK_FILE), serde_yaml::to_string(&lock)?)?;

        info!("Installed {} at {}", spec.installed_name(), &commit[..commit.len().min(7)]);
        Ok(lock)
    }

    /// Remove an installed package. Files referencing it are left untouched;
    /// the caller surfaces the returned reference list as a warning.
    pub fn remove(&self, spec: &PackageSpec) -> Result<(), TaktError> {
        let target = self.package_dir(spec);
        if !target.exists() {
            return Err(TaktError::missing("package", spec.installed_name()));
        }
        std::fs::remove_dir_all(&target)?;

        // Drop the @owner directory when it became empty.
        if let Some(owner_dir) = target.parent() {
            if owner_dir.is_dir()
                && std::fs::read_dir(owner_dir)?.next().is_none()
            {
                std::fs::remove_dir(owner_dir)?;
            }
        }
        info!("Removed {}", spec.installed_name());
        Ok(())
    }

    /// Project files whose content references `from: @owner/repo`.
    pub fn find_references(
        &self,
        spec: &PackageSpec,
        project_root: &Path,
    ) -> Result<Vec<PathBuf>, TaktError> {
        let needle = format!("from: {}", spec.installed_name());
        let pieces_dir = project_root.join(".takt").join("pieces");
        let mut references = Vec::new();
        if !pieces_dir.is_dir() {
            return Ok(references);
        }
        for entry in WalkDir::new(&pieces_dir).into_iter().flatten() {
            if entry.file_type().is_file() {
                if let Ok(content) = std::fs::read_to_string(entry.path()) {
                    if content.contains(&needle) {
                        references.push(entry.path().to_path_buf());
                    }
                }
            }
        }
        Ok(references)
    }

    /// Every installed package with its lockfile.
    pub fn list(&self) -> Result<Vec<InstalledPackage>, TaktError> {
        let mut packages = Vec::new();
        if !self.root.is_dir() {
            return Ok(packages);
        }
        for owner_entry in std::fs::read_dir(&self.root)? {
            let owner_path = owner_entry?.path();
            let Some(owner_name) = owner_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !owner_path.is_dir() || !owner_name.starts_with('@') {
                continue;
            }
            for repo_entry in std::fs::read_dir(&owner_path)? {
                let repo_path = repo_entry?.path();
                if !repo_path.is_dir() {
                    continue;
                }
                let Some(repo_name) = repo_path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if repo_name.ends_with(".tmp") || repo_name.ends_with(".bak") {
                    continue;
                }
                let lock = std::fs::read_to_string(repo_path.join(LOCK_FILE))
                    .ok()
                    .and_then(|contents| serde_yaml::from_str(&contents).ok());
                packages.push(InstalledPackage {
                    name: format!("{owner_name}/{repo_name}"),
                    lock,
                });
            }
        }
        packages.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(packages)
    }
}

/// Validate a staged package tree and return its manifest.
pub fn validate_package(staged: &Path) -> Result<Manifest, TaktError> {
    let manifest_path = staged.join(MANIFEST_FILE);
    if !manifest_path.is_file() {
        return Err(TaktError::validation(format!(
            "Package has no {MANIFEST_FILE}"
        )));
    }
    let manifest: Manifest = serde_yaml::from_str(&std::fs::read_to_string(&manifest_path)?)?;

    if Path::new(&manifest.path).is_absolute() || !is_traversal_free(&manifest.path) {
        return Err(TaktError::validation(format!(
            "Manifest path '{}' escapes the package root",
            manifest.path
        )));
    }

    if let Some(min_version) = manifest.takt.as_ref().and_then(|t| t.min_version.as_deref()) {
        let required = parse_strict_version(min_version)?;
        let running = parse_strict_version(env!("CARGO_PKG_VERSION"))?;
        if required > running {
            return Err(TaktError::validation(format!(
                "Package requires takt {} but this is {}",
                min_version,
                env!("CARGO_PKG_VERSION")
            )));
        }
    }

    let content_root = staged.join(&manifest.path);
    let has_facets = content_root.join("facets").is_dir();
    let has_pieces = content_root.join("pieces").is_dir();
    if !has_facets && !has_pieces {
        return Err(TaktError::validation(
            "Package contains neither facets/ nor pieces/".to_string(),
        ));
    }

    Ok(manifest)
}

/// Clone the source ref into the staging directory and return the resolved
/// commit. The `.git` directory is stripped; a failed fetch is fatal for
/// installs.
async fn fetch_into(spec: &PackageSpec, staging: &Path) -> Result<String, TaktError> {
    let mut args: Vec<String> = vec!["clone".into(), "--depth".into(), "1".into()];
    if let Some(git_ref) = &spec.git_ref {
        args.push("--branch".into());
        args.push(git_ref.clone());
    }
    args.push(spec.clone_url());
    args.push(staging.display().to_string());

    let output = Command::new("git").args(&args).output().await?;
    if !output.status.success() {
        return Err(TaktError::Network {
            message: format!(
                "Failed to fetch {}: {}",
                spec.source_string(),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    let rev = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(staging)
        .output()
        .await?;
    if !rev.status.success() {
        return Err(TaktError::Network {
            message: "Could not resolve the fetched commit".to_string(),
        });
    }
    let commit = String::from_utf8_lossy(&rev.stdout).trim().to_string();

    let git_dir = staging.join(".git");
    if git_dir.exists() {
        std::fs::remove_dir_all(git_dir)?;
    }
    Ok(commit)
}
