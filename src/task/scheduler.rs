//! The task scheduler: drains the persistent queue with bounded concurrency,
//! isolating each task in a short-lived clone and gating clone creation on
//! repository readiness.
//!
//! Sequential mode (`concurrency = 1`) executes in the project's own working
//! copy unless the task asks for a clone. Parallel mode reads a batch of
//! pending tasks, runs each in its own clone with a shared abort signal, and
//! writes the queue file exactly once per batch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::analytics::AnalyticsWriter;
use crate::config::TaktConfig;
use crate::engine::{ExecutionContext, MovementEngine, PieceRunner};
use crate::error::TaktError;
use crate::piece::loader::PieceLoader;
use crate::piece::PieceStatus;
use crate::provider::AgentInvoker;
use crate::session::SessionLogWriter;
use crate::task::clone::{CloneManager, CloneOptions, SubmoduleSpec};
use crate::task::{TaskQueue, TaskRecord, WorktreeSpec};

/// Executes one task inside a prepared working directory.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(
        &self,
        task: &TaskRecord,
        task_text: &str,
        working_dir: &Path,
        quiet: bool,
        cancel: CancellationToken,
    ) -> Result<(), TaktError>;
}

/// Result counters for one drain invocation.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

enum ExecOutcome {
    Done,
    Skipped,
    Failed(String),
}

/// Concurrency-bounded queue executor.
pub struct Scheduler {
    config: TaktConfig,
    runner: Arc<dyn TaskRunner>,
    cancel: CancellationToken,
    interactive: bool,
}

impl Scheduler {
    pub fn new(
        config: TaktConfig,
        runner: Arc<dyn TaskRunner>,
        cancel: CancellationToken,
        interactive: bool,
    ) -> Self {
        Self {
            config,
            runner,
            cancel,
            interactive,
        }
    }

    /// Drain pending tasks batch by batch until the queue is empty or the
    /// umbrella signal fires. Partial failures never abort a batch.
    pub async fn drain(&self) -> Result<DrainSummary, TaktError> {
        let mut summary = DrainSummary::default();
        let project_root = self.config.project_root.clone();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let mut queue = TaskQueue::load(&project_root)?;
            let batch = queue.pending_indices(self.config.concurrency);
            if batch.is_empty() {
                break;
            }
            // Statuses accumulate in memory; the file is written exactly once
            // per batch, so a crash mid-batch leaves the tasks pending and
            // they are retried on the next drain.
            for &index in &batch {
                queue.mark_running(index);
            }

            let parallel = self.config.concurrency > 1;
            let outcomes: Vec<(usize, ExecOutcome)> = if parallel {
                let futures = batch.iter().map(|&index| {
                    let task = queue.tasks[index].clone();
                    async move { (index, self.execute_one(&task, true).await) }
                });
                futures::future::join_all(futures).await
            } else {
                let mut outcomes = Vec::new();
                for &index in &batch {
                    let task = queue.tasks[index].clone();
                    outcomes.push((index, self.execute_one(&task, false).await));
                    if self.cancel.is_cancelled() {
                        break;
                    }
                }
                outcomes
            };

            for (index, outcome) in outcomes {
                match outcome {
                    ExecOutcome::Done => {
                        queue.mark_completed(index);
                        summary.completed += 1;
                    }
                    ExecOutcome::Failed(reason) => {
                        warn!("Task '{}' failed: {}", queue.tasks[index].name, reason);
                        queue.mark_failed(index, reason);
                        summary.failed += 1;
                    }
                    ExecOutcome::Skipped => {
                        // Back to pending; the user declined the fall-back.
                        queue.tasks[index].status = crate::task::TaskStatus::Pending;
                        queue.tasks[index].started_at = None;
                        summary.skipped += 1;
                    }
                }
            }
            queue.save()?;

            if summary.skipped > 0 {
                // Skipped tasks would be picked up again immediately.
                break;
            }
        }

        info!(
            "Queue drained: {} completed, {} failed, {} skipped",
            summary.completed, summary.failed, summary.skipped
        );
        Ok(summary)
    }

    /// Execute one task, deciding between in-place and clone isolation.
    async fn execute_one(&self, task: &TaskRecord, parallel: bool) -> ExecOutcome {
        let project_root = self.config.project_root.clone();

        let text = match task.resolve_content(&project_root) {
            Ok(text) => text,
            Err(e) => return ExecOutcome::Failed(e.to_string()),
        };

        let wants_clone = match &task.worktree {
            Some(WorktreeSpec::Flag(false)) => false,
            Some(_) => true,
            // Scheduler default: clone in parallel batches, in place when
            // sequential.
            None => parallel,
        };

        let working_dir: PathBuf = if wants_clone {
            match self.prepare_clone(task, &project_root).await {
                Ok(Some(path)) => path,
                Ok(None) => return ExecOutcome::Skipped,
                Err(e) => return ExecOutcome::Failed(e.to_string()),
            }
        } else {
            project_root.clone()
        };

        let child_cancel = self.cancel.child_token();
        match self
            .runner
            .run_task(task, &text, &working_dir, parallel, child_cancel)
            .await
        {
            Ok(()) => ExecOutcome::Done,
            Err(e) => ExecOutcome::Failed(e.to_string()),
        }
    }

    /// Clone gating: check readiness, fall back to in-place when allowed.
    /// `Ok(None)` means the user declined and the task should be skipped.
    async fn prepare_clone(
        &self,
        task: &TaskRecord,
        project_root: &Path,
    ) -> Result<Option<PathBuf>, TaktError> {
        if !CloneManager::is_repo_ready(project_root).await {
            if self.interactive && !TaktConfig::no_tty() {
                let proceed = crate::cli::interactive::confirm(&format!(
                    "Repository at {} is not ready for cloning (no commits?). Run task '{}' in place?",
                    project_root.display(),
                    task.name
                ));
                if !proceed {
                    return Ok(None);
                }
            } else {
                warn!("Repository not ready for cloning; falling back to in-place execution");
            }
            return Ok(Some(project_root.to_path_buf()));
        }

        let manager = CloneManager::new(project_root);
        let options = CloneOptions {
            issue: task.issue.clone(),
            slug: slugify(&task.name),
            destination: match &task.worktree {
                Some(WorktreeSpec::Path(path)) => Some(project_root.join(path)),
                _ => None,
            },
            auto_fetch: self.config.auto_fetch,
            submodules: SubmoduleSpec::None,
        };
        let handle = manager.create(&options).await?;
        Ok(Some(handle.path))
    }
}

/// Reduce a task name to a filesystem/branch-safe slug.
pub fn slugify(name: &str) -> String {
    let mut slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug.chars().take(32).collect()
    }
}

/// The production task runner: loads the piece and drives a full engine run.
pub struct PieceTaskRunner {
    pub config: TaktConfig,
    pub invoker: Arc<dyn AgentInvoker>,
    pub cli_provider: Option<String>,
    pub cli_model: Option<String>,
}

#[async_trait]
impl TaskRunner for PieceTaskRunner {
    async fn run_task(
        &self,
        task: &TaskRecord,
        task_text: &str,
        working_dir: &Path,
        quiet: bool,
        cancel: CancellationToken,
    ) -> Result<(), TaktError> {
        let piece_name = task
            .piece
            .clone()
            .unwrap_or_else(|| self.config.default_piece.clone());
        let loader = PieceLoader::new(&self.config);
        let piece = Arc::new(loader.load_by_name(&piece_name)?);

        let run_id = uuid::Uuid::new_v4().to_string();
        let log = SessionLogWriter::create(&self.config.project_root, &run_id)?;
        if !quiet {
            info!("Run {} of piece '{}' for task '{}'", run_id, piece_name, task.name);
        }

        let ctx = ExecutionContext::new(
            &self.config,
            working_dir.to_path_buf(),
            task_text.to_string(),
            run_id,
            self.cli_provider.clone(),
            self.cli_model.clone(),
            cancel,
        );
        let engine = MovementEngine::new(self.invoker.clone(), ctx);
        let analytics = AnalyticsWriter::new(&TaktConfig::user_dir());
        let runner = PieceRunner::new(
            piece,
            engine,
            log,
            Some(analytics),
            self.config.alignment_check,
        );

        let outcome = runner.run().await?;
        match outcome.status {
            PieceStatus::Completed => Ok(()),
            PieceStatus::Aborted | PieceStatus::Failed | PieceStatus::Running => {
                Err(TaktError::aborted(
                    outcome
                        .abort_reason
                        .unwrap_or_else(|| "piece did not complete".to_string()),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRunner {
        calls: AtomicUsize,
        fail_names: Vec<String>,
    }

    #[async_trait]
    impl TaskRunner for CountingRunner {
        async fn run_task(
            &self,
            task: &TaskRecord,
            _task_text: &str,
            _working_dir: &Path,
            _quiet: bool,
            _cancel: CancellationToken,
        ) -> Result<(), TaktError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_names.contains(&task.name) {
                return Err(TaktError::aborted("scripted failure"));
            }
            Ok(())
        }
    }

    fn scheduler_for(tmp: &tempfile::TempDir, concurrency: usize, fail: &[&str]) -> Scheduler {
        let project = ConfigFile {
            concurrency: Some(concurrency),
            ..Default::default()
        };
        let config = TaktConfig::merge(tmp.path(), ConfigFile::default(), project);
        Scheduler::new(
            config,
            Arc::new(CountingRunner {
                calls: AtomicUsize::new(0),
                fail_names: fail.iter().map(|s| s.to_string()).collect(),
            }),
            CancellationToken::new(),
            false,
        )
    }

    #[tokio::test]
    async fn test_sequential_drain_marks_statuses() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut queue = TaskQueue::load(tmp.path()).unwrap();
        queue.add(TaskRecord::new("task-1", "a"));
        queue.add(TaskRecord::new("task-2", "b"));
        queue.save().unwrap();

        let scheduler = scheduler_for(&tmp, 1, &["task-2"]);
        let summary = scheduler.drain().await.unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);

        let queue = TaskQueue::load(tmp.path()).unwrap();
        assert_eq!(queue.tasks[0].status, crate::task::TaskStatus::Completed);
        assert_eq!(queue.tasks[1].status, crate::task::TaskStatus::Failed);
        assert!(queue.tasks[1].failure.as_deref().unwrap().contains("scripted"));
    }

    #[tokio::test]
    async fn test_partial_failure_does_not_abort_batch() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut queue = TaskQueue::load(tmp.path()).unwrap();
        for i in 0..3 {
            // In-place execution so the parallel batch needs no git repo.
            let mut task = TaskRecord::new(format!("task-{i}"), "x");
            task.worktree = Some(WorktreeSpec::Flag(false));
            queue.add(task);
        }
        queue.save().unwrap();

        let scheduler = scheduler_for(&tmp, 3, &["task-1"]);
        let summary = scheduler.drain().await.unwrap();
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_drain_empty_queue() {
        let tmp = tempfile::TempDir::new().unwrap();
        let scheduler = scheduler_for(&tmp, 1, &[]);
        let summary = scheduler.drain().await.unwrap();
        assert_eq!(summary, DrainSummary::default());
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Fix the Login Bug!"), "fix-the-login-bug");
        assert_eq!(slugify("___"), "task");
        assert!(slugify(&"x".repeat(100)).len() <= 32);
    }
}
