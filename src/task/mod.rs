//! The persistent task queue.
//!
//! Tasks live in `PROJECT/.takt/tasks.yaml` under a `tasks:` array. Status
//! progresses `pending → running → completed|failed` with timestamps. The
//! scheduler is the sole writer; the file is read once at batch start and
//! written once at batch end.

pub mod clone;
pub mod scheduler;
pub mod watch;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaktError;

pub const TASKS_FILE: &str = "tasks.yaml";

/// Queue lifecycle of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// The `worktree` field accepts a boolean or a destination path; absent means
/// "use the scheduler default".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorktreeSpec {
    Flag(bool),
    Path(String),
}

/// One persisted task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub name: String,

    /// Inline task text; exactly one of `content` / `content_file` is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Path (relative to the project root) holding the task text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub piece: Option<String>,

    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<WorktreeSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_pr: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,

    /// Failure reason recorded for `failed` tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl TaskRecord {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: Some(content.into()),
            content_file: None,
            piece: None,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            branch: None,
            worktree: None,
            auto_pr: None,
            issue: None,
            failure: None,
        }
    }

    /// Resolve the task text from `content` or `content_file`.
    pub fn resolve_content(&self, project_root: &Path) -> Result<String, TaktError> {
        if let Some(content) = &self.content {
            return Ok(content.clone());
        }
        if let Some(file) = &self.content_file {
            let path = project_root.join(file);
            if !path.is_file() {
                return Err(TaktError::missing("content file", file.clone()));
            }
            return Ok(std::fs::read_to_string(path)?);
        }
        Err(TaktError::validation(format!(
            "Task '{}' has neither content nor content_file",
            self.name
        )))
    }
}

/// On-disk shape of tasks.yaml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TasksFile {
    #[serde(default)]
    tasks: Vec<TaskRecord>,
}

/// In-memory handle on the queue file.
#[derive(Debug)]
pub struct TaskQueue {
    path: PathBuf,
    pub tasks: Vec<TaskRecord>,
}

impl TaskQueue {
    pub fn path_for(project_root: &Path) -> PathBuf {
        project_root.join(".takt").join(TASKS_FILE)
    }

    /// Load the queue; a missing file is an empty queue.
    pub fn load(project_root: &Path) -> Result<Self, TaktError> {
        let path = Self::path_for(project_root);
        let tasks = if path.is_file() {
            let contents = std::fs::read_to_string(&path)?;
            let file: TasksFile = serde_yaml::from_str(&contents)?;
            file.tasks
        } else {
            Vec::new()
        };
        Ok(Self { path, tasks })
    }

    /// Write the queue back. One writer, one write per batch.
    pub fn save(&self) -> Result<(), TaktError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = TasksFile {
            tasks: self.tasks.clone(),
        };
        std::fs::write(&self.path, serde_yaml::to_string(&file)?)?;
        Ok(())
    }

    pub fn add(&mut self, task: TaskRecord) {
        self.tasks.push(task);
    }

    /// Generate the next auto task name (`task-<n>`).
    pub fn next_auto_name(&self) -> String {
        let max: u32 = self
            .tasks
            .iter()
            .filter_map(|t| t.name.strip_prefix("task-"))
            .filter_map(|n| n.parse().ok())
            .max()
            .unwrap_or(0);
        format!("task-{}", max + 1)
    }

    /// Indices of up to `limit` pending tasks, in queue order.
    pub fn pending_indices(&self, limit: usize) -> Vec<usize> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == TaskStatus::Pending)
            .map(|(i, _)| i)
            .take(limit)
            .collect()
    }

    pub fn mark_running(&mut self, index: usize) {
        let task = &mut self.tasks[index];
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, index: usize) {
        let task = &mut self.tasks[index];
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, index: usize, failure: impl Into<String>) {
        let task = &mut self.tasks[index];
        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now());
        task.failure = Some(failure.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_queue_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let mut queue = TaskQueue::load(tmp.path()).unwrap();
        assert!(queue.tasks.is_empty());

        queue.add(TaskRecord::new("task-1", "fix the login bug"));
        queue.save().unwrap();

        let reloaded = TaskQueue::load(tmp.path()).unwrap();
        assert_eq!(reloaded.tasks.len(), 1);
        assert_eq!(reloaded.tasks[0].name, "task-1");
        assert_eq!(reloaded.tasks[0].status, TaskStatus::Pending);
    }

    #[test]
    fn test_status_transitions_with_timestamps() {
        let tmp = TempDir::new().unwrap();
        let mut queue = TaskQueue::load(tmp.path()).unwrap();
        queue.add(TaskRecord::new("task-1", "x"));

        queue.mark_running(0);
        assert_eq!(queue.tasks[0].status, TaskStatus::Running);
        assert!(queue.tasks[0].started_at.is_some());

        queue.mark_failed(0, "provider crashed");
        assert_eq!(queue.tasks[0].status, TaskStatus::Failed);
        assert!(queue.tasks[0].completed_at.is_some());
        assert_eq!(queue.tasks[0].failure.as_deref(), Some("provider crashed"));
    }

    #[test]
    fn test_pending_batch_selection() {
        let tmp = TempDir::new().unwrap();
        let mut queue = TaskQueue::load(tmp.path()).unwrap();
        for i in 0..4 {
            queue.add(TaskRecord::new(format!("task-{i}"), "x"));
        }
        queue.mark_completed(1);

        let batch = queue.pending_indices(2);
        assert_eq!(batch, vec![0, 2]);
    }

    #[test]
    fn test_auto_name_generation() {
        let tmp = TempDir::new().unwrap();
        let mut queue = TaskQueue::load(tmp.path()).unwrap();
        assert_eq!(queue.next_auto_name(), "task-1");
        queue.add(TaskRecord::new("task-7", "x"));
        queue.add(TaskRecord::new("named-differently", "x"));
        assert_eq!(queue.next_auto_name(), "task-8");
    }

    #[test]
    fn test_worktree_spec_forms() {
        let yaml = "name: a\nstatus: pending\ncreated_at: 2026-01-01T00:00:00Z\ncontent: x\nworktree: true\n";
        let task: TaskRecord = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(task.worktree, Some(WorktreeSpec::Flag(true)));

        let yaml = "name: a\nstatus: pending\ncreated_at: 2026-01-01T00:00:00Z\ncontent: x\nworktree: ../clones/here\n";
        let task: TaskRecord = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            task.worktree,
            Some(WorktreeSpec::Path("../clones/here".to_string()))
        );

        let yaml = "name: a\nstatus: pending\ncreated_at: 2026-01-01T00:00:00Z\ncontent: x\n";
        let task: TaskRecord = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(task.worktree, None);
    }

    #[test]
    fn test_content_file_resolution() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("task.md"), "do the thing").unwrap();
        let mut task = TaskRecord::new("t", "");
        task.content = None;
        task.content_file = Some("task.md".to_string());
        assert_eq!(task.resolve_content(tmp.path()).unwrap(), "do the thing");

        task.content_file = Some("missing.md".to_string());
        assert!(task.resolve_content(tmp.path()).is_err());
    }
}
