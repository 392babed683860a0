//! Watch mode: poll `PROJECT/.takt/tasks/` for new task files and execute
//! each as it appears. Exits on SIGINT.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::TaktError;
use crate::task::scheduler::Scheduler;
use crate::task::{TaskQueue, TaskRecord};

/// Poll interval for the watch loop.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Directory scanned for incoming task files.
pub fn watch_dir(project_root: &Path) -> PathBuf {
    project_root.join(".takt").join("tasks")
}

/// Run the watch loop until the cancel token (wired to SIGINT) fires.
pub async fn watch(
    project_root: &Path,
    scheduler: &Scheduler,
    cancel: CancellationToken,
) -> Result<usize, TaktError> {
    let dir = watch_dir(project_root);
    std::fs::create_dir_all(&dir)?;
    let processed_dir = dir.join("processed");
    std::fs::create_dir_all(&processed_dir)?;

    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut executed = 0usize;

    info!("Watching {} for task files", dir.display());

    loop {
        if cancel.is_cancelled() {
            break;
        }

        for path in scan_task_files(&dir)? {
            if seen.contains(&path) {
                continue;
            }
            seen.insert(path.clone());

            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!("Could not read task file {}: {}", path.display(), e);
                    continue;
                }
            };
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("task")
                .to_string();
            info!("New task file: {}", path.display());

            let mut queue = TaskQueue::load(project_root)?;
            queue.add(TaskRecord::new(name, content.trim().to_string()));
            queue.save()?;

            scheduler.drain().await?;
            executed += 1;

            if let Some(file_name) = path.file_name() {
                let target = processed_dir.join(file_name);
                if let Err(e) = std::fs::rename(&path, &target) {
                    warn!("Could not archive processed task file: {}", e);
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = cancel.cancelled() => break,
        }
    }

    Ok(executed)
}

fn scan_task_files(dir: &Path) -> Result<Vec<PathBuf>, TaktError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
