//! Queue drain end-to-end: tasks.yaml in, piece runs via the mock provider,
//! statuses and session logs out.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use takt::config::{ConfigFile, TaktConfig};
use takt::provider::mock::MockInvoker;
use takt::task::scheduler::{PieceTaskRunner, Scheduler};
use takt::task::{TaskQueue, TaskRecord, TaskStatus, WorktreeSpec};

/// Full in-place drain: two tasks, one succeeds, one aborts on an unmatched
/// rule; the batch completes and per-task statuses land in tasks.yaml.
#[tokio::test]
async fn drain_runs_pieces_and_records_statuses() {
    let tmp = tempfile::TempDir::new().unwrap();
    let project_root = tmp.path().join("project");
    std::fs::create_dir_all(&project_root).unwrap();

    // Point the user dir at the sandbox so analytics and user config stay in
    // the test tree.
    std::env::set_var("TAKT_CONFIG_DIR", tmp.path().join("home").display().to_string());

    // A trivial one-movement piece in the project layer.
    let pieces_dir = project_root.join(".takt").join("pieces");
    std::fs::create_dir_all(&pieces_dir).unwrap();
    std::fs::write(
        pieces_dir.join("single.yaml"),
        "name: single\ninitial_movement: only\nmovements:\n  - name: only\n    instruction: \"{task}\"\n    rules:\n      - condition: done\n        next: COMPLETE\n",
    )
    .unwrap();

    let scenario_path = tmp.path().join("scenario.json");
    std::fs::write(
        &scenario_path,
        r#"{
            "responses": {
                "only": [
                    {"content": "ok\nSTATUS: done"},
                    {"content": "confused\nSTATUS: unknown_tag"}
                ]
            }
        }"#,
    )
    .unwrap();

    let mut queue = TaskQueue::load(&project_root).unwrap();
    let mut good = TaskRecord::new("task-1", "do the good thing");
    good.piece = Some("single".to_string());
    good.worktree = Some(WorktreeSpec::Flag(false));
    let mut bad = TaskRecord::new("task-2", "do the confusing thing");
    bad.piece = Some("single".to_string());
    bad.worktree = Some(WorktreeSpec::Flag(false));
    queue.add(good);
    queue.add(bad);
    queue.save().unwrap();

    let config = TaktConfig::merge(&project_root, ConfigFile::default(), ConfigFile::default());
    let runner = PieceTaskRunner {
        config: config.clone(),
        invoker: Arc::new(MockInvoker::from_file(&scenario_path).unwrap()),
        cli_provider: None,
        cli_model: None,
    };
    let scheduler = Scheduler::new(config, Arc::new(runner), CancellationToken::new(), false);

    let summary = scheduler.drain().await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);

    let queue = TaskQueue::load(&project_root).unwrap();
    assert_eq!(queue.tasks[0].status, TaskStatus::Completed);
    assert!(queue.tasks[0].started_at.is_some());
    assert!(queue.tasks[0].completed_at.is_some());
    assert_eq!(queue.tasks[1].status, TaskStatus::Failed);
    assert!(queue.tasks[1]
        .failure
        .as_deref()
        .unwrap()
        .contains("No matching rule"));

    // Each run produced its own session log with piece_start first.
    let runs_dir = project_root.join(".takt").join("runs");
    let mut logs = Vec::new();
    for entry in walk(&runs_dir) {
        if entry.extension().and_then(|e| e.to_str()) == Some("jsonl") {
            logs.push(entry);
        }
    }
    assert_eq!(logs.len(), 2);
    for log in logs {
        let records = takt::session::read_records(&log).unwrap();
        assert_eq!(records[0]["type"], "piece_start");
    }

    std::env::remove_var("TAKT_CONFIG_DIR");
}

fn walk(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                files.extend(walk(&path));
            } else {
                files.push(path);
            }
        }
    }
    files
}
