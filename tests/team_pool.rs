//! Team-leader worker pool: decomposition, bounded refills, aggregation.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use takt::config::{ConfigFile, TaktConfig};
use takt::engine::{ExecutionContext, MovementEngine, PieceRunner};
use takt::piece::loader::PieceLoader;
use takt::piece::PieceStatus;
use takt::provider::mock::MockInvoker;
use takt::session::{self, SessionLogWriter};

const TEAM_PIECE: &str = r#"
name: team-run
initial_movement: team
movements:
  - name: team
    persona: team-leader
    instruction: "Split and execute: {task}"
    team_leader:
      max_parts: 2
    rules:
      - condition: done
        next: COMPLETE
"#;

/// Leader proposes five parts across three plans (max_parts caps each plan at
/// two); every part worker reports done.
const FIVE_PART_SCENARIO: &str = r#"{
    "responses": {
        "team": [
            {"content": "DECOMPOSITION:\np1 | Create one.txt | Create the file one.txt\np2 | Create two.txt | Create the file two.txt\nCONTINUE: yes\nSTATUS: done"},
            {"content": "DECOMPOSITION:\np3 | Create three.txt | Create the file three.txt\np4 | Create four.txt | Create the file four.txt\nCONTINUE: yes"},
            {"content": "DECOMPOSITION:\np5 | Create five.txt | Create the file five.txt\nCONTINUE: no"}
        ],
        "p1": [{"content": "created one.txt\nSTATUS: done"}],
        "p2": [{"content": "created two.txt\nSTATUS: done"}],
        "p3": [{"content": "created three.txt\nSTATUS: done"}],
        "p4": [{"content": "created four.txt\nSTATUS: done"}],
        "p5": [{"content": "created five.txt\nSTATUS: done"}]
    }
}"#;

async fn run_team(scenario_json: &str, run_id: &str) -> (takt::engine::RunOutcome, Vec<serde_json::Value>) {
    let tmp = tempfile::TempDir::new().unwrap();
    let project_root = tmp.path().to_path_buf();
    let config = TaktConfig::merge(&project_root, ConfigFile::default(), ConfigFile::default());

    let scenario_path = project_root.join("scenario.json");
    std::fs::write(&scenario_path, scenario_json).unwrap();
    let invoker = Arc::new(MockInvoker::from_file(&scenario_path).unwrap());

    let loader = PieceLoader::new(&config);
    let piece = Arc::new(loader.load_from_str(TEAM_PIECE).unwrap());

    let ctx = ExecutionContext::new(
        &config,
        project_root.clone(),
        "create five files".to_string(),
        run_id.to_string(),
        None,
        None,
        CancellationToken::new(),
    );
    let engine = MovementEngine::new(invoker, ctx);
    let log = SessionLogWriter::create(&project_root, run_id).unwrap();
    let log_path = log.path().to_path_buf();

    let runner = PieceRunner::new(piece, engine, log, None, false);
    let outcome = runner.run().await.unwrap();
    let records = session::read_records(&log_path).unwrap();
    (outcome, records)
}

#[tokio::test]
async fn worker_pool_refills_until_plan_is_done() {
    let (outcome, records) = run_team(FIVE_PART_SCENARIO, "run-team").await;
    assert_eq!(outcome.status, PieceStatus::Completed);

    let team = records
        .iter()
        .find(|r| r["type"] == "step_complete" && r["step"] == "team")
        .expect("team step_complete");
    let content = team["content"].as_str().unwrap();

    // The aggregation contract: a decomposition header plus one
    // `## <part-id>: <part-title>` section per part.
    assert!(content.starts_with("## decomposition"));
    let header = regex::Regex::new(r"(?m)^## [^:\n]+: .+$").unwrap();
    let sections = header.find_iter(content).count();
    assert!(sections >= 5, "expected >= 5 sections, got {sections}:\n{content}");

    // Parts appear in the leader's declared order, refills after the first
    // batch.
    for pair in ["p1", "p2", "p3", "p4", "p5"].windows(2) {
        let a = content.find(&format!("## {}:", pair[0])).unwrap();
        let b = content.find(&format!("## {}:", pair[1])).unwrap();
        assert!(a < b, "{} should precede {}", pair[0], pair[1]);
    }

    // Every part also produced its own step_complete before the parent's.
    let steps: Vec<&str> = records
        .iter()
        .filter(|r| r["type"] == "step_complete")
        .map(|r| r["step"].as_str().unwrap())
        .collect();
    let parent = steps.iter().position(|s| *s == "team").unwrap();
    for part in ["p1", "p2", "p3", "p4", "p5"] {
        let position = steps.iter().position(|s| *s == part).unwrap();
        assert!(position < parent);
    }
}

#[tokio::test]
async fn failing_part_aborts_the_pool() {
    let scenario = r#"{
        "responses": {
            "team": [
                {"content": "DECOMPOSITION:\np1 | First | Do one\np2 | Second | Do two\nCONTINUE: no"}
            ],
            "p1": [{"content": "", "error": "worker exploded"}],
            "p2": [{"content": "fine\nSTATUS: done"}]
        }
    }"#;
    let (outcome, _) = run_team(scenario, "run-team-fail").await;
    assert_eq!(outcome.status, PieceStatus::Failed);
    assert!(outcome
        .abort_reason
        .unwrap()
        .contains("worker exploded"));
}

#[tokio::test]
async fn leader_without_parts_fails() {
    let scenario = r#"{
        "responses": {
            "team": [{"content": "I could not decompose this.\nSTATUS: done"}]
        }
    }"#;
    let (outcome, _) = run_team(scenario, "run-team-empty").await;
    assert_eq!(outcome.status, PieceStatus::Failed);
}
