//! Test: linear advancement and run completion

use crate::helpers::*;
use conductor::{EngineStore, RunStatus, StartRun, StepStatus};

const CHAIN: &str = r#"
id: "p1"
name: "Two Step Chain"
steps:
  - id: "step_a"
    agent: "planner"
    on_complete: "step_b"
  - id: "step_b"
    agent: "coder"
"#;

/// stepA completes with {x: "1"}, engine queues stepB; stepB completes as
/// the last step and the run finishes with the accumulated outputs.
#[tokio::test]
async fn test_linear_chain_completes_with_outputs() {
    let h = harness(&[CHAIN]).await;

    let run_id = h
        .engine
        .start_run(StartRun::new("p1", "ship it"))
        .await
        .unwrap();

    let first = h.next_queued().await;
    assert_eq!(first.step_id, "step_a");
    assert_eq!(first.agent_id, "planner");

    h.start_step(&run_id, "step_a").await;
    assert_run_status(&h, &run_id, RunStatus::Running).await;
    assert_eq!(
        h.run(&run_id).await.current_step_id.as_deref(),
        Some("step_a")
    );

    h.complete_step(&run_id, "step_a", &[("x", "1")]).await;
    assert_eq!(h.step_status(&run_id, "step_a").await, StepStatus::Completed);

    let second = h.next_queued().await;
    assert_eq!(second.step_id, "step_b");
    assert_eq!(second.agent_id, "coder");

    // Outputs set by stepA are already visible to later routing.
    let outputs = h.store.get_outputs(&run_id).await.unwrap();
    assert_eq!(outputs.get("x").map(String::as_str), Some("1"));

    h.start_step(&run_id, "step_b").await;
    h.complete_step(&run_id, "step_b", &[("y", "2")]).await;

    assert_run_status(&h, &run_id, RunStatus::Completed).await;
    let final_outputs = assert_run_complete_event(&h, &run_id);
    assert_eq!(final_outputs.get("x").map(String::as_str), Some("1"));
    assert_eq!(final_outputs.get("y").map(String::as_str), Some("2"));

    let completed = h.hooks.completed.lock().unwrap().clone();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].0, run_id);

    h.assert_nothing_queued().await;
}

/// Empty output values are not merged into the accumulated outputs.
#[tokio::test]
async fn test_empty_outputs_not_accumulated() {
    let h = harness(&[CHAIN]).await;

    let run_id = h
        .engine
        .start_run(StartRun::new("p1", "ship it"))
        .await
        .unwrap();
    h.next_queued().await;

    h.complete_step(&run_id, "step_a", &[("kept", "v"), ("dropped", "")])
        .await;

    let outputs = h.store.get_outputs(&run_id).await.unwrap();
    assert_eq!(outputs.get("kept").map(String::as_str), Some("v"));
    assert!(!outputs.contains_key("dropped"));
}

/// A mid-pipeline step with no route forward is a configuration error.
#[tokio::test]
async fn test_step_without_route_fails_run() {
    let yaml = r#"
id: "p2"
name: "Dead End"
steps:
  - id: "stuck"
    agent: "x"
  - id: "after"
    agent: "x"
"#;
    let h = harness(&[yaml]).await;

    let run_id = h
        .engine
        .start_run(StartRun::new("p2", "dead end"))
        .await
        .unwrap();
    h.next_queued().await;

    h.complete_step(&run_id, "stuck", &[]).await;

    assert_run_status(&h, &run_id, RunStatus::Failed).await;
    assert_run_failed_event(&h, &run_id, "stuck");
    h.assert_nothing_queued().await;
}

/// A single-step pipeline completes directly.
#[tokio::test]
async fn test_single_step_pipeline() {
    let yaml = r#"
id: "solo"
name: "Solo"
steps:
  - id: "only"
    agent: "x"
"#;
    let h = harness(&[yaml]).await;

    let run_id = h
        .engine
        .start_run(StartRun::new("solo", "one shot"))
        .await
        .unwrap();
    h.next_queued().await;

    h.complete_step(&run_id, "only", &[("answer", "42")]).await;

    assert_run_status(&h, &run_id, RunStatus::Completed).await;
    let outputs = assert_run_complete_event(&h, &run_id);
    assert_eq!(outputs.get("answer").map(String::as_str), Some("42"));
}
