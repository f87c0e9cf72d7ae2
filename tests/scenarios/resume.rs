//! Test: crash recovery and resume-point selection

use crate::helpers::*;
use conductor::{
    EngineError, EngineStore, RunStatus, StartRun, StepExecution, StepStatus,
};

const CHAIN: &str = r#"
id: "p1"
name: "Chain"
steps:
  - id: "step_a"
    agent: "x"
    on_complete: "step_b"
  - id: "step_b"
    agent: "x"
    on_complete: "step_c"
  - id: "step_c"
    agent: "x"
"#;

/// A step left `running` by a crashed process is reset to queued (stale
/// session cleared) and re-queued exactly once.
#[tokio::test]
async fn test_resume_resets_crashed_step() {
    let h = harness(&[CHAIN]).await;
    seed_run(&h, "r1", "p1", RunStatus::Running).await;

    let mut step = StepExecution::queued("r1", "step_b", 3);
    step.status = StepStatus::Running;
    step.session_id = Some("stale-session".to_string());
    step.started_at = Some(chrono::Utc::now());
    h.store.create_step(&step).await.unwrap();

    let mut done = StepExecution::queued("r1", "step_a", 3);
    done.status = StepStatus::Completed;
    h.store.create_step(&done).await.unwrap();

    h.attach_executor("r1").await;
    h.engine.resume_run("r1", None).await.unwrap();

    let queued = h.next_queued().await;
    assert_eq!(queued.step_id, "step_b");
    h.assert_nothing_queued().await;

    let step = h.store.get_step("r1", "step_b").await.unwrap().unwrap();
    assert_eq!(step.status, StepStatus::Queued);
    assert!(step.session_id.is_none());
    assert!(step.started_at.is_none());
}

/// With a completed prefix, resume picks the first untouched step.
#[tokio::test]
async fn test_resume_after_completed_prefix() {
    let h = harness(&[CHAIN]).await;
    seed_run(&h, "r2", "p1", RunStatus::Running).await;

    let mut done = StepExecution::queued("r2", "step_a", 3);
    done.status = StepStatus::Completed;
    h.store.create_step(&done).await.unwrap();

    h.attach_executor("r2").await;
    h.engine.resume_run("r2", None).await.unwrap();

    assert_eq!(h.next_queued().await.step_id, "step_b");
    h.assert_nothing_queued().await;
}

/// With no execution records at all, resume starts from the first step.
#[tokio::test]
async fn test_resume_from_scratch() {
    let h = harness(&[CHAIN]).await;
    seed_run(&h, "r3", "p1", RunStatus::Pending).await;

    h.attach_executor("r3").await;
    h.engine.resume_run("r3", None).await.unwrap();

    assert_eq!(h.next_queued().await.step_id, "step_a");
    h.assert_nothing_queued().await;
}

/// Concurrent duplicate resume triggers queue at most one step.
#[tokio::test]
async fn test_concurrent_resume_is_idempotent() {
    let h = harness(&[CHAIN]).await;
    seed_run(&h, "r4", "p1", RunStatus::Running).await;
    h.attach_executor("r4").await;

    let first = h.engine.resume_run("r4", None);
    let second = h.engine.resume_run("r4", None);
    let (a, b) = tokio::join!(first, second);
    a.unwrap();
    b.unwrap();

    h.next_queued().await;
    h.assert_nothing_queued().await;
}

/// Resuming a run this instance is already driving is a no-op.
#[tokio::test]
async fn test_resume_of_active_run_is_noop() {
    let h = harness(&[CHAIN]).await;
    let run_id = h
        .engine
        .start_run(StartRun::new("p1", "active"))
        .await
        .unwrap();
    h.next_queued().await;

    h.engine.resume_run(&run_id, None).await.unwrap();
    h.assert_nothing_queued().await;
}

/// Terminal runs cannot be resumed.
#[tokio::test]
async fn test_resume_of_completed_run_fails() {
    let h = harness(&[CHAIN]).await;
    seed_run(&h, "r5", "p1", RunStatus::Completed).await;

    let result = h.engine.resume_run("r5", None).await;
    assert!(matches!(result, Err(EngineError::NotResumable { .. })));
    assert!(!h.engine.is_active("r5"));
}

/// An unknown run id is an error, and the guard entry is released.
#[tokio::test]
async fn test_resume_unknown_run_fails() {
    let h = harness(&[CHAIN]).await;

    let result = h.engine.resume_run("ghost", None).await;
    assert!(matches!(result, Err(EngineError::RunNotFound(_))));
    assert!(!h.engine.is_active("ghost"));

    // A later, correct resume still works.
    seed_run(&h, "ghost", "p1", RunStatus::Pending).await;
    h.attach_executor("ghost").await;
    h.engine.resume_run("ghost", None).await.unwrap();
    assert_eq!(h.next_queued().await.step_id, "step_a");
}

/// After resume the run keeps executing normally to completion.
#[tokio::test]
async fn test_resumed_run_completes() {
    let h = harness(&[CHAIN]).await;
    seed_run(&h, "r6", "p1", RunStatus::Running).await;

    let mut done = StepExecution::queued("r6", "step_a", 3);
    done.status = StepStatus::Completed;
    h.store.create_step(&done).await.unwrap();
    h.store.set_output("r6", "x", "1").await.unwrap();

    h.attach_executor("r6").await;
    h.engine.resume_run("r6", None).await.unwrap();

    assert_eq!(h.next_queued().await.step_id, "step_b");
    h.complete_step("r6", "step_b", &[("y", "2")]).await;

    assert_eq!(h.next_queued().await.step_id, "step_c");
    h.complete_step("r6", "step_c", &[]).await;

    assert_run_status(&h, "r6", RunStatus::Completed).await;
    let outputs = assert_run_complete_event(&h, "r6");
    assert_eq!(outputs.get("x").map(String::as_str), Some("1"));
    assert_eq!(outputs.get("y").map(String::as_str), Some("2"));
}
