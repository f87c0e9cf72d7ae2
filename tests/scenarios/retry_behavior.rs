//! Test: executor failures, retry accounting, promotion to run failure

use crate::helpers::*;
use conductor::{EngineStore, PipelineEvent, RunStatus, StartRun, StepExecution, StepStatus};

const SINGLE: &str = r#"
id: "single"
name: "Single"
max_retries: 3
steps:
  - id: "work"
    agent: "worker"
"#;

/// Each failure below the limit re-queues the same step with an annotated
/// context; the failure after the last retry fails the run.
#[tokio::test]
async fn test_retries_then_run_failure() {
    let h = harness(&[SINGLE]).await;
    let run_id = h
        .engine
        .start_run(StartRun::new("single", "try hard"))
        .await
        .unwrap();
    assert_eq!(h.next_queued().await.step_id, "work");

    for attempt in 1..=3u32 {
        h.fail_step(&run_id, "work", "executor crashed").await;
        assert_eq!(h.next_queued().await.step_id, "work");

        let step = h.store.get_step(&run_id, "work").await.unwrap().unwrap();
        assert_eq!(step.retry_count, attempt);
        assert!(step
            .human_context
            .as_deref()
            .unwrap()
            .contains("executor crashed"));
    }

    // 4th failure: retries exhausted.
    h.fail_step(&run_id, "work", "executor crashed").await;

    assert_run_status(&h, &run_id, RunStatus::Failed).await;
    assert_eq!(h.step_status(&run_id, "work").await, StepStatus::Failed);
    assert_run_failed_event(&h, &run_id, "work");
    h.assert_nothing_queued().await;

    let retry_events = h
        .run_events()
        .iter()
        .filter(|e| matches!(e, PipelineEvent::StepRetrying { .. }))
        .count();
    assert_eq!(retry_events, 3);

    let failed = h.hooks.failed.lock().unwrap().clone();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, run_id);
}

/// A record already at retry_count == max_retries fails immediately on the
/// next STEP_FAILED; there is no extra attempt.
#[tokio::test]
async fn test_exhausted_record_fails_without_requeue() {
    let h = harness(&[SINGLE]).await;
    let run_id = h
        .engine
        .start_run(StartRun::new("single", "exhausted"))
        .await
        .unwrap();
    h.next_queued().await;

    let mut step = h.store.get_step(&run_id, "work").await.unwrap().unwrap();
    step.retry_count = 3;
    h.store.update_step(&step).await.unwrap();

    h.fail_step(&run_id, "work", "still broken").await;

    assert_run_status(&h, &run_id, RunStatus::Failed).await;
    assert_run_failed_event(&h, &run_id, "still broken");
    h.assert_nothing_queued().await;
}

/// A step-level max_retries overrides the pipeline default.
#[tokio::test]
async fn test_step_override_wins() {
    let yaml = r#"
id: "tight"
name: "Tight"
max_retries: 5
steps:
  - id: "work"
    agent: "worker"
    max_retries: 1
"#;
    let h = harness(&[yaml]).await;
    let run_id = h
        .engine
        .start_run(StartRun::new("tight", "one retry only"))
        .await
        .unwrap();
    h.next_queued().await;

    h.fail_step(&run_id, "work", "boom").await;
    assert_eq!(h.next_queued().await.step_id, "work");

    h.fail_step(&run_id, "work", "boom").await;
    assert_run_status(&h, &run_id, RunStatus::Failed).await;
    h.assert_nothing_queued().await;
}

/// Retry accounting survives the record being re-queued: queueing never
/// resets retry_count.
#[tokio::test]
async fn test_requeue_preserves_retry_count() {
    let h = harness(&[SINGLE]).await;
    let run_id = h
        .engine
        .start_run(StartRun::new("single", "count keeping"))
        .await
        .unwrap();
    h.next_queued().await;

    h.fail_step(&run_id, "work", "first").await;
    h.next_queued().await;

    let step: StepExecution = h.store.get_step(&run_id, "work").await.unwrap().unwrap();
    assert_eq!(step.retry_count, 1);
    assert_eq!(step.status, StepStatus::Queued);
    assert!(step.session_id.is_none());
}
