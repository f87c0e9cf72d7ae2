//! Test: human interventions and deletion notices

use crate::helpers::*;
use conductor::{
    EngineStore, InterventionAction, PipelineEvent, RunStatus, StartRun, StepStatus,
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
"#;

fn intervention(
    run_id: &str,
    action: InterventionAction,
    step_id: Option<&str>,
    context: Option<&str>,
) -> PipelineEvent {
    PipelineEvent::HumanIntervention {
        run_id: run_id.to_string(),
        action,
        step_id: step_id.map(str::to_string),
        context: context.map(str::to_string),
    }
}

/// Stop fails the run, fires the hook and stops event processing.
#[tokio::test]
async fn test_stop_fails_live_run() {
    let h = harness(&[CHAIN]).await;
    let run_id = h
        .engine
        .start_run(StartRun::new("p1", "stoppable"))
        .await
        .unwrap();
    h.next_queued().await;

    h.publish(&run_id, intervention(&run_id, InterventionAction::Stop, None, None))
        .await;

    assert_run_status(&h, &run_id, RunStatus::Failed).await;
    assert_run_failed_event(&h, &run_id, "stopped");
    assert!(!h.engine.is_active(&run_id));

    let failed = h.hooks.failed.lock().unwrap().clone();
    assert_eq!(failed.len(), 1);

    // The engine has unsubscribed: a late completion changes nothing.
    h.complete_step(&run_id, "step_a", &[("x", "1")]).await;
    assert_eq!(h.step_status(&run_id, "step_a").await, StepStatus::Queued);
    h.assert_nothing_queued().await;
}

/// Stop against a run whose record is already gone still publishes
/// RUN_FAILED and unsubscribes cleanly.
#[tokio::test]
async fn test_stop_survives_deleted_run() {
    let h = harness(&[CHAIN]).await;
    let run_id = h
        .engine
        .start_run(StartRun::new("p1", "doomed"))
        .await
        .unwrap();
    h.next_queued().await;

    h.store.delete_run(&run_id).await.unwrap();

    h.publish(&run_id, intervention(&run_id, InterventionAction::Stop, None, None))
        .await;

    assert_run_failed_event(&h, &run_id, "stopped");
    assert!(!h.engine.is_active(&run_id));
}

/// A deletion notice behaves like a stop.
#[tokio::test]
async fn test_run_deleted_notice() {
    let h = harness(&[CHAIN]).await;
    let run_id = h
        .engine
        .start_run(StartRun::new("p1", "deleted"))
        .await
        .unwrap();
    h.next_queued().await;

    h.store.delete_run(&run_id).await.unwrap();
    h.publish(
        &run_id,
        PipelineEvent::RunDeleted {
            run_id: run_id.clone(),
        },
    )
    .await;

    assert_run_failed_event(&h, &run_id, "deleted");
    assert!(!h.engine.is_active(&run_id));
}

/// Restart cancels the step and re-queues it with the appended context.
#[tokio::test]
async fn test_restart_requeues_with_context() {
    let h = harness(&[CHAIN]).await;
    let run_id = h
        .engine
        .start_run(StartRun::new("p1", "restartable"))
        .await
        .unwrap();
    h.next_queued().await;
    h.start_step(&run_id, "step_a").await;

    h.publish(
        &run_id,
        intervention(
            &run_id,
            InterventionAction::Restart,
            Some("step_a"),
            Some("take the simpler approach"),
        ),
    )
    .await;

    let requeued = h.next_queued().await;
    assert_eq!(requeued.step_id, "step_a");

    let cancelled = h.run_events().iter().any(|event| {
        matches!(
            event,
            PipelineEvent::StepCancelled { step_id, .. } if step_id == "step_a"
        )
    });
    assert!(cancelled, "Expected a STEP_CANCELLED before the re-queue");

    let step = h.store.get_step(&run_id, "step_a").await.unwrap().unwrap();
    assert_eq!(step.status, StepStatus::Queued);
    assert!(step
        .human_context
        .as_deref()
        .unwrap()
        .contains("take the simpler approach"));
}

/// inject_context appends guidance without touching the step's state.
#[tokio::test]
async fn test_inject_context_does_not_restart() {
    let h = harness(&[CHAIN]).await;
    let run_id = h
        .engine
        .start_run(StartRun::new("p1", "guided"))
        .await
        .unwrap();
    h.next_queued().await;
    h.start_step(&run_id, "step_a").await;

    h.publish(
        &run_id,
        intervention(
            &run_id,
            InterventionAction::InjectContext,
            Some("step_a"),
            Some("remember the edge cases"),
        ),
    )
    .await;

    let step = h.store.get_step(&run_id, "step_a").await.unwrap().unwrap();
    assert_eq!(step.status, StepStatus::Running);
    assert!(step
        .human_context
        .as_deref()
        .unwrap()
        .contains("remember the edge cases"));
    h.assert_nothing_queued().await;
}
