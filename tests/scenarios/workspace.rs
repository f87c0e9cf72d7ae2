//! Test: workspace provisioning gates the run lifecycle

use crate::helpers::*;
use conductor::{
    EngineError, EngineStore, LocalWorkspaceProvider, RunStatus, StartRun, WorkspaceFinalize,
    WorkspaceProvider,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const SOLO: &str = r#"
id: "solo"
name: "Solo"
steps:
  - id: "only"
    agent: "x"
"#;

/// Provider that always refuses to provision
struct BrokenWorkspace;

#[async_trait::async_trait]
impl WorkspaceProvider for BrokenWorkspace {
    async fn create_run_worktree(
        &self,
        _project_id: Option<&str>,
        _run_id: &str,
        _repo_url: Option<&str>,
        _task_branch: Option<&str>,
    ) -> anyhow::Result<PathBuf> {
        anyhow::bail!("disk full")
    }

    async fn ensure_run_workspace(
        &self,
        _run_id: &str,
        _repo_url: Option<&str>,
    ) -> anyhow::Result<PathBuf> {
        anyhow::bail!("disk full")
    }

    fn get_run_path(&self, run_id: &str) -> PathBuf {
        PathBuf::from("/nonexistent").join(run_id)
    }

    async fn finalize_run_workspace(
        &self,
        _run_id: &str,
        _project_id: Option<&str>,
    ) -> anyhow::Result<WorkspaceFinalize> {
        Ok(WorkspaceFinalize::default())
    }
}

/// Workspace setup failure fails the run before any step is queued: the
/// two start_run outcomes are mutually exclusive.
#[tokio::test]
async fn test_start_fails_before_any_queue() {
    let h = harness_with(&[SOLO], |engine| {
        engine.with_workspace(Arc::new(BrokenWorkspace))
    })
    .await;

    let result = h.engine.start_run(StartRun::new("solo", "no disk")).await;
    let Err(EngineError::WorkspaceSetup { run_id, reason }) = result else {
        panic!("Expected WorkspaceSetup error, got {:?}", result);
    };
    assert!(reason.contains("disk full"));

    assert_run_status(&h, &run_id, RunStatus::Failed).await;
    assert_run_failed_event(&h, &run_id, "Workspace setup failed");
    h.assert_nothing_queued().await;

    let failed = h.hooks.failed.lock().unwrap().clone();
    assert_eq!(failed.len(), 1);
    assert!(h.store.get_step(&run_id, "only").await.unwrap().is_none());
}

/// Resume re-runs workspace setup and fails the run when it breaks.
#[tokio::test]
async fn test_resume_fails_on_workspace_error() {
    let h = harness_with(&[SOLO], |engine| {
        engine.with_workspace(Arc::new(BrokenWorkspace))
    })
    .await;
    seed_run(&h, "r1", "solo", RunStatus::Running).await;

    let result = h.engine.resume_run("r1", None).await;
    assert!(matches!(result, Err(EngineError::WorkspaceSetup { .. })));
    assert_run_status(&h, "r1", RunStatus::Failed).await;
    h.assert_nothing_queued().await;
}

/// With a working provider the workspace exists before the first step is
/// queued and is cleaned up after completion.
#[tokio::test]
async fn test_workspace_lifecycle_around_run() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(LocalWorkspaceProvider::new(dir.path()));
    let h = {
        let provider = provider.clone();
        harness_with(&[SOLO], move |engine| engine.with_workspace(provider)).await
    };

    let run_id = h
        .engine
        .start_run(StartRun::new("solo", "with workspace"))
        .await
        .unwrap();

    h.next_queued().await;
    let path = provider.get_run_path(&run_id);
    assert!(path.exists(), "Workspace must exist before work is claimed");

    h.complete_step(&run_id, "only", &[]).await;
    assert_run_status(&h, &run_id, RunStatus::Completed).await;

    // Finalize runs as a background task.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!path.exists(), "Workspace should be cleaned up");
}
