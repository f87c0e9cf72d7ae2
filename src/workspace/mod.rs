//! Workspace provisioning boundary
//!
//! The engine never touches git itself; it asks a provider for an isolated
//! working directory before the first step is queued and hands it back for
//! finalization when the run completes. The git-worktree provider lives in
//! the deployment that owns the repositories; `LocalWorkspaceProvider` is
//! the plain-directory implementation used by tests and non-git setups.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Outcome of finalizing a run's workspace
#[derive(Debug, Clone, Default)]
pub struct WorkspaceFinalize {
    /// Whether the run's work was pushed to a remote
    pub pushed: bool,
    pub branch: Option<String>,
    pub commit_hash: Option<String>,
    /// Set when the push was attempted and failed; cleanup still ran
    pub push_error: Option<String>,
}

/// Creates, locates and finalizes isolated per-run working directories
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Provision a workspace for a new run. Must succeed before any step
    /// of the run is queued.
    async fn create_run_worktree(
        &self,
        project_id: Option<&str>,
        run_id: &str,
        repo_url: Option<&str>,
        task_branch: Option<&str>,
    ) -> Result<PathBuf>;

    /// Idempotent create-if-missing, used on resume. `repo_url` lets a
    /// provider recreate a workspace that was cleaned up underneath it.
    async fn ensure_run_workspace(&self, run_id: &str, repo_url: Option<&str>) -> Result<PathBuf>;

    /// Where the run's workspace lives (whether or not it exists yet)
    fn get_run_path(&self, run_id: &str) -> PathBuf;

    /// Push + cleanup on completion
    async fn finalize_run_workspace(
        &self,
        run_id: &str,
        project_id: Option<&str>,
    ) -> Result<WorkspaceFinalize>;
}

/// Plain-directory workspace provider
pub struct LocalWorkspaceProvider {
    root: PathBuf,
}

impl LocalWorkspaceProvider {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl WorkspaceProvider for LocalWorkspaceProvider {
    async fn create_run_worktree(
        &self,
        _project_id: Option<&str>,
        run_id: &str,
        repo_url: Option<&str>,
        _task_branch: Option<&str>,
    ) -> Result<PathBuf> {
        self.ensure_run_workspace(run_id, repo_url).await
    }

    async fn ensure_run_workspace(&self, run_id: &str, _repo_url: Option<&str>) -> Result<PathBuf> {
        let path = self.get_run_path(run_id);
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("Failed to create workspace {}", path.display()))?;
        debug!(run_id, path = %path.display(), "Workspace ready");
        Ok(path)
    }

    fn get_run_path(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    async fn finalize_run_workspace(
        &self,
        run_id: &str,
        _project_id: Option<&str>,
    ) -> Result<WorkspaceFinalize> {
        let path = self.get_run_path(run_id);
        if path.exists() {
            tokio::fs::remove_dir_all(&path)
                .await
                .with_context(|| format!("Failed to remove workspace {}", path.display()))?;
        }

        // Nothing to push for a local directory.
        Ok(WorkspaceFinalize::default())
    }
}
