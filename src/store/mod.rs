//! Durable state for runs, step executions, outputs and loop state

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteEngineStore;

use crate::core::{LoopItem, LoopItemStatus, LoopState, PipelineRun, StepExecution};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};

/// Trait for engine persistence backends
///
/// Uniformly asynchronous: callers never need to know whether the
/// implementation blocks, queries a pool, or just takes a lock.
#[async_trait]
pub trait EngineStore: Send + Sync {
    /// Persist a new run
    async fn create_run(&self, run: &PipelineRun) -> Result<()>;

    /// Load a run by id
    async fn get_run(&self, run_id: &str) -> Result<Option<PipelineRun>>;

    /// Replace a run's persisted state
    async fn update_run(&self, run: &PipelineRun) -> Result<()>;

    /// List all runs, most recently created first
    async fn list_runs(&self) -> Result<Vec<PipelineRun>>;

    /// Persist a new step execution record
    async fn create_step(&self, step: &StepExecution) -> Result<()>;

    /// Load the execution record for a (run, step) pair
    async fn get_step(&self, run_id: &str, step_id: &str) -> Result<Option<StepExecution>>;

    /// Replace a step execution record
    async fn update_step(&self, step: &StepExecution) -> Result<()>;

    /// Accumulated outputs for a run
    async fn get_outputs(&self, run_id: &str) -> Result<BTreeMap<String, String>>;

    /// Set one accumulated output key
    async fn set_output(&self, run_id: &str, key: &str, value: &str) -> Result<()>;

    /// Persist freshly-created loop state
    async fn create_loop_state(&self, state: &LoopState) -> Result<()>;

    /// Load loop state for a (run, loop step) pair
    async fn get_loop_state(&self, run_id: &str, step_id: &str) -> Result<Option<LoopState>>;

    /// Update one loop item's status and output snapshot
    async fn update_loop_item(
        &self,
        run_id: &str,
        step_id: &str,
        index: usize,
        status: LoopItemStatus,
        output: Option<&str>,
    ) -> Result<()>;

    /// Move `current_index` to the next pending item and return it, or
    /// `None` when every item has completed
    async fn advance_loop(&self, run_id: &str, step_id: &str) -> Result<Option<LoopItem>>;
}

/// In-memory store (for testing or ephemeral use)
#[derive(Default)]
pub struct InMemoryEngineStore {
    runs: tokio::sync::RwLock<HashMap<String, PipelineRun>>,
    steps: tokio::sync::RwLock<HashMap<(String, String), StepExecution>>,
    outputs: tokio::sync::RwLock<HashMap<String, BTreeMap<String, String>>>,
    loops: tokio::sync::RwLock<HashMap<(String, String), LoopState>>,
}

impl InMemoryEngineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove a run record outright. The engine never does this; it exists
    /// so crash/cleanup races (intervention against a deleted run) can be
    /// reproduced.
    pub async fn delete_run(&self, run_id: &str) -> Option<PipelineRun> {
        self.runs.write().await.remove(run_id)
    }
}

#[async_trait]
impl EngineStore for InMemoryEngineStore {
    async fn create_run(&self, run: &PipelineRun) -> Result<()> {
        self.runs.write().await.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<PipelineRun>> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn update_run(&self, run: &PipelineRun) -> Result<()> {
        let mut runs = self.runs.write().await;
        if !runs.contains_key(&run.id) {
            anyhow::bail!("Run '{}' does not exist", run.id);
        }
        runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn list_runs(&self) -> Result<Vec<PipelineRun>> {
        let runs = self.runs.read().await;
        let mut all: Vec<PipelineRun> = runs.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn create_step(&self, step: &StepExecution) -> Result<()> {
        self.steps
            .write()
            .await
            .insert((step.run_id.clone(), step.step_id.clone()), step.clone());
        Ok(())
    }

    async fn get_step(&self, run_id: &str, step_id: &str) -> Result<Option<StepExecution>> {
        Ok(self
            .steps
            .read()
            .await
            .get(&(run_id.to_string(), step_id.to_string()))
            .cloned())
    }

    async fn update_step(&self, step: &StepExecution) -> Result<()> {
        let key = (step.run_id.clone(), step.step_id.clone());
        let mut steps = self.steps.write().await;
        if !steps.contains_key(&key) {
            anyhow::bail!("Step '{}_{}' does not exist", step.run_id, step.step_id);
        }
        steps.insert(key, step.clone());
        Ok(())
    }

    async fn get_outputs(&self, run_id: &str) -> Result<BTreeMap<String, String>> {
        Ok(self
            .outputs
            .read()
            .await
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_output(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let mut outputs = self.outputs.write().await;
        outputs
            .entry(run_id.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn create_loop_state(&self, state: &LoopState) -> Result<()> {
        self.loops
            .write()
            .await
            .insert((state.run_id.clone(), state.step_id.clone()), state.clone());
        Ok(())
    }

    async fn get_loop_state(&self, run_id: &str, step_id: &str) -> Result<Option<LoopState>> {
        Ok(self
            .loops
            .read()
            .await
            .get(&(run_id.to_string(), step_id.to_string()))
            .cloned())
    }

    async fn update_loop_item(
        &self,
        run_id: &str,
        step_id: &str,
        index: usize,
        status: LoopItemStatus,
        output: Option<&str>,
    ) -> Result<()> {
        let mut loops = self.loops.write().await;
        let state = loops
            .get_mut(&(run_id.to_string(), step_id.to_string()))
            .ok_or_else(|| anyhow::anyhow!("No loop state for '{}_{}'", run_id, step_id))?;
        let item = state
            .items
            .get_mut(index)
            .ok_or_else(|| anyhow::anyhow!("Loop item index {} out of range", index))?;

        item.status = status;
        if let Some(output) = output {
            item.output = Some(output.to_string());
        }
        Ok(())
    }

    async fn advance_loop(&self, run_id: &str, step_id: &str) -> Result<Option<LoopItem>> {
        let mut loops = self.loops.write().await;
        let state = loops
            .get_mut(&(run_id.to_string(), step_id.to_string()))
            .ok_or_else(|| anyhow::anyhow!("No loop state for '{}_{}'", run_id, step_id))?;

        match state.next_pending().cloned() {
            Some(item) => {
                state.current_index = item.index;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}
