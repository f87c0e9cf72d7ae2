//! Runtime state models: runs, step executions, loop state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Overall status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Run has been created but no step has started
    Pending,
    /// Run has at least one step in flight
    Running,
    /// Run completed successfully
    Completed,
    /// Run failed
    Failed,
    /// Run was cancelled
    Cancelled,
}

impl RunStatus {
    /// Check if the run is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// One execution instance of a pipeline definition
///
/// Owned exclusively by the engine; mutated only through `EngineStore`
/// calls the engine issues. Immutable once the status is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique run id
    pub id: String,

    /// Id of the pipeline definition this run executes
    pub pipeline_id: String,

    /// Optional project this run belongs to
    pub project_id: Option<String>,

    /// Optional branch the workspace is provisioned on
    pub task_branch: Option<String>,

    /// Optional user that triggered the run
    pub user_id: Option<String>,

    /// Current status
    pub status: RunStatus,

    /// What this run is trying to accomplish
    pub task_description: String,

    /// The step currently in flight, if any
    pub current_step_id: Option<String>,

    /// Free-text operator guidance carried into queued steps
    pub human_context: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Create a fresh pending run
    pub fn new(id: String, pipeline_id: String, task_description: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            pipeline_id,
            project_id: None,
            task_branch: None,
            user_id: None,
            status: RunStatus::Pending,
            task_description,
            current_step_id: None,
            human_context: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Status of a single step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// Published for an executor to claim
    Queued,
    /// An executor has claimed it and is working
    Running,
    /// Executor reported success
    Completed,
    /// Executor reported failure and retries are exhausted
    Failed,
    /// Cancelled by intervention
    Cancelled,
    /// Failed but will be re-queued
    Retrying,
}

/// Execution record for one (run, step) pair
///
/// Identity is the `(run_id, step_id)` pair. Loop bodies reuse the same
/// record across iterations, so the status cycles
/// queued -> running -> completed -> queued...
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub run_id: String,
    pub step_id: String,

    pub status: StepStatus,

    /// Executor session handle, set when the executor claims the step
    pub session_id: Option<String>,

    /// Serialized input payload (loop item data for loop iterations)
    pub inputs: Option<String>,

    /// Outputs reported on the most recent completion
    pub outputs: BTreeMap<String, String>,

    /// Error reported on the most recent failure
    pub error: Option<String>,

    /// Retries consumed so far
    pub retry_count: u32,

    /// Effective retry bound for this step
    pub max_retries: u32,

    /// Operator guidance and retry annotations carried to the executor
    pub human_context: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl StepExecution {
    /// Create a freshly queued execution record
    pub fn queued(run_id: &str, step_id: &str, max_retries: u32) -> Self {
        Self {
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            status: StepStatus::Queued,
            session_id: None,
            inputs: None,
            outputs: BTreeMap::new(),
            error: None,
            retry_count: 0,
            max_retries,
            human_context: None,
            started_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Append a line of operator/engine guidance
    pub fn push_context(&mut self, context: &str) {
        match &mut self.human_context {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(context);
            }
            None => self.human_context = Some(context.to_string()),
        }
    }
}

/// Status of one loop item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopItemStatus {
    Pending,
    Completed,
}

/// One element of a loop's collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopItem {
    pub id: String,
    pub index: usize,

    /// The array element, re-serialized as a string if it wasn't one
    pub data: String,

    pub status: LoopItemStatus,
    pub retry_count: u32,

    /// Snapshot of the body's outputs when the item completed
    pub output: Option<String>,
}

/// Iteration state for one loop step within one run
///
/// Created once on first entry into the loop step; `items` is fixed-length
/// from then on. Never deleted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopState {
    pub run_id: String,
    pub step_id: String,
    pub items: Vec<LoopItem>,
    pub current_index: usize,
}

impl LoopState {
    /// Build loop state from the elements of the source array
    pub fn from_values(run_id: &str, step_id: &str, values: &[serde_json::Value]) -> Self {
        let items = values
            .iter()
            .enumerate()
            .map(|(index, value)| LoopItem {
                id: format!("{}_{}_{}", run_id, step_id, index),
                index,
                data: match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                },
                status: LoopItemStatus::Pending,
                retry_count: 0,
                output: None,
            })
            .collect();

        Self {
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            items,
            current_index: 0,
        }
    }

    /// First item still pending, in index order
    pub fn next_pending(&self) -> Option<&LoopItem> {
        self.items
            .iter()
            .find(|item| item.status == LoopItemStatus::Pending)
    }
}
