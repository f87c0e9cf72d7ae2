//! Typed pipeline events and the message-channel boundary
//!
//! Events are the only coupling between the engine and the executor side:
//! the engine publishes control events (`STEP_QUEUED`, `RUN_FAILED`, ...)
//! and consumes lifecycle events (`STEP_COMPLETE`, `STEP_FAILED`, ...)
//! published back on the same run channel. Payloads are tagged by a `type`
//! field so any transport that moves JSON can carry them.

pub mod memory;

pub use memory::InMemoryEventChannel;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Name of the process-wide channel external observers subscribe to
pub const GLOBAL_CHANNEL: &str = "global";

/// Channel name for a single run's events
pub fn run_channel(run_id: &str) -> String {
    format!("run:{}", run_id)
}

/// Requested human intervention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionAction {
    /// Abort the run
    Stop,
    /// Cancel and re-queue a step with extra context
    Restart,
    /// Append context to a step without restarting it
    InjectContext,
}

/// Every event that can travel over a run channel or the global channel
///
/// One tagged union for both directions of the contract: executors publish
/// the step-lifecycle variants, the engine publishes the control variants.
/// Unrecognized tags deserialize to `Unknown` and are logged, never
/// silently matched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineEvent {
    /// A run was created and its first step is about to be queued
    RunCreated { run_id: String, pipeline_id: String },

    /// Terminal success, with the full accumulated-outputs snapshot
    RunComplete {
        run_id: String,
        outputs: BTreeMap<String, String>,
    },

    /// Terminal failure, with a human-readable reason
    RunFailed { run_id: String, error: String },

    /// The run's record was removed from the store
    RunDeleted { run_id: String },

    /// Unit of work for an executor to claim
    StepQueued {
        run_id: String,
        step_id: String,
        agent_id: String,
        timestamp: DateTime<Utc>,
    },

    /// An executor claimed the step and started working
    StepStarted {
        run_id: String,
        step_id: String,
        session_id: Option<String>,
    },

    /// Streaming output from the executor; informational only
    StepOutput {
        run_id: String,
        step_id: String,
        output: String,
    },

    /// The executor finished the step successfully
    StepComplete {
        run_id: String,
        step_id: String,
        outputs: BTreeMap<String, String>,
    },

    /// The executor failed the step
    StepFailed {
        run_id: String,
        step_id: String,
        error: String,
    },

    /// The step was cancelled
    StepCancelled { run_id: String, step_id: String },

    /// The step failed but will be re-queued
    StepRetrying {
        run_id: String,
        step_id: String,
        attempt: u32,
        max_retries: u32,
    },

    /// Operator intervention on a run or step
    HumanIntervention {
        run_id: String,
        action: InterventionAction,
        step_id: Option<String>,
        context: Option<String>,
    },

    /// Fire-and-forget inter-agent message
    AgentMessage { run_id: String, message: String },

    /// Any tag this engine does not know
    #[serde(other)]
    Unknown,
}

impl PipelineEvent {
    /// The run this event belongs to, if it carries one
    pub fn run_id(&self) -> Option<&str> {
        match self {
            PipelineEvent::RunCreated { run_id, .. }
            | PipelineEvent::RunComplete { run_id, .. }
            | PipelineEvent::RunFailed { run_id, .. }
            | PipelineEvent::RunDeleted { run_id }
            | PipelineEvent::StepQueued { run_id, .. }
            | PipelineEvent::StepStarted { run_id, .. }
            | PipelineEvent::StepOutput { run_id, .. }
            | PipelineEvent::StepComplete { run_id, .. }
            | PipelineEvent::StepFailed { run_id, .. }
            | PipelineEvent::StepCancelled { run_id, .. }
            | PipelineEvent::StepRetrying { run_id, .. }
            | PipelineEvent::HumanIntervention { run_id, .. }
            | PipelineEvent::AgentMessage { run_id, .. } => Some(run_id),
            PipelineEvent::Unknown => None,
        }
    }
}

/// Boxed future returned by event handlers
pub type EventFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Type for channel subscribers
pub type EventHandler = Arc<dyn Fn(PipelineEvent) -> EventFuture + Send + Sync>;

/// Opaque unsubscribe handle returned by `EventChannel::subscribe`
#[derive(Debug)]
pub struct Subscription {
    pub channel: String,
    pub token: u64,
}

/// Publish/subscribe abstraction keyed by channel name
///
/// Implementations must deliver events for one channel in publish order;
/// consumer-group fan-out across processes is the transport's concern.
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Publish an event to a named channel
    async fn publish(&self, channel: &str, event: PipelineEvent) -> Result<()>;

    /// Subscribe a handler to a named channel
    async fn subscribe(&self, channel: &str, handler: EventHandler) -> Result<Subscription>;

    /// Remove a subscription; events published afterwards are not delivered
    async fn unsubscribe(&self, subscription: Subscription) -> Result<()>;
}
