//! The orchestration engine
//!
//! Purely reactive: every state transition happens inside an event
//! handler, is fully persisted before the handler returns, and the next
//! transition only occurs when the executor's answer arrives on the run
//! channel. The engine owns no timers and never blocks on a step.

use crate::{
    core::{
        LoopConfig, LoopItemStatus, LoopState, PipelineConfig, PipelineRegistry, PipelineRun,
        RunStatus, StepConfig, StepExecution, StepStatus,
    },
    events::{
        run_channel, EventChannel, EventHandler, InterventionAction, PipelineEvent, Subscription,
        GLOBAL_CHANNEL,
    },
    execution::routing,
    store::EngineStore,
    workspace::WorkspaceProvider,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Error types for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Pipeline '{0}' is not registered")]
    UnknownPipeline(String),

    #[error("Pipeline '{0}' has no steps")]
    EmptyPipeline(String),

    #[error("Run '{0}' not found")]
    RunNotFound(String),

    #[error("Run '{run_id}' cannot be resumed from status {status:?}")]
    NotResumable { run_id: String, status: RunStatus },

    #[error("Workspace setup failed for run '{run_id}': {reason}")]
    WorkspaceSetup { run_id: String, reason: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// External hooks invoked on terminal run transitions
///
/// Both are awaited but fire-and-forget in effect: a hook failure is
/// logged and never alters the run status already committed.
#[async_trait]
pub trait RunHooks: Send + Sync {
    async fn on_run_completed(
        &self,
        run_id: &str,
        outputs: &BTreeMap<String, String>,
    ) -> anyhow::Result<()>;

    async fn on_run_failed(&self, run_id: &str, error: &str) -> anyhow::Result<()>;
}

/// Parameters for starting a new run
#[derive(Debug, Clone, Default)]
pub struct StartRun {
    pub pipeline_id: String,
    pub task_description: String,
    pub human_context: Option<String>,
    pub project_id: Option<String>,
    pub repo_url: Option<String>,
    pub task_branch: Option<String>,
    pub user_id: Option<String>,
}

impl StartRun {
    pub fn new(pipeline_id: &str, task_description: &str) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            task_description: task_description.to_string(),
            ..Default::default()
        }
    }
}

/// The pipeline orchestration engine
///
/// One logical instance per process. Engine state is explicit fields:
/// the read-only registry, the active-run guard and the per-run
/// subscription map; everything else lives in the store.
pub struct PipelineEngine {
    registry: Arc<PipelineRegistry>,
    store: Arc<dyn EngineStore>,
    channel: Arc<dyn EventChannel>,
    workspace: Option<Arc<dyn WorkspaceProvider>>,
    hooks: Option<Arc<dyn RunHooks>>,

    /// Runs this instance is currently driving. The insert-under-one-lock
    /// check-and-set is what makes duplicate resume triggers a no-op.
    active_runs: Mutex<HashSet<String>>,

    /// Unsubscribe handles for the run channels we listen on
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl PipelineEngine {
    pub fn new(
        registry: Arc<PipelineRegistry>,
        store: Arc<dyn EngineStore>,
        channel: Arc<dyn EventChannel>,
    ) -> Self {
        Self {
            registry,
            store,
            channel,
            workspace: None,
            hooks: None,
            active_runs: Mutex::new(HashSet::new()),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_workspace(mut self, workspace: Arc<dyn WorkspaceProvider>) -> Self {
        self.workspace = Some(workspace);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn RunHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Whether this instance is actively driving the run
    pub fn is_active(&self, run_id: &str) -> bool {
        self.active_runs.lock().expect("active set poisoned").contains(run_id)
    }

    // ---- run lifecycle -------------------------------------------------

    /// Create a run and queue its first step
    ///
    /// Workspace setup must succeed before anything is queued: on failure
    /// the run is marked failed, the failure event and hook fire, and no
    /// step ever exists for the run.
    pub async fn start_run(self: &Arc<Self>, req: StartRun) -> Result<String, EngineError> {
        let pipeline = self
            .registry
            .get(&req.pipeline_id)
            .ok_or_else(|| EngineError::UnknownPipeline(req.pipeline_id.clone()))?;
        if pipeline.steps.is_empty() {
            return Err(EngineError::EmptyPipeline(req.pipeline_id.clone()));
        }

        let run_id = Uuid::new_v4().to_string();
        let mut run = PipelineRun::new(
            run_id.clone(),
            req.pipeline_id.clone(),
            req.task_description.clone(),
        );
        run.project_id = req.project_id.clone();
        run.task_branch = req.task_branch.clone();
        run.user_id = req.user_id.clone();
        run.human_context = req.human_context.clone();

        self.store.create_run(&run).await?;
        self.active_runs
            .lock()
            .expect("active set poisoned")
            .insert(run_id.clone());
        info!(run_id = %run_id, pipeline_id = %req.pipeline_id, "Run created");

        if let Some(workspace) = &self.workspace {
            if let Err(e) = workspace
                .create_run_worktree(
                    req.project_id.as_deref(),
                    &run_id,
                    req.repo_url.as_deref(),
                    req.task_branch.as_deref(),
                )
                .await
            {
                let reason = e.to_string();
                self.fail_run(&run_id, &format!("Workspace setup failed: {}", reason))
                    .await;
                return Err(EngineError::WorkspaceSetup { run_id, reason });
            }
        }

        let created = PipelineEvent::RunCreated {
            run_id: run_id.clone(),
            pipeline_id: req.pipeline_id.clone(),
        };
        self.publish_run(&run_id, created.clone()).await;
        self.publish_global(created).await;

        self.subscribe_run(&run_id).await?;

        let first = &pipeline.steps[0];
        if let Err(e) = self.queue_step(&run, pipeline, first, None, None).await {
            self.fail_run(&run_id, &format!("Failed to queue first step: {}", e))
                .await;
            return Err(e);
        }

        Ok(run_id)
    }

    /// Resume an interrupted run
    ///
    /// Safe to call redundantly: a run already held in the active set is a
    /// no-op, so concurrent duplicate triggers queue at most one step.
    pub async fn resume_run(
        self: &Arc<Self>,
        run_id: &str,
        repo_url: Option<&str>,
    ) -> Result<(), EngineError> {
        {
            let mut active = self.active_runs.lock().expect("active set poisoned");
            if !active.insert(run_id.to_string()) {
                debug!(run_id, "Resume ignored; run already active");
                return Ok(());
            }
        }

        let result = self.resume_run_inner(run_id, repo_url).await;
        if result.is_err() {
            self.active_runs
                .lock()
                .expect("active set poisoned")
                .remove(run_id);
        }
        result
    }

    async fn resume_run_inner(
        self: &Arc<Self>,
        run_id: &str,
        repo_url: Option<&str>,
    ) -> Result<(), EngineError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;

        if !matches!(run.status, RunStatus::Pending | RunStatus::Running) {
            return Err(EngineError::NotResumable {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }

        let pipeline = self
            .registry
            .get(&run.pipeline_id)
            .ok_or_else(|| EngineError::UnknownPipeline(run.pipeline_id.clone()))?;
        if pipeline.steps.is_empty() {
            return Err(EngineError::EmptyPipeline(run.pipeline_id.clone()));
        }

        if let Some(workspace) = &self.workspace {
            if let Err(e) = workspace.ensure_run_workspace(run_id, repo_url).await {
                let reason = e.to_string();
                self.fail_run(run_id, &format!("Workspace setup failed on resume: {}", reason))
                    .await;
                return Err(EngineError::WorkspaceSetup {
                    run_id: run_id.to_string(),
                    reason,
                });
            }
        }

        self.subscribe_run(run_id).await?;

        let target = self.select_resume_step(&run, pipeline).await?;
        info!(run_id, step_id = %target.id, "Resuming run");
        self.queue_step(&run, pipeline, target, None, None).await?;

        Ok(())
    }

    /// Pick the step to resume from, in priority order:
    /// 1. any queued or running execution (a running one is reset to
    ///    queued so it re-executes cleanly instead of being treated as in
    ///    flight);
    /// 2. with the first step completed, the first later step that was
    ///    never touched or is still queued;
    /// 3. the first step.
    async fn select_resume_step<'a>(
        &self,
        run: &PipelineRun,
        pipeline: &'a PipelineConfig,
    ) -> Result<&'a StepConfig, EngineError> {
        for step_cfg in &pipeline.steps {
            if let Some(mut exec) = self.store.get_step(&run.id, &step_cfg.id).await? {
                match exec.status {
                    StepStatus::Queued => return Ok(step_cfg),
                    StepStatus::Running => {
                        exec.status = StepStatus::Queued;
                        exec.session_id = None;
                        exec.started_at = None;
                        exec.updated_at = Utc::now();
                        self.store.update_step(&exec).await?;
                        return Ok(step_cfg);
                    }
                    _ => {}
                }
            }
        }

        let first = &pipeline.steps[0];
        let first_completed = matches!(
            self.store.get_step(&run.id, &first.id).await?.map(|e| e.status),
            Some(StepStatus::Completed)
        );
        if first_completed {
            for step_cfg in &pipeline.steps[1..] {
                match self.store.get_step(&run.id, &step_cfg.id).await? {
                    None => return Ok(step_cfg),
                    Some(exec) if exec.status == StepStatus::Queued => return Ok(step_cfg),
                    Some(_) => {}
                }
            }
        }

        Ok(first)
    }

    // ---- event dispatch ------------------------------------------------

    async fn subscribe_run(self: &Arc<Self>, run_id: &str) -> Result<(), EngineError> {
        {
            let subscriptions = self.subscriptions.lock().expect("subscription map poisoned");
            if subscriptions.contains_key(run_id) {
                return Ok(());
            }
        }

        let engine = Arc::clone(self);
        let handler_run_id = run_id.to_string();
        let handler: EventHandler = Arc::new(move |event| {
            let engine = Arc::clone(&engine);
            let run_id = handler_run_id.clone();
            Box::pin(async move {
                engine.dispatch(&run_id, event).await;
            })
        });

        let subscription = self.channel.subscribe(&run_channel(run_id), handler).await?;
        self.subscriptions
            .lock()
            .expect("subscription map poisoned")
            .insert(run_id.to_string(), subscription);
        Ok(())
    }

    /// Top-level handler for one event on one run channel
    ///
    /// Never propagates an error: a throw here would stop processing for
    /// every run sharing the dispatcher, so failures become log lines or
    /// state transitions instead.
    async fn dispatch(self: &Arc<Self>, run_id: &str, event: PipelineEvent) {
        // Stop interventions and deletion notices must work even when the
        // run row is gone, so they are handled before the store lookup.
        match &event {
            PipelineEvent::HumanIntervention {
                action: InterventionAction::Stop,
                ..
            } => {
                info!(run_id, "Stop intervention received");
                self.fail_run(run_id, "Run stopped by operator").await;
                return;
            }
            PipelineEvent::RunDeleted { .. } => {
                info!(run_id, "Run record deleted");
                self.fail_run(run_id, "Run deleted").await;
                return;
            }
            _ => {}
        }

        let run = match self.store.get_run(run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                error!(run_id, "Dropping event for unknown run");
                return;
            }
            Err(e) => {
                error!(run_id, error = %e, "Failed to load run; dropping event");
                return;
            }
        };

        let pipeline = match self.registry.get(&run.pipeline_id) {
            Some(pipeline) => pipeline,
            None => {
                error!(
                    run_id,
                    pipeline_id = %run.pipeline_id,
                    "Dropping event for unregistered pipeline"
                );
                return;
            }
        };

        if let Err(e) = self.handle_event(run, pipeline, event).await {
            error!(run_id, error = %e, "Event handling failed");
        }
    }

    async fn handle_event(
        &self,
        mut run: PipelineRun,
        pipeline: &PipelineConfig,
        event: PipelineEvent,
    ) -> Result<(), EngineError> {
        match event {
            PipelineEvent::StepStarted {
                step_id,
                session_id,
                ..
            } => {
                if let Some(mut step) = self.store.get_step(&run.id, &step_id).await? {
                    step.status = StepStatus::Running;
                    step.session_id = session_id.clone();
                    step.started_at = Some(Utc::now());
                    step.updated_at = Utc::now();
                    self.store.update_step(&step).await?;
                }

                if run.status == RunStatus::Pending {
                    run.status = RunStatus::Running;
                }
                run.current_step_id = Some(step_id.clone());
                run.updated_at = Utc::now();
                self.store.update_run(&run).await?;

                self.publish_global(PipelineEvent::StepStarted {
                    run_id: run.id.clone(),
                    step_id,
                    session_id,
                })
                .await;
            }

            PipelineEvent::StepOutput { step_id, output, .. } => {
                debug!(run_id = %run.id, step_id = %step_id, bytes = output.len(), "Step output");
            }

            PipelineEvent::StepComplete {
                step_id, outputs, ..
            } => {
                if let Some(mut step) = self.store.get_step(&run.id, &step_id).await? {
                    step.status = StepStatus::Completed;
                    step.outputs = outputs.clone();
                    step.error = None;
                    step.updated_at = Utc::now();
                    self.store.update_step(&step).await?;
                }

                // Non-empty outputs become visible to every later step.
                for (key, value) in &outputs {
                    if !value.is_empty() {
                        self.store.set_output(&run.id, key, value).await?;
                    }
                }

                self.publish_global(PipelineEvent::StepComplete {
                    run_id: run.id.clone(),
                    step_id: step_id.clone(),
                    outputs: outputs.clone(),
                })
                .await;

                match pipeline.step(&step_id) {
                    Some(step_cfg) => {
                        self.route_result(&run, pipeline, step_cfg, &outputs).await?;
                    }
                    None => {
                        self.fail_run(
                            &run.id,
                            &format!("Completed step '{}' is not in the pipeline", step_id),
                        )
                        .await;
                    }
                }
            }

            PipelineEvent::StepFailed { step_id, error, .. } => {
                self.handle_step_failed(&run, pipeline, &step_id, &error).await?;
            }

            PipelineEvent::StepCancelled { step_id, .. } => {
                if let Some(mut step) = self.store.get_step(&run.id, &step_id).await? {
                    step.status = StepStatus::Cancelled;
                    step.updated_at = Utc::now();
                    self.store.update_step(&step).await?;
                }
            }

            PipelineEvent::HumanIntervention {
                action,
                step_id,
                context,
                ..
            } => match action {
                // Stop was consumed by dispatch before the store lookup.
                InterventionAction::Stop => {}
                InterventionAction::Restart => {
                    self.restart_step(&run, pipeline, step_id.as_deref(), context.as_deref())
                        .await?;
                }
                InterventionAction::InjectContext => {
                    let (Some(step_id), Some(context)) = (step_id, context) else {
                        warn!(run_id = %run.id, "inject_context requires a step and context");
                        return Ok(());
                    };
                    if let Some(mut step) = self.store.get_step(&run.id, &step_id).await? {
                        step.push_context(&context);
                        step.updated_at = Utc::now();
                        self.store.update_step(&step).await?;
                        info!(run_id = %run.id, step_id = %step_id, "Context injected");
                    }
                }
            },

            // The engine's own control events echo back on the run
            // channel; they carry no transition for us.
            PipelineEvent::StepQueued { .. }
            | PipelineEvent::StepRetrying { .. }
            | PipelineEvent::RunCreated { .. }
            | PipelineEvent::RunComplete { .. }
            | PipelineEvent::RunFailed { .. }
            | PipelineEvent::AgentMessage { .. } => {}

            PipelineEvent::RunDeleted { .. } => {}

            PipelineEvent::Unknown => {
                warn!(run_id = %run.id, "Ignoring event with unknown type tag");
            }
        }

        Ok(())
    }

    async fn handle_step_failed(
        &self,
        run: &PipelineRun,
        pipeline: &PipelineConfig,
        step_id: &str,
        error: &str,
    ) -> Result<(), EngineError> {
        let Some(step_cfg) = pipeline.step(step_id) else {
            self.fail_run(
                &run.id,
                &format!("Failed step '{}' is not in the pipeline", step_id),
            )
            .await;
            return Ok(());
        };

        let max_retries = pipeline.effective_max_retries(step_cfg);
        let existing = self.store.get_step(&run.id, step_id).await?;
        let is_new = existing.is_none();
        let mut step = existing.unwrap_or_else(|| {
            warn!(run_id = %run.id, step_id, "Failure for a step never queued");
            StepExecution::queued(&run.id, step_id, max_retries)
        });

        if step.retry_count < max_retries {
            step.status = StepStatus::Retrying;
            step.retry_count += 1;
            step.error = Some(error.to_string());
            step.push_context(&format!(
                "Attempt {}/{} failed: {}",
                step.retry_count, max_retries, error
            ));
            step.updated_at = Utc::now();
            if is_new {
                self.store.create_step(&step).await?;
            } else {
                self.store.update_step(&step).await?;
            }

            warn!(
                run_id = %run.id,
                step_id,
                attempt = step.retry_count,
                max_retries,
                "Step failed; retrying"
            );
            self.publish_run(
                &run.id,
                PipelineEvent::StepRetrying {
                    run_id: run.id.clone(),
                    step_id: step_id.to_string(),
                    attempt: step.retry_count,
                    max_retries,
                },
            )
            .await;

            self.queue_step(run, pipeline, step_cfg, None, None).await?;
        } else {
            step.status = StepStatus::Failed;
            step.error = Some(error.to_string());
            step.updated_at = Utc::now();
            if is_new {
                self.store.create_step(&step).await?;
            } else {
                self.store.update_step(&step).await?;
            }

            self.publish_global(PipelineEvent::StepFailed {
                run_id: run.id.clone(),
                step_id: step_id.to_string(),
                error: error.to_string(),
            })
            .await;

            self.fail_run(
                &run.id,
                &format!(
                    "Step '{}' failed after {} retries: {}",
                    step_id, step.retry_count, error
                ),
            )
            .await;
        }

        Ok(())
    }

    async fn restart_step(
        &self,
        run: &PipelineRun,
        pipeline: &PipelineConfig,
        step_id: Option<&str>,
        context: Option<&str>,
    ) -> Result<(), EngineError> {
        let Some(step_id) = step_id else {
            warn!(run_id = %run.id, "restart requires a step id");
            return Ok(());
        };
        let Some(step_cfg) = pipeline.step(step_id) else {
            warn!(run_id = %run.id, step_id, "restart names an unknown step");
            return Ok(());
        };

        if let Some(mut step) = self.store.get_step(&run.id, step_id).await? {
            step.status = StepStatus::Cancelled;
            step.updated_at = Utc::now();
            self.store.update_step(&step).await?;
        }
        self.publish_run(
            &run.id,
            PipelineEvent::StepCancelled {
                run_id: run.id.clone(),
                step_id: step_id.to_string(),
            },
        )
        .await;

        info!(run_id = %run.id, step_id, "Restarting step");
        self.queue_step(run, pipeline, step_cfg, context, None).await
    }

    // ---- result routing ------------------------------------------------

    /// Decide what follows a completed step, in strict priority order:
    /// loop advancement, the on_result table, on_complete, then the
    /// last-step / configuration-error terminal cases.
    async fn route_result(
        &self,
        run: &PipelineRun,
        pipeline: &PipelineConfig,
        step_cfg: &StepConfig,
        outputs: &BTreeMap<String, String>,
    ) -> Result<(), EngineError> {
        if step_cfg.is_loop() {
            return self.advance_loop(run, pipeline, step_cfg, outputs, false).await;
        }

        if let Some(table) = &step_cfg.on_result {
            if let Some((matched, action)) = routing::match_result(outputs, table) {
                debug!(
                    run_id = %run.id,
                    step_id = %step_cfg.id,
                    matched = %matched,
                    "Result rule matched"
                );
                let action = action.clone();
                return self
                    .apply_action(run, pipeline, step_cfg, &action, outputs)
                    .await;
            }
        }

        self.advance_linear(run, pipeline, step_cfg).await
    }

    /// Linear advance: on_complete target, else completion for the last
    /// step, else a configuration error.
    async fn advance_linear(
        &self,
        run: &PipelineRun,
        pipeline: &PipelineConfig,
        step_cfg: &StepConfig,
    ) -> Result<(), EngineError> {
        if let Some(next_id) = &step_cfg.on_complete {
            let Some(next) = pipeline.step(next_id) else {
                self.fail_run(
                    &run.id,
                    &format!("Step '{}' advances to unknown step '{}'", step_cfg.id, next_id),
                )
                .await;
                return Ok(());
            };
            return self.queue_step(run, pipeline, next, None, None).await;
        }

        if pipeline.is_last_step(&step_cfg.id) {
            return self.complete_run(run).await;
        }

        self.fail_run(
            &run.id,
            &format!(
                "Step '{}' has no route forward and is not the last step",
                step_cfg.id
            ),
        )
        .await;
        Ok(())
    }

    /// Execute a matched result action
    async fn apply_action(
        &self,
        run: &PipelineRun,
        pipeline: &PipelineConfig,
        step_cfg: &StepConfig,
        action: &crate::core::StepResultAction,
        outputs: &BTreeMap<String, String>,
    ) -> Result<(), EngineError> {
        // notify is a side effect that never blocks routing; delivery
        // failures surface in the log only.
        if let Some(message) = &action.notify {
            let channel = Arc::clone(&self.channel);
            let run_id = run.id.clone();
            let message = message.clone();
            tokio::spawn(async move {
                let event = PipelineEvent::AgentMessage {
                    run_id: run_id.clone(),
                    message,
                };
                if let Err(e) = channel.publish(&run_channel(&run_id), event).await {
                    warn!(run_id = %run_id, error = %e, "Failed to deliver agent message");
                }
            });
        }

        if let Some(target_id) = &action.goto {
            let Some(target) = pipeline.step(target_id) else {
                self.fail_run(
                    &run.id,
                    &format!(
                        "Step '{}' result routes to unknown step '{}'",
                        step_cfg.id, target_id
                    ),
                )
                .await;
                return Ok(());
            };
            return self.queue_step(run, pipeline, target, None, None).await;
        }

        if action.retry {
            let max_retries = action
                .max_retries
                .unwrap_or_else(|| pipeline.effective_max_retries(step_cfg));
            let existing = self.store.get_step(&run.id, &step_cfg.id).await?;
            let is_new = existing.is_none();
            let mut step = existing
                .unwrap_or_else(|| StepExecution::queued(&run.id, &step_cfg.id, max_retries));

            if step.retry_count >= max_retries {
                self.fail_run(
                    &run.id,
                    &format!("Step '{}' exceeded retry limit of {}", step_cfg.id, max_retries),
                )
                .await;
                return Ok(());
            }

            step.status = StepStatus::Retrying;
            step.retry_count += 1;
            step.updated_at = Utc::now();
            if is_new {
                self.store.create_step(&step).await?;
            } else {
                self.store.update_step(&step).await?;
            }

            self.publish_run(
                &run.id,
                PipelineEvent::StepRetrying {
                    run_id: run.id.clone(),
                    step_id: step_cfg.id.clone(),
                    attempt: step.retry_count,
                    max_retries,
                },
            )
            .await;

            return self.queue_step(run, pipeline, step_cfg, None, None).await;
        }

        if action.continue_loop {
            // At most one loop is active per run; probe loop steps in
            // pipeline order for persisted state.
            for candidate in pipeline.steps.iter().filter(|s| s.is_loop()) {
                if self
                    .store
                    .get_loop_state(&run.id, &candidate.id)
                    .await?
                    .is_some()
                {
                    return self.advance_loop(run, pipeline, candidate, outputs, true).await;
                }
            }
            error!(
                run_id = %run.id,
                step_id = %step_cfg.id,
                "continue_loop matched but no loop is active"
            );
            return Ok(());
        }

        // A notify-only (or empty) rule still has to move the run along.
        self.advance_linear(run, pipeline, step_cfg).await
    }

    // ---- loop advancement ----------------------------------------------

    /// Drive a loop step forward
    ///
    /// First entry materializes the collection from the `over` output and
    /// re-queues the loop step for item 0. Each later entry snapshots the
    /// body's outputs onto the current item, detours through
    /// `on_each_complete` when configured, and re-queues for the next
    /// pending item. `returning_from_gate` marks re-entry after the
    /// gate, which must neither re-snapshot nor re-queue the gate.
    async fn advance_loop(
        &self,
        run: &PipelineRun,
        pipeline: &PipelineConfig,
        loop_step: &StepConfig,
        outputs: &BTreeMap<String, String>,
        returning_from_gate: bool,
    ) -> Result<(), EngineError> {
        let Some(loop_cfg) = &loop_step.loop_config else {
            self.fail_run(
                &run.id,
                &format!("Step '{}' routed as a loop but has no loop config", loop_step.id),
            )
            .await;
            return Ok(());
        };

        let state = self.store.get_loop_state(&run.id, &loop_step.id).await?;

        let Some(state) = state else {
            return self.enter_loop(run, pipeline, loop_step, loop_cfg).await;
        };

        if !returning_from_gate {
            let snapshot = serde_json::to_string(outputs).unwrap_or_default();
            self.store
                .update_loop_item(
                    &run.id,
                    &loop_step.id,
                    state.current_index,
                    LoopItemStatus::Completed,
                    Some(&snapshot),
                )
                .await?;

            if let Some(gate_id) = &loop_cfg.on_each_complete {
                let Some(gate) = pipeline.step(gate_id) else {
                    self.fail_run(
                        &run.id,
                        &format!(
                            "Loop step '{}' gate references unknown step '{}'",
                            loop_step.id, gate_id
                        ),
                    )
                    .await;
                    return Ok(());
                };
                // The index only advances once the gate reports back.
                debug!(run_id = %run.id, step_id = %loop_step.id, gate = %gate_id, "Queueing loop gate");
                return self.queue_step(run, pipeline, gate, None, None).await;
            }
        }

        match self.store.advance_loop(&run.id, &loop_step.id).await? {
            Some(item) => {
                debug!(
                    run_id = %run.id,
                    step_id = %loop_step.id,
                    index = item.index,
                    "Re-queueing loop body"
                );
                self.queue_step(run, pipeline, loop_step, None, Some(item.data))
                    .await
            }
            None => self.finish_loop(run, pipeline, loop_step, loop_cfg).await,
        }
    }

    /// First entry: parse the source array and queue item 0
    async fn enter_loop(
        &self,
        run: &PipelineRun,
        pipeline: &PipelineConfig,
        loop_step: &StepConfig,
        loop_cfg: &LoopConfig,
    ) -> Result<(), EngineError> {
        let accumulated = self.store.get_outputs(&run.id).await?;
        let Some(source) = accumulated.get(&loop_cfg.over) else {
            self.fail_run(
                &run.id,
                &format!(
                    "Loop step '{}' source output '{}' is missing",
                    loop_step.id, loop_cfg.over
                ),
            )
            .await;
            return Ok(());
        };

        let values = match serde_json::from_str::<serde_json::Value>(source) {
            Ok(serde_json::Value::Array(values)) => values,
            _ => {
                self.fail_run(
                    &run.id,
                    &format!(
                        "Loop step '{}' source output '{}' is not a JSON array",
                        loop_step.id, loop_cfg.over
                    ),
                )
                .await;
                return Ok(());
            }
        };

        let state = LoopState::from_values(&run.id, &loop_step.id, &values);
        info!(
            run_id = %run.id,
            step_id = %loop_step.id,
            items = state.items.len(),
            "Entering loop"
        );
        self.store.create_loop_state(&state).await?;

        match self.store.advance_loop(&run.id, &loop_step.id).await? {
            Some(item) => {
                self.queue_step(run, pipeline, loop_step, None, Some(item.data))
                    .await
            }
            // Empty collection: nothing to iterate.
            None => self.finish_loop(run, pipeline, loop_step, loop_cfg).await,
        }
    }

    /// All items done: hand off to on_all_complete, or fall through to the
    /// same linear/terminal logic as an ordinary completion.
    async fn finish_loop(
        &self,
        run: &PipelineRun,
        pipeline: &PipelineConfig,
        loop_step: &StepConfig,
        loop_cfg: &LoopConfig,
    ) -> Result<(), EngineError> {
        info!(run_id = %run.id, step_id = %loop_step.id, "Loop complete");

        if let Some(all_id) = &loop_cfg.on_all_complete {
            let Some(all) = pipeline.step(all_id) else {
                self.fail_run(
                    &run.id,
                    &format!(
                        "Loop step '{}' on_all_complete references unknown step '{}'",
                        loop_step.id, all_id
                    ),
                )
                .await;
                return Ok(());
            };
            return self.queue_step(run, pipeline, all, None, None).await;
        }

        self.advance_linear(run, pipeline, loop_step).await
    }

    // ---- queueing & terminal operations --------------------------------

    /// Publish a unit of work for an executor to claim
    ///
    /// Reuses the existing execution record for the (run, step) pair when
    /// there is one, preserving retry accounting and accumulated operator
    /// context across loop iterations and restarts.
    async fn queue_step(
        &self,
        run: &PipelineRun,
        pipeline: &PipelineConfig,
        step_cfg: &StepConfig,
        context: Option<&str>,
        inputs: Option<String>,
    ) -> Result<(), EngineError> {
        let existing = self.store.get_step(&run.id, &step_cfg.id).await?;
        let is_new = existing.is_none();

        let mut step = existing.unwrap_or_else(|| {
            let mut fresh = StepExecution::queued(
                &run.id,
                &step_cfg.id,
                pipeline.effective_max_retries(step_cfg),
            );
            fresh.human_context = run.human_context.clone();
            fresh
        });

        step.status = StepStatus::Queued;
        step.session_id = None;
        step.started_at = None;
        if inputs.is_some() {
            step.inputs = inputs;
        }
        if let Some(context) = context {
            step.push_context(context);
        }
        step.updated_at = Utc::now();

        if is_new {
            self.store.create_step(&step).await?;
        } else {
            self.store.update_step(&step).await?;
        }

        info!(run_id = %run.id, step_id = %step_cfg.id, agent = %step_cfg.agent, "Step queued");
        self.publish_run(
            &run.id,
            PipelineEvent::StepQueued {
                run_id: run.id.clone(),
                step_id: step_cfg.id.clone(),
                agent_id: step_cfg.agent.clone(),
                timestamp: Utc::now(),
            },
        )
        .await;

        Ok(())
    }

    /// Terminal success: persist, publish on both channels, finalize the
    /// workspace in the background, invoke the hook, unsubscribe last.
    async fn complete_run(&self, run: &PipelineRun) -> Result<(), EngineError> {
        let outputs = self.store.get_outputs(&run.id).await?;

        let mut run = run.clone();
        run.status = RunStatus::Completed;
        run.completed_at = Some(Utc::now());
        run.updated_at = Utc::now();
        self.store.update_run(&run).await?;

        info!(run_id = %run.id, "Run completed");

        let event = PipelineEvent::RunComplete {
            run_id: run.id.clone(),
            outputs: outputs.clone(),
        };
        self.publish_run(&run.id, event.clone()).await;
        self.publish_global(event).await;

        if let Some(workspace) = &self.workspace {
            let workspace = Arc::clone(workspace);
            let run_id = run.id.clone();
            let project_id = run.project_id.clone();
            tokio::spawn(async move {
                match workspace
                    .finalize_run_workspace(&run_id, project_id.as_deref())
                    .await
                {
                    Ok(result) => {
                        if let Some(push_error) = result.push_error {
                            warn!(run_id = %run_id, error = %push_error, "Workspace push failed");
                        } else {
                            debug!(run_id = %run_id, pushed = result.pushed, "Workspace finalized");
                        }
                    }
                    Err(e) => warn!(run_id = %run_id, error = %e, "Workspace finalize failed"),
                }
            });
        }

        if let Some(hooks) = &self.hooks {
            if let Err(e) = hooks.on_run_completed(&run.id, &outputs).await {
                warn!(run_id = %run.id, error = %e, "on_run_completed hook failed");
            }
        }

        self.teardown(&run.id).await;
        Ok(())
    }

    /// Terminal failure
    ///
    /// Infallible by design: it is the landing spot for every error path,
    /// and it must work even when the run row no longer exists (the
    /// failure event and unsubscribe are unconditional; the store update
    /// is best-effort).
    async fn fail_run(&self, run_id: &str, error: &str) {
        warn!(run_id, error, "Run failed");

        let event = PipelineEvent::RunFailed {
            run_id: run_id.to_string(),
            error: error.to_string(),
        };
        self.publish_run(run_id, event.clone()).await;
        self.publish_global(event).await;

        match self.store.get_run(run_id).await {
            Ok(Some(mut run)) if !run.status.is_terminal() => {
                run.status = RunStatus::Failed;
                run.completed_at = Some(Utc::now());
                run.updated_at = Utc::now();
                if let Err(e) = self.store.update_run(&run).await {
                    error!(run_id, error = %e, "Failed to persist run failure");
                }
            }
            Ok(_) => {}
            Err(e) => error!(run_id, error = %e, "Failed to load run during failure"),
        }

        if let Some(hooks) = &self.hooks {
            if let Err(e) = hooks.on_run_failed(run_id, error).await {
                warn!(run_id, error = %e, "on_run_failed hook failed");
            }
        }

        self.teardown(run_id).await;
    }

    /// Stop listening for a run; no further events are processed for it
    async fn teardown(&self, run_id: &str) {
        let subscription = self
            .subscriptions
            .lock()
            .expect("subscription map poisoned")
            .remove(run_id);
        if let Some(subscription) = subscription {
            if let Err(e) = self.channel.unsubscribe(subscription).await {
                warn!(run_id, error = %e, "Failed to unsubscribe run channel");
            }
        }
        self.active_runs
            .lock()
            .expect("active set poisoned")
            .remove(run_id);
    }

    async fn publish_run(&self, run_id: &str, event: PipelineEvent) {
        if let Err(e) = self.channel.publish(&run_channel(run_id), event).await {
            error!(run_id, error = %e, "Failed to publish on run channel");
        }
    }

    async fn publish_global(&self, event: PipelineEvent) {
        if let Err(e) = self.channel.publish(GLOBAL_CHANNEL, event).await {
            error!(error = %e, "Failed to publish on global channel");
        }
    }
}
