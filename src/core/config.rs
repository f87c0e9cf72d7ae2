//! Pipeline definitions from YAML

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// System-wide retry bound used when neither the step nor the
/// pipeline override it.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Top-level pipeline definition loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Unique pipeline identifier
    pub id: String,

    /// Human-readable pipeline name
    pub name: String,

    /// Default retry bound for steps in this pipeline
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Ordered pipeline steps
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

/// Step definition as written in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Unique step identifier within the pipeline
    pub id: String,

    /// Agent the executor should run this step with
    pub agent: String,

    /// Loop descriptor; presence makes this a loop step
    #[serde(rename = "loop", default)]
    pub loop_config: Option<LoopConfig>,

    /// Step to queue after this one completes (linear advance)
    #[serde(default)]
    pub on_complete: Option<String>,

    /// Expected output value -> action routing table
    #[serde(default)]
    pub on_result: Option<BTreeMap<String, StepResultAction>>,

    /// Retry bound for this step (overrides the pipeline default)
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl StepConfig {
    /// Whether this step iterates over a runtime collection
    pub fn is_loop(&self) -> bool {
        self.loop_config.is_some()
    }
}

/// Loop descriptor for a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Name of a prior accumulated output holding a JSON array
    pub over: String,

    /// Step to run after every item (e.g. a review gate)
    #[serde(default)]
    pub on_each_complete: Option<String>,

    /// Step to run once after the final item
    #[serde(default)]
    pub on_all_complete: Option<String>,
}

/// Action bound to a matched `on_result` value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepResultAction {
    /// Jump to a named step
    #[serde(default)]
    pub goto: Option<String>,

    /// Re-queue the current step
    #[serde(default)]
    pub retry: bool,

    /// Retry bound override for the `retry` action
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Inter-agent message to publish (does not block routing)
    #[serde(default)]
    pub notify: Option<String>,

    /// Hand control back to the active loop after a review gate
    #[serde(default)]
    pub continue_loop: bool,
}

impl PipelineConfig {
    /// Load a pipeline definition from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse a pipeline definition from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the pipeline definition
    ///
    /// Every step-id reference (`on_complete`, `on_result.goto`, loop
    /// targets) must name a step in this pipeline. A pipeline with zero
    /// steps parses fine; `start_run` rejects it at execution time.
    pub fn validate(&self) -> Result<()> {
        // Check that all step IDs are unique
        let mut seen_ids = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen_ids.insert(&step.id) {
                anyhow::bail!("Duplicate step ID: {}", step.id);
            }
        }

        let step_ids: std::collections::HashSet<_> = self.steps.iter().map(|s| &s.id).collect();

        for step in &self.steps {
            if let Some(ref target) = step.on_complete {
                if !step_ids.contains(target) {
                    anyhow::bail!(
                        "Step '{}' on_complete references non-existent step '{}'",
                        step.id,
                        target
                    );
                }
            }

            if let Some(table) = &step.on_result {
                for (value, action) in table {
                    if let Some(ref target) = action.goto {
                        if !step_ids.contains(target) {
                            anyhow::bail!(
                                "Step '{}' on_result['{}'] goto references non-existent step '{}'",
                                step.id,
                                value,
                                target
                            );
                        }
                    }
                }
            }

            if let Some(lc) = &step.loop_config {
                if lc.over.trim().is_empty() {
                    anyhow::bail!("Step '{}' loop has an empty 'over' output name", step.id);
                }
                if let Some(ref target) = lc.on_each_complete {
                    if !step_ids.contains(target) {
                        anyhow::bail!(
                            "Step '{}' loop on_each_complete references non-existent step '{}'",
                            step.id,
                            target
                        );
                    }
                }
                if let Some(ref target) = lc.on_all_complete {
                    if !step_ids.contains(target) {
                        anyhow::bail!(
                            "Step '{}' loop on_all_complete references non-existent step '{}'",
                            step.id,
                            target
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Get a step definition by id
    pub fn step(&self, id: &str) -> Option<&StepConfig> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Position of a step in the definition order
    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Whether the named step is the final step of the pipeline
    pub fn is_last_step(&self, id: &str) -> bool {
        self.steps.last().map(|s| s.id == id).unwrap_or(false)
    }

    /// Effective retry bound for a step: step override, else pipeline
    /// default, else the system default.
    pub fn effective_max_retries(&self, step: &StepConfig) -> u32 {
        step.max_retries
            .or(self.max_retries)
            .unwrap_or(DEFAULT_MAX_RETRIES)
    }
}
