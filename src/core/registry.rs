//! Pipeline definition registry
//!
//! Populated once at startup from external configuration and read-only
//! thereafter. The engine holds it behind an `Arc`.

use crate::core::config::PipelineConfig;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// In-memory mapping from pipeline id to its static step graph
#[derive(Debug, Default)]
pub struct PipelineRegistry {
    pipelines: HashMap<String, PipelineConfig>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self {
            pipelines: HashMap::new(),
        }
    }

    /// Register a validated pipeline definition
    ///
    /// Re-registering an id replaces the previous definition; registration
    /// happens only during startup.
    pub fn register(&mut self, config: PipelineConfig) -> Result<()> {
        config.validate()?;
        info!(
            pipeline_id = %config.id,
            steps = config.steps.len(),
            "Registered pipeline"
        );
        self.pipelines.insert(config.id.clone(), config);
        Ok(())
    }

    /// Load every `*.yaml`/`*.yml` definition from a directory
    pub fn load_dir<P: AsRef<Path>>(&mut self, dir: P) -> Result<usize> {
        let dir = dir.as_ref();
        let mut loaded = 0;

        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read pipeline directory {}", dir.display()))?
        {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }

            let config = PipelineConfig::from_file(&path)
                .with_context(|| format!("Failed to load pipeline {}", path.display()))?;
            self.register(config)?;
            loaded += 1;
        }

        Ok(loaded)
    }

    /// Look up a pipeline definition by id
    pub fn get(&self, pipeline_id: &str) -> Option<&PipelineConfig> {
        self.pipelines.get(pipeline_id)
    }

    /// Registered pipeline ids, sorted for deterministic listing
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
        ids.sort();
        ids
    }
}
