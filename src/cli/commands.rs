//! CLI command definitions

use clap::Args;

/// Validate a pipeline definition
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// List run history
#[derive(Debug, Args, Clone)]
pub struct RunsCommand {
    /// Pipeline id to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show one run in detail
#[derive(Debug, Args, Clone)]
pub struct ShowCommand {
    /// Run id
    pub run_id: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}
