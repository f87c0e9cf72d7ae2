//! CLI output formatting

use crate::core::{PipelineRun, RunStatus};
use console::Emoji;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");

/// Format a run status for display
pub fn format_status(status: RunStatus) -> String {
    match status {
        RunStatus::Pending => style("PENDING").dim().to_string(),
        RunStatus::Running => style("RUNNING").yellow().to_string(),
        RunStatus::Completed => style("COMPLETED").green().to_string(),
        RunStatus::Failed => style("FAILED").red().to_string(),
        RunStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

/// Format a run as a single history line
pub fn format_run_summary(run: &PipelineRun) -> String {
    let status_icon = match run.status {
        RunStatus::Completed => CHECK,
        RunStatus::Failed => CROSS,
        RunStatus::Running => SPINNER,
        _ => INFO,
    };

    let short_id: String = run.id.chars().take(8).collect();
    let current = run
        .current_step_id
        .as_deref()
        .map(|s| format!(" @ {}", style(s).cyan()))
        .unwrap_or_default();

    format!(
        "{} {} - {} - {}{}",
        status_icon,
        style(short_id).dim(),
        style(&run.pipeline_id).bold(),
        format_status(run.status),
        current
    )
}

/// Multi-line detail view for one run
pub fn format_run_details(run: &PipelineRun) -> String {
    let mut lines = vec![
        format!("  ID: {}", style(&run.id).cyan()),
        format!("  Pipeline: {}", style(&run.pipeline_id).bold()),
        format!("  Status: {}", format_status(run.status)),
        format!("  Task: {}", run.task_description),
        format!("  Created: {}", style(run.created_at.to_rfc3339()).dim()),
    ];

    if let Some(step) = &run.current_step_id {
        lines.push(format!("  Current step: {}", style(step).cyan()));
    }
    if let Some(branch) = &run.task_branch {
        lines.push(format!("  Branch: {}", branch));
    }
    if let Some(completed) = run.completed_at {
        lines.push(format!(
            "  Finished: {}",
            style(completed.to_rfc3339()).dim()
        ));
    }
    if let Some(context) = &run.human_context {
        lines.push(format!("  Context: {}", style(context).dim()));
    }

    lines.join("\n")
}
