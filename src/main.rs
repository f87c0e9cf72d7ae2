mod cli;
mod core;
mod events;
mod execution;
mod store;
mod workspace;

use anyhow::{Context, Result};
use cli::commands::{RunsCommand, ShowCommand, ValidateCommand};
use cli::output::*;
use cli::{Cli, Command};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::Runs(cmd) => list_runs(cmd).await?,
        Command::Show(cmd) => show_run(cmd).await?,
    }

    Ok(())
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    let result = core::config::PipelineConfig::from_file(&cmd.file);

    match result {
        Ok(config) => {
            println!("{} Pipeline definition is valid!", CHECK);
            println!("  Id: {}", style(&config.id).cyan());
            println!("  Name: {}", style(&config.name).bold());
            println!("  Steps: {}", style(config.steps.len()).cyan());
            let loops = config.steps.iter().filter(|s| s.is_loop()).count();
            if loops > 0 {
                println!("  Loop steps: {}", style(loops).cyan());
            }

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(e).red());
            std::process::exit(1);
        }
    }
}

#[cfg(feature = "sqlite")]
async fn open_store() -> Result<store::SqliteEngineStore> {
    store::SqliteEngineStore::with_default_path().await
}

#[cfg(feature = "sqlite")]
async fn list_runs(cmd: &RunsCommand) -> Result<()> {
    use store::EngineStore;

    let store = open_store().await?;
    let mut runs = store.list_runs().await?;

    if let Some(pipeline) = &cmd.pipeline {
        runs.retain(|r| &r.pipeline_id == pipeline);
    }
    runs.truncate(cmd.limit);

    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(());
    }

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("{} Run history (showing latest {}):", INFO, cmd.limit);
        for run in &runs {
            println!("  {}", format_run_summary(run));
        }
    }

    Ok(())
}

#[cfg(feature = "sqlite")]
async fn show_run(cmd: &ShowCommand) -> Result<()> {
    use store::EngineStore;

    let store = open_store().await?;
    let run = store.get_run(&cmd.run_id).await?;

    match run {
        Some(run) => {
            if cmd.json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                println!("{} Run details", INFO);
                println!("{}", format_run_details(&run));
            }
        }
        None => {
            println!("{} Run not found", WARN);
        }
    }

    Ok(())
}

#[cfg(not(feature = "sqlite"))]
async fn list_runs(_cmd: &RunsCommand) -> Result<()> {
    println!("{} Run history requires the 'sqlite' feature", WARN);
    Ok(())
}

#[cfg(not(feature = "sqlite"))]
async fn show_run(_cmd: &ShowCommand) -> Result<()> {
    println!("{} Run history requires the 'sqlite' feature", WARN);
    Ok(())
}
