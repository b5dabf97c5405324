//! ucr-reconcile - keeps report tables in line with their data sources
//!
//! # Usage
//!
//! ```bash
//! # Check data source definitions without connecting
//! ucr-reconcile -c ucr.yaml validate
//!
//! # Show what a pass would do, including the index DDL operators must run
//! ucr-reconcile -c ucr.yaml plan
//!
//! # Reconcile (at most once per bootstrap interval across all runners)
//! ucr-reconcile -c ucr.yaml reconcile
//!
//! # Rebuild one table from the documents file
//! ucr-reconcile -c ucr.yaml rebuild cases --in-place
//! ```

mod config;
mod runtime;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ucr_rebuild::prelude::*;

use config::CliConfig;
use runtime::Runtime;

#[derive(Parser)]
#[command(name = "ucr-reconcile")]
#[command(version, about = "Schema reconciliation and rebuilds for report tables")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "UCR_CONFIG", default_value = "ucr.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration and data source definitions
    Validate,
    /// Diff and classify without changing anything
    Plan {
        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Yaml)]
        format: Format,
    },
    /// Run a reconciliation pass and drain the rebuilds it queues
    Reconcile {
        /// Ignore the last recorded run and reconcile now
        #[arg(long)]
        force: bool,
    },
    /// Rebuild one data source's table from the documents file
    Rebuild {
        /// Data source id
        config_id: String,
        /// Keep the existing table and load into it
        #[arg(long, conflicts_with = "resume")]
        in_place: bool,
        /// Continue an interrupted build
        #[arg(long)]
        resume: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Yaml,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = CliConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Validate => validate(&config),
        Commands::Plan { format } => plan(config, format).await,
        Commands::Reconcile { force } => reconcile(config, force).await,
        Commands::Rebuild {
            config_id,
            in_place,
            resume,
        } => rebuild(config, &config_id, in_place, resume).await,
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

fn validate(config: &CliConfig) -> Result<()> {
    let sources = config.load_data_sources()?;
    let filter = ConfigFilter::from_processor(&config.rebuild.processor)?;

    println!("✓ Configuration valid!\n");
    println!("Engines:");
    for engine_id in config.engines.keys() {
        println!("  - {}", engine_id);
    }
    println!();

    println!("Data sources:");
    let mut broken = 0;
    for source in &sources {
        let handled = if filter.accepts(source) { "" } else { " (not handled by this worker)" };
        match DefaultDefinitionProvider.definition(source) {
            Ok(definition) => println!(
                "  ✓ {} -> {} on {}{}",
                source.id, definition.table_name, source.engine_id, handled
            ),
            Err(e) => {
                broken += 1;
                println!("  ✗ {}: {}", source.id, e);
            }
        }
    }

    if broken > 0 {
        anyhow::bail!("{} data source(s) failed validation", broken);
    }
    Ok(())
}

async fn plan(config: CliConfig, format: Format) -> Result<()> {
    let runtime = Runtime::connect(&config).await?;
    let adapters = runtime.adapters(&runtime.handled_sources().await?);

    let (orchestrator, _jobs) = runtime.orchestrator(&config);
    let plans = orchestrator.plan(&adapters).await?;

    let output = match format {
        Format::Json => serde_json::to_string_pretty(&plans)?,
        Format::Yaml => serde_yaml::to_string(&plans)?,
    };
    println!("{}", output);

    runtime.close().await;
    Ok(())
}

async fn reconcile(config: CliConfig, force: bool) -> Result<()> {
    let runtime = Runtime::connect(&config).await?;

    let (orchestrator, jobs) = runtime.orchestrator(&config);
    let tracker = orchestrator.rebuilder().tracker().clone();
    let worker = runtime.worker(&config, tracker.clone())?;
    let drain = tokio::spawn(async move { worker.run(jobs).await });

    let manager = runtime.table_manager(&config, orchestrator);
    if force {
        manager.reset_reconcile().await?;
    }
    let report = manager.bootstrap(None).await?;
    // Closes the queue once the pass is done so the worker can finish
    drop(manager);
    drain.await?;

    let Some(report) = report else {
        info!("reconciled recently by another runner, nothing to do");
        runtime.close().await;
        return Ok(());
    };

    println!("{}", serde_yaml::to_string(&report)?);
    let failed_jobs = tracker
        .statuses()
        .into_iter()
        .filter(|s| s.state == JobState::Failed)
        .count();
    runtime.close().await;

    if report.has_failures() || failed_jobs > 0 {
        error!(
            table_failures = report.failures.len(),
            failed_rebuilds = failed_jobs,
            "reconciliation finished with failures"
        );
        anyhow::bail!("reconciliation finished with failures");
    }
    Ok(())
}

async fn rebuild(config: CliConfig, config_id: &str, in_place: bool, resume: bool) -> Result<()> {
    let runtime = Runtime::connect(&config).await?;

    let source = runtime
        .catalog()
        .get(config_id)
        .await?
        .with_context(|| format!("Unknown data source '{}'", config_id))?;
    let adapter = runtime.factory().build(&source)?;
    let builder = runtime.builder(&config)?;

    let stats = if resume {
        if !builder.resume_helper(&source).has_resume_state().await? {
            warn!(config = %config_id, "no resume state, build starts from the first unit");
        }
        builder.resume(adapter.as_ref()).await?
    } else if in_place {
        builder.rebuild_in_place(adapter.as_ref()).await?
    } else {
        builder.rebuild(adapter.as_ref()).await?
    };

    println!(
        "✓ {}: {} unit(s) built, {} skipped, {} document(s), {} row(s)",
        adapter.table_name(),
        stats.units_built,
        stats.units_skipped,
        stats.load.documents,
        stats.load.rows_inserted
    );
    runtime.close().await;
    Ok(())
}
