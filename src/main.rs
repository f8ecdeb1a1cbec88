//! cadence - job-orchestration core.
//!
//! Usage:
//!   cadence run --config <file>             Run every enabled sweep until Ctrl+C
//!   cadence validate --config <file>        Validate a configuration without running
//!   cadence sweep <kind> --config <file>    Run one tick of a single sweep

use cadence::{
    AssumeLive, Event, EventHandler, OrchestratorConfig, Runtime, SweepKind, YamlLoader,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// cadence - recurring-unit scheduling, backpressure and retries
#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduling, retry and monitor sweeps
    Run {
        /// Path to the YAML configuration (defaults apply when omitted)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Validate a configuration without running
    Validate {
        /// Path to the YAML configuration
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },

    /// Run a single tick of one sweep and print its report
    Sweep {
        /// scheduling, retry or monitor
        #[arg(value_name = "KIND")]
        kind: SweepKind,

        /// Path to the YAML configuration (defaults apply when omitted)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

/// Logs orchestration events.
struct LoggingHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::ExecutionRetried {
                execution_id,
                attempt,
                reason,
                ..
            } => {
                info!(%execution_id, attempt, %reason, "execution requeued");
            }
            Event::ExecutionExhausted {
                execution_id,
                attempts,
                ..
            } => {
                warn!(%execution_id, attempts, "execution out of attempts");
            }
            Event::ExecutionStuck {
                execution_id,
                status,
                ..
            } => {
                warn!(%execution_id, %status, "execution stuck");
            }
            other => {
                tracing::debug!(event = other.kind(), unit_id = %other.unit_id(), "event");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            run(load_config(config.as_deref())?).await?;
        }
        Commands::Validate { config } => {
            validate(&config)?;
        }
        Commands::Sweep { kind, config } => {
            sweep_once(load_config(config.as_deref())?, kind).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            YamlLoader::load(path)?
        }
        None => {
            let mut config = OrchestratorConfig::default();
            config.apply_env(std::env::vars())?;
            config.validate()?;
            config
        }
    };
    Ok(config)
}

async fn build_runtime(config: OrchestratorConfig) -> Result<Runtime, Box<dyn std::error::Error>> {
    let runtime = Runtime::from_config(config, Arc::new(AssumeLive)).await?;
    runtime.events().register(Arc::new(LoggingHandler)).await;
    Ok(runtime)
}

/// Run every enabled sweep until Ctrl+C.
async fn run(config: OrchestratorConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        instance_id = %config.instance_id,
        scheduling_secs = config.scheduling.interval_secs,
        retry_secs = config.retry.interval_secs,
        monitor_secs = config.monitor.interval_secs,
        "starting cadence"
    );
    let runtime = build_runtime(config).await?;
    let handle = runtime.start();

    if handle.sweeps().is_empty() {
        warn!("every sweep is disabled, nothing to do");
        return Ok(());
    }

    info!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    handle.shutdown().await;

    info!("Goodbye!");
    Ok(())
}

/// Validate a configuration without running.
fn validate(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating configuration: {}", path.display());

    match YamlLoader::load(path) {
        Ok(config) => {
            info!("Configuration is valid:");
            info!("  instance: {}", config.instance_id);
            info!("  storage: {:?}", config.storage);
            info!("  retry classes: {}", config.retry_classes.len());
            info!("  retry bindings: {}", config.retry_bindings.len());
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}

/// Run one tick of `kind` and print its report.
async fn sweep_once(
    config: OrchestratorConfig,
    kind: SweepKind,
) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = build_runtime(config).await?;

    match runtime.run_once(kind).await {
        Some(report) => {
            println!("{} sweep: {:?}", kind, report);
            Ok(())
        }
        None => {
            warn!("{} lease is held elsewhere, sweep skipped", kind);
            Ok(())
        }
    }
}
