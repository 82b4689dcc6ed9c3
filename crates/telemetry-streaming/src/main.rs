//! # Telemetry Streaming CLI
//!
//! `ingest` runs the per-topic queries against Kafka until interrupted.
//! `demo` runs the vehicle simulator and the pipeline in one process over
//! the in-memory broker and stops once everything has been written.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use telemetry_broker::MemoryBroker;
use telemetry_domain::{Route, Vehicle};
use telemetry_simulator::{FanoutPublisher, SimulationLoop, SimulatorConfig, TelemetryBundleGenerator};
use telemetry_streaming::{IngestionPipeline, QueryOutcomes, StartingOffsets, StreamingConfig};

#[derive(Parser, Debug)]
#[command(name = "telemetry-streaming")]
#[command(about = "Ingest smart-city telemetry topics into Parquet")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    storage: StorageArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume the telemetry topics from Kafka until Ctrl+C
    Ingest {
        /// Where topics without a checkpoint start: earliest or latest
        #[arg(long)]
        starting_offsets: Option<StartingOffsets>,
    },

    /// Simulate one trip and ingest it, all in memory
    Demo {
        /// Seed for reproducible runs
        #[arg(long)]
        seed: Option<u64>,

        /// Pause between simulator ticks in milliseconds
        #[arg(long, default_value_t = 10)]
        tick_ms: u64,

        /// Stop the simulator after this many ticks
        #[arg(long)]
        max_ticks: Option<u64>,
    },
}

#[derive(Args, Debug)]
struct StorageArgs {
    /// Root of the Parquet datasets
    #[arg(long, global = true)]
    output_root: Option<PathBuf>,

    /// Root of the checkpoint directories
    #[arg(long, global = true)]
    checkpoint_root: Option<PathBuf>,

    /// Pause between micro-batch triggers in milliseconds
    #[arg(long, global = true)]
    trigger_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = StreamingConfig::from_env();
    if let Some(root) = cli.storage.output_root {
        config.output_root = root;
    }
    if let Some(root) = cli.storage.checkpoint_root {
        config.checkpoint_root = root;
    }
    if let Some(ms) = cli.storage.trigger_ms {
        config.trigger_interval = Duration::from_millis(ms);
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(version = telemetry_streaming::VERSION, "Starting telemetry streaming");

    let outcomes = match cli.command {
        Command::Ingest { starting_offsets } => {
            if let Some(starting) = starting_offsets {
                config.starting_offsets = starting;
            }
            ingest(config).await?
        }
        Command::Demo {
            seed,
            tick_ms,
            max_ticks,
        } => demo(config, seed, tick_ms, max_ticks).await?,
    };

    let mut failed = 0;
    for (topic, outcome) in &outcomes {
        match outcome {
            Ok(progress) => tracing::info!(
                %topic,
                batches = progress.batches_committed,
                rows = progress.rows_written,
                late_dropped = progress.late_dropped,
                decode_failures = progress.decode_failures,
                "Query finished"
            ),
            Err(e) => {
                failed += 1;
                tracing::error!(%topic, error = %e, "Query ended with an error");
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} queries failed", outcomes.len());
    }
    Ok(())
}

#[cfg(feature = "kafka")]
async fn ingest(config: StreamingConfig) -> Result<QueryOutcomes> {
    let source = Arc::new(telemetry_broker::KafkaSource::new(config.broker.clone()));
    let pipeline = IngestionPipeline::start(&config, source).await?;

    wait_for_signal().await;
    Ok(pipeline.shutdown().await)
}

#[cfg(not(feature = "kafka"))]
async fn ingest(_config: StreamingConfig) -> Result<QueryOutcomes> {
    anyhow::bail!("Kafka ingestion requested but built without the `kafka` feature")
}

async fn demo(
    config: StreamingConfig,
    seed: Option<u64>,
    tick_ms: u64,
    max_ticks: Option<u64>,
) -> Result<QueryOutcomes> {
    let broker = Arc::new(MemoryBroker::new(config.broker.partitions));
    let pipeline = IngestionPipeline::start(&config, broker.clone()).await?;

    let sim_config = SimulatorConfig {
        tick_interval: Duration::from_millis(tick_ms),
        seed,
        max_ticks,
        ..SimulatorConfig::from_env()
    };
    let vehicle = Vehicle::new(sim_config.vehicle_id.clone());
    let generator = TelemetryBundleGenerator::starting_now(Route::london_to_birmingham(), sim_config.seed);
    let publisher = FanoutPublisher::new(broker);
    let mut simulation = SimulationLoop::new(&sim_config, vehicle, generator, publisher);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let signal = tokio::spawn(async move {
        wait_for_signal().await;
        trigger.cancel();
    });

    let report = simulation.run(cancel).await;
    signal.abort();
    tracing::info!(
        ticks = report.ticks,
        delivered = report.delivered,
        failed = report.failed,
        reason = %report.reason,
        "Simulation finished, draining topics"
    );

    Ok(pipeline.run_until_drained(Duration::from_millis(100)).await)
}

/// Resolve on Ctrl+C or SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, stopping"),
        () = terminate => tracing::info!("Received SIGTERM, stopping"),
    }
}
