//! Vehicle Telemetry Simulator CLI
//!
//! Drives one vehicle from London to Birmingham, publishing five correlated
//! readings per tick.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use telemetry_broker::{MemoryBroker, SharedTransport};
use telemetry_domain::{Route, Vehicle};
use telemetry_simulator::{
    FanoutPublisher, SimulationLoop, SimulatorConfig, TelemetryBundleGenerator, TerminationReason,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportKind {
    /// In-process broker; messages are kept in memory only
    Memory,
    /// Kafka at KAFKA_BOOTSTRAP_SERVERS (requires the `kafka` feature)
    Kafka,
}

#[derive(Parser, Debug)]
#[command(name = "telemetry-simulator")]
#[command(about = "Simulate a vehicle emitting smart-city telemetry")]
struct Args {
    /// Vehicle identifier
    #[arg(long)]
    vehicle_id: Option<String>,

    /// Pause between ticks in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Stop after this many ticks
    #[arg(long)]
    max_ticks: Option<u64>,

    /// Message transport
    #[arg(long, value_enum, default_value = "memory")]
    transport: TransportKind,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let mut config = SimulatorConfig::from_env();
    if let Some(id) = args.vehicle_id {
        config.vehicle_id = id;
    }
    if let Some(ms) = args.tick_ms {
        config.tick_interval = Duration::from_millis(ms);
    }
    config.seed = args.seed.or(config.seed);
    config.max_ticks = args.max_ticks.or(config.max_ticks);

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let transport = build_transport(args.transport, &config)?;
    let vehicle = Vehicle::new(config.vehicle_id.clone());
    let generator = TelemetryBundleGenerator::starting_now(Route::london_to_birmingham(), config.seed);
    let publisher = FanoutPublisher::new(Arc::clone(&transport));

    info!(
        vehicle_id = %vehicle.vehicle_id,
        transport = ?args.transport,
        tick_ms = config.tick_interval.as_millis(),
        "Starting vehicle simulation"
    );

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let mut simulation = SimulationLoop::new(&config, vehicle, generator, publisher);
    let report = simulation.run(cancel).await;
    transport.flush(config.flush_timeout).await?;

    info!(
        ticks = report.ticks,
        delivered = report.delivered,
        failed = report.failed,
        reason = %report.reason,
        "Simulation finished"
    );

    match report.reason {
        TerminationReason::FatalError(reason) => Err(anyhow::anyhow!(reason)),
        _ => Ok(()),
    }
}

fn build_transport(kind: TransportKind, config: &SimulatorConfig) -> Result<SharedTransport> {
    match kind {
        TransportKind::Memory => Ok(Arc::new(MemoryBroker::new(config.broker.partitions))),
        #[cfg(feature = "kafka")]
        TransportKind::Kafka => Ok(Arc::new(telemetry_broker::KafkaTransport::new(&config.broker)?)),
        #[cfg(not(feature = "kafka"))]
        TransportKind::Kafka => {
            anyhow::bail!("Kafka transport requested but built without the `kafka` feature")
        }
    }
}

/// Cancel the simulation on Ctrl+C or SIGTERM
async fn shutdown_signal(cancel: CancellationToken) {
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
        () = ctrl_c => info!("Received Ctrl+C, finishing in-flight deliveries"),
        () = terminate => info!("Received SIGTERM, finishing in-flight deliveries"),
    }
    cancel.cancel();
}
