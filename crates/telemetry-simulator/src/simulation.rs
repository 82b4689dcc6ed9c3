//! Simulation loop and termination policy.
//!
//! ```text
//!            ┌──────────── tick ─────────────┐
//!            ▼                               │
//!        Running ── bundle published ── pause + collect acks
//!            │
//!            ├─ destination reached ─┐
//!            ├─ cancellation ────────┼──▶ Terminating(reason) ── final flush ──▶ Stopped
//!            ├─ tick limit ──────────┤
//!            └─ fatal error ─────────┘
//! ```

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use telemetry_domain::{Position, SimTime, TelemetryRecord, Vehicle};

use crate::config::{SerializationPolicy, SimulatorConfig};
use crate::error::Result;
use crate::generator::{TelemetryBundle, TelemetryBundleGenerator};
use crate::publisher::FanoutPublisher;

/// Why the loop left `Running`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    DestinationReached,
    UserInterrupt,
    TickLimit,
    FatalError(String),
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DestinationReached => f.write_str("destination reached"),
            Self::UserInterrupt => f.write_str("interrupted by user"),
            Self::TickLimit => f.write_str("tick limit reached"),
            Self::FatalError(reason) => write!(f, "fatal error: {reason}"),
        }
    }
}

/// Loop lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Terminating(TerminationReason),
    Stopped,
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub ticks: u64,
    pub reason: TerminationReason,
    pub delivered: usize,
    pub failed: usize,
    pub final_position: Option<Position>,
    pub final_time: Option<SimTime>,
}

/// Turns a record into its wire payload.
pub type RecordEncoder =
    Box<dyn Fn(&TelemetryRecord) -> serde_json::Result<Vec<u8>> + Send + Sync>;

/// Drives ticks until the vehicle arrives, the run is cancelled or something fatal happens.
pub struct SimulationLoop {
    vehicle: Vehicle,
    generator: TelemetryBundleGenerator,
    publisher: FanoutPublisher,
    tick_interval: Duration,
    max_ticks: Option<u64>,
    serialization_policy: SerializationPolicy,
    encoder: RecordEncoder,
    state: LoopState,
    ticks: u64,
    last_bundle: Option<(SimTime, Position)>,
}

impl SimulationLoop {
    pub fn new(
        config: &SimulatorConfig,
        vehicle: Vehicle,
        generator: TelemetryBundleGenerator,
        publisher: FanoutPublisher,
    ) -> Self {
        Self {
            vehicle,
            generator,
            publisher,
            tick_interval: config.tick_interval,
            max_ticks: config.max_ticks,
            serialization_policy: config.serialization_policy,
            encoder: Box::new(TelemetryRecord::to_json),
            state: LoopState::Stopped,
            ticks: 0,
            last_bundle: None,
        }
    }

    /// Replace the JSON wire encoding of records.
    #[must_use]
    pub fn with_encoder(mut self, encoder: RecordEncoder) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    /// Run to completion. Every submitted message is acknowledged before this returns.
    pub async fn run(&mut self, cancel: CancellationToken) -> SimulationReport {
        self.state = LoopState::Running;
        tracing::info!(
            vehicle_id = %self.vehicle.vehicle_id,
            destination = ?self.generator.route().destination(),
            "Simulation started"
        );

        let reason = loop {
            if cancel.is_cancelled() {
                break TerminationReason::UserInterrupt;
            }

            let bundle = self.generator.generate(&self.vehicle);
            self.ticks += 1;
            self.last_bundle = Some((bundle.time, bundle.position));

            match self.publish_bundle(&bundle) {
                Ok(()) => tracing::info!(
                    tick = bundle.tick,
                    time = %bundle.time,
                    lat = bundle.position.latitude,
                    lon = bundle.position.longitude,
                    "Bundle published"
                ),
                Err(e) => match self.serialization_policy {
                    SerializationPolicy::Abort => {
                        tracing::error!(tick = bundle.tick, error = %e, "Bundle serialization failed, aborting");
                        break TerminationReason::FatalError(e.to_string());
                    }
                    SerializationPolicy::SkipTick => {
                        tracing::warn!(tick = bundle.tick, error = %e, "Bundle serialization failed, skipping tick");
                    }
                },
            }

            if bundle.destination_reached {
                self.collect().await;
                tracing::info!(ticks = self.ticks, "Vehicle has reached its destination");
                break TerminationReason::DestinationReached;
            }

            if self.max_ticks.is_some_and(|max| self.ticks >= max) {
                self.collect().await;
                break TerminationReason::TickLimit;
            }

            tokio::select! {
                () = cancel.cancelled() => break TerminationReason::UserInterrupt,
                () = self.pause_and_collect() => {}
            }
        };

        self.state = LoopState::Terminating(reason.clone());
        tracing::info!(%reason, pending = self.publisher.pending(), "Simulation terminating");

        // In-flight deliveries are still awaited after a cancellation.
        self.collect().await;
        self.state = LoopState::Stopped;

        let report = SimulationReport {
            ticks: self.ticks,
            reason,
            delivered: self.publisher.delivered(),
            failed: self.publisher.failed(),
            final_position: self.last_bundle.map(|(_, p)| p),
            final_time: self.last_bundle.map(|(t, _)| t),
        };
        tracing::info!(
            ticks = report.ticks,
            delivered = report.delivered,
            failed = report.failed,
            "Simulation stopped"
        );
        report
    }

    /// Serialize all five records first so a bad record aborts the whole tick.
    fn publish_bundle(&mut self, bundle: &TelemetryBundle) -> Result<()> {
        let mut encoded = Vec::with_capacity(bundle.records.len());
        for record in &bundle.records {
            encoded.push((record.topic(), record.key(), (self.encoder)(record)?));
        }

        for (topic, key, payload) in encoded {
            self.publisher.publish(topic.as_str(), key, payload);
        }
        Ok(())
    }

    /// Ack collection for the bundle just published overlaps the pause.
    async fn pause_and_collect(&mut self) {
        let pause = tokio::time::sleep(self.tick_interval);
        tokio::join!(self.publisher.flush(), pause);
    }

    async fn collect(&mut self) {
        self.publisher.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use telemetry_broker::MemoryBroker;
    use telemetry_domain::{Increments, Route, Topic};

    fn route() -> Route {
        Route::new(
            Position::new(51.5, -0.1),
            Position::new(52.4, -1.0),
            Increments {
                latitude: 0.01,
                longitude: -0.01,
            },
        )
        .unwrap()
    }

    fn config(tick_interval: Duration) -> SimulatorConfig {
        SimulatorConfig {
            tick_interval,
            seed: Some(99),
            ..SimulatorConfig::default()
        }
    }

    fn build(broker: Arc<MemoryBroker>, config: &SimulatorConfig, route: Route) -> SimulationLoop {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        let generator = TelemetryBundleGenerator::new(route, start, config.seed);
        let publisher = FanoutPublisher::new(broker);
        SimulationLoop::new(config, Vehicle::default(), generator, publisher)
    }

    #[tokio::test]
    async fn test_runs_to_destination() {
        let broker = Arc::new(MemoryBroker::new(3));
        let mut sim = build(broker.clone(), &config(Duration::ZERO), route());

        let report = sim.run(CancellationToken::new()).await;

        assert_eq!(report.reason, TerminationReason::DestinationReached);
        assert!((88..=92).contains(&report.ticks), "ticks {}", report.ticks);
        assert_eq!(report.delivered, 5 * report.ticks as usize);
        assert_eq!(report.failed, 0);
        assert_eq!(sim.state(), &LoopState::Stopped);
        for topic in Topic::ALL {
            assert_eq!(broker.message_count(topic.as_str()).await, report.ticks as usize);
        }
        let last = report.final_position.unwrap();
        assert!(last.has_reached(&route().destination()));
    }

    #[tokio::test]
    async fn test_longitude_bound_route_takes_longer() {
        // Longitude needs twice as many steps as latitude on this route.
        let long_route = Route::new(
            Position::new(51.5, -0.1),
            Position::new(52.4, -1.9),
            Increments {
                latitude: 0.01,
                longitude: -0.01,
            },
        )
        .unwrap();
        let broker = Arc::new(MemoryBroker::new(1));
        let mut sim = build(broker, &config(Duration::ZERO), long_route);

        let report = sim.run(CancellationToken::new()).await;
        assert_eq!(report.reason, TerminationReason::DestinationReached);
        assert!((178..=182).contains(&report.ticks), "ticks {}", report.ticks);
    }

    #[tokio::test]
    async fn test_publish_failures_do_not_stop_the_loop() {
        let broker = Arc::new(MemoryBroker::new(1));
        broker.fail_topic(Topic::Gps.as_str(), "not leader").await;
        let mut sim = build(broker.clone(), &config(Duration::ZERO), route());

        let report = sim.run(CancellationToken::new()).await;

        assert_eq!(report.reason, TerminationReason::DestinationReached);
        assert_eq!(report.failed, report.ticks as usize);
        assert_eq!(report.delivered, 4 * report.ticks as usize);
        assert_eq!(broker.message_count("gps_data").await, 0);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let broker = Arc::new(MemoryBroker::new(1));
        let mut sim = build(broker.clone(), &config(Duration::ZERO), route());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = sim.run(cancel).await;
        assert_eq!(report.reason, TerminationReason::UserInterrupt);
        assert_eq!(report.ticks, 0);
        assert!(report.final_position.is_none());
        assert_eq!(broker.message_count("vehicle_data").await, 0);
    }

    #[tokio::test]
    async fn test_cancel_during_pause_collects_in_flight() {
        let broker = Arc::new(MemoryBroker::new(2));
        let mut sim = build(broker.clone(), &config(Duration::from_millis(40)), route());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let report = sim.run(cancel).await;
        assert_eq!(report.reason, TerminationReason::UserInterrupt);
        assert!(report.ticks >= 1 && report.ticks < 88);
        assert_eq!(report.delivered + report.failed, 5 * report.ticks as usize);
        assert_eq!(
            broker.message_count("emergency_data").await,
            report.ticks as usize
        );
    }

    #[tokio::test]
    async fn test_tick_limit() {
        let broker = Arc::new(MemoryBroker::new(1));
        let config = SimulatorConfig {
            max_ticks: Some(7),
            ..config(Duration::ZERO)
        };
        let mut sim = build(broker, &config, route());

        let report = sim.run(CancellationToken::new()).await;
        assert_eq!(report.reason, TerminationReason::TickLimit);
        assert_eq!(report.ticks, 7);
        assert_eq!(report.delivered, 35);
    }

    /// JSON encoding that fails for the weather record of tick `bad_tick`.
    fn failing_weather_encoder(bad_tick: usize) -> RecordEncoder {
        let weather_seen = AtomicUsize::new(0);
        Box::new(move |record: &TelemetryRecord| {
            if record.topic() == Topic::Weather
                && weather_seen.fetch_add(1, Ordering::SeqCst) + 1 == bad_tick
            {
                return Err(<serde_json::Error as serde::ser::Error>::custom("sensor offline"));
            }
            record.to_json()
        })
    }

    #[tokio::test]
    async fn test_serialization_failure_aborts_by_default() {
        let broker = Arc::new(MemoryBroker::new(1));
        let mut sim = build(broker.clone(), &config(Duration::ZERO), route())
            .with_encoder(failing_weather_encoder(3));

        let report = sim.run(CancellationToken::new()).await;

        assert!(matches!(&report.reason, TerminationReason::FatalError(reason) if reason.contains("sensor offline")));
        assert_eq!(report.ticks, 3);
        assert_eq!(sim.state(), &LoopState::Stopped);
        // Nothing of the failed tick went out, not even the records encoded before weather.
        assert_eq!(report.delivered, 10);
        for topic in Topic::ALL {
            assert_eq!(broker.message_count(topic.as_str()).await, 2, "{topic}");
        }
    }

    #[tokio::test]
    async fn test_skip_tick_policy_keeps_ticking() {
        let limited = SimulatorConfig {
            max_ticks: Some(5),
            ..config(Duration::ZERO)
        };
        let reference = build(Arc::new(MemoryBroker::new(1)), &limited, route())
            .run(CancellationToken::new())
            .await;

        let broker = Arc::new(MemoryBroker::new(1));
        let skipping = SimulatorConfig {
            serialization_policy: SerializationPolicy::SkipTick,
            ..limited.clone()
        };
        let mut sim = build(broker.clone(), &skipping, route()).with_encoder(failing_weather_encoder(3));
        let report = sim.run(CancellationToken::new()).await;

        assert_eq!(report.reason, TerminationReason::TickLimit);
        assert_eq!(report.ticks, 5);
        assert_eq!(report.delivered, 20);
        assert_eq!(broker.message_count("vehicle_data").await, 4);
        // Clock and tracker advanced through the skipped tick as usual.
        assert_eq!(report.final_time, reference.final_time);
        assert_eq!(report.final_position, reference.final_position);
    }
}
