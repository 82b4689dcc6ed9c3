//! # Telemetry Simulator
//!
//! Drives one simulated vehicle from its start point to its destination and
//! fans five correlated readings per tick out to their topics.
//!
//! ## Components
//!
//! - [`SimulationClock`]: simulated time, 30-60 s per tick
//! - [`PositionTracker`]: position with per-tick increment and jitter
//! - [`TelemetryBundleGenerator`]: one correlated bundle per tick
//! - [`FanoutPublisher`]: non-blocking publish, one ack per message
//! - [`SimulationLoop`]: tick driver and termination policy

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod error;
pub mod generator;
pub mod publisher;
pub mod simulation;
pub mod tracker;

pub use clock::SimulationClock;
pub use config::{SerializationPolicy, SimulatorConfig};
pub use error::{Result, SimulatorError};
pub use generator::{TelemetryBundle, TelemetryBundleGenerator};
pub use publisher::{DeliveryAck, FanoutPublisher, FlushReport};
pub use simulation::{LoopState, RecordEncoder, SimulationLoop, SimulationReport, TerminationReason};
pub use tracker::PositionTracker;
