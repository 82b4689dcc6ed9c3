//! Simulator error types.

use thiserror::Error;

/// Producer-side errors.
#[derive(Error, Debug)]
pub enum SimulatorError {
    /// A record could not be encoded before publishing
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport could not be constructed or flushed
    #[error("Broker error: {0}")]
    Broker(#[from] telemetry_broker::BrokerError),

    /// Invalid route or topic
    #[error("Domain error: {0}")]
    Domain(#[from] telemetry_domain::DomainError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for simulator operations.
pub type Result<T> = std::result::Result<T, SimulatorError>;
