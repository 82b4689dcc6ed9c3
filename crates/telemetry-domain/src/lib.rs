//! # Smart City Telemetry - Domain Model
//!
//! Value objects, categorical enums and the five telemetry record kinds
//! emitted by a simulated vehicle. These types are shared by the producer
//! (`telemetry-simulator`) and the ingestion pipeline (`telemetry-streaming`),
//! and their serde representation *is* the wire format.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Simulated event time carried by every record.
pub type SimTime = DateTime<Utc>;

// =============================================================================
// VALUE OBJECTS
// =============================================================================

/// Geographic position. Serialized on the wire as a `[lat, lon]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64)", into = "(f64, f64)")]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

impl Position {
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Arrival check against a north-west destination corner.
    #[must_use]
    pub fn has_reached(&self, destination: &Self) -> bool {
        reached(self, destination)
    }
}

impl From<(f64, f64)> for Position {
    fn from((latitude, longitude): (f64, f64)) -> Self {
        Self::new(latitude, longitude)
    }
}

impl From<Position> for (f64, f64) {
    fn from(p: Position) -> Self {
        (p.latitude, p.longitude)
    }
}

/// `true` once the vehicle is at or beyond the destination, approaching from
/// the south-east: `lat >= dest.lat && lon <= dest.lon`.
///
/// Only meaningful together with a [`Route`] whose increments point north-west.
#[must_use]
pub fn reached(position: &Position, destination: &Position) -> bool {
    position.latitude >= destination.latitude && position.longitude <= destination.longitude
}

/// Fixed per-tick movement applied before jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Increments {
    pub latitude: f64,
    pub longitude: f64,
}

/// Start point, destination and per-tick increments of a simulated trip.
///
/// The arrival predicate and the increment signs are a paired invariant:
/// latitude must grow and longitude must shrink, otherwise the vehicle
/// would never satisfy [`reached`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Route {
    start: Position,
    destination: Position,
    increments: Increments,
}

/// Central London.
pub const LONDON: Position = Position::new(51.5074, -0.1278);

/// Central Birmingham.
pub const BIRMINGHAM: Position = Position::new(52.4862, -1.8904);

impl Route {
    /// Build a route, rejecting increments that can never reach the destination.
    pub fn new(start: Position, destination: Position, increments: Increments) -> Result<Self> {
        if !(increments.latitude > 0.0 && increments.longitude < 0.0) {
            return Err(DomainError::DivergentRoute {
                lat_increment: increments.latitude,
                lon_increment: increments.longitude,
            });
        }
        Ok(Self {
            start,
            destination,
            increments,
        })
    }

    /// Split the straight line between `start` and `destination` into `steps` equal moves.
    pub fn with_steps(start: Position, destination: Position, steps: u32) -> Result<Self> {
        if steps == 0 {
            return Err(DomainError::InvalidStepCount);
        }
        let steps = f64::from(steps);
        Self::new(
            start,
            destination,
            Increments {
                latitude: (destination.latitude - start.latitude) / steps,
                longitude: (destination.longitude - start.longitude) / steps,
            },
        )
    }

    /// London to Birmingham in 100 nominal steps.
    #[must_use]
    pub fn london_to_birmingham() -> Self {
        Self {
            start: LONDON,
            destination: BIRMINGHAM,
            increments: Increments {
                latitude: (BIRMINGHAM.latitude - LONDON.latitude) / 100.0,
                longitude: (BIRMINGHAM.longitude - LONDON.longitude) / 100.0,
            },
        }
    }

    #[must_use]
    pub const fn start(&self) -> Position {
        self.start
    }

    #[must_use]
    pub const fn destination(&self) -> Position {
        self.destination
    }

    #[must_use]
    pub const fn increments(&self) -> Increments {
        self.increments
    }
}

impl Default for Route {
    fn default() -> Self {
        Self::london_to_birmingham()
    }
}

/// The simulated vehicle. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub vehicle_id: String,
    pub make: String,
    pub model: String,
    pub year: i32,
    pub fuel_type: String,
}

impl Vehicle {
    pub fn new(vehicle_id: impl Into<String>) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            ..Self::default()
        }
    }
}

impl Default for Vehicle {
    fn default() -> Self {
        Self {
            vehicle_id: "Vehicle-IoT-Data".to_string(),
            make: "Tesla".to_string(),
            model: "Model S".to_string(),
            year: 2024,
            fuel_type: "Electric".to_string(),
        }
    }
}

// =============================================================================
// TOPICS
// =============================================================================

/// One message stream per record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Vehicle,
    Gps,
    Traffic,
    Weather,
    Emergency,
}

impl Topic {
    /// Bundle order.
    pub const ALL: [Self; 5] = [
        Self::Vehicle,
        Self::Gps,
        Self::Traffic,
        Self::Weather,
        Self::Emergency,
    ];

    /// Stream name on the broker and directory name in storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Vehicle => "vehicle_data",
            Self::Gps => "gps_data",
            Self::Traffic => "traffic_data",
            Self::Weather => "weather_data",
            Self::Emergency => "emergency_data",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s || t.as_str().trim_end_matches("_data") == s)
            .ok_or_else(|| DomainError::UnknownTopic(s.to_string()))
    }
}

// =============================================================================
// ENUMS
// =============================================================================

/// Weather condition reported by the roadside station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WeatherCondition {
    Sunny,
    Cloudy,
    Rain,
    Snow,
}

impl WeatherCondition {
    pub const ALL: [Self; 4] = [Self::Sunny, Self::Cloudy, Self::Rain, Self::Snow];
    pub const NAMES: &'static [&'static str] = &["Sunny", "Cloudy", "Rain", "Snow"];
}

/// Emergency incident category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncidentType {
    Accident,
    Fire,
    Medical,
    Police,
    None,
}

impl IncidentType {
    pub const ALL: [Self; 5] = [
        Self::Accident,
        Self::Fire,
        Self::Medical,
        Self::Police,
        Self::None,
    ];
    pub const NAMES: &'static [&'static str] = &["Accident", "Fire", "Medical", "Police", "None"];
}

/// Emergency incident lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncidentStatus {
    Active,
    Resolved,
}

impl IncidentStatus {
    pub const ALL: [Self; 2] = [Self::Active, Self::Resolved];
    pub const NAMES: &'static [&'static str] = &["Active", "Resolved"];
}

// =============================================================================
// RECORDS
// =============================================================================

/// Vehicle state reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleData {
    pub id: Uuid,
    pub vehicle_id: String,
    pub timestamp: SimTime,
    pub location: Position,
    pub speed: f64,
    pub direction: String,
    pub make: String,
    pub model: String,
    pub year: i32,
    #[serde(rename = "fuelType")]
    pub fuel_type: String,
}

/// GPS reading. Carries no location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsData {
    pub id: Uuid,
    pub vehicle_id: String,
    pub timestamp: SimTime,
    pub speed: f64,
    pub direction: String,
    #[serde(rename = "vehicleType")]
    pub vehicle_type: String,
}

/// Traffic camera capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficCameraData {
    pub id: Uuid,
    pub vehicle_id: String,
    pub camera_id: String,
    pub location: Position,
    pub timestamp: SimTime,
    pub snapshot: String,
}

/// Weather station reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherData {
    pub id: Uuid,
    #[serde(rename = "vehicle_id")]
    pub vehicle_id: String,
    pub location: Position,
    pub timestamp: SimTime,
    pub temperature: f64,
    pub weather_condition: WeatherCondition,
    pub precipitation: f64,
    pub wind_speed: f64,
    pub humidity: i32,
    pub air_quality_index: f64,
}

/// Emergency incident report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyIncidentData {
    pub id: Uuid,
    pub vehicle_id: String,
    #[serde(rename = "incidentId")]
    pub incident_id: Uuid,
    #[serde(rename = "type")]
    pub incident_type: IncidentType,
    pub timestamp: SimTime,
    pub location: Position,
    pub status: IncidentStatus,
    pub description: String,
}

/// One of the five record kinds produced per tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TelemetryRecord {
    Vehicle(VehicleData),
    Gps(GpsData),
    TrafficCamera(TrafficCameraData),
    Weather(WeatherData),
    EmergencyIncident(EmergencyIncidentData),
}

impl TelemetryRecord {
    #[must_use]
    pub const fn topic(&self) -> Topic {
        match self {
            Self::Vehicle(_) => Topic::Vehicle,
            Self::Gps(_) => Topic::Gps,
            Self::TrafficCamera(_) => Topic::Traffic,
            Self::Weather(_) => Topic::Weather,
            Self::EmergencyIncident(_) => Topic::Emergency,
        }
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        match self {
            Self::Vehicle(r) => r.id,
            Self::Gps(r) => r.id,
            Self::TrafficCamera(r) => r.id,
            Self::Weather(r) => r.id,
            Self::EmergencyIncident(r) => r.id,
        }
    }

    #[must_use]
    pub fn vehicle_id(&self) -> &str {
        match self {
            Self::Vehicle(r) => &r.vehicle_id,
            Self::Gps(r) => &r.vehicle_id,
            Self::TrafficCamera(r) => &r.vehicle_id,
            Self::Weather(r) => &r.vehicle_id,
            Self::EmergencyIncident(r) => &r.vehicle_id,
        }
    }

    #[must_use]
    pub const fn timestamp(&self) -> SimTime {
        match self {
            Self::Vehicle(r) => r.timestamp,
            Self::Gps(r) => r.timestamp,
            Self::TrafficCamera(r) => r.timestamp,
            Self::Weather(r) => r.timestamp,
            Self::EmergencyIncident(r) => r.timestamp,
        }
    }

    /// `None` for GPS readings.
    #[must_use]
    pub const fn location(&self) -> Option<Position> {
        match self {
            Self::Vehicle(r) => Some(r.location),
            Self::Gps(_) => None,
            Self::TrafficCamera(r) => Some(r.location),
            Self::Weather(r) => Some(r.location),
            Self::EmergencyIncident(r) => Some(r.location),
        }
    }

    /// Message key: the record's own id, so partitioning is per record.
    #[must_use]
    pub fn key(&self) -> String {
        self.id().to_string()
    }

    /// Encode as a UTF-8 JSON object.
    pub fn to_json(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Domain-level errors
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("Route never reaches destination: lat_increment={lat_increment}, lon_increment={lon_increment}")]
    DivergentRoute {
        lat_increment: f64,
        lon_increment: f64,
    },

    #[error("Route needs at least one step")]
    InvalidStepCount,

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
