//! Fixed per-topic schemas and their Arrow representation.

use std::sync::Arc;

use arrow::datatypes::{
    DataType as ArrowType, Field as ArrowField, Schema as ArrowSchema, SchemaRef, TimeUnit,
};

use telemetry_domain::{IncidentStatus, IncidentType, Topic, WeatherCondition};

/// Event-time column shared by every topic.
pub const EVENT_TIME_FIELD: &str = "timestamp";

/// Logical column types understood by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Utf8,
    Float64,
    /// JSON integers only
    Int32,
    /// RFC 3339 or naive ISO string, stored as UTC microseconds
    Timestamp,
    /// `[lat, lon]` pair
    Location,
    /// String restricted to a closed set, stored as Utf8
    Category(&'static [&'static str]),
}

impl DataType {
    /// Human readable name used in decode errors
    #[must_use]
    pub const fn describe(&self) -> &'static str {
        match self {
            Self::Utf8 => "string",
            Self::Float64 => "number",
            Self::Int32 => "32-bit integer",
            Self::Timestamp => "timestamp string",
            Self::Location => "[lat, lon] pair",
            Self::Category(_) => "category string",
        }
    }

    fn to_arrow(self) -> ArrowType {
        match self {
            Self::Utf8 | Self::Category(_) => ArrowType::Utf8,
            Self::Float64 => ArrowType::Float64,
            Self::Int32 => ArrowType::Int32,
            Self::Timestamp => ArrowType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            Self::Location => ArrowType::new_fixed_size_list(ArrowType::Float64, 2, true),
        }
    }
}

/// One column of a topic schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Field {
    const fn optional(name: &'static str, data_type: DataType) -> Self {
        Self {
            name,
            data_type,
            nullable: true,
        }
    }

    const fn event_time() -> Self {
        Self {
            name: EVENT_TIME_FIELD,
            data_type: DataType::Timestamp,
            nullable: false,
        }
    }
}

const VEHICLE: &[Field] = &[
    Field::optional("id", DataType::Utf8),
    Field::optional("vehicle_id", DataType::Utf8),
    Field::event_time(),
    Field::optional("location", DataType::Location),
    Field::optional("speed", DataType::Float64),
    Field::optional("direction", DataType::Utf8),
    Field::optional("make", DataType::Utf8),
    Field::optional("model", DataType::Utf8),
    Field::optional("year", DataType::Int32),
    Field::optional("fuelType", DataType::Utf8),
];

const GPS: &[Field] = &[
    Field::optional("id", DataType::Utf8),
    Field::optional("vehicle_id", DataType::Utf8),
    Field::event_time(),
    Field::optional("speed", DataType::Float64),
    Field::optional("direction", DataType::Utf8),
    Field::optional("vehicleType", DataType::Utf8),
];

const TRAFFIC: &[Field] = &[
    Field::optional("id", DataType::Utf8),
    Field::optional("vehicle_id", DataType::Utf8),
    Field::optional("camera_id", DataType::Utf8),
    Field::optional("location", DataType::Location),
    Field::event_time(),
    Field::optional("snapshot", DataType::Utf8),
];

const WEATHER: &[Field] = &[
    Field::optional("id", DataType::Utf8),
    Field::optional("vehicle_id", DataType::Utf8),
    Field::optional("location", DataType::Location),
    Field::event_time(),
    Field::optional("temperature", DataType::Float64),
    Field::optional(
        "weatherCondition",
        DataType::Category(WeatherCondition::NAMES),
    ),
    Field::optional("precipitation", DataType::Float64),
    Field::optional("windSpeed", DataType::Float64),
    Field::optional("humidity", DataType::Int32),
    Field::optional("airQualityIndex", DataType::Float64),
];

const EMERGENCY: &[Field] = &[
    Field::optional("id", DataType::Utf8),
    Field::optional("vehicle_id", DataType::Utf8),
    Field::optional("incidentId", DataType::Utf8),
    Field::optional("type", DataType::Category(IncidentType::NAMES)),
    Field::event_time(),
    Field::optional("location", DataType::Location),
    Field::optional("status", DataType::Category(IncidentStatus::NAMES)),
    Field::optional("description", DataType::Utf8),
];

/// Column layout of one topic, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicSchema {
    topic: Topic,
    fields: &'static [Field],
}

impl TopicSchema {
    #[must_use]
    pub const fn for_topic(topic: Topic) -> Self {
        let fields = match topic {
            Topic::Vehicle => VEHICLE,
            Topic::Gps => GPS,
            Topic::Traffic => TRAFFIC,
            Topic::Weather => WEATHER,
            Topic::Emergency => EMERGENCY,
        };
        Self { topic, fields }
    }

    #[must_use]
    pub const fn topic(&self) -> Topic {
        self.topic
    }

    #[must_use]
    pub const fn fields(&self) -> &'static [Field] {
        self.fields
    }

    /// Position of the event-time column
    #[must_use]
    pub fn event_time_index(&self) -> Option<usize> {
        self.fields.iter().position(|f| f.name == EVENT_TIME_FIELD)
    }

    /// Arrow schema used for the Parquet files of this topic
    #[must_use]
    pub fn arrow_schema(&self) -> SchemaRef {
        let fields: Vec<ArrowField> = self
            .fields
            .iter()
            .map(|f| ArrowField::new(f.name, f.data_type.to_arrow(), f.nullable))
            .collect();
        Arc::new(ArrowSchema::new(fields))
    }
}
