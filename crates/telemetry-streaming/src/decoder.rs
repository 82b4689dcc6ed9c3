//! Schema-validating payload decoder.
//!
//! Payloads are the JSON objects written by the simulator. Every schema
//! column is looked up by name; missing or `null` columns decode to
//! [`FieldValue::Null`], extra keys are ignored. Only the event time is
//! mandatory.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use telemetry_domain::{Position, SimTime, Topic};

use crate::error::DecodeError;
use crate::schema::{DataType, EVENT_TIME_FIELD, Field, TopicSchema};

type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// One decoded column value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Utf8(String),
    Float64(f64),
    Int32(i32),
    Timestamp(SimTime),
    Location(Position),
}

/// A payload that passed schema validation. `values` follow the schema's
/// column order.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    pub topic: Topic,
    pub event_time: SimTime,
    pub values: Vec<FieldValue>,
}

/// Decoder bound to one topic's schema
#[derive(Debug, Clone, Copy)]
pub struct StreamDecoder {
    schema: TopicSchema,
}

impl StreamDecoder {
    #[must_use]
    pub const fn new(topic: Topic) -> Self {
        Self {
            schema: TopicSchema::for_topic(topic),
        }
    }

    #[must_use]
    pub const fn schema(&self) -> &TopicSchema {
        &self.schema
    }

    pub fn decode(&self, payload: &[u8]) -> DecodeResult<DecodedRecord> {
        let Value::Object(object) = serde_json::from_slice::<Value>(payload)? else {
            return Err(DecodeError::NotAnObject);
        };

        let mut event_time = None;
        let mut values = Vec::with_capacity(self.schema.fields().len());

        for field in self.schema.fields() {
            let value = decode_field(field, &object)?;
            if field.data_type == DataType::Timestamp && !field.nullable {
                match value {
                    FieldValue::Timestamp(ts) => event_time = Some(ts),
                    _ => return Err(DecodeError::MissingEventTime(field.name)),
                }
            }
            values.push(value);
        }

        let event_time = event_time.ok_or(DecodeError::MissingEventTime(EVENT_TIME_FIELD))?;

        Ok(DecodedRecord {
            topic: self.schema.topic(),
            event_time,
            values,
        })
    }
}

fn decode_field(field: &Field, object: &Map<String, Value>) -> DecodeResult<FieldValue> {
    let value = match object.get(field.name) {
        None | Some(Value::Null) => return Ok(FieldValue::Null),
        Some(value) => value,
    };

    let mismatch = || DecodeError::TypeMismatch {
        field: field.name,
        expected: field.data_type.describe(),
    };

    match field.data_type {
        DataType::Utf8 => value
            .as_str()
            .map(|s| FieldValue::Utf8(s.to_string()))
            .ok_or_else(mismatch),

        DataType::Float64 => value.as_f64().map(FieldValue::Float64).ok_or_else(mismatch),

        DataType::Int32 => value
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .map(FieldValue::Int32)
            .ok_or_else(mismatch),

        DataType::Timestamp => {
            let raw = value.as_str().ok_or_else(mismatch)?;
            parse_timestamp(raw)
                .map(FieldValue::Timestamp)
                .ok_or_else(|| DecodeError::BadTimestamp {
                    field: field.name,
                    value: raw.to_string(),
                })
        }

        DataType::Location => match value.as_array().map(Vec::as_slice) {
            Some([lat, lon]) => match (lat.as_f64(), lon.as_f64()) {
                (Some(lat), Some(lon)) => Ok(FieldValue::Location(Position::new(lat, lon))),
                _ => Err(mismatch()),
            },
            _ => Err(mismatch()),
        },

        DataType::Category(allowed) => {
            let raw = value.as_str().ok_or_else(mismatch)?;
            if allowed.contains(&raw) {
                Ok(FieldValue::Utf8(raw.to_string()))
            } else {
                Err(DecodeError::UnknownCategory {
                    field: field.name,
                    value: raw.to_string(),
                    allowed,
                })
            }
        }
    }
}

/// RFC 3339, or a naive ISO timestamp read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<SimTime> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
