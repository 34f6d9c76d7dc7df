// Point model - the time-series record handed to the sink
//
// A Point is immutable once built. Tags and fields are kept in ordered maps so
// that two normalizations of the same response produce identical output.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Tag set attached to a point (e.g. `VDC`, `NodeID`)
pub type Tags = BTreeMap<String, String>;

/// Field set of a point, keyed by field name
pub type Fields = BTreeMap<String, FieldValue>;

/// A single field value: either numeric or retained text
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Applies the numeric coercion policy to raw text.
    ///
    /// Text that parses as a finite base-10 float (surrounding whitespace
    /// ignored) becomes `Float`; anything else is kept verbatim as `Text`.
    pub fn coerce(raw: &str) -> Self {
        match parse_number(raw) {
            Some(value) => FieldValue::Float(value),
            None => FieldValue::Text(raw.to_string()),
        }
    }
}

/// Parses text as a finite float, ignoring surrounding whitespace
pub fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|value| value.is_finite())
}

/// Truncates an instant to whole seconds
pub fn truncate_to_second(instant: DateTime<Utc>) -> DateTime<Utc> {
    from_epoch_seconds(instant.timestamp()).unwrap_or(instant)
}

/// Converts epoch seconds into a UTC instant, rejecting out-of-range values
pub fn from_epoch_seconds(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}

/// One fully-formed time-series record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    measurement: String,
    tags: Tags,
    fields: Fields,
    timestamp: DateTime<Utc>,
}

impl Point {
    /// Builds a point; the timestamp is truncated to 1-second resolution
    pub fn new(
        measurement: impl Into<String>,
        tags: Tags,
        fields: Fields,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Point {
            measurement: measurement.into(),
            tags,
            fields,
            timestamp: truncate_to_second(timestamp),
        }
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Points of one measurement family, written to the sink in a single call
#[derive(Debug, Clone, PartialEq)]
pub struct PointBatch {
    pub measurement: String,
    pub points: Vec<Point>,
}

impl PointBatch {
    pub fn new(measurement: impl Into<String>, points: Vec<Point>) -> Self {
        PointBatch {
            measurement: measurement.into(),
            points,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
