// Telemetry domain models shared by every channel backend
use crate::error::{AnalyticsError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single (timestamp, value) sample of a stream, in internal units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl DataPoint {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Sort samples by timestamp and collapse duplicate timestamps, keeping the
/// sample that arrived last.
pub fn normalize_points(mut points: Vec<DataPoint>) -> Vec<DataPoint> {
    points.sort_by_key(|p| p.timestamp);

    let mut out: Vec<DataPoint> = Vec::with_capacity(points.len());
    for point in points {
        match out.last_mut() {
            Some(last) if last.timestamp == point.timestamp => *last = point,
            _ => out.push(point),
        }
    }
    out
}

/// Half-open time bounds `[start, end)`; a missing bound is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(AnalyticsError::usage(format!(
                "time window start {} must be before end {}",
                start, end
            )));
        }
        Ok(Self {
            start: Some(start),
            end: Some(end),
        })
    }

    pub fn since(start: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.start.is_none_or(|s| timestamp >= s) && self.end.is_none_or(|e| timestamp < e)
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKind {
    Project,
    Device,
    Archive,
}

impl SourceKind {
    /// Name of the API resource that describes a source of this kind.
    pub fn resource(&self) -> &'static str {
        match self {
            SourceKind::Project => "project",
            SourceKind::Device => "device",
            SourceKind::Archive => "datablock",
        }
    }

    /// Query parameter used to list the streams of a source of this kind.
    pub fn stream_filter(&self) -> &'static str {
        match self {
            SourceKind::Project => "project",
            SourceKind::Device => "device",
            SourceKind::Archive => "block",
        }
    }
}

/// The project, device or archive whose streams a group analyses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceId {
    kind: SourceKind,
    slug: String,
}

impl SourceId {
    pub fn parse(slug: &str) -> Result<Self> {
        let slug = slug.trim();
        let kind = if slug.starts_with("p--") {
            SourceKind::Project
        } else if slug.starts_with("d--") {
            SourceKind::Device
        } else if slug.starts_with("b--") {
            SourceKind::Archive
        } else {
            return Err(AnalyticsError::usage(format!(
                "invalid source '{}': expected a project (p--), device (d--) or archive (b--) slug",
                slug
            )));
        };

        Ok(Self {
            kind,
            slug: slug.to_string(),
        })
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.slug)
    }
}

impl TryFrom<String> for SourceId {
    type Error = AnalyticsError;

    fn try_from(value: String) -> Result<Self> {
        SourceId::parse(&value)
    }
}

impl From<SourceId> for String {
    fn from(value: SourceId) -> Self {
        value.slug
    }
}

/// Metadata describing one stream of a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub slug: String,
    /// User supplied label; may be empty.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub var_name: Option<String>,
    #[serde(default)]
    pub var_type: Option<String>,
    /// Slug of the unit the stream is displayed in by default.
    #[serde(default)]
    pub output_unit: Option<String>,
    /// System streams that are not listed unless explicitly requested.
    #[serde(default)]
    pub hidden: bool,
}

impl StreamDescriptor {
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            name: String::new(),
            var_name: None,
            var_type: None,
            output_unit: None,
            hidden: false,
        }
    }

    pub fn display_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }

        match self.var_name.as_deref() {
            Some(var) if !var.is_empty() => format!("{} (from variable)", var),
            _ => "Unnamed".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCounts {
    pub points: u64,
    pub events: u64,
}

impl StreamCounts {
    pub fn is_empty(&self) -> bool {
        self.points == 0 && self.events == 0
    }
}

/// Event summary record; the payload is the event's extra data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub has_raw_data: bool,
}

/// Full raw data uploaded alongside an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub event_id: i64,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Scalar property value; deliberately limited to what every backend can store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    String(String),
    None,
}

impl PropertyValue {
    /// Flatten an arbitrary JSON value; anything that is not a scalar is kept
    /// as its JSON text.
    pub fn from_json(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => PropertyValue::None,
            Value::Bool(b) => PropertyValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => PropertyValue::Int(i),
                None => PropertyValue::String(n.to_string()),
            },
            Value::String(s) => PropertyValue::String(s),
            other => PropertyValue::String(other.to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }
}

pub type Properties = BTreeMap<String, PropertyValue>;

/// Descriptive fields of a source (ids, creation/claim times, location...).
pub type SourceInfo = BTreeMap<String, PropertyValue>;
