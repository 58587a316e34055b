// Cloud channel: the Channel contract over the REST API, via a Session
use crate::application::channel::{Channel, DatapointResults};
use crate::domain::telemetry::{
    DataPoint, Event, Properties, PropertyValue, RawEvent, SourceId, SourceInfo, SourceKind,
    StreamCounts, StreamDescriptor, TimeWindow, normalize_points,
};
use crate::domain::vartype::{Mdo, UnitDefinition, VariableType};
use crate::error::{AnalyticsError, Result};
use crate::infrastructure::config::AnalyticsConfig;
use crate::infrastructure::session::{Session, SessionConfig};
use crate::infrastructure::transport::{ApiRequest, HttpTransport, Transport};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde::Deserialize;
use serde::de::Error as _;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireUnitRef {
    Slug(String),
    Unit { slug: String },
}

#[derive(Debug, Deserialize)]
struct WireStream {
    slug: String,
    #[serde(default)]
    data_label: Option<String>,
    #[serde(default)]
    var_name: Option<String>,
    #[serde(default)]
    var_type: Option<String>,
    #[serde(default)]
    output_unit: Option<WireUnitRef>,
}

impl From<WireStream> for StreamDescriptor {
    fn from(wire: WireStream) -> Self {
        let mut stream = StreamDescriptor::new(wire.slug);
        stream.name = wire.data_label.unwrap_or_default();
        stream.var_name = wire.var_name;
        stream.var_type = wire.var_type;
        stream.output_unit = wire.output_unit.map(|unit| match unit {
            WireUnitRef::Slug(slug) | WireUnitRef::Unit { slug } => slug,
        });
        stream
    }
}

#[derive(Debug, Deserialize)]
struct WireStreamCount {
    #[serde(default)]
    data_cnt: u64,
    #[serde(default)]
    event_cnt: u64,
    #[serde(default)]
    has_streamid: Option<bool>,
}

impl WireStreamCount {
    /// System streams are the ones explicitly flagged as having no stream id.
    fn is_system(&self) -> bool {
        self.has_streamid == Some(false)
    }
}

#[derive(Debug, Deserialize)]
struct WireDeviceExtra {
    #[serde(default)]
    stream_counts: BTreeMap<String, WireStreamCount>,
}

#[derive(Debug, Deserialize)]
struct WireDataPoint {
    timestamp: DateTime<Utc>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    int_value: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    id: i64,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    extra_data: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    has_raw_data: bool,
}

fn one() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
struct WireUnit {
    slug: String,
    #[serde(default)]
    unit_full: String,
    #[serde(default)]
    unit_short: Option<String>,
    #[serde(default = "one")]
    m: f64,
    #[serde(default = "one")]
    d: f64,
    #[serde(default)]
    o: f64,
}

#[derive(Debug, Deserialize)]
struct WireVartype {
    slug: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    available_output_units: Vec<WireUnit>,
    #[serde(default)]
    default_output_unit: Option<WireUnitRef>,
}

impl From<WireVartype> for VariableType {
    fn from(wire: WireVartype) -> Self {
        let units = wire
            .available_output_units
            .into_iter()
            .filter_map(|unit| match Mdo::new(unit.m, unit.d, unit.o) {
                Ok(mdo) => Some(UnitDefinition {
                    label: if unit.unit_full.is_empty() {
                        unit.slug.clone()
                    } else {
                        unit.unit_full
                    },
                    slug: unit.slug,
                    short: unit.unit_short,
                    mdo,
                }),
                Err(e) => {
                    tracing::warn!("Skipping unit {} of variable type {}: {}", unit.slug, wire.slug, e);
                    None
                }
            })
            .collect();

        VariableType {
            slug: wire.slug,
            name: wire.name,
            units,
            default_unit: wire.default_output_unit.map(|unit| match unit {
                WireUnitRef::Slug(slug) | WireUnitRef::Unit { slug } => slug,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireProperty {
    name: String,
    #[serde(default)]
    value: Value,
}

/// Numbers may arrive as JSON numbers or as numeric strings.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Millisecond bound for a query. Rounding `end` up keeps the server's
/// slice a superset of the window; the exact cut happens locally.
fn format_bound(at: DateTime<Utc>, round_up: bool) -> String {
    let sub_milli = at.timestamp_subsec_nanos() % 1_000_000;
    let at = if round_up && sub_milli != 0 {
        at + TimeDelta::nanoseconds(i64::from(1_000_000 - sub_milli))
    } else {
        at
    };
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn with_window(mut request: ApiRequest, window: TimeWindow) -> ApiRequest {
    if let Some(start) = window.start {
        request = request.param("start", format_bound(start, false));
    }
    if let Some(end) = window.end {
        request = request.param("end", format_bound(end, true));
    }
    request
}

fn data_request(slug: &str, window: TimeWindow) -> ApiRequest {
    with_window(ApiRequest::new("data/").param("filter", slug).param("mask", 1), window)
}

fn events_request(slug: &str, window: TimeWindow) -> ApiRequest {
    with_window(ApiRequest::new("event/").param("filter", slug).param("mask", 1), window)
}

fn streams_request(source: &SourceId) -> ApiRequest {
    let request = ApiRequest::new("stream/").param(source.kind().stream_filter(), source.slug());
    match source.kind() {
        // Archives keep streams that are no longer attached to any device.
        SourceKind::Archive => request.param("all", 1),
        _ => request,
    }
}

fn parse_datapoints(items: Vec<Value>, window: TimeWindow) -> Result<Vec<DataPoint>> {
    let mut points = Vec::with_capacity(items.len());
    for item in items {
        let wire: WireDataPoint = serde_json::from_value(item)?;
        if !window.contains(wire.timestamp) {
            continue;
        }

        let value = wire
            .value
            .as_ref()
            .and_then(as_number)
            .or_else(|| wire.int_value.as_ref().and_then(as_number))
            .unwrap_or(f64::NAN);
        points.push(DataPoint::new(wire.timestamp, value));
    }
    Ok(normalize_points(points))
}

fn count_of(value: &Value) -> Result<u64> {
    value
        .get("count")
        .and_then(Value::as_u64)
        .ok_or_else(|| serde_json::Error::custom("paginated response is missing its count").into())
}

/// Channel backed by the cloud API. Bulk operations fan out through the
/// session's worker pool.
pub struct CloudChannel<T: Transport = HttpTransport> {
    session: Session<T>,
}

impl CloudChannel<HttpTransport> {
    pub fn connect(config: &AnalyticsConfig) -> Result<Self> {
        let transport = HttpTransport::new(
            &config.cloud.domain,
            config.cloud.verify_tls,
            Duration::from_secs(config.session.token_ttl_secs),
        )?;
        let session = Session::new(
            transport,
            config.cloud.credentials(),
            SessionConfig::from(&config.session),
        );
        Ok(Self::new(session))
    }
}

impl<T: Transport> CloudChannel<T> {
    pub fn new(session: Session<T>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    /// Resolve a device by its external id, which must match exactly one device.
    pub async fn find_device(&self, external_id: &str) -> Result<SourceId> {
        let items = self
            .session
            .fetch_all(ApiRequest::new("device/").param("external_id", external_id))
            .await?;

        let slugs = items
            .iter()
            .map(|item| {
                item.get("slug")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| AnalyticsError::from(serde_json::Error::custom("device record is missing its slug")))
            })
            .collect::<Result<Vec<_>>>()?;

        let device = match slugs.as_slice() {
            [] => return Err(AnalyticsError::not_found("device", external_id)),
            [slug] => SourceId::parse(slug)?,
            many => {
                return Err(AnalyticsError::usage(format!(
                    "external id '{}' matches {} devices: {}",
                    external_id,
                    many.len(),
                    many.join(", ")
                )));
            }
        };

        if device.kind() != SourceKind::Device {
            return Err(AnalyticsError::usage(format!(
                "external id '{}' resolved to {}, which is not a device",
                external_id, device
            )));
        }
        tracing::debug!("External id {} is device {}", external_id, device);
        Ok(device)
    }

    async fn device_extra(&self, device: &str) -> Result<WireDeviceExtra> {
        let value = self
            .session
            .execute(&ApiRequest::new(format!("device/{}/extra/", device)))
            .await
            .map_err(|e| match e {
                AnalyticsError::NotFound { .. } => AnalyticsError::not_found("source", device),
                other => other,
            })?;
        Ok(serde_json::from_value(value)?)
    }

    /// Point and event counts read from single-item pages.
    async fn count_generic(&self, slugs: &[String]) -> Result<BTreeMap<String, StreamCounts>> {
        let mut requests = Vec::with_capacity(slugs.len() * 2);
        for (i, slug) in slugs.iter().enumerate() {
            requests.push((
                (i, false),
                ApiRequest::new(format!("stream/{}/data/", slug)).param("page_size", 1),
            ));
            requests.push((
                (i, true),
                ApiRequest::new("event/").param("filter", slug).param("page_size", 1),
            ));
        }

        let mut counts: BTreeMap<String, StreamCounts> = BTreeMap::new();
        for ((i, is_events), outcome) in self.session.fetch_multiple(requests).await? {
            let count = count_of(&outcome?)?;
            let entry = counts.entry(slugs[i].clone()).or_default();
            if is_events {
                entry.events = count;
            } else {
                entry.points = count;
            }
        }
        Ok(counts)
    }

    async fn fetch_event_list(&self, slug: &str, window: TimeWindow) -> Result<Vec<Event>> {
        let items = self.session.fetch_all(events_request(slug, window)).await?;

        let mut events = Vec::with_capacity(items.len());
        for item in items {
            let wire: WireEvent = serde_json::from_value(item)?;
            if window.contains(wire.timestamp) {
                events.push(Event {
                    id: wire.id,
                    timestamp: wire.timestamp,
                    payload: wire.extra_data.unwrap_or_default(),
                    has_raw_data: wire.has_raw_data,
                });
            }
        }
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}

#[async_trait]
impl<T: Transport> Channel for CloudChannel<T> {
    async fn list_streams(&self, source: &SourceId, include_hidden: bool) -> Result<Vec<StreamDescriptor>> {
        let items = self.session.fetch_all(streams_request(source)).await?;
        let mut streams = items
            .into_iter()
            .map(|item| serde_json::from_value::<WireStream>(item).map(StreamDescriptor::from))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if include_hidden && source.kind() == SourceKind::Device {
            let extra = self.device_extra(source.slug()).await?;
            streams.extend(
                extra
                    .stream_counts
                    .iter()
                    .filter(|(_, counts)| counts.is_system())
                    .map(|(slug, _)| {
                        let mut stream = StreamDescriptor::new(slug.clone());
                        stream.hidden = true;
                        stream
                    }),
            );
        }

        tracing::debug!("Found {} streams for {}", streams.len(), source);
        Ok(streams)
    }

    async fn count_streams(&self, source: &SourceId) -> Result<usize> {
        let value = self
            .session
            .execute(&streams_request(source).param("page_size", 1))
            .await?;
        Ok(count_of(&value)? as usize)
    }

    async fn count_stream_data(
        &self,
        source: &SourceId,
        slugs: &[String],
    ) -> Result<BTreeMap<String, StreamCounts>> {
        if source.kind() != SourceKind::Device {
            return self.count_generic(slugs).await;
        }

        // System streams are only counted in the device's extra record.
        let extra = self.device_extra(source.slug()).await?;
        let normal: Vec<String> = slugs
            .iter()
            .filter(|slug| !extra.stream_counts.get(*slug).is_some_and(|c| c.is_system()))
            .cloned()
            .collect();
        let mut counts = self.count_generic(&normal).await?;

        for slug in slugs {
            if counts.contains_key(slug) {
                continue;
            }
            let system = extra
                .stream_counts
                .get(slug)
                .ok_or_else(|| AnalyticsError::not_found("stream", slug.clone()))?;
            counts.insert(
                slug.clone(),
                StreamCounts {
                    points: system.data_cnt,
                    events: system.event_cnt,
                },
            );
        }
        Ok(counts)
    }

    async fn fetch_datapoints(&self, slug: &str, window: TimeWindow) -> Result<Vec<DataPoint>> {
        let items = self.session.fetch_all(data_request(slug, window)).await?;
        tracing::debug!("Fetched {} data points for {}", items.len(), slug);
        parse_datapoints(items, window)
    }

    async fn fetch_many_datapoints(&self, slugs: &[String], window: TimeWindow) -> Result<DatapointResults> {
        let requests = slugs
            .iter()
            .map(|slug| (slug.clone(), data_request(slug, window)))
            .collect();

        Ok(self
            .session
            .fetch_all_multiple(requests)
            .await?
            .into_iter()
            .map(|(slug, outcome)| (slug, outcome.and_then(|items| parse_datapoints(items, window))))
            .collect())
    }

    async fn fetch_events(&self, slug: &str, window: TimeWindow) -> Result<Vec<Event>> {
        self.fetch_event_list(slug, window).await
    }

    async fn fetch_raw_events(&self, slug: &str, window: TimeWindow) -> Result<Vec<RawEvent>> {
        let events = self.fetch_event_list(slug, window).await?;
        let requests = events
            .iter()
            .filter(|e| e.has_raw_data)
            .map(|e| ((e.id, e.timestamp), ApiRequest::new(format!("event/{}/data/", e.id))))
            .collect();

        self.session
            .fetch_multiple(requests)
            .await?
            .into_iter()
            .map(|((event_id, timestamp), outcome)| {
                outcome.map(|payload| RawEvent {
                    event_id,
                    timestamp,
                    payload,
                })
            })
            .collect()
    }

    async fn fetch_properties(&self, source: &SourceId) -> Result<Properties> {
        let items = self
            .session
            .fetch_all(ApiRequest::new("property/").param("target", source.slug()))
            .await?;

        let mut properties = Properties::new();
        for item in items {
            let wire: WireProperty = serde_json::from_value(item)?;
            properties.insert(wire.name, PropertyValue::from_json(wire.value));
        }
        Ok(properties)
    }

    async fn fetch_variable_types(&self, slugs: &[String]) -> Result<BTreeMap<String, VariableType>> {
        let requests = slugs
            .iter()
            .map(|slug| (slug.clone(), ApiRequest::new(format!("vartype/{}/", slug))))
            .collect();

        let mut vartypes = BTreeMap::new();
        for (slug, outcome) in self.session.fetch_multiple(requests).await? {
            match outcome {
                Ok(value) => {
                    let vartype = VariableType::from(serde_json::from_value::<WireVartype>(value)?);
                    vartypes.insert(vartype.slug.clone(), vartype);
                }
                Err(AnalyticsError::NotFound { .. }) => {
                    tracing::warn!("Variable type {} does not exist", slug);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(vartypes)
    }

    async fn fetch_source_info(&self, source: &SourceId) -> Result<SourceInfo> {
        let path = format!("{}/{}/", source.kind().resource(), source.slug());
        let value = self
            .session
            .execute(&ApiRequest::new(path))
            .await
            .map_err(|e| match e {
                AnalyticsError::NotFound { .. } => AnalyticsError::not_found("source", source.slug()),
                other => other,
            })?;

        match value {
            Value::Object(fields) => Ok(fields
                .into_iter()
                .map(|(k, v)| (k, PropertyValue::from_json(v)))
                .collect()),
            other => Err(serde_json::Error::custom(format!(
                "unexpected source record for {}: {}",
                source, other
            ))
            .into()),
        }
    }
}
