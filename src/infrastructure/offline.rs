// Offline store: persisted snapshot of a source and the channel that serves it
use crate::application::channel::Channel;
use crate::domain::telemetry::{
    DataPoint, Event, Properties, RawEvent, SourceId, SourceInfo, StreamCounts, StreamDescriptor,
    TimeWindow, normalize_points,
};
use crate::domain::vartype::VariableType;
use crate::error::{AnalyticsError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Keyed storage for everything a group needs to be reopened without the cloud.
pub trait OfflineStore: Send + Sync {
    fn save_source_info(&mut self, source: &SourceId, info: &SourceInfo, properties: &Properties) -> Result<()>;

    fn save_vartype(&mut self, vartype: &VariableType) -> Result<()>;

    /// Store one stream. Raw events must belong to one of `events`.
    fn save_stream(
        &mut self,
        definition: &StreamDescriptor,
        points: &[DataPoint],
        events: &[Event],
        raw_events: &[RawEvent],
    ) -> Result<()>;

    fn get_stream_definition(&self, slug: &str) -> Result<StreamDescriptor>;

    fn source(&self) -> Option<&SourceId>;

    fn source_info(&self) -> &SourceInfo;

    fn properties(&self) -> &Properties;

    fn vartype(&self, slug: &str) -> Option<&VariableType>;

    fn stream_definitions(&self) -> Vec<StreamDescriptor>;

    fn stream_points(&self, slug: &str) -> Result<Vec<DataPoint>>;

    fn stream_events(&self, slug: &str) -> Result<&[Event]>;

    fn stream_raw_events(&self, slug: &str) -> Result<&[RawEvent]>;
}

/// JSON has no NaN, so gaps are stored as null.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPoint {
    timestamp: DateTime<Utc>,
    value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredStream {
    definition: StreamDescriptor,
    #[serde(default)]
    points: Vec<StoredPoint>,
    #[serde(default)]
    events: Vec<Event>,
    #[serde(default)]
    raw_events: Vec<RawEvent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Contents {
    #[serde(default)]
    source: Option<SourceId>,
    #[serde(default)]
    info: SourceInfo,
    #[serde(default)]
    properties: Properties,
    #[serde(default)]
    vartypes: BTreeMap<String, VariableType>,
    #[serde(default)]
    streams: Vec<StoredStream>,
}

/// File-backed (or in-memory) offline store, persisted as one JSON document.
#[derive(Debug, Clone, Default)]
pub struct OfflineDatabase {
    path: Option<PathBuf>,
    read_only: bool,
    contents: Contents,
}

impl OfflineDatabase {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open `path`. An existing database is opened read-only; a new path
    /// gives an empty, writable database that `flush` will create.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            tracing::debug!("Opening offline database {} read-only", path.display());
            let text = std::fs::read_to_string(path)?;
            return Ok(Self {
                path: Some(path.to_path_buf()),
                read_only: true,
                contents: serde_json::from_str(&text)?,
            });
        }

        Ok(Self {
            path: Some(path.to_path_buf()),
            read_only: false,
            contents: Contents::default(),
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the database to its file; a no-op for in-memory databases.
    pub fn flush(&self) -> Result<()> {
        if self.read_only {
            return Err(AnalyticsError::usage("cannot flush a read-only offline database"));
        }
        let Some(path) = &self.path else {
            return Ok(());
        };

        let text = serde_json::to_string_pretty(&self.contents)?;
        std::fs::write(path, text)?;
        tracing::info!(
            "Saved {} streams to offline database {}",
            self.contents.streams.len(),
            path.display()
        );
        Ok(())
    }

    fn writable(&self) -> Result<()> {
        if self.read_only {
            let path = self
                .path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            return Err(AnalyticsError::usage(format!(
                "offline database {} is read-only",
                path
            )));
        }
        Ok(())
    }

    fn stream(&self, slug: &str) -> Result<&StoredStream> {
        self.contents
            .streams
            .iter()
            .find(|s| s.definition.slug == slug)
            .ok_or_else(|| AnalyticsError::not_found("stream", slug))
    }
}

impl OfflineStore for OfflineDatabase {
    fn save_source_info(&mut self, source: &SourceId, info: &SourceInfo, properties: &Properties) -> Result<()> {
        self.writable()?;
        if let Some(existing) = &self.contents.source {
            if existing != source {
                return Err(AnalyticsError::usage(format!(
                    "offline database already holds {}, cannot add {}",
                    existing, source
                )));
            }
        }

        self.contents.source = Some(source.clone());
        self.contents.info = info.clone();
        self.contents.properties = properties.clone();
        Ok(())
    }

    fn save_vartype(&mut self, vartype: &VariableType) -> Result<()> {
        self.writable()?;
        self.contents
            .vartypes
            .insert(vartype.slug.clone(), vartype.clone());
        Ok(())
    }

    fn save_stream(
        &mut self,
        definition: &StreamDescriptor,
        points: &[DataPoint],
        events: &[Event],
        raw_events: &[RawEvent],
    ) -> Result<()> {
        self.writable()?;
        if self.stream(&definition.slug).is_ok() {
            return Err(AnalyticsError::usage(format!(
                "stream {} is already saved in the offline database",
                definition.slug
            )));
        }

        let event_ids: HashSet<i64> = events.iter().map(|e| e.id).collect();
        if let Some(orphan) = raw_events.iter().find(|r| !event_ids.contains(&r.event_id)) {
            return Err(AnalyticsError::usage(format!(
                "raw event {} of stream {} has no matching event",
                orphan.event_id, definition.slug
            )));
        }

        let points = normalize_points(points.to_vec())
            .into_iter()
            .map(|p| StoredPoint {
                timestamp: p.timestamp,
                value: p.value.is_finite().then_some(p.value),
            })
            .collect();

        let mut events = events.to_vec();
        events.sort_by_key(|e| e.timestamp);
        let mut raw_events = raw_events.to_vec();
        raw_events.sort_by_key(|r| r.timestamp);

        self.contents.streams.push(StoredStream {
            definition: definition.clone(),
            points,
            events,
            raw_events,
        });
        Ok(())
    }

    fn get_stream_definition(&self, slug: &str) -> Result<StreamDescriptor> {
        Ok(self.stream(slug)?.definition.clone())
    }

    fn source(&self) -> Option<&SourceId> {
        self.contents.source.as_ref()
    }

    fn source_info(&self) -> &SourceInfo {
        &self.contents.info
    }

    fn properties(&self) -> &Properties {
        &self.contents.properties
    }

    fn vartype(&self, slug: &str) -> Option<&VariableType> {
        self.contents.vartypes.get(slug)
    }

    fn stream_definitions(&self) -> Vec<StreamDescriptor> {
        self.contents
            .streams
            .iter()
            .map(|s| s.definition.clone())
            .collect()
    }

    fn stream_points(&self, slug: &str) -> Result<Vec<DataPoint>> {
        Ok(self
            .stream(slug)?
            .points
            .iter()
            .map(|p| DataPoint::new(p.timestamp, p.value.unwrap_or(f64::NAN)))
            .collect())
    }

    fn stream_events(&self, slug: &str) -> Result<&[Event]> {
        Ok(&self.stream(slug)?.events)
    }

    fn stream_raw_events(&self, slug: &str) -> Result<&[RawEvent]> {
        Ok(&self.stream(slug)?.raw_events)
    }
}

/// Channel over an offline store, for analysis without network access.
pub struct OfflineChannel<S: OfflineStore = OfflineDatabase> {
    store: S,
}

impl<S: OfflineStore> OfflineChannel<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn check_source(&self, source: &SourceId) -> Result<()> {
        match self.store.source() {
            Some(stored) if stored == source => Ok(()),
            _ => Err(AnalyticsError::not_found("source", source.slug())),
        }
    }
}

#[async_trait]
impl<S: OfflineStore> Channel for OfflineChannel<S> {
    async fn list_streams(&self, source: &SourceId, include_hidden: bool) -> Result<Vec<StreamDescriptor>> {
        self.check_source(source)?;
        Ok(self
            .store
            .stream_definitions()
            .into_iter()
            .filter(|s| include_hidden || !s.hidden)
            .collect())
    }

    async fn count_streams(&self, source: &SourceId) -> Result<usize> {
        Ok(self.list_streams(source, false).await?.len())
    }

    async fn count_stream_data(
        &self,
        source: &SourceId,
        slugs: &[String],
    ) -> Result<BTreeMap<String, StreamCounts>> {
        self.check_source(source)?;
        slugs
            .iter()
            .map(|slug| -> Result<(String, StreamCounts)> {
                let counts = StreamCounts {
                    points: self.store.stream_points(slug)?.len() as u64,
                    events: self.store.stream_events(slug)?.len() as u64,
                };
                Ok((slug.clone(), counts))
            })
            .collect()
    }

    async fn fetch_datapoints(&self, slug: &str, window: TimeWindow) -> Result<Vec<DataPoint>> {
        Ok(self
            .store
            .stream_points(slug)?
            .into_iter()
            .filter(|p| window.contains(p.timestamp))
            .collect())
    }

    async fn fetch_events(&self, slug: &str, window: TimeWindow) -> Result<Vec<Event>> {
        Ok(self
            .store
            .stream_events(slug)?
            .iter()
            .filter(|e| window.contains(e.timestamp))
            .cloned()
            .collect())
    }

    async fn fetch_raw_events(&self, slug: &str, window: TimeWindow) -> Result<Vec<RawEvent>> {
        Ok(self
            .store
            .stream_raw_events(slug)?
            .iter()
            .filter(|r| window.contains(r.timestamp))
            .cloned()
            .collect())
    }

    async fn fetch_properties(&self, source: &SourceId) -> Result<Properties> {
        self.check_source(source)?;
        Ok(self.store.properties().clone())
    }

    async fn fetch_variable_types(&self, slugs: &[String]) -> Result<BTreeMap<String, VariableType>> {
        Ok(slugs
            .iter()
            .filter_map(|slug| self.store.vartype(slug))
            .map(|vt| (vt.slug.clone(), vt.clone()))
            .collect())
    }

    async fn fetch_source_info(&self, source: &SourceId) -> Result<SourceInfo> {
        self.check_source(source)?;
        Ok(self.store.source_info().clone())
    }
}
