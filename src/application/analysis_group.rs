// Analysis group: cached, backend-agnostic access to one source's streams
use crate::application::channel::Channel;
use crate::domain::stream_series::StreamSeries;
use crate::domain::telemetry::{
    DataPoint, Event, Properties, RawEvent, SourceId, SourceInfo, StreamCounts, StreamDescriptor, TimeWindow,
};
use crate::domain::vartype::VartypeRegistry;
use crate::error::{AnalyticsError, Result};
use crate::infrastructure::cloud_channel::CloudChannel;
use crate::infrastructure::offline::OfflineStore;
use crate::infrastructure::transport::Transport;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// How `fetch_streams` treats streams that fail to download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    /// Keep what succeeded and report the failures.
    #[default]
    Partial,
    /// Fail the call, caching nothing, if any stream fails.
    AllOrNothing,
}

#[derive(Debug, Default)]
pub struct FetchReport {
    pub fetched: Vec<String>,
    pub failed: Vec<(String, AnalyticsError)>,
}

impl FetchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A raw event payload after post-processing.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedEvent<R> {
    pub event_id: i64,
    pub timestamp: DateTime<Utc>,
    pub value: R,
}

struct TableEntry {
    slug: String,
    slug_lower: String,
    name_lower: String,
}

/// The streams of one project, device or archive, read through a single
/// channel. Stream series and source metadata are cached for the group's
/// lifetime; event payloads are fetched fresh on every call.
pub struct AnalysisGroup<C: Channel> {
    channel: C,
    source: SourceId,
    streams: Vec<StreamDescriptor>,
    counts: BTreeMap<String, StreamCounts>,
    vartypes: VartypeRegistry,
    table: Vec<TableEntry>,
    series: HashMap<String, StreamSeries>,
    source_info: Option<SourceInfo>,
    properties: Option<Properties>,
}

impl<C: Channel> AnalysisGroup<C> {
    /// List the source's streams, count their data and resolve the
    /// variable types they reference.
    pub async fn open(channel: C, source: SourceId, include_hidden: bool) -> Result<Self> {
        let streams = channel.list_streams(&source, include_hidden).await?;

        let mut seen = BTreeSet::new();
        if let Some(dup) = streams.iter().find(|s| !seen.insert(s.slug.as_str())) {
            return Err(AnalyticsError::usage(format!(
                "source {} lists stream {} more than once",
                source, dup.slug
            )));
        }

        let slugs: Vec<String> = streams.iter().map(|s| s.slug.clone()).collect();
        let counts = channel.count_stream_data(&source, &slugs).await?;

        let vartype_slugs: Vec<String> = streams
            .iter()
            .filter_map(|s| s.var_type.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let vartypes: VartypeRegistry = channel
            .fetch_variable_types(&vartype_slugs)
            .await?
            .into_values()
            .collect();

        let table = streams
            .iter()
            .map(|s| TableEntry {
                slug: s.slug.clone(),
                slug_lower: s.slug.to_lowercase(),
                name_lower: s.display_name().to_lowercase(),
            })
            .collect();

        tracing::info!(
            "Opened analysis group for {} with {} streams and {} variable types",
            source,
            streams.len(),
            vartypes.len()
        );

        Ok(Self {
            channel,
            source,
            streams,
            counts,
            vartypes,
            table,
            series: HashMap::new(),
            source_info: None,
            properties: None,
        })
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    pub fn variable_types(&self) -> &VartypeRegistry {
        &self.vartypes
    }

    pub fn stream_counts(&self, slug: &str) -> Option<StreamCounts> {
        self.counts.get(slug).copied()
    }

    /// A stream with neither points nor events. Streams without counts are treated as empty.
    pub fn stream_empty(&self, slug: &str) -> bool {
        self.counts.get(slug).is_none_or(|c| c.is_empty())
    }

    pub fn display_name(&self, slug: &str) -> Option<String> {
        self.descriptor(slug).map(|s| s.display_name())
    }

    fn descriptor(&self, slug: &str) -> Option<&StreamDescriptor> {
        self.streams.iter().find(|s| s.slug == slug)
    }

    /// Resolve a slug, name or unique fragment of either (case-insensitive).
    ///
    /// An exact slug or name always matches. Fragments only match streams
    /// holding data unless `include_empty` is set.
    pub fn find_stream(&self, partial: &str, include_empty: bool) -> Result<&str> {
        let needle = partial.trim().to_lowercase();
        if needle.is_empty() {
            return Err(AnalyticsError::usage("a stream slug or name is required"));
        }

        let exact: Vec<&TableEntry> = self
            .table
            .iter()
            .filter(|e| e.slug_lower == needle || e.name_lower == needle)
            .collect();
        if let [entry] = exact.as_slice() {
            return Ok(&entry.slug);
        }

        let found: Vec<&TableEntry> = self
            .table
            .iter()
            .filter(|e| e.slug_lower.contains(&needle) || e.name_lower.contains(&needle))
            .filter(|e| include_empty || !self.stream_empty(&e.slug))
            .collect();

        match found.as_slice() {
            [] => Err(AnalyticsError::not_found("stream", partial)),
            [entry] => Ok(&entry.slug),
            many => Err(AnalyticsError::usage(format!(
                "'{}' matches {} streams: {}",
                partial,
                many.len(),
                many.iter().map(|e| e.slug.as_str()).collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    fn build_series(&self, slug: &str, points: Vec<DataPoint>) -> Result<StreamSeries> {
        let stream = self
            .descriptor(slug)
            .ok_or_else(|| AnalyticsError::not_found("stream", slug))?;
        let vartype = self.vartypes.resolve(stream).cloned();
        if stream.var_type.is_some() && vartype.is_none() {
            tracing::warn!("Stream {} references an unknown variable type", slug);
        }
        Ok(StreamSeries::for_stream(points, stream.clone(), vartype))
    }

    /// Fetch a stream's full history, or return it from the cache.
    pub async fn fetch_stream(&mut self, name: &str) -> Result<&StreamSeries> {
        let slug = self.find_stream(name, false)?.to_string();

        if !self.series.contains_key(&slug) {
            let points = self.channel.fetch_datapoints(&slug, TimeWindow::all()).await?;
            let series = self.build_series(&slug, points)?;
            self.series.insert(slug.clone(), series);
        } else {
            tracing::debug!("Using cached series for {}", slug);
        }

        self.series
            .get(&slug)
            .ok_or_else(|| AnalyticsError::not_found("stream", slug))
    }

    /// Fetch part of a stream's history. Windowed results are not cached.
    pub async fn fetch_stream_window(&self, name: &str, window: TimeWindow) -> Result<StreamSeries> {
        let slug = self.find_stream(name, false)?;
        let points = self.channel.fetch_datapoints(slug, window).await?;
        self.build_series(slug, points)
    }

    /// Fetch several streams at once, downloading only those not yet cached.
    pub async fn fetch_streams(&mut self, names: &[&str], mode: FetchMode) -> Result<FetchReport> {
        let slugs = names
            .iter()
            .map(|name| self.find_stream(name, false).map(str::to_string))
            .collect::<Result<Vec<_>>>()?;

        let mut report = FetchReport::default();
        let mut missing = Vec::new();
        for slug in slugs {
            if self.series.contains_key(&slug) {
                report.fetched.push(slug);
            } else if !missing.contains(&slug) {
                missing.push(slug);
            }
        }

        let mut downloaded = Vec::new();
        for (slug, outcome) in self.channel.fetch_many_datapoints(&missing, TimeWindow::all()).await? {
            match outcome {
                Ok(points) => downloaded.push((slug, points)),
                Err(e) if mode == FetchMode::AllOrNothing => {
                    tracing::warn!("Aborting fetch of {} streams: {} failed", missing.len(), slug);
                    return Err(e);
                }
                Err(e) => report.failed.push((slug, e)),
            }
        }

        for (slug, points) in downloaded {
            let series = self.build_series(&slug, points)?;
            self.series.insert(slug.clone(), series);
            report.fetched.push(slug);
        }

        if !report.is_complete() {
            tracing::warn!(
                "Fetched {} streams, {} failed",
                report.fetched.len(),
                report.failed.len()
            );
        }
        Ok(report)
    }

    pub async fn fetch_events(&self, name: &str) -> Result<Vec<Event>> {
        let slug = self.find_stream(name, false)?;
        self.channel.fetch_events(slug, TimeWindow::all()).await
    }

    pub async fn fetch_raw_events(&self, name: &str) -> Result<Vec<RawEvent>> {
        let slug = self.find_stream(name, false)?;
        self.channel.fetch_raw_events(slug, TimeWindow::all()).await
    }

    /// Raw event payloads, optionally narrowed to one top-level `subkey`,
    /// each passed through `postprocess`.
    pub async fn fetch_raw_events_with<R, F>(
        &self,
        name: &str,
        subkey: Option<&str>,
        postprocess: F,
    ) -> Result<Vec<ProcessedEvent<R>>>
    where
        F: Fn(&Value) -> R,
    {
        let slug = self.find_stream(name, false)?;
        self.channel
            .fetch_raw_events(slug, TimeWindow::all())
            .await?
            .into_iter()
            .map(|raw| {
                let payload = match subkey {
                    Some(key) => raw.payload.get(key).ok_or_else(|| {
                        AnalyticsError::usage(format!("raw event {} has no key '{}'", raw.event_id, key))
                    })?,
                    None => &raw.payload,
                };
                Ok(ProcessedEvent {
                    event_id: raw.event_id,
                    timestamp: raw.timestamp,
                    value: postprocess(payload),
                })
            })
            .collect()
    }

    pub async fn source_info(&mut self) -> Result<&SourceInfo> {
        if self.source_info.is_none() {
            self.source_info = Some(self.channel.fetch_source_info(&self.source).await?);
        }
        self.source_info
            .as_ref()
            .ok_or_else(|| AnalyticsError::not_found("source", self.source.slug()))
    }

    pub async fn properties(&mut self) -> Result<&Properties> {
        if self.properties.is_none() {
            self.properties = Some(self.channel.fetch_properties(&self.source).await?);
        }
        self.properties
            .as_ref()
            .ok_or_else(|| AnalyticsError::not_found("source", self.source.slug()))
    }

    /// Write the source record, variable types and every stream (with its
    /// points, events and raw events) into `store`.
    ///
    /// Everything is downloaded before the first write, so a failed fetch
    /// leaves `store` untouched and the save can be retried.
    pub async fn save<S: OfflineStore>(&mut self, store: &mut S) -> Result<()> {
        if let Some(stream) = self
            .streams
            .iter()
            .find(|s| store.get_stream_definition(&s.slug).is_ok())
        {
            return Err(AnalyticsError::usage(format!(
                "stream {} is already saved in the offline store",
                stream.slug
            )));
        }

        let info = self.source_info().await?.clone();
        let properties = self.properties().await?.clone();

        let to_download: Vec<String> = self
            .streams
            .iter()
            .filter(|s| !self.series.contains_key(&s.slug))
            .filter(|s| self.counts.get(&s.slug).is_some_and(|c| c.points > 0))
            .map(|s| s.slug.clone())
            .collect();

        let mut downloaded = HashMap::new();
        for (slug, outcome) in self.channel.fetch_many_datapoints(&to_download, TimeWindow::all()).await? {
            downloaded.insert(slug, outcome?);
        }

        let mut staged = Vec::with_capacity(self.streams.len());
        for stream in &self.streams {
            let points = match (self.series.get(&stream.slug), downloaded.remove(&stream.slug)) {
                (Some(series), _) => series.raw_points().to_vec(),
                (None, Some(points)) => points,
                (None, None) => Vec::new(),
            };

            let has_events = self.counts.get(&stream.slug).is_some_and(|c| c.events > 0);
            let (events, raw_events) = if has_events {
                let events = self.channel.fetch_events(&stream.slug, TimeWindow::all()).await?;
                let raw_events = if events.iter().any(|e| e.has_raw_data) {
                    self.channel.fetch_raw_events(&stream.slug, TimeWindow::all()).await?
                } else {
                    Vec::new()
                };
                (events, raw_events)
            } else {
                (Vec::new(), Vec::new())
            };

            staged.push((stream, points, events, raw_events));
        }

        store.save_source_info(&self.source, &info, &properties)?;
        for vartype in self.vartypes.iter() {
            store.save_vartype(vartype)?;
        }
        for (stream, points, events, raw_events) in &staged {
            store.save_stream(stream, points, events, raw_events)?;
        }

        tracing::info!("Saved {} streams of {}", staged.len(), self.source);
        Ok(())
    }
}

impl<T: Transport> AnalysisGroup<CloudChannel<T>> {
    /// Open the group of the single device carrying `external_id`.
    pub async fn from_external_id(channel: CloudChannel<T>, external_id: &str, include_hidden: bool) -> Result<Self> {
        let device = channel.find_device(external_id).await?;
        Self::open(channel, device, include_hidden).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CloudErrorKind;
    use crate::infrastructure::cloud_channel::tests::{DEVICE, PUMP, SYSTEM, TEMP, channel, device_cloud};
    use crate::infrastructure::offline::{OfflineChannel, OfflineDatabase};
    use crate::infrastructure::transport::ApiRequest;
    use crate::infrastructure::transport::tests::FakeTransport;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    async fn cloud_group(transport: FakeTransport) -> AnalysisGroup<CloudChannel<FakeTransport>> {
        AnalysisGroup::open(channel(transport), SourceId::parse(DEVICE).unwrap(), false)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_and_find_stream() {
        let group = cloud_group(device_cloud()).await;

        assert_eq!(group.streams().len(), 2);
        assert_eq!(group.variable_types().len(), 1);
        assert!(group.stream_empty(PUMP));
        assert!(!group.stream_empty(TEMP));
        assert_eq!(group.display_name(PUMP).as_deref(), Some("IO 2 (from variable)"));

        assert_eq!(group.find_stream("temp", false).unwrap(), TEMP);
        assert_eq!(group.find_stream("5001", false).unwrap(), TEMP);
        assert_eq!(group.find_stream("WATER TEMP", false).unwrap(), TEMP);

        // Empty streams are found by exact slug, or by fragment when asked.
        assert_eq!(group.find_stream(PUMP, false).unwrap(), PUMP);
        assert!(matches!(
            group.find_stream("io 2", false),
            Err(AnalyticsError::NotFound { .. })
        ));
        assert_eq!(group.find_stream("io 2", true).unwrap(), PUMP);

        assert!(matches!(
            group.find_stream("s--0000", true),
            Err(AnalyticsError::Usage(_))
        ));
        assert!(group.find_stream(SYSTEM, true).is_err());
    }

    #[tokio::test]
    async fn test_find_stream_requires_a_name() {
        let group = cloud_group(device_cloud()).await;
        assert!(matches!(group.find_stream("", true), Err(AnalyticsError::Usage(_))));
        assert!(matches!(group.find_stream("   ", false), Err(AnalyticsError::Usage(_))));
    }

    #[tokio::test]
    async fn test_open_from_external_id() {
        let transport = device_cloud().respond(
            &ApiRequest::new("device/")
                .param("external_id", "tank-3")
                .param("page_size", 100)
                .key(),
            json!({ "count": 1, "results": [{ "slug": DEVICE }] }),
        );

        let group = AnalysisGroup::from_external_id(channel(transport), "tank-3", false)
            .await
            .unwrap();
        assert_eq!(group.source(), &SourceId::parse(DEVICE).unwrap());
        assert_eq!(group.streams().len(), 2);
    }

    #[tokio::test]
    async fn test_raw_events_with_subkey_and_postprocess() {
        let group = cloud_group(device_cloud()).await;

        let sums = group
            .fetch_raw_events_with("temp", Some("samples"), |samples| {
                samples
                    .as_array()
                    .map(|values| values.iter().filter_map(|v| v.as_f64()).sum::<f64>())
                    .unwrap_or(0.0)
            })
            .await
            .unwrap();
        assert_eq!(sums.len(), 1);
        assert_eq!(sums[0].event_id, 11);
        assert_eq!(sums[0].value, 6.0);

        let whole = group
            .fetch_raw_events_with("temp", None, |payload| payload.is_object())
            .await
            .unwrap();
        assert!(whole[0].value);

        assert!(matches!(
            group.fetch_raw_events_with("temp", Some("missing"), |v| v.clone()).await,
            Err(AnalyticsError::Usage(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_save_leaves_store_untouched() {
        let transport = device_cloud().failing(|key, attempt| {
            (key == "event/11/data/" && attempt == 1).then(|| AnalyticsError::Cloud {
                kind: CloudErrorKind::Client(400),
                message: "bad request".to_string(),
            })
        });
        let mut group = cloud_group(transport).await;
        let mut db = OfflineDatabase::in_memory();

        assert!(group.save(&mut db).await.is_err());
        assert!(db.source().is_none());
        assert!(db.stream_definitions().is_empty());

        group.save(&mut db).await.unwrap();
        assert_eq!(db.stream_definitions().len(), 2);
        assert_eq!(db.stream_raw_events(TEMP).unwrap().len(), 1);

        // A second save into the same store is refused before any write.
        assert!(matches!(group.save(&mut db).await, Err(AnalyticsError::Usage(_))));
        assert_eq!(db.stream_definitions().len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_stream_is_cached_and_converted() {
        let mut group = cloud_group(device_cloud()).await;

        let series = group.fetch_stream("temp").await.unwrap();
        assert_eq!(series.unit().label(), "Celsius");
        assert_eq!(series.points()[0].value, 21.5);

        let calls = group.channel().session().transport().calls.load(Ordering::SeqCst);
        let again = group.fetch_stream(TEMP).await.unwrap();
        assert_eq!(again.len(), 3);
        assert_eq!(group.channel().session().transport().calls.load(Ordering::SeqCst), calls);
    }

    fn flaky_pump() -> FakeTransport {
        device_cloud().failing(|key, _| {
            (key.starts_with("data/?filter=") && key.contains("--5002")).then(|| AnalyticsError::Cloud {
                kind: CloudErrorKind::Transient {
                    status: Some(503),
                    retry_after: None,
                },
                message: "unavailable".to_string(),
            })
        })
    }

    #[tokio::test]
    async fn test_fetch_streams_partial() {
        let mut group = cloud_group(flaky_pump()).await;

        let report = group.fetch_streams(&[TEMP, PUMP], FetchMode::Partial).await.unwrap();
        assert_eq!(report.fetched, vec![TEMP.to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, PUMP);
        assert!(matches!(report.failed[0].1, AnalyticsError::RetriesExhausted { .. }));
        assert!(!report.is_complete());

        // The successful stream stays cached.
        let calls = group.channel().session().transport().calls.load(Ordering::SeqCst);
        group.fetch_stream(TEMP).await.unwrap();
        assert_eq!(group.channel().session().transport().calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_fetch_streams_all_or_nothing() {
        let mut group = cloud_group(flaky_pump()).await;

        let outcome = group.fetch_streams(&[TEMP, PUMP], FetchMode::AllOrNothing).await;
        assert!(outcome.is_err());

        let calls = group.channel().session().transport().calls.load(Ordering::SeqCst);
        group.fetch_stream(TEMP).await.unwrap();
        assert!(group.channel().session().transport().calls.load(Ordering::SeqCst) > calls);
    }

    #[tokio::test]
    async fn test_source_metadata_is_cached() {
        let mut group = cloud_group(device_cloud()).await;

        let label = group.source_info().await.unwrap()["label"].clone();
        let calls = group.channel().session().transport().calls.load(Ordering::SeqCst);
        assert_eq!(group.source_info().await.unwrap()["label"], label);
        group.properties().await.unwrap();
        group.properties().await.unwrap();
        assert_eq!(group.channel().session().transport().calls.load(Ordering::SeqCst), calls + 1);
    }

    #[tokio::test]
    async fn test_saved_group_matches_cloud_group() {
        let mut cloud = cloud_group(device_cloud()).await;
        let mut db = OfflineDatabase::in_memory();
        cloud.save(&mut db).await.unwrap();

        let mut offline = AnalysisGroup::open(OfflineChannel::new(db), SourceId::parse(DEVICE).unwrap(), false)
            .await
            .unwrap();

        assert_eq!(offline.streams(), cloud.streams());
        for stream in cloud.streams() {
            assert_eq!(offline.stream_counts(&stream.slug), cloud.stream_counts(&stream.slug));
        }

        let cloud_points = cloud.fetch_stream("temp").await.unwrap().points().to_vec();
        let offline_points = offline.fetch_stream("temp").await.unwrap().points().to_vec();
        assert_eq!(cloud_points, offline_points);

        assert_eq!(
            offline.fetch_events("temp").await.unwrap(),
            cloud.fetch_events("temp").await.unwrap()
        );
        assert_eq!(
            offline.fetch_raw_events("temp").await.unwrap(),
            cloud.fetch_raw_events("temp").await.unwrap()
        );
        assert_eq!(
            offline.source_info().await.unwrap(),
            cloud.source_info().await.unwrap()
        );
        assert_eq!(
            offline.properties().await.unwrap(),
            cloud.properties().await.unwrap()
        );
    }
}
