// Channel trait for backend-agnostic stream data access
use crate::domain::telemetry::{
    DataPoint, Event, Properties, RawEvent, SourceId, SourceInfo, StreamCounts, StreamDescriptor,
    TimeWindow,
};
use crate::domain::vartype::VariableType;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Per-slug outcome of a bulk datapoint fetch, in request order.
pub type DatapointResults = Vec<(String, Result<Vec<DataPoint>>)>;

/// Data retrieval contract shared by the cloud, archive and offline backends.
///
/// Every call is read-only. Time-ordered results are sorted ascending. A source
/// or stream the backend does not know fails with `NotFound`; a known one
/// without data returns an empty result.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Streams of a source; hidden system streams only when `include_hidden`.
    async fn list_streams(&self, source: &SourceId, include_hidden: bool) -> Result<Vec<StreamDescriptor>>;

    async fn count_streams(&self, source: &SourceId) -> Result<usize>;

    /// Number of points and events held by each of `slugs`.
    async fn count_stream_data(
        &self,
        source: &SourceId,
        slugs: &[String],
    ) -> Result<BTreeMap<String, StreamCounts>>;

    async fn fetch_datapoints(&self, slug: &str, window: TimeWindow) -> Result<Vec<DataPoint>>;

    /// Fetch several streams, keeping each stream's failure in its own slot.
    /// Fatal errors (authentication, certificates) abort the whole call.
    async fn fetch_many_datapoints(&self, slugs: &[String], window: TimeWindow) -> Result<DatapointResults> {
        let mut results = Vec::with_capacity(slugs.len());
        for slug in slugs {
            match self.fetch_datapoints(slug, window).await {
                Err(e) if e.is_fatal() => return Err(e),
                outcome => results.push((slug.clone(), outcome)),
            }
        }
        Ok(results)
    }

    async fn fetch_events(&self, slug: &str, window: TimeWindow) -> Result<Vec<Event>>;

    async fn fetch_raw_events(&self, slug: &str, window: TimeWindow) -> Result<Vec<RawEvent>>;

    async fn fetch_properties(&self, source: &SourceId) -> Result<Properties>;

    /// Variable types by slug; unknown slugs are left out of the result.
    async fn fetch_variable_types(&self, slugs: &[String]) -> Result<BTreeMap<String, VariableType>>;

    async fn fetch_source_info(&self, source: &SourceId) -> Result<SourceInfo>;
}
