// Archive channel: cloud access restricted to archived data blocks
use crate::application::channel::{Channel, DatapointResults};
use crate::domain::telemetry::{
    DataPoint, Event, Properties, RawEvent, SourceId, SourceInfo, SourceKind, StreamCounts,
    StreamDescriptor, TimeWindow,
};
use crate::domain::vartype::VariableType;
use crate::error::{AnalyticsError, Result};
use crate::infrastructure::cloud_channel::CloudChannel;
use crate::infrastructure::transport::{HttpTransport, Transport};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Serves archives (`b--` sources) from the cloud. Archived streams are
/// frozen, so every listing includes streams detached from their device.
pub struct ArchiveChannel<T: Transport = HttpTransport> {
    cloud: CloudChannel<T>,
}

impl<T: Transport> ArchiveChannel<T> {
    pub fn new(cloud: CloudChannel<T>) -> Self {
        Self { cloud }
    }

    pub fn cloud(&self) -> &CloudChannel<T> {
        &self.cloud
    }

    fn check(source: &SourceId) -> Result<()> {
        if source.kind() != SourceKind::Archive {
            return Err(AnalyticsError::usage(format!(
                "archive channel cannot serve {} (expected a b-- archive slug)",
                source
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Transport> Channel for ArchiveChannel<T> {
    async fn list_streams(&self, source: &SourceId, include_hidden: bool) -> Result<Vec<StreamDescriptor>> {
        Self::check(source)?;
        self.cloud.list_streams(source, include_hidden).await
    }

    async fn count_streams(&self, source: &SourceId) -> Result<usize> {
        Self::check(source)?;
        self.cloud.count_streams(source).await
    }

    async fn count_stream_data(
        &self,
        source: &SourceId,
        slugs: &[String],
    ) -> Result<BTreeMap<String, StreamCounts>> {
        Self::check(source)?;
        self.cloud.count_stream_data(source, slugs).await
    }

    async fn fetch_datapoints(&self, slug: &str, window: TimeWindow) -> Result<Vec<DataPoint>> {
        self.cloud.fetch_datapoints(slug, window).await
    }

    async fn fetch_many_datapoints(&self, slugs: &[String], window: TimeWindow) -> Result<DatapointResults> {
        self.cloud.fetch_many_datapoints(slugs, window).await
    }

    async fn fetch_events(&self, slug: &str, window: TimeWindow) -> Result<Vec<Event>> {
        self.cloud.fetch_events(slug, window).await
    }

    async fn fetch_raw_events(&self, slug: &str, window: TimeWindow) -> Result<Vec<RawEvent>> {
        self.cloud.fetch_raw_events(slug, window).await
    }

    async fn fetch_properties(&self, source: &SourceId) -> Result<Properties> {
        Self::check(source)?;
        self.cloud.fetch_properties(source).await
    }

    async fn fetch_variable_types(&self, slugs: &[String]) -> Result<BTreeMap<String, VariableType>> {
        self.cloud.fetch_variable_types(slugs).await
    }

    async fn fetch_source_info(&self, source: &SourceId) -> Result<SourceInfo> {
        Self::check(source)?;
        self.cloud.fetch_source_info(source).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::cloud_channel::tests::{DEVICE, channel};
    use crate::infrastructure::transport::tests::FakeTransport;
    use serde_json::json;

    const ARCHIVE: &str = "b--0001-0000-0000-04e7";

    #[tokio::test]
    async fn test_lists_every_archived_stream() {
        let transport = FakeTransport::new().respond(
            &format!("stream/?block={}&all=1&page_size=100", ARCHIVE),
            json!({ "count": 1, "results": [{ "slug": "s--0001-04e7--0000-0000-0000-0000--5001" }] }),
        );
        let archive = ArchiveChannel::new(channel(transport));

        let streams = archive
            .list_streams(&SourceId::parse(ARCHIVE).unwrap(), false)
            .await
            .unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].display_name(), "Unnamed");
    }

    #[tokio::test]
    async fn test_rejects_non_archive_sources() {
        let archive = ArchiveChannel::new(channel(FakeTransport::new()));
        let device = SourceId::parse(DEVICE).unwrap();

        assert!(matches!(
            archive.list_streams(&device, false).await,
            Err(AnalyticsError::Usage(_))
        ));
        assert!(matches!(
            archive.fetch_source_info(&device).await,
            Err(AnalyticsError::Usage(_))
        ));
        assert_eq!(archive.cloud().session().transport().calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
