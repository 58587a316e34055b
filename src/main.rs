// Main entry point - Configuration and channel wiring
use anyhow::Context;
use stream_analytics::AnalysisGroup;
use stream_analytics::infrastructure::archive_channel::ArchiveChannel;
use stream_analytics::infrastructure::cloud_channel::CloudChannel;
use stream_analytics::infrastructure::config::load_config;
use stream_analytics::domain::telemetry::{SourceId, SourceKind};
use stream_analytics::Channel;
use tracing_subscriber::EnvFilter;

async fn summarize<C: Channel>(channel: C, source: SourceId) -> anyhow::Result<()> {
    let mut group = AnalysisGroup::open(channel, source, false)
        .await
        .context("Failed to open analysis group")?;

    for stream in group.streams() {
        let counts = group.stream_counts(&stream.slug).unwrap_or_default();
        tracing::info!(
            "{} {:?}: {} points, {} events",
            stream.slug,
            stream.display_name(),
            counts.points,
            counts.events
        );
    }

    let info = group.source_info().await.context("Failed to fetch source info")?;
    tracing::info!("Source record has {} fields", info.len());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;
    let Some(source) = config.cloud.source_id()? else {
        anyhow::bail!("No source configured; set cloud.source or ANALYTICS__CLOUD__SOURCE");
    };

    let cloud = CloudChannel::connect(&config).context("Failed to connect to the cloud")?;
    tracing::info!("Reading {} from {}", source, config.cloud.domain);

    match source.kind() {
        SourceKind::Archive => summarize(ArchiveChannel::new(cloud), source).await,
        _ => summarize(cloud, source).await,
    }
}
