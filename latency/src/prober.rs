//! Default [`RegionProber`] implementation: opens a websocket to the
//! region's URL and measures time-to-connect, then closes it (spec.md
//! §4.4 `onConnected`: "probe it (open a websocket to the region's URL and
//! measure time-to-connect, then close; single-flight per region)").

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::trace;

use crate::ids::Region;
use crate::service::RegionProber;

/// Resolves a region to the URL to probe. Implemented by the embedder on
/// top of the domain client (C1, `streaming-core::domain`), which this
/// crate cannot depend on directly without creating a cycle.
#[async_trait]
pub trait RegionUrlResolver: Send + Sync + 'static {
    async fn resolve(&self, region: &Region) -> anyhow::Result<url::Url>;
}

pub struct WebsocketRegionProber<R: RegionUrlResolver> {
    resolver: R,
}

impl<R: RegionUrlResolver> WebsocketRegionProber<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl<R: RegionUrlResolver> RegionProber for WebsocketRegionProber<R> {
    async fn probe(&self, region: &Region) -> anyhow::Result<Duration> {
        let url = self.resolver.resolve(region).await?;

        let started = Instant::now();
        let (socket, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let elapsed = started.elapsed();

        drop(socket);
        trace!(%region, ?elapsed, "latency probe connected");

        Ok(elapsed)
    }
}
