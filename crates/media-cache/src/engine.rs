//! Facade that wires both caches to one HTTP client configuration.

use std::sync::Arc;

use tracing::info;

use crate::config::MediaCacheConfig;
use crate::error::Result;
use crate::preload::AssetPreloadManager;
use crate::range::RangeCacheManager;
use crate::transport::{HttpTransport, Transport};

/// The range cache and the asset preloader, built from one
/// [`MediaCacheConfig`].
#[derive(Clone)]
pub struct MediaCache {
    range: RangeCacheManager,
    preload: AssetPreloadManager,
}

impl MediaCache {
    /// Build both caches on top of HTTP.
    pub async fn new(config: MediaCacheConfig) -> Result<Self> {
        config.validate()?;
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config.http)?);
        let range = RangeCacheManager::new(config.range.clone(), transport).await?;
        let preload = AssetPreloadManager::with_hls(config.preload.clone(), &config.http).await?;
        info!(range_root = ?config.range.root, preload_root = ?config.preload.root, "Media cache ready");
        Ok(Self { range, preload })
    }

    /// Assemble from managers created elsewhere, e.g. with custom transports.
    pub fn from_parts(range: RangeCacheManager, preload: AssetPreloadManager) -> Self {
        Self { range, preload }
    }

    pub fn range(&self) -> &RangeCacheManager {
        &self.range
    }

    pub fn preload(&self) -> &AssetPreloadManager {
        &self.preload
    }

    /// Wipe both caches.
    pub async fn clear_all(&self) -> Result<()> {
        self.range.clear_all().await?;
        self.preload.clear_all().await
    }

    pub async fn shutdown(&self) {
        self.preload.shutdown();
        self.range.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpConfig;
    use crate::origin::OriginId;
    use crate::test_utils::{MemoryTransport, init_tracing, sample};

    #[tokio::test]
    async fn facade_routes_to_both_caches() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let config = MediaCacheConfig::default().with_root(dir.path());
        let origin = OriginId::new("https://cdn.example.com/clip.mp4");

        let transport = MemoryTransport::new(1024).with_resource(&origin, sample(4096));
        let range = RangeCacheManager::new(config.range.clone(), Arc::new(transport))
            .await
            .unwrap();
        let preload = AssetPreloadManager::with_hls(config.preload.clone(), &HttpConfig::default())
            .await
            .unwrap();
        let cache = MediaCache::from_parts(range, preload);

        let bytes = cache.range().request(&origin, 100, 200).collect().await.unwrap();
        assert_eq!(&bytes[..], &sample(4096)[100..300]);
        assert!(!cache.preload().is_cached(&origin));

        cache.clear_all().await.unwrap();
        assert_eq!(cache.range().stats().await.unwrap().entries, 0);
        cache.shutdown().await;
    }
}
