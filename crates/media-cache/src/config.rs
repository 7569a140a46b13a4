use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Top-level configuration for both caches and the HTTP collaborators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaCacheConfig {
    pub range: RangeCacheConfig,
    pub preload: PreloadConfig,
    pub http: HttpConfig,
}

impl MediaCacheConfig {
    /// Place both caches under a single directory.
    pub fn with_root(mut self, root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        self.range.root = root.join("ranges");
        self.preload.root = root.join("assets");
        self
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        self.range.validate()?;
        self.preload.validate()?;
        Ok(())
    }
}

// --- Range cache configuration ---
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeCacheConfig {
    /// Directory holding `meta/` and `data/`
    pub root: PathBuf,
    /// Budget for all cached bytes
    pub max_size_bytes: u64,
    /// Bytes written between two eviction passes while a transfer is running
    pub eviction_check_bytes: u64,
    /// How often coalesced access-time updates are flushed to disk
    #[serde(with = "duration_millis")]
    pub access_flush_interval: Duration,
}

impl Default for RangeCacheConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("media-cache").join("ranges"),
            max_size_bytes: 512 * 1024 * 1024,      // 512MB
            eviction_check_bytes: 8 * 1024 * 1024,  // 8MB
            access_flush_interval: Duration::from_secs(5),
        }
    }
}

impl RangeCacheConfig {
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_max_size(mut self, bytes: u64) -> Self {
        self.max_size_bytes = bytes;
        self
    }

    pub fn with_eviction_check_bytes(mut self, bytes: u64) -> Self {
        self.eviction_check_bytes = bytes;
        self
    }

    pub fn with_access_flush_interval(mut self, interval: Duration) -> Self {
        self.access_flush_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.max_size_bytes == 0 {
            return Err(CacheError::Config(
                "range cache size budget must be greater than zero".into(),
            ));
        }
        if self.access_flush_interval.is_zero() {
            return Err(CacheError::Config(
                "access flush interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

// --- Whole-asset preload configuration ---
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadConfig {
    /// Directory holding `packages/`, `partial/` and `locations.json`
    pub root: PathBuf,
    /// Budget for all verified packages
    pub max_size_bytes: u64,
    /// Max simultaneous asset downloads
    pub max_concurrent: usize,
    /// Max simultaneous segment downloads inside one asset
    pub segment_concurrency: usize,
    /// Bandwidth hint used to pick a variant from a master playlist.
    /// `None` picks the highest bitrate.
    pub preferred_bitrate: Option<u64>,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("media-cache").join("assets"),
            max_size_bytes: 1024 * 1024 * 1024, // 1GB
            max_concurrent: 2,
            segment_concurrency: 4,
            preferred_bitrate: None,
        }
    }
}

impl PreloadConfig {
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_max_size(mut self, bytes: u64) -> Self {
        self.max_size_bytes = bytes;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_preferred_bitrate(mut self, bitrate: Option<u64>) -> Self {
        self.preferred_bitrate = bitrate;
        self
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.max_size_bytes == 0 {
            return Err(CacheError::Config(
                "preload size budget must be greater than zero".into(),
            ));
        }
        if self.max_concurrent == 0 || self.segment_concurrency == 0 {
            return Err(CacheError::Config(
                "preload concurrency must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

// --- HTTP configuration ---
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    /// Time to establish a connection
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
    /// Max silence between two body chunks
    #[serde(with = "duration_millis")]
    pub read_timeout: Duration,
    /// Overall timeout for small requests (playlists, segments, keys)
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    pub follow_redirects: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            follow_redirects: true,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        MediaCacheConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_budgets() {
        let config = RangeCacheConfig::default().with_max_size(0);
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));

        let config = PreloadConfig::default().with_max_concurrent(0);
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: MediaCacheConfig = serde_json::from_str(
            r#"{ "range": { "max_size_bytes": 1024, "access_flush_interval": 250 },
                 "preload": { "max_concurrent": 3 } }"#,
        )
        .unwrap();
        assert_eq!(config.range.max_size_bytes, 1024);
        assert_eq!(config.range.access_flush_interval, Duration::from_millis(250));
        assert_eq!(config.preload.max_concurrent, 3);
        assert_eq!(config.preload.segment_concurrency, 4);
        assert!(config.http.follow_redirects);
    }

    #[test]
    fn shared_root() {
        let config = MediaCacheConfig::default().with_root("/var/cache/player");
        assert_eq!(config.range.root, PathBuf::from("/var/cache/player/ranges"));
        assert_eq!(config.preload.root, PathBuf::from("/var/cache/player/assets"));
    }
}
