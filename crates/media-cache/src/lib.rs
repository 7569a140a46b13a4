//! # Media Cache
//!
//! Disk caches for streamed media playback.
//!
//! ## Features
//!
//! - Progressive byte-range cache: arbitrary intervals of a remote resource
//!   are stored as they stream in and served from disk afterwards
//! - One upstream transfer per resource, shared by all overlapping requests
//! - Resumable across restarts through per-resource metadata records
//! - Whole-asset HLS preloading with verification before publication
//! - Independent LRU size budgets for both caches

pub mod config;
pub mod engine;
pub mod error;
pub mod eviction;
pub mod origin;
pub mod preload;
pub mod range;
pub mod transport;

#[cfg(test)]
mod test_utils;

pub use config::{HttpConfig, MediaCacheConfig, PreloadConfig, RangeCacheConfig};
pub use engine::MediaCache;
pub use error::{CacheError, Result};
pub use origin::OriginId;
pub use preload::{
    AssetFetcher, AssetLocation, AssetPreloadManager, AssetVerifier, PreloadEvent, PreloadState,
    PreloadStats,
};
pub use range::{
    CacheStats, ContentInfo, PendingRequest, PreloadOutcome, RangeCacheManager, RequestEvent,
    RequestId,
};
pub use transport::{ByteRangeRequest, HttpTransport, Transport, TransportEvent};
