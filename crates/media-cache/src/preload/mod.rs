//! # Whole-Asset Preloading
//!
//! Downloads complete segmented assets (HLS packages) ahead of playback,
//! verifies that what landed on disk is playable, and keeps the verified
//! packages under their own size budget.
//!
//! ```text
//! <root>/
//! ├── partial/<key>-<epoch>/    # downloads in progress
//! ├── packages/<storage-key>/   # verified, playable packages
//! └── locations.json            # origin -> package
//! ```
//!
//! Each origin moves through `Queued -> Active -> {Verified | Rejected}`.
//! A package only appears under `packages/` after verification passed, so a
//! location handed to a consumer always points at a complete asset.

mod fetcher;
mod hls;
mod manager;
mod store;
mod verify;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::origin::OriginId;

pub use fetcher::{AssetFetcher, AssetVerifier};
pub use hls::HlsPackageFetcher;
pub use manager::{AssetPreloadManager, PreloadStats};
pub use store::LocationStore;
pub use verify::PlaylistVerifier;

/// Name of the rewritten playlist inside every HLS package.
pub const PACKAGE_ENTRY: &str = "index.m3u8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PreloadState {
    Queued,
    Active,
    Verified,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadEntry {
    pub origin: OriginId,
    /// Order of acceptance; lower values were enqueued first.
    pub position: u64,
    pub state: PreloadState,
}

/// Where a verified package lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetLocation {
    /// Package directory.
    pub package: PathBuf,
    /// Playable entry point inside the package.
    pub entry: PathBuf,
    pub size_bytes: u64,
    /// Milliseconds since the UNIX epoch.
    pub verified_at: u64,
}

/// Lifecycle notifications published by the preload manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreloadEvent {
    Queued(OriginId),
    Started(OriginId),
    Verified {
        origin: OriginId,
        location: PathBuf,
        size_bytes: u64,
    },
    Rejected {
        origin: OriginId,
        reason: String,
    },
    Cancelled(OriginId),
    Evicted(OriginId),
}

impl PreloadEvent {
    pub fn origin(&self) -> &OriginId {
        match self {
            PreloadEvent::Queued(origin)
            | PreloadEvent::Started(origin)
            | PreloadEvent::Cancelled(origin)
            | PreloadEvent::Evicted(origin) => origin,
            PreloadEvent::Verified { origin, .. } | PreloadEvent::Rejected { origin, .. } => origin,
        }
    }
}
