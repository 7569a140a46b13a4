use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::origin::OriginId;

/// Downloads a complete asset into a directory.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    /// Download `origin` into `dest` and return the entry point's file name
    /// relative to `dest`. Must return [`CacheError::Cancelled`] promptly once
    /// `cancel` fires.
    ///
    /// [`CacheError::Cancelled`]: crate::CacheError::Cancelled
    async fn fetch(
        &self,
        origin: &OriginId,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<String>;
}

/// Decides whether a downloaded package is complete and playable.
#[async_trait]
pub trait AssetVerifier: Send + Sync {
    async fn verify(&self, package: &Path, entry: &str) -> Result<()>;
}
