//! # Origin identifiers
//!
//! An [`OriginId`] names one remote resource. Everything persisted on disk is
//! keyed by [`OriginId::storage_key`], a SHA-256 digest of the identifier, so
//! arbitrary URLs map onto flat, filename-safe names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::CacheError;

/// Stable identifier for a remote resource, usually a normalized URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OriginId(String);

impl OriginId {
    /// Wrap an opaque identifier as-is.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse and normalize a URL.
    ///
    /// The fragment is dropped, scheme and host are lower-cased and default
    /// ports are removed, so `HTTP://Example.com:80/a#t=10` and
    /// `http://example.com/a` identify the same resource.
    pub fn from_url(raw: &str) -> Result<Self, CacheError> {
        let mut url = Url::parse(raw.trim())
            .map_err(|e| CacheError::Config(format!("Invalid origin URL {raw}: {e}")))?;
        url.set_fragment(None);
        Ok(Self(url.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The origin as a URL, if it is one.
    pub fn to_url(&self) -> Option<Url> {
        Url::parse(&self.0).ok()
    }

    /// Filename-safe key used for every on-disk artifact of this origin.
    pub fn storage_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let hash = hasher.finalize();
        format!("{hash:x}")
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OriginId {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_url(s)
    }
}

impl From<&str> for OriginId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for OriginId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_equivalent_urls() {
        let a = OriginId::from_url("HTTP://Example.com:80/video.mp4#t=10").unwrap();
        let b = OriginId::from_url("http://example.com/video.mp4").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.storage_key(), b.storage_key());
    }

    #[test]
    fn query_strings_stay_significant() {
        let a = OriginId::from_url("https://cdn.example.com/v.mp4?sig=1").unwrap();
        let b = OriginId::from_url("https://cdn.example.com/v.mp4?sig=2").unwrap();
        assert_ne!(a.storage_key(), b.storage_key());
    }

    #[test]
    fn storage_key_is_hex_sha256() {
        let key = OriginId::new("opaque-id").storage_key();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            OriginId::from_url("not a url"),
            Err(CacheError::Config(_))
        ));
    }
}
