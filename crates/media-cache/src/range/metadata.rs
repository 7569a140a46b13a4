//! Per-resource record persisted next to the cached bytes.

use serde::{Deserialize, Serialize};

use crate::origin::OriginId;
use crate::range::range_set::{ByteRange, RangeSet};
use crate::range::request::ContentInfo;

/// Milliseconds since the UNIX epoch.
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Persisted description of one partially or fully cached resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub origin: OriginId,
    /// Total length in bytes, 0 while unknown.
    pub total_length: u64,
    pub content_type: String,
    #[serde(default)]
    pub accepts_ranges: bool,
    downloaded_ranges: RangeSet,
    /// Data file name inside the store's data directory.
    pub local_file: String,
    /// Last time the entry served a request, in UNIX milliseconds.
    pub last_access: u64,
}

impl ResourceMetadata {
    pub fn new(origin: OriginId) -> Self {
        let local_file = format!("{}.bin", origin.storage_key());
        Self {
            origin,
            total_length: 0,
            content_type: String::new(),
            accepts_ranges: false,
            downloaded_ranges: RangeSet::new(),
            local_file,
            last_access: unix_millis(),
        }
    }

    pub fn downloaded_ranges(&self) -> &RangeSet {
        &self.downloaded_ranges
    }

    /// Record that `range` is now present in the data file.
    pub fn record_range(&mut self, range: ByteRange) {
        self.downloaded_ranges.merge(range);
    }

    pub fn covered_bytes(&self) -> u64 {
        self.downloaded_ranges.total_covered()
    }

    pub fn is_complete(&self) -> bool {
        self.total_length > 0 && self.covered_bytes() >= self.total_length
    }

    pub fn length_known(&self) -> bool {
        self.total_length > 0
    }

    /// Clamp a request to the known resource length.
    ///
    /// Returns `None` when the request starts at or beyond the end of a
    /// resource whose length is known.
    pub fn clamp(&self, offset: u64, length: u64) -> Option<ByteRange> {
        let range = ByteRange::from_offset(offset, length);
        if !self.length_known() || length == 0 {
            return Some(range);
        }
        if offset >= self.total_length {
            return None;
        }
        Some(ByteRange::new(offset, range.end.min(self.total_length)))
    }

    /// Whether the (clamped) request can be answered from disk alone.
    pub fn covers(&self, offset: u64, length: u64) -> bool {
        match self.clamp(offset, length) {
            Some(range) => self.downloaded_ranges.covers(range.start, range.len()),
            None => false,
        }
    }

    pub fn touch(&mut self) {
        self.last_access = unix_millis();
    }

    pub fn content_info(&self) -> ContentInfo {
        ContentInfo {
            total_length: self.total_length,
            content_type: self.content_type.clone(),
            accepts_ranges: self.accepts_ranges,
        }
    }
}
