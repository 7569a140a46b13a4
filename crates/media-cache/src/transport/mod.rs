//! # Transport
//!
//! The range cache never talks to the network directly. A [`Transport`] turns
//! `(origin, byte range)` into a stream of [`TransportEvent`]s: one `Headers`,
//! any number of `Chunk`s, then exactly one `Completed` or `Failed`.

mod http;

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::CacheError;
use crate::origin::OriginId;

pub use http::{HttpTransport, create_client, parse_content_range};

/// Bytes asked of upstream: `[start, end)`, or `[start, EOF)` without an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRangeRequest {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRangeRequest {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// Value for an HTTP `Range` header (inclusive end).
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) if end > self.start => format!("bytes={}-{}", self.start, end - 1),
            _ => format!("bytes={}-", self.start),
        }
    }
}

/// Response metadata reported before any body bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseInfo {
    /// Total length declared by a `Content-Range` header.
    pub content_range_total: Option<u64>,
    /// Length of this response body.
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub accepts_ranges: bool,
    /// Whether upstream honoured the range (HTTP 206).
    pub partial: bool,
    /// Offset of the first body byte within the resource.
    pub start_offset: u64,
}

impl ResponseInfo {
    /// Total resource length, preferring the range's declared total over a
    /// plain content length. A partial body's length says nothing about the
    /// whole resource.
    pub fn total_length(&self) -> Option<u64> {
        self.content_range_total.or(if self.partial {
            None
        } else {
            self.content_length
        })
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Headers(ResponseInfo),
    Chunk { offset: u64, data: Bytes },
    Completed,
    Failed(CacheError),
}

impl TransportEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportEvent::Completed | TransportEvent::Failed(_))
    }
}

pub type TransportStream = BoxStream<'static, TransportEvent>;

/// Issues byte-range requests against remote origins.
///
/// Dropping the returned stream must abort the transfer.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, origin: &OriginId, range: ByteRangeRequest) -> TransportStream;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_is_inclusive() {
        assert_eq!(
            ByteRangeRequest::new(0, Some(100)).header_value(),
            "bytes=0-99"
        );
        assert_eq!(ByteRangeRequest::new(500, None).header_value(), "bytes=500-");
    }

    #[test]
    fn total_prefers_content_range() {
        let info = ResponseInfo {
            content_range_total: Some(10_000),
            content_length: Some(100),
            partial: true,
            ..Default::default()
        };
        assert_eq!(info.total_length(), Some(10_000));

        let partial_unknown = ResponseInfo {
            content_length: Some(100),
            partial: true,
            ..Default::default()
        };
        assert_eq!(partial_unknown.total_length(), None);

        let full = ResponseInfo {
            content_length: Some(100),
            ..Default::default()
        };
        assert_eq!(full.total_length(), Some(100));
    }
}
