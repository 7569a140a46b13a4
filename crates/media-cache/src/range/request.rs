//! Consumer-facing request handles and the events delivered through them.

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::error::{CacheError, Result};
use crate::origin::OriginId;

/// Identifies one consumer request for the lifetime of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a player needs to know before it starts asking for bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentInfo {
    /// 0 while unknown.
    pub total_length: u64,
    pub content_type: String,
    pub accepts_ranges: bool,
}

#[derive(Debug, Clone)]
pub enum RequestEvent {
    /// Length/type of the resource. Sent at most once per request.
    ContentInfo(ContentInfo),
    /// A contiguous piece of the requested interval.
    Data { offset: u64, bytes: Bytes },
    /// The whole interval has been delivered.
    Finished,
    /// The request will not be completed.
    Failed(CacheError),
}

/// Result of a [`preload`](crate::RangeCacheManager::preload) hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadOutcome {
    /// The initial span was already on disk; nothing was fetched.
    AlreadyCached,
    /// The initial span was fetched from upstream.
    Fetched,
}

/// Handle to an in-flight byte-range request.
///
/// Dropping the handle stops delivery but does not detach the request; call
/// [`RangeCacheManager::cancel`](crate::RangeCacheManager::cancel) for that.
#[derive(Debug)]
pub struct PendingRequest {
    pub(crate) id: RequestId,
    pub(crate) origin: OriginId,
    pub(crate) offset: u64,
    pub(crate) length: u64,
    pub(crate) events: mpsc::UnboundedReceiver<RequestEvent>,
}

impl PendingRequest {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn origin(&self) -> &OriginId {
        &self.origin
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Next event, or `None` once the request has been answered or dropped.
    pub async fn next_event(&mut self) -> Option<RequestEvent> {
        self.events.recv().await
    }

    /// Wait for the whole interval and return it as one buffer.
    pub async fn collect(mut self) -> Result<Bytes> {
        let mut buffer = BytesMut::new();
        let mut expected = self.offset;
        while let Some(event) = self.events.recv().await {
            match event {
                RequestEvent::ContentInfo(_) => {}
                RequestEvent::Data { offset, bytes } => {
                    if offset != expected {
                        return Err(CacheError::Corrupt(format!(
                            "Out-of-order delivery: expected offset {expected}, got {offset}"
                        )));
                    }
                    expected += bytes.len() as u64;
                    buffer.extend_from_slice(&bytes);
                }
                RequestEvent::Finished => return Ok(buffer.freeze()),
                RequestEvent::Failed(err) => return Err(err),
            }
        }
        Err(CacheError::Cancelled)
    }
}
