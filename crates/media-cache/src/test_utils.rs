//! Shared fixtures for unit tests.

use std::collections::HashMap;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::CacheError;
use crate::origin::OriginId;
use crate::transport::{ByteRangeRequest, ResponseInfo, Transport, TransportEvent, TransportStream};

static INIT: Once = Once::new();

/// Initialize tracing for tests
pub(crate) fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// Deterministic, non-repeating-looking test payload.
pub(crate) fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub(crate) fn partial_headers(start: u64, total: u64) -> ResponseInfo {
    ResponseInfo {
        content_range_total: Some(total),
        content_length: Some(total.saturating_sub(start)),
        content_type: Some("video/mp4".to_string()),
        accepts_ranges: true,
        partial: true,
        start_offset: start,
    }
}

/// Poll `check` until it holds or a second has passed.
pub(crate) async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Records every opened range and never produces an event.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    requests: Mutex<Vec<ByteRangeRequest>>,
}

impl RecordingTransport {
    pub(crate) fn requests(&self) -> Vec<ByteRangeRequest> {
        self.requests.lock().clone()
    }
}

impl Transport for RecordingTransport {
    fn open(&self, _origin: &OriginId, range: ByteRangeRequest) -> TransportStream {
        self.requests.lock().push(range);
        stream::pending().boxed()
    }
}

/// A transfer opened on a [`ScriptedTransport`]; the test plays upstream.
pub(crate) struct OpenedTransfer {
    pub origin: OriginId,
    pub range: ByteRangeRequest,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl OpenedTransfer {
    pub(crate) fn headers(&self, total: u64) {
        let _ = self
            .events
            .send(TransportEvent::Headers(partial_headers(self.range.start, total)));
    }

    pub(crate) fn chunk(&self, offset: u64, data: &[u8]) {
        let _ = self.events.send(TransportEvent::Chunk {
            offset,
            data: Bytes::copy_from_slice(data),
        });
    }

    pub(crate) fn complete(&self) {
        let _ = self.events.send(TransportEvent::Completed);
    }

    pub(crate) fn fail(&self, err: CacheError) {
        let _ = self.events.send(TransportEvent::Failed(err));
    }
}

/// Hands every opened transfer to the test.
pub(crate) struct ScriptedTransport {
    opened: mpsc::UnboundedSender<OpenedTransfer>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<OpenedTransfer>) {
        let (opened, rx) = mpsc::unbounded_channel();
        (Self { opened }, rx)
    }
}

impl Transport for ScriptedTransport {
    fn open(&self, origin: &OriginId, range: ByteRangeRequest) -> TransportStream {
        let (events, rx) = mpsc::unbounded_channel();
        let _ = self.opened.send(OpenedTransfer {
            origin: origin.clone(),
            range,
            events,
        });
        UnboundedReceiverStream::new(rx).boxed()
    }
}

/// Serves in-memory resources honouring the requested range.
pub(crate) struct MemoryTransport {
    resources: HashMap<OriginId, Bytes>,
    chunk_size: usize,
    opens: AtomicUsize,
}

impl MemoryTransport {
    pub(crate) fn new(chunk_size: usize) -> Self {
        Self {
            resources: HashMap::new(),
            chunk_size,
            opens: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_resource(mut self, origin: &OriginId, body: Vec<u8>) -> Self {
        self.resources.insert(origin.clone(), Bytes::from(body));
        self
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Transport for MemoryTransport {
    fn open(&self, origin: &OriginId, range: ByteRangeRequest) -> TransportStream {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let Some(body) = self.resources.get(origin).cloned() else {
            return stream::iter(vec![TransportEvent::Failed(CacheError::Upstream(format!(
                "Server returned status code 404 Not Found for {origin}"
            )))])
            .boxed();
        };

        let total = body.len() as u64;
        let start = range.start.min(total);
        let end = range.end.unwrap_or(total).min(total);

        let mut events = vec![TransportEvent::Headers(partial_headers(start, total))];
        let mut offset = start;
        while offset < end {
            let next = (offset + self.chunk_size as u64).min(end);
            events.push(TransportEvent::Chunk {
                offset,
                data: body.slice(offset as usize..next as usize),
            });
            offset = next;
        }
        events.push(TransportEvent::Completed);
        stream::iter(events).boxed()
    }
}
