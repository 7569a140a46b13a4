//! # Fetch Operation
//!
//! One [`FetchOperation`] exists per origin while requests for uncovered bytes
//! are outstanding. It owns the upstream transfer, writes every received chunk
//! at its true offset, merges the interval into the resource's [`RangeSet`]
//! and hands newly covered bytes to the requests waiting for them.
//!
//! Operations are plain state owned by the manager's actor task; every method
//! runs on that task, so no locking happens here. Transport events reach the
//! actor through a pump task per transfer, tagged with a transfer id so events
//! of a cancelled transfer are recognised and dropped.
//!
//! [`RangeSet`]: crate::range::range_set::RangeSet

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::StreamExt;
use tokio::fs;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::{CacheError, Result};
use crate::origin::OriginId;
use crate::range::metadata::ResourceMetadata;
use crate::range::range_set::{ByteRange, RangeSet};
use crate::range::request::{ContentInfo, PreloadOutcome, RequestEvent, RequestId};
use crate::range::store::{self, MetadataStore};
use crate::transport::{
    ByteRangeRequest, ResponseInfo, Transport, TransportEvent, TransportStream,
};

/// Bytes requested when only the content information is wanted.
const INFO_PROBE_BYTES: u64 = 64 * 1024;

/// Largest single `Data` event handed to a consumer.
pub(crate) const DELIVERY_CHUNK_BYTES: u64 = 256 * 1024;

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

/// A transport event on its way to the actor.
#[derive(Debug)]
pub(crate) struct TransferMessage {
    pub origin: OriginId,
    pub transfer_id: u64,
    pub event: TransportEvent,
}

/// Collaborators an operation needs while handling a call.
pub(crate) struct FetchContext<'a> {
    pub store: &'a MetadataStore,
    pub transport: &'a dyn Transport,
    pub events: &'a mpsc::Sender<TransferMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    Fetching,
    Completed,
    Failed,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct EventOutcome {
    pub bytes_written: u64,
    pub transfer_finished: bool,
}

enum Sink {
    Consumer(mpsc::UnboundedSender<RequestEvent>),
    Preload(oneshot::Sender<Result<PreloadOutcome>>),
}

struct PendingEntry {
    id: RequestId,
    offset: u64,
    /// Exclusive end, clamped once the resource length is known.
    end: u64,
    delivered: u64,
    info_sent: bool,
    sink: Sink,
}

impl PendingEntry {
    fn cursor(&self) -> u64 {
        self.offset + self.delivered
    }

    fn is_satisfied(&self) -> bool {
        self.cursor() >= self.end
    }

    fn send_info(&mut self, info: &ContentInfo) {
        if self.info_sent {
            return;
        }
        self.info_sent = true;
        if let Sink::Consumer(tx) = &self.sink {
            let _ = tx.send(RequestEvent::ContentInfo(info.clone()));
        }
    }

    fn finish(self) {
        match self.sink {
            Sink::Consumer(tx) => {
                let _ = tx.send(RequestEvent::Finished);
            }
            Sink::Preload(reply) => {
                let _ = reply.send(Ok(PreloadOutcome::Fetched));
            }
        }
    }

    fn fail(self, err: CacheError) {
        match self.sink {
            Sink::Consumer(tx) => {
                let _ = tx.send(RequestEvent::Failed(err));
            }
            Sink::Preload(reply) => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

enum Progress {
    Waiting,
    Satisfied,
    Failed(CacheError),
    Abandoned,
}

struct ActiveTransfer {
    id: u64,
    span: ByteRange,
    cancel: CancellationToken,
    /// Upstream ignored the range and is sending the body from byte 0.
    full_body: bool,
}

pub(crate) struct FetchOperation {
    origin: OriginId,
    metadata: ResourceMetadata,
    state: FetchState,
    pending: Vec<PendingEntry>,
    info_waiters: Vec<oneshot::Sender<Result<ContentInfo>>>,
    transfer: Option<ActiveTransfer>,
    data_file: Option<fs::File>,
}

impl FetchOperation {
    pub(crate) fn new(metadata: ResourceMetadata) -> Self {
        Self {
            origin: metadata.origin.clone(),
            metadata,
            state: FetchState::Idle,
            pending: Vec::new(),
            info_waiters: Vec::new(),
            transfer: None,
            data_file: None,
        }
    }

    pub(crate) fn metadata(&self) -> &ResourceMetadata {
        &self.metadata
    }

    pub(crate) fn touch(&mut self) {
        self.metadata.touch();
    }

    pub(crate) fn state(&self) -> FetchState {
        self.state
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// No requests, no waiters and no transfer: the registry may drop it.
    pub(crate) fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.info_waiters.is_empty() && self.transfer.is_none()
    }

    #[cfg(test)]
    pub(crate) fn transfer_id(&self) -> Option<u64> {
        self.transfer.as_ref().map(|t| t.id)
    }

    /// Register a consumer request, deliver whatever is already on disk and
    /// start fetching the rest if nothing is in flight.
    pub(crate) async fn attach(
        &mut self,
        ctx: &FetchContext<'_>,
        id: RequestId,
        offset: u64,
        length: u64,
        events: mpsc::UnboundedSender<RequestEvent>,
    ) {
        let Some(range) = self.metadata.clamp(offset, length) else {
            let _ = events.send(RequestEvent::Failed(CacheError::InvalidRange { offset, length }));
            return;
        };

        let mut entry = PendingEntry {
            id,
            offset: range.start,
            end: range.end,
            delivered: 0,
            info_sent: false,
            sink: Sink::Consumer(events),
        };
        if self.metadata.length_known() {
            entry.send_info(&self.metadata.content_info());
        }

        debug!(origin = %self.origin, request = %id, offset = range.start, end = range.end, "Attached request");
        self.pending.push(entry);
        self.deliver_ready(ctx).await;
        self.ensure_transfer(ctx);
    }

    /// Warm the cache with `[0, byte_count)`; nothing is delivered.
    pub(crate) async fn attach_preload(
        &mut self,
        ctx: &FetchContext<'_>,
        id: RequestId,
        byte_count: u64,
        reply: oneshot::Sender<Result<PreloadOutcome>>,
    ) {
        let end = if self.metadata.length_known() {
            byte_count.min(self.metadata.total_length)
        } else {
            byte_count
        };

        debug!(origin = %self.origin, request = %id, bytes = end, "Attached preload");
        self.pending.push(PendingEntry {
            id,
            offset: 0,
            end,
            delivered: 0,
            info_sent: true,
            sink: Sink::Preload(reply),
        });
        self.deliver_ready(ctx).await;
        self.ensure_transfer(ctx);
    }

    /// Answer once the resource length is known, probing upstream if needed.
    pub(crate) fn wait_for_info(
        &mut self,
        ctx: &FetchContext<'_>,
        reply: oneshot::Sender<Result<ContentInfo>>,
    ) {
        if self.metadata.length_known() {
            let _ = reply.send(Ok(self.metadata.content_info()));
            return;
        }
        self.info_waiters.push(reply);
        if self.transfer.is_none() {
            let start = self.metadata.downloaded_ranges().first_gap_from(0);
            self.start_transfer(ctx, ByteRange::from_offset(start, INFO_PROBE_BYTES));
        }
    }

    /// Remove a pending request. The transfer is cancelled once nobody needs it.
    pub(crate) fn detach(&mut self, id: RequestId) -> bool {
        let Some(position) = self.pending.iter().position(|e| e.id == id) else {
            return false;
        };
        // Dropping the entry closes its channel; no further events reach it.
        self.pending.remove(position);
        debug!(origin = %self.origin, request = %id, "Detached request");

        if self.pending.is_empty() && self.info_waiters.is_empty() {
            self.cancel_transfer();
        }
        true
    }

    /// Cancel the transfer and fail everything that is waiting.
    pub(crate) fn cancel_all(&mut self, err: CacheError) {
        self.cancel_transfer();
        self.fail_pending(err);
    }

    fn cancel_transfer(&mut self) {
        if let Some(transfer) = self.transfer.take() {
            transfer.cancel.cancel();
            debug!(origin = %self.origin, transfer = transfer.id, "Cancelled upstream transfer");
        }
        self.state = FetchState::Idle;
    }

    fn fail_pending(&mut self, err: CacheError) {
        for entry in self.pending.drain(..) {
            entry.fail(err.clone());
        }
        for waiter in self.info_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    pub(crate) async fn handle_event(
        &mut self,
        ctx: &FetchContext<'_>,
        transfer_id: u64,
        event: TransportEvent,
    ) -> EventOutcome {
        let current = self.transfer.as_ref().map(|t| t.id);
        if current != Some(transfer_id) {
            trace!(origin = %self.origin, transfer = transfer_id, "Ignoring event from stale transfer");
            return EventOutcome::default();
        }

        match event {
            TransportEvent::Headers(info) => {
                self.on_headers(ctx, info).await;
                EventOutcome::default()
            }
            TransportEvent::Chunk { offset, data } => self.on_chunk(ctx, offset, data).await,
            TransportEvent::Completed => {
                self.on_completed(ctx).await;
                EventOutcome {
                    bytes_written: 0,
                    transfer_finished: true,
                }
            }
            TransportEvent::Failed(err) => {
                self.on_failed(err);
                EventOutcome {
                    bytes_written: 0,
                    transfer_finished: true,
                }
            }
        }
    }

    async fn on_headers(&mut self, ctx: &FetchContext<'_>, info: ResponseInfo) {
        if let Some(total) = info.total_length().filter(|t| *t > 0) {
            if self.metadata.length_known() && self.metadata.total_length != total {
                warn!(
                    origin = %self.origin,
                    previous = self.metadata.total_length,
                    current = total,
                    "Upstream reported a different resource length"
                );
            }
            self.metadata.total_length = total;
        }
        if let Some(content_type) = info.content_type.clone() {
            self.metadata.content_type = content_type;
        }
        self.metadata.accepts_ranges = info.accepts_ranges;

        if !info.partial {
            if let Some(transfer) = self.transfer.as_mut() {
                transfer.full_body = true;
                transfer.span = ByteRange::new(
                    info.start_offset,
                    info.total_length().unwrap_or(u64::MAX),
                );
            }
        }

        self.persist(ctx).await;
        self.apply_known_length();

        self.announce_content_info();

        // Clamping may have satisfied requests that ran past the end.
        self.deliver_ready(ctx).await;
    }

    /// Hand the content information to everyone still waiting for it, once the
    /// length is known.
    fn announce_content_info(&mut self) {
        if !self.metadata.length_known() {
            return;
        }
        let content = self.metadata.content_info();
        for entry in self.pending.iter_mut() {
            entry.send_info(&content);
        }
        for waiter in self.info_waiters.drain(..) {
            let _ = waiter.send(Ok(content.clone()));
        }
    }

    /// Clamp pending requests to the now-known length, failing those that
    /// start past the end.
    fn apply_known_length(&mut self) {
        if !self.metadata.length_known() {
            return;
        }
        let total = self.metadata.total_length;
        let mut index = 0;
        while index < self.pending.len() {
            let entry = &mut self.pending[index];
            if entry.offset >= total && entry.end > entry.offset {
                let entry = self.pending.remove(index);
                let (offset, length) = (entry.offset, entry.end - entry.offset);
                entry.fail(CacheError::InvalidRange { offset, length });
                continue;
            }
            entry.end = entry.end.min(total);
            index += 1;
        }
    }

    async fn on_chunk(&mut self, ctx: &FetchContext<'_>, offset: u64, data: Bytes) -> EventOutcome {
        if data.is_empty() {
            return EventOutcome::default();
        }
        let len = data.len() as u64;

        if let Err(e) = self.write_chunk(ctx, offset, &data).await {
            error!(origin = %self.origin, offset, error = %e, "Failed to write chunk to cache file");
            self.cancel_transfer();
            self.state = FetchState::Failed;
            self.fail_pending(CacheError::from(e));
            return EventOutcome {
                bytes_written: 0,
                transfer_finished: true,
            };
        }

        self.metadata.record_range(ByteRange::from_offset(offset, len));
        self.persist(ctx).await;
        self.deliver_ready(ctx).await;

        EventOutcome {
            bytes_written: len,
            transfer_finished: false,
        }
    }

    async fn write_chunk(
        &mut self,
        ctx: &FetchContext<'_>,
        offset: u64,
        data: &[u8],
    ) -> std::io::Result<()> {
        if self.data_file.is_none() {
            let file = store::open_for_write(&ctx.store.data_path(&self.origin)).await?;
            self.data_file = Some(file);
        }
        if let Some(file) = self.data_file.as_mut() {
            store::write_at(file, offset, data).await?;
        }
        Ok(())
    }

    async fn on_completed(&mut self, ctx: &FetchContext<'_>) {
        let Some(transfer) = self.transfer.take() else {
            return;
        };
        self.state = FetchState::Completed;
        self.data_file = None;

        // A whole body that simply ended tells us the length.
        if transfer.full_body && !self.metadata.length_known() {
            let end = self.metadata.downloaded_ranges().first_gap_from(0);
            if end > 0 {
                self.metadata.total_length = end;
                self.persist(ctx).await;
                self.apply_known_length();
                self.announce_content_info();
                self.deliver_ready(ctx).await;
            }
        }

        let span = transfer.span;
        let mut index = 0;
        while index < self.pending.len() {
            let entry = &self.pending[index];
            let cursor = entry.cursor();
            if !entry.is_satisfied() && span.contains(cursor) {
                let entry = self.pending.remove(index);
                warn!(
                    origin = %self.origin,
                    request = %entry.id,
                    cursor,
                    "Upstream ended before delivering the requested bytes"
                );
                entry.fail(CacheError::Upstream(format!(
                    "short read: transfer of [{}, {}) ended before byte {cursor}",
                    span.start, span.end
                )));
            } else {
                index += 1;
            }
        }

        debug!(
            origin = %self.origin,
            transfer = transfer.id,
            covered = self.metadata.covered_bytes(),
            total = self.metadata.total_length,
            "Upstream transfer completed"
        );

        // Requests that arrived for bytes beyond this transfer need another one.
        self.ensure_transfer(ctx);

        if self.transfer.is_none() && !self.info_waiters.is_empty() {
            warn!(origin = %self.origin, "Upstream transfer ended without reporting the resource length");
            for waiter in self.info_waiters.drain(..) {
                let _ = waiter.send(Err(CacheError::Upstream(
                    "resource length is unknown".to_string(),
                )));
            }
        }
    }

    fn on_failed(&mut self, err: CacheError) {
        if let Some(transfer) = self.transfer.take() {
            warn!(origin = %self.origin, transfer = transfer.id, error = %err, "Upstream transfer failed");
        }
        self.state = FetchState::Failed;
        self.data_file = None;
        self.fail_pending(err);
    }

    async fn persist(&self, ctx: &FetchContext<'_>) {
        if let Err(e) = ctx.store.save(&self.metadata).await {
            warn!(origin = %self.origin, error = %e, "Failed to persist cache metadata");
        }
    }

    /// Hand newly covered bytes to every pending request and retire the ones
    /// that are complete, failed, or whose consumer went away.
    async fn deliver_ready(&mut self, ctx: &FetchContext<'_>) {
        let path = ctx.store.data_path(&self.origin);
        let mut index = 0;
        while index < self.pending.len() {
            let progress = Self::advance(
                &mut self.pending[index],
                self.metadata.downloaded_ranges(),
                &path,
            )
            .await;

            match progress {
                Progress::Waiting => index += 1,
                Progress::Satisfied => {
                    let entry = self.pending.remove(index);
                    debug!(origin = %self.origin, request = %entry.id, "Request fulfilled");
                    entry.finish();
                }
                Progress::Failed(err) => {
                    let entry = self.pending.remove(index);
                    warn!(origin = %self.origin, request = %entry.id, error = %err, "Failed to deliver cached bytes");
                    entry.fail(err);
                }
                Progress::Abandoned => {
                    let entry = self.pending.remove(index);
                    debug!(origin = %self.origin, request = %entry.id, "Consumer went away");
                }
            }
        }
    }

    async fn advance(entry: &mut PendingEntry, ranges: &RangeSet, path: &Path) -> Progress {
        if let Sink::Consumer(tx) = &entry.sink {
            if tx.is_closed() {
                return Progress::Abandoned;
            }
        }
        if entry.is_satisfied() {
            return Progress::Satisfied;
        }

        let cursor = entry.cursor();
        let available = ranges.first_gap_from(cursor).min(entry.end);
        if available <= cursor {
            return Progress::Waiting;
        }

        match &entry.sink {
            Sink::Consumer(tx) => {
                let mut position = cursor;
                while position < available {
                    let len = (available - position).min(DELIVERY_CHUNK_BYTES);
                    let bytes = match store::read_range(path, position, len).await {
                        Ok(bytes) => bytes,
                        Err(e) => return Progress::Failed(e.into()),
                    };
                    if tx
                        .send(RequestEvent::Data {
                            offset: position,
                            bytes,
                        })
                        .is_err()
                    {
                        return Progress::Abandoned;
                    }
                    position += len;
                    entry.delivered = position - entry.offset;
                }
            }
            Sink::Preload(_) => entry.delivered = available - entry.offset,
        }

        if entry.is_satisfied() {
            Progress::Satisfied
        } else {
            Progress::Waiting
        }
    }

    /// Start a transfer at the lowest uncovered offset at or after the
    /// smallest pending cursor, unless one is already running.
    fn ensure_transfer(&mut self, ctx: &FetchContext<'_>) {
        if self.transfer.is_some() {
            return;
        }
        let waiting = || self.pending.iter().filter(|e| !e.is_satisfied());
        let Some(lowest) = waiting().map(PendingEntry::cursor).min() else {
            return;
        };
        let highest = waiting().map(|e| e.end).max().unwrap_or(lowest);

        let ranges = self.metadata.downloaded_ranges();
        let start = ranges.first_gap_from(lowest);
        let mut end = highest;
        // Stop where cached bytes resume; a follow-up transfer picks up after them.
        if let Some(next) = ranges.next_covered_after(start) {
            end = end.min(next);
        }
        if self.metadata.length_known() {
            end = end.min(self.metadata.total_length);
        }
        if end <= start {
            return;
        }

        self.start_transfer(ctx, ByteRange::new(start, end));
    }

    fn start_transfer(&mut self, ctx: &FetchContext<'_>, span: ByteRange) {
        let id = NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let end = (span.end != u64::MAX).then_some(span.end);
        let stream = ctx
            .transport
            .open(&self.origin, ByteRangeRequest::new(span.start, end));

        spawn_pump(
            stream,
            ctx.events.clone(),
            self.origin.clone(),
            id,
            cancel.clone(),
        );

        debug!(origin = %self.origin, transfer = id, start = span.start, end = span.end, "Started upstream transfer");
        self.transfer = Some(ActiveTransfer {
            id,
            span,
            cancel,
            full_body: false,
        });
        self.state = FetchState::Fetching;
    }
}

/// Forward a transport stream into the actor's mailbox until it ends or the
/// transfer is cancelled.
fn spawn_pump(
    mut stream: TransportStream,
    events: mpsc::Sender<TransferMessage>,
    origin: OriginId,
    transfer_id: u64,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = stream.next() => event,
            };

            let event = event.unwrap_or_else(|| {
                TransportEvent::Failed(CacheError::Upstream(
                    "transport stream ended without a terminal event".into(),
                ))
            });
            let terminal = event.is_terminal();
            let message = TransferMessage {
                origin: origin.clone(),
                transfer_id,
                event,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = events.send(message) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }

            if terminal {
                break;
            }
        }
        trace!(origin = %origin, transfer = transfer_id, "Transfer pump finished");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{RecordingTransport, init_tracing, partial_headers, sample};

    struct Harness {
        _dir: tempfile::TempDir,
        store: MetadataStore,
        transport: RecordingTransport,
        events_tx: mpsc::Sender<TransferMessage>,
        _events_rx: mpsc::Receiver<TransferMessage>,
    }

    impl Harness {
        async fn new() -> Self {
            init_tracing();
            let dir = tempfile::tempdir().unwrap();
            let store = MetadataStore::new(dir.path());
            store.ensure_initialized().await.unwrap();
            let (events_tx, events_rx) = mpsc::channel(16);
            Self {
                _dir: dir,
                store,
                transport: RecordingTransport::default(),
                events_tx,
                _events_rx: events_rx,
            }
        }

        fn ctx(&self) -> FetchContext<'_> {
            FetchContext {
                store: &self.store,
                transport: &self.transport,
                events: &self.events_tx,
            }
        }
    }

    fn origin() -> OriginId {
        OriginId::new("https://example.com/movie.mp4")
    }

    fn consumer() -> (
        mpsc::UnboundedSender<RequestEvent>,
        mpsc::UnboundedReceiver<RequestEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RequestEvent>) -> Vec<RequestEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn data_spans(events: &[RequestEvent]) -> Vec<(u64, usize)> {
        events
            .iter()
            .filter_map(|e| match e {
                RequestEvent::Data { offset, bytes } => Some((*offset, bytes.len())),
                _ => None,
            })
            .collect()
    }

    fn finished(events: &[RequestEvent]) -> bool {
        events.iter().any(|e| matches!(e, RequestEvent::Finished))
    }

    #[tokio::test]
    async fn partial_then_full_delivery() {
        let h = Harness::new().await;
        let ctx = h.ctx();
        let body = sample(100);
        let mut op = FetchOperation::new(ResourceMetadata::new(origin()));
        let (tx, mut rx) = consumer();

        op.attach(&ctx, RequestId(1), 0, 100, tx).await;
        assert_eq!(op.state(), FetchState::Fetching);
        assert_eq!(h.transport.requests(), vec![ByteRangeRequest::new(0, Some(100))]);
        let transfer = op.transfer_id().unwrap();

        op.handle_event(&ctx, transfer, TransportEvent::Headers(partial_headers(0, 100)))
            .await;
        op.handle_event(
            &ctx,
            transfer,
            TransportEvent::Chunk {
                offset: 0,
                data: Bytes::copy_from_slice(&body[..50]),
            },
        )
        .await;

        let events = drain(&mut rx);
        assert!(matches!(events[0], RequestEvent::ContentInfo(ref info) if info.total_length == 100));
        assert_eq!(data_spans(&events), vec![(0, 50)]);
        assert!(!finished(&events));
        assert_eq!(op.pending_count(), 1);

        op.handle_event(
            &ctx,
            transfer,
            TransportEvent::Chunk {
                offset: 50,
                data: Bytes::copy_from_slice(&body[50..]),
            },
        )
        .await;
        let events = drain(&mut rx);
        assert_eq!(data_spans(&events), vec![(50, 50)]);
        assert!(finished(&events));
        assert!(op.metadata().is_complete());

        let outcome = op.handle_event(&ctx, transfer, TransportEvent::Completed).await;
        assert!(outcome.transfer_finished);
        assert_eq!(op.state(), FetchState::Completed);
        assert!(op.is_idle());

        let stored = h.store.load(&origin()).await.unwrap();
        assert!(stored.is_complete());
    }

    #[tokio::test]
    async fn one_chunk_satisfies_overlapping_requests() {
        let h = Harness::new().await;
        let ctx = h.ctx();
        let body = sample(90);
        let mut op = FetchOperation::new(ResourceMetadata::new(origin()));
        let (tx_a, mut rx_a) = consumer();
        let (tx_b, mut rx_b) = consumer();

        op.attach(&ctx, RequestId(1), 0, 50, tx_a).await;
        op.attach(&ctx, RequestId(2), 40, 50, tx_b).await;
        assert_eq!(h.transport.requests().len(), 1);
        let transfer = op.transfer_id().unwrap();

        op.handle_event(
            &ctx,
            transfer,
            TransportEvent::Chunk {
                offset: 0,
                data: Bytes::from(body.clone()),
            },
        )
        .await;

        let a = drain(&mut rx_a);
        let b = drain(&mut rx_b);
        assert_eq!(data_spans(&a), vec![(0, 50)]);
        assert_eq!(data_spans(&b), vec![(40, 50)]);
        assert!(finished(&a) && finished(&b));
        assert_eq!(op.pending_count(), 0);
    }

    #[tokio::test]
    async fn resumes_after_cached_prefix() {
        let h = Harness::new().await;
        let ctx = h.ctx();
        let body = sample(200);

        let mut metadata = ResourceMetadata::new(origin());
        metadata.total_length = 200;
        metadata.record_range(ByteRange::new(0, 80));
        metadata.record_range(ByteRange::new(120, 150));
        let mut file = store::open_for_write(&h.store.data_path(&origin())).await.unwrap();
        store::write_at(&mut file, 0, &body[..80]).await.unwrap();
        store::write_at(&mut file, 120, &body[120..150]).await.unwrap();

        let mut op = FetchOperation::new(metadata);
        let (tx, mut rx) = consumer();
        op.attach(&ctx, RequestId(1), 10, 190, tx).await;

        // The covered prefix is delivered at once and the fetch skips it,
        // stopping where cached bytes resume.
        let events = drain(&mut rx);
        assert_eq!(data_spans(&events), vec![(10, 70)]);
        assert_eq!(h.transport.requests(), vec![ByteRangeRequest::new(80, Some(120))]);

        let transfer = op.transfer_id().unwrap();
        op.handle_event(
            &ctx,
            transfer,
            TransportEvent::Chunk {
                offset: 80,
                data: Bytes::copy_from_slice(&body[80..120]),
            },
        )
        .await;
        op.handle_event(&ctx, transfer, TransportEvent::Completed).await;

        // 80..150 is now contiguous; the next transfer starts after it.
        let events = drain(&mut rx);
        assert_eq!(data_spans(&events), vec![(80, 70)]);
        assert_eq!(
            h.transport.requests().last().copied(),
            Some(ByteRangeRequest::new(150, Some(200)))
        );
    }

    #[tokio::test]
    async fn short_read_fails_only_affected_requests() {
        let h = Harness::new().await;
        let ctx = h.ctx();
        let body = sample(100);
        let mut op = FetchOperation::new(ResourceMetadata::new(origin()));
        let (tx_a, mut rx_a) = consumer();
        let (tx_b, mut rx_b) = consumer();

        op.attach(&ctx, RequestId(1), 0, 100, tx_a).await;
        let transfer = op.transfer_id().unwrap();
        op.attach(&ctx, RequestId(2), 0, 30, tx_b).await;

        op.handle_event(
            &ctx,
            transfer,
            TransportEvent::Chunk {
                offset: 0,
                data: Bytes::copy_from_slice(&body[..40]),
            },
        )
        .await;
        op.handle_event(&ctx, transfer, TransportEvent::Completed).await;

        let a = drain(&mut rx_a);
        let b = drain(&mut rx_b);
        assert!(finished(&b));
        assert_eq!(data_spans(&a), vec![(0, 40)]);
        assert!(matches!(
            a.last(),
            Some(RequestEvent::Failed(CacheError::Upstream(_)))
        ));
        assert!(!op.metadata().is_complete());
        assert!(op.is_idle());
    }

    #[tokio::test]
    async fn upstream_error_fails_every_pending_request() {
        let h = Harness::new().await;
        let ctx = h.ctx();
        let mut op = FetchOperation::new(ResourceMetadata::new(origin()));
        let (tx_a, mut rx_a) = consumer();
        let (tx_b, mut rx_b) = consumer();

        op.attach(&ctx, RequestId(1), 0, 10, tx_a).await;
        op.attach(&ctx, RequestId(2), 500, 10, tx_b).await;
        let transfer = op.transfer_id().unwrap();

        op.handle_event(
            &ctx,
            transfer,
            TransportEvent::Failed(CacheError::Upstream("connection reset".into())),
        )
        .await;

        for rx in [&mut rx_a, &mut rx_b] {
            let events = drain(rx);
            assert!(matches!(
                events.last(),
                Some(RequestEvent::Failed(CacheError::Upstream(_)))
            ));
        }
        assert_eq!(op.state(), FetchState::Failed);
        assert!(op.is_idle());

        // A fresh request re-enters Fetching.
        let (tx, _rx) = consumer();
        op.attach(&ctx, RequestId(3), 0, 10, tx).await;
        assert_eq!(op.state(), FetchState::Fetching);
        assert_eq!(h.transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn stale_transfer_events_are_ignored() {
        let h = Harness::new().await;
        let ctx = h.ctx();
        let mut op = FetchOperation::new(ResourceMetadata::new(origin()));
        let (tx, mut rx) = consumer();

        op.attach(&ctx, RequestId(1), 0, 10, tx).await;
        let stale = op.transfer_id().unwrap();
        op.cancel_all(CacheError::Cancelled);
        assert!(matches!(
            drain(&mut rx).last(),
            Some(RequestEvent::Failed(CacheError::Cancelled))
        ));

        let outcome = op
            .handle_event(
                &ctx,
                stale,
                TransportEvent::Chunk {
                    offset: 0,
                    data: Bytes::from_static(b"0123456789"),
                },
            )
            .await;
        assert_eq!(outcome.bytes_written, 0);
        assert_eq!(op.metadata().covered_bytes(), 0);
    }

    #[tokio::test]
    async fn detaching_last_request_cancels_transfer() {
        let h = Harness::new().await;
        let ctx = h.ctx();
        let mut op = FetchOperation::new(ResourceMetadata::new(origin()));
        let (tx_a, _rx_a) = consumer();
        let (tx_b, mut rx_b) = consumer();

        op.attach(&ctx, RequestId(1), 0, 10, tx_a).await;
        op.attach(&ctx, RequestId(2), 0, 10, tx_b).await;

        assert!(op.detach(RequestId(2)));
        assert!(op.transfer_id().is_some());
        // The detached request's channel is closed without further events.
        assert!(rx_b.recv().await.is_none());

        assert!(op.detach(RequestId(1)));
        assert!(op.is_idle());
        assert!(!op.detach(RequestId(1)));
    }

    #[tokio::test]
    async fn preload_completes_without_delivering() {
        let h = Harness::new().await;
        let ctx = h.ctx();
        let mut op = FetchOperation::new(ResourceMetadata::new(origin()));
        let (reply, outcome) = oneshot::channel();

        op.attach_preload(&ctx, RequestId(1), 64, reply).await;
        assert_eq!(h.transport.requests(), vec![ByteRangeRequest::new(0, Some(64))]);
        let transfer = op.transfer_id().unwrap();
        op.handle_event(
            &ctx,
            transfer,
            TransportEvent::Chunk {
                offset: 0,
                data: Bytes::from(sample(64)),
            },
        )
        .await;

        assert_eq!(outcome.await.unwrap().unwrap(), PreloadOutcome::Fetched);
    }

    #[tokio::test]
    async fn info_waiter_answered_when_full_body_completes() {
        let h = Harness::new().await;
        let ctx = h.ctx();
        let body = sample(16);
        let mut op = FetchOperation::new(ResourceMetadata::new(origin()));
        let (tx, mut rx) = consumer();

        op.attach(&ctx, RequestId(1), 0, 10, tx).await;
        let transfer = op.transfer_id().unwrap();
        // Chunked 200 reply: whole body, no length.
        let headers = ResponseInfo {
            partial: false,
            ..Default::default()
        };
        op.handle_event(&ctx, transfer, TransportEvent::Headers(headers)).await;

        let (reply, mut info) = oneshot::channel();
        op.wait_for_info(&ctx, reply);
        assert!(info.try_recv().is_err());

        op.handle_event(
            &ctx,
            transfer,
            TransportEvent::Chunk {
                offset: 0,
                data: Bytes::from(body),
            },
        )
        .await;
        assert!(finished(&drain(&mut rx)));
        op.handle_event(&ctx, transfer, TransportEvent::Completed).await;

        let content = info.await.unwrap().unwrap();
        assert_eq!(content.total_length, 16);
        assert!(op.is_idle());
    }

    #[tokio::test]
    async fn info_waiter_fails_when_length_never_arrives() {
        let h = Harness::new().await;
        let ctx = h.ctx();
        let mut op = FetchOperation::new(ResourceMetadata::new(origin()));

        let (reply, info) = oneshot::channel();
        op.wait_for_info(&ctx, reply);
        let transfer = op.transfer_id().unwrap();
        let headers = ResponseInfo {
            partial: true,
            ..Default::default()
        };
        op.handle_event(&ctx, transfer, TransportEvent::Headers(headers)).await;
        op.handle_event(
            &ctx,
            transfer,
            TransportEvent::Chunk {
                offset: 0,
                data: Bytes::from(sample(8)),
            },
        )
        .await;
        op.handle_event(&ctx, transfer, TransportEvent::Completed).await;

        assert!(matches!(info.await.unwrap(), Err(CacheError::Upstream(_))));
        assert!(op.is_idle());
    }

    #[tokio::test]
    async fn request_past_known_end_is_rejected() {
        let h = Harness::new().await;
        let ctx = h.ctx();
        let mut metadata = ResourceMetadata::new(origin());
        metadata.total_length = 100;
        let mut op = FetchOperation::new(metadata);
        let (tx, mut rx) = consumer();

        op.attach(&ctx, RequestId(1), 100, 10, tx).await;
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [RequestEvent::Failed(CacheError::InvalidRange { offset: 100, length: 10 })]
        ));
        assert!(h.transport.requests().is_empty());
    }
}
