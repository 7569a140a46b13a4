//! # Range Cache Manager
//!
//! The public entry point of the progressive range cache. A
//! [`RangeCacheManager`] is a cheap, cloneable handle to a single actor task
//! that owns the operation registry, the metadata store and the eviction
//! bookkeeping.
//!
//! ## Flow
//!
//! 1. A consumer calls [`RangeCacheManager::request`] and immediately receives
//!    a [`PendingRequest`].
//! 2. The actor checks the resource's recorded ranges. A covered interval is
//!    streamed from disk by a short-lived reader task without touching
//!    upstream.
//! 3. Otherwise the request is attached to the origin's [`FetchOperation`],
//!    which starts (or joins) the single transfer for that origin.
//! 4. Transport events arrive through a bounded channel; chunks are written,
//!    recorded and fanned out to every request they satisfy.
//! 5. After a transfer ends, or every `eviction_check_bytes` written, the
//!    store is brought back under its size budget. Origins with a live
//!    operation are never evicted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::RangeCacheConfig;
use crate::error::{CacheError, Result};
use crate::eviction::{EvictionCandidate, plan_eviction};
use crate::origin::OriginId;
use crate::range::fetch::{DELIVERY_CHUNK_BYTES, FetchContext, FetchOperation, TransferMessage};
use crate::range::metadata::{ResourceMetadata, unix_millis};
use crate::range::range_set::ByteRange;
use crate::range::request::{ContentInfo, PendingRequest, PreloadOutcome, RequestEvent, RequestId};
use crate::range::store::{self, MetadataStore};
use crate::transport::Transport;

/// Capacity of the transport event channel; full means pumps wait.
const TRANSFER_CHANNEL_CAPACITY: usize = 64;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> RequestId {
    RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
}

/// Snapshot of the range cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    /// Covered bytes across all entries.
    pub bytes: u64,
    pub complete_entries: usize,
    pub live_operations: usize,
}

enum Command {
    Request {
        id: RequestId,
        origin: OriginId,
        offset: u64,
        length: u64,
        events: mpsc::UnboundedSender<RequestEvent>,
    },
    Cancel {
        origin: OriginId,
        id: RequestId,
    },
    Preload {
        id: RequestId,
        origin: OriginId,
        byte_count: u64,
        reply: oneshot::Sender<Result<PreloadOutcome>>,
    },
    ContentInfo {
        origin: OriginId,
        reply: oneshot::Sender<Result<ContentInfo>>,
    },
    ClearAll {
        reply: oneshot::Sender<Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<CacheStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the range cache actor.
#[derive(Clone)]
pub struct RangeCacheManager {
    commands: mpsc::UnboundedSender<Command>,
    root: PathBuf,
}

impl RangeCacheManager {
    /// Create the storage directories and start the actor.
    pub async fn new(config: RangeCacheConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let store = MetadataStore::new(&config.root);
        store.ensure_initialized().await?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (transfer_tx, transfer_rx) = mpsc::channel(TRANSFER_CHANNEL_CAPACITY);

        info!(
            root = ?config.root,
            max_size = config.max_size_bytes,
            "Starting range cache"
        );

        let root = config.root.clone();
        let actor = Actor {
            config,
            shared: Shared {
                store,
                transport,
                transfer_tx,
            },
            operations: HashMap::new(),
            access_updates: HashMap::new(),
            hit_readers: HashMap::new(),
            bytes_since_eviction: 0,
        };
        tokio::spawn(actor.run(command_rx, transfer_rx));

        Ok(Self { commands, root })
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Ask for `[offset, offset + length)` of `origin`. Never blocks.
    pub fn request(&self, origin: &OriginId, offset: u64, length: u64) -> PendingRequest {
        let id = next_request_id();
        let (events, rx) = mpsc::unbounded_channel();

        let command = Command::Request {
            id,
            origin: origin.clone(),
            offset,
            length,
            events,
        };
        if let Err(mpsc::error::SendError(Command::Request { events, .. })) =
            self.commands.send(command)
        {
            let _ = events.send(RequestEvent::Failed(CacheError::Shutdown));
        }

        PendingRequest {
            id,
            origin: origin.clone(),
            offset,
            length,
            events: rx,
        }
    }

    /// Stop delivering to a request. Unknown or finished requests are ignored.
    pub fn cancel(&self, request: &PendingRequest) {
        let _ = self.commands.send(Command::Cancel {
            origin: request.origin().clone(),
            id: request.id(),
        });
    }

    /// Make sure the first `byte_count` bytes of `origin` are on disk.
    pub async fn preload(&self, origin: &OriginId, byte_count: u64) -> Result<PreloadOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Preload {
            id: next_request_id(),
            origin: origin.clone(),
            byte_count,
            reply,
        })?;
        rx.await.map_err(|_| CacheError::Cancelled)?
    }

    /// Total length and content type, fetched from upstream if not yet known.
    pub async fn content_info(&self, origin: &OriginId) -> Result<ContentInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ContentInfo {
            origin: origin.clone(),
            reply,
        })?;
        rx.await.map_err(|_| CacheError::Cancelled)?
    }

    /// Cancel all transfers, fail every pending request and wipe storage.
    pub async fn clear_all(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ClearAll { reply })?;
        rx.await.map_err(|_| CacheError::Shutdown)?
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply })?;
        rx.await.map_err(|_| CacheError::Shutdown)
    }

    /// Stop the actor after flushing pending access times.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| CacheError::Shutdown)
    }
}

/// Actor state that in-flight operations borrow while handling a call.
struct Shared {
    store: MetadataStore,
    transport: Arc<dyn Transport>,
    transfer_tx: mpsc::Sender<TransferMessage>,
}

impl Shared {
    fn context(&self) -> FetchContext<'_> {
        FetchContext {
            store: &self.store,
            transport: self.transport.as_ref(),
            events: &self.transfer_tx,
        }
    }
}

struct Actor {
    config: RangeCacheConfig,
    shared: Shared,
    operations: HashMap<OriginId, FetchOperation>,
    /// Last hit per origin, written back on the next flush.
    access_updates: HashMap<OriginId, u64>,
    /// Readers serving cache hits; a finished reader cancels its own token.
    hit_readers: HashMap<RequestId, CancellationToken>,
    bytes_since_eviction: u64,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transfers: mpsc::Receiver<TransferMessage>,
    ) {
        let mut flush = tokio::time::interval(self.config.access_flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        commands.close();
                        while let Ok(command) = commands.try_recv() {
                            reject(command);
                        }
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(message) = transfers.recv() => self.handle_transfer(message).await,
                _ = flush.tick() => self.flush_access_times().await,
            }
        }

        debug!(root = ?self.config.root, "Range cache stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Request {
                id,
                origin,
                offset,
                length,
                events,
            } => self.handle_request(id, origin, offset, length, events).await,
            Command::Cancel { origin, id } => {
                if let Some(reader) = self.hit_readers.remove(&id) {
                    trace!(origin = %origin, request = %id, "Stopping cache hit reader");
                    reader.cancel();
                } else if let Some(op) = self.operations.get_mut(&origin) {
                    op.detach(id);
                }
                self.retire_if_idle(&origin);
            }
            Command::Preload {
                id,
                origin,
                byte_count,
                reply,
            } => self.handle_preload(id, origin, byte_count, reply).await,
            Command::ContentInfo { origin, reply } => {
                let op = Self::operation(&mut self.operations, &self.shared.store, &origin).await;
                op.wait_for_info(&self.shared.context(), reply);
                self.retire_if_idle(&origin);
            }
            Command::ClearAll { reply } => {
                let _ = reply.send(self.clear_all().await);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats().await);
            }
            // Handled by the run loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    /// Registered operation for `origin`, creating it from the stored record.
    async fn operation<'a>(
        operations: &'a mut HashMap<OriginId, FetchOperation>,
        store: &MetadataStore,
        origin: &OriginId,
    ) -> &'a mut FetchOperation {
        if !operations.contains_key(origin) {
            let metadata = store
                .load(origin)
                .await
                .unwrap_or_else(|| ResourceMetadata::new(origin.clone()));
            operations.insert(origin.clone(), FetchOperation::new(metadata));
        }
        operations
            .entry(origin.clone())
            .or_insert_with(|| FetchOperation::new(ResourceMetadata::new(origin.clone())))
    }

    fn retire_if_idle(&mut self, origin: &OriginId) {
        if self.operations.get(origin).is_some_and(FetchOperation::is_idle) {
            trace!(origin = %origin, "Retiring idle fetch operation");
            self.operations.remove(origin);
        }
    }

    async fn handle_request(
        &mut self,
        id: RequestId,
        origin: OriginId,
        offset: u64,
        length: u64,
        events: mpsc::UnboundedSender<RequestEvent>,
    ) {
        let op = Self::operation(&mut self.operations, &self.shared.store, &origin).await;

        if op.metadata().covers(offset, length) {
            if let Some(range) = op.metadata().clamp(offset, length) {
                trace!(origin = %origin, request = %id, start = range.start, end = range.end, "Cache hit");
                let reader = CancellationToken::new();
                serve_hit(
                    self.shared.store.data_path(&origin),
                    range,
                    op.metadata().content_info(),
                    events,
                    reader.clone(),
                );
                self.hit_readers.retain(|_, token| !token.is_cancelled());
                self.hit_readers.insert(id, reader);
                self.access_updates.insert(origin.clone(), unix_millis());
            }
        } else {
            op.touch();
            op.attach(&self.shared.context(), id, offset, length, events)
                .await;
        }

        self.retire_if_idle(&origin);
    }

    async fn handle_preload(
        &mut self,
        id: RequestId,
        origin: OriginId,
        byte_count: u64,
        reply: oneshot::Sender<Result<PreloadOutcome>>,
    ) {
        let op = Self::operation(&mut self.operations, &self.shared.store, &origin).await;

        if op.metadata().covers(0, byte_count) {
            debug!(origin = %origin, bytes = byte_count, "Preload already cached");
            let _ = reply.send(Ok(PreloadOutcome::AlreadyCached));
        } else {
            op.touch();
            op.attach_preload(&self.shared.context(), id, byte_count, reply)
                .await;
        }

        self.retire_if_idle(&origin);
    }

    async fn handle_transfer(&mut self, message: TransferMessage) {
        let TransferMessage {
            origin,
            transfer_id,
            event,
        } = message;

        let Some(op) = self.operations.get_mut(&origin) else {
            trace!(origin = %origin, transfer = transfer_id, "Dropping event for retired operation");
            return;
        };

        let outcome = op
            .handle_event(&self.shared.context(), transfer_id, event)
            .await;
        self.bytes_since_eviction += outcome.bytes_written;
        self.retire_if_idle(&origin);

        if outcome.transfer_finished
            || self.bytes_since_eviction >= self.config.eviction_check_bytes
        {
            self.enforce_size_budget().await;
        }
    }

    /// Write coalesced hit times back to the stored records.
    async fn flush_access_times(&mut self) {
        if self.access_updates.is_empty() {
            return;
        }
        let count = self.access_updates.len();

        for (origin, accessed) in self.access_updates.drain() {
            let result = match self.operations.get_mut(&origin) {
                Some(op) => {
                    op.touch();
                    self.shared.store.save(op.metadata()).await
                }
                None => match self.shared.store.load(&origin).await {
                    Some(mut metadata) => {
                        metadata.last_access = metadata.last_access.max(accessed);
                        self.shared.store.save(&metadata).await
                    }
                    // Evicted or cleared since the hit.
                    None => Ok(()),
                },
            };
            if let Err(e) = result {
                warn!(origin = %origin, error = %e, "Failed to persist access time");
            }
        }

        trace!(count, "Flushed access times");
    }

    /// Evict least recently used entries until the store fits its budget.
    async fn enforce_size_budget(&mut self) {
        self.bytes_since_eviction = 0;
        self.flush_access_times().await;

        let records: Vec<ResourceMetadata> = self.shared.store.enumerate_all().collect().await;
        let candidates: Vec<EvictionCandidate<OriginId>> = records
            .into_iter()
            .map(|record| {
                let live = self.operations.get(&record.origin);
                let current = live.map_or(&record, |op| op.metadata());
                EvictionCandidate {
                    size: current.covered_bytes(),
                    last_used: current.last_access,
                    pinned: live.is_some(),
                    key: record.origin.clone(),
                }
            })
            .collect();

        let plan = plan_eviction(candidates, self.config.max_size_bytes);
        if plan.is_empty() {
            return;
        }

        for origin in &plan.victims {
            match self.shared.store.delete(origin).await {
                Ok(()) => debug!(origin = %origin, "Evicted cached resource"),
                Err(e) => warn!(origin = %origin, error = %e, "Failed to evict cached resource"),
            }
        }

        info!(
            evicted = plan.victims.len(),
            before = plan.total_before,
            after = plan.total_after,
            budget = self.config.max_size_bytes,
            "Range cache trimmed"
        );
        if plan.total_after > self.config.max_size_bytes {
            warn!(
                size = plan.total_after,
                budget = self.config.max_size_bytes,
                "Range cache still over budget; remaining entries are in use"
            );
        }
    }

    async fn clear_all(&mut self) -> Result<()> {
        let cancelled = self.operations.len();
        for (_, mut op) in self.operations.drain() {
            op.cancel_all(CacheError::Cancelled);
        }
        self.stop_hit_readers();
        self.access_updates.clear();
        self.bytes_since_eviction = 0;

        self.shared.store.clear().await?;
        info!(cancelled, "Range cache cleared");
        Ok(())
    }

    fn stop_hit_readers(&mut self) {
        for (_, reader) in self.hit_readers.drain() {
            reader.cancel();
        }
    }

    async fn stats(&self) -> CacheStats {
        let records: Vec<ResourceMetadata> = self.shared.store.enumerate_all().collect().await;

        let mut stats = CacheStats {
            entries: records.len(),
            live_operations: self.operations.len(),
            ..Default::default()
        };
        for record in &records {
            let current = self
                .operations
                .get(&record.origin)
                .map_or(record, |op| op.metadata());
            stats.bytes += current.covered_bytes();
            if current.is_complete() {
                stats.complete_entries += 1;
            }
        }
        stats
    }

    async fn shutdown(&mut self) {
        for (origin, mut op) in self.operations.drain() {
            debug!(origin = %origin, state = ?op.state(), pending = op.pending_count(), "Cancelling operation on shutdown");
            op.cancel_all(CacheError::Shutdown);
        }
        self.stop_hit_readers();
        self.flush_access_times().await;
        info!(root = ?self.config.root, "Range cache shut down");
    }
}

/// Answer a command that arrived after shutdown began.
fn reject(command: Command) {
    match command {
        Command::Request { events, .. } => {
            let _ = events.send(RequestEvent::Failed(CacheError::Shutdown));
        }
        Command::Preload { reply, .. } => {
            let _ = reply.send(Err(CacheError::Shutdown));
        }
        Command::ContentInfo { reply, .. } => {
            let _ = reply.send(Err(CacheError::Shutdown));
        }
        Command::ClearAll { reply } => {
            let _ = reply.send(Err(CacheError::Shutdown));
        }
        Command::Shutdown { reply } => {
            let _ = reply.send(());
        }
        Command::Cancel { .. } | Command::Stats { .. } => {}
    }
}

/// Stream a fully covered interval from disk on its own task. Nothing is sent
/// once `cancel` fires; the token is cancelled when the reader ends.
fn serve_hit(
    path: PathBuf,
    range: ByteRange,
    info: ContentInfo,
    events: mpsc::UnboundedSender<RequestEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let _done = cancel.clone().drop_guard();
        if cancel.is_cancelled() {
            return;
        }
        let _ = events.send(RequestEvent::ContentInfo(info));

        let mut position = range.start;
        while position < range.end {
            let len = (range.end - position).min(DELIVERY_CHUNK_BYTES);
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                read = store::read_range(&path, position, len) => read,
            };
            if cancel.is_cancelled() {
                return;
            }
            match read {
                Ok(bytes) => {
                    if events
                        .send(RequestEvent::Data {
                            offset: position,
                            bytes,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    warn!(path = ?path, offset = position, error = %e, "Failed to read cached bytes");
                    let _ = events.send(RequestEvent::Failed(e.into()));
                    return;
                }
            }
            position += len;
        }

        if !cancel.is_cancelled() {
            let _ = events.send(RequestEvent::Finished);
        }
    });
}
