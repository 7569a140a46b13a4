//! # Asset Preload Manager
//!
//! Keeps a first-come queue of assets that are likely to be played soon and
//! downloads them with at most `max_concurrent` transfers at a time.
//!
//! Every download lands in `partial/<key>-<epoch>/`, is checked by the configured
//! [`AssetVerifier`] and only then renamed into `packages/<key>/`. A failed
//! download or verification removes the partial directory and marks the
//! origin rejected; it is retried only when enqueued again.
//!
//! Queue, active set and location map live behind one `parking_lot` mutex that
//! is never held across an await. Writing `locations.json` and eviction are
//! serialized by a separate async mutex.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use parking_lot::Mutex;
use tokio::fs;
use tokio::io;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{HttpConfig, PreloadConfig};
use crate::error::{CacheError, Result};
use crate::eviction::{EvictionCandidate, plan_eviction};
use crate::origin::OriginId;
use crate::preload::fetcher::{AssetFetcher, AssetVerifier};
use crate::preload::hls::HlsPackageFetcher;
use crate::preload::store::LocationStore;
use crate::preload::verify::PlaylistVerifier;
use crate::preload::{AssetLocation, PreloadEntry, PreloadEvent, PreloadState};
use crate::range::unix_millis;
use crate::transport::create_client;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreloadStats {
    pub queued: usize,
    pub active: usize,
    pub cached: usize,
    pub rejected: usize,
    pub cached_bytes: u64,
}

#[derive(Default)]
struct Registry {
    queue: VecDeque<OriginId>,
    active: HashMap<OriginId, CancellationToken>,
    entries: HashMap<OriginId, PreloadEntry>,
    locations: BTreeMap<OriginId, AssetLocation>,
    /// Most recent in-process lookup per origin.
    lookups: HashMap<OriginId, u64>,
    next_position: u64,
    /// Bumped by `clear_all`; downloads started earlier must not publish.
    epoch: u64,
}

impl Registry {
    fn admit(&mut self, origin: OriginId, state: PreloadState) {
        let position = self.next_position;
        self.next_position += 1;
        self.entries.insert(
            origin.clone(),
            PreloadEntry {
                origin,
                position,
                state,
            },
        );
    }

    fn set_state(&mut self, origin: &OriginId, state: PreloadState) {
        if let Some(entry) = self.entries.get_mut(origin) {
            entry.state = state;
        }
    }
}

struct Inner {
    config: PreloadConfig,
    fetcher: Arc<dyn AssetFetcher>,
    verifier: Arc<dyn AssetVerifier>,
    location_store: LocationStore,
    packages_dir: PathBuf,
    partial_dir: PathBuf,
    registry: Mutex<Registry>,
    persist_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<PreloadEvent>,
}

/// Handle to the whole-asset preloader. Cheap to clone.
#[derive(Clone)]
pub struct AssetPreloadManager {
    inner: Arc<Inner>,
}

impl AssetPreloadManager {
    /// Open (or create) the preload directory and restore verified packages.
    ///
    /// Leftover partial downloads are discarded, locations whose package is
    /// gone are dropped and package directories nobody points to are removed.
    pub async fn new(
        config: PreloadConfig,
        fetcher: Arc<dyn AssetFetcher>,
        verifier: Arc<dyn AssetVerifier>,
    ) -> Result<Self> {
        config.validate()?;

        let packages_dir = config.root.join("packages");
        let partial_dir = config.root.join("partial");
        fs::create_dir_all(&packages_dir).await?;
        reset_dir(&partial_dir).await?;

        let location_store = LocationStore::new(&config.root);
        let stored = location_store.load().await;
        let stored_count = stored.len();

        let mut registry = Registry::default();
        for (origin, location) in stored {
            if fs::try_exists(&location.entry).await.unwrap_or(false) {
                registry.admit(origin.clone(), PreloadState::Verified);
                registry.locations.insert(origin, location);
            } else {
                warn!(origin = %origin, package = ?location.package, "Dropping location of missing package");
            }
        }

        remove_orphan_packages(&packages_dir, &registry.locations).await;
        if registry.locations.len() != stored_count {
            location_store.save(&registry.locations).await?;
        }

        info!(
            root = ?config.root,
            packages = registry.locations.len(),
            max_size = config.max_size_bytes,
            max_concurrent = config.max_concurrent,
            "Starting preload manager"
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                fetcher,
                verifier,
                location_store,
                packages_dir,
                partial_dir,
                registry: Mutex::new(registry),
                persist_lock: tokio::sync::Mutex::new(()),
                events,
            }),
        })
    }

    /// Preloader for HLS packages over HTTP.
    pub async fn with_hls(config: PreloadConfig, http: &HttpConfig) -> Result<Self> {
        let client = create_client(http)?;
        let fetcher = HlsPackageFetcher::new(client, http, &config);
        Self::new(config, Arc::new(fetcher), Arc::new(PlaylistVerifier)).await
    }

    /// Queue origins that are neither cached, active nor already queued.
    /// Returns how many were accepted. Never blocks on I/O.
    pub fn enqueue<I>(&self, origins: I) -> usize
    where
        I: IntoIterator<Item = OriginId>,
    {
        let mut accepted = Vec::new();
        {
            let mut registry = self.inner.registry.lock();
            for origin in origins {
                let state = registry.entries.get(&origin).map(|e| e.state);
                if matches!(
                    state,
                    Some(PreloadState::Queued | PreloadState::Active | PreloadState::Verified)
                ) {
                    continue;
                }
                registry.admit(origin.clone(), PreloadState::Queued);
                registry.queue.push_back(origin.clone());
                accepted.push(origin);
            }
        }

        for origin in &accepted {
            debug!(origin = %origin, "Queued asset for preload");
            let _ = self.inner.events.send(PreloadEvent::Queued(origin.clone()));
        }
        self.inner.pump();
        accepted.len()
    }

    /// Playable entry point of a verified package. Counts as a use for
    /// eviction purposes.
    pub fn local_location(&self, origin: &OriginId) -> Option<PathBuf> {
        let mut registry = self.inner.registry.lock();
        let entry = registry.locations.get(origin).map(|l| l.entry.clone())?;
        registry.lookups.insert(origin.clone(), unix_millis());
        Some(entry)
    }

    /// Full location record, without touching recency.
    pub fn location(&self, origin: &OriginId) -> Option<AssetLocation> {
        self.inner.registry.lock().locations.get(origin).cloned()
    }

    pub fn is_cached(&self, origin: &OriginId) -> bool {
        self.inner.registry.lock().locations.contains_key(origin)
    }

    pub fn state(&self, origin: &OriginId) -> Option<PreloadState> {
        self.inner
            .registry
            .lock()
            .entries
            .get(origin)
            .map(|e| e.state)
    }

    /// Every known origin in acceptance order.
    pub fn entries(&self) -> Vec<PreloadEntry> {
        let mut entries: Vec<_> = self.inner.registry.lock().entries.values().cloned().collect();
        entries.sort_by_key(|e| e.position);
        entries
    }

    /// Drop a queued origin or abort an active download.
    pub fn cancel(&self, origin: &OriginId) -> bool {
        let mut registry = self.inner.registry.lock();

        if let Some(token) = registry.active.get(origin) {
            // The download task reports the cancellation once it has cleaned up.
            token.cancel();
            return true;
        }

        let before = registry.queue.len();
        registry.queue.retain(|queued| queued != origin);
        if registry.queue.len() == before {
            return false;
        }
        registry.entries.remove(origin);
        drop(registry);

        debug!(origin = %origin, "Removed asset from preload queue");
        let _ = self.inner.events.send(PreloadEvent::Cancelled(origin.clone()));
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PreloadEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> PreloadStats {
        let registry = self.inner.registry.lock();
        PreloadStats {
            queued: registry.queue.len(),
            active: registry.active.len(),
            cached: registry.locations.len(),
            rejected: registry
                .entries
                .values()
                .filter(|e| e.state == PreloadState::Rejected)
                .count(),
            cached_bytes: registry.locations.values().map(|l| l.size_bytes).sum(),
        }
    }

    /// Abort every download, forget every origin and delete all packages.
    pub async fn clear_all(&self) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.persist_lock.lock().await;

        let aborted = {
            let mut registry = inner.registry.lock();
            registry.epoch += 1;
            for token in registry.active.values() {
                token.cancel();
            }
            let aborted = registry.active.len() + registry.queue.len();
            registry.active.clear();
            registry.queue.clear();
            registry.entries.clear();
            registry.locations.clear();
            registry.lookups.clear();
            aborted
        };

        reset_dir(&inner.packages_dir).await?;
        reset_dir(&inner.partial_dir).await?;
        inner.location_store.save(&BTreeMap::new()).await?;

        info!(aborted, root = ?inner.config.root, "Preload cache cleared");
        Ok(())
    }

    /// Abort active downloads and drop the queue. Verified packages stay.
    pub fn shutdown(&self) {
        let mut registry = self.inner.registry.lock();
        for origin in std::mem::take(&mut registry.queue) {
            registry.entries.remove(&origin);
        }
        for token in registry.active.values() {
            token.cancel();
        }
        debug!(active = registry.active.len(), "Preload manager shutting down");
    }
}

impl Inner {
    /// Start queued downloads while slots are free.
    fn pump(self: &Arc<Self>) {
        let mut started = Vec::new();
        {
            let mut registry = self.registry.lock();
            while registry.active.len() < self.config.max_concurrent {
                let Some(origin) = registry.queue.pop_front() else {
                    break;
                };
                let token = CancellationToken::new();
                registry.active.insert(origin.clone(), token.clone());
                registry.set_state(&origin, PreloadState::Active);
                started.push((origin, token, registry.epoch));
            }
        }

        for (origin, token, epoch) in started {
            let _ = self.events.send(PreloadEvent::Started(origin.clone()));
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.run(origin, token, epoch).await;
            });
        }
    }

    async fn run(self: Arc<Self>, origin: OriginId, cancel: CancellationToken, epoch: u64) {
        let key = origin.storage_key();
        // Per-epoch name: a download abandoned by `clear_all` may still be
        // cleaning up while the same origin downloads again.
        let partial = self.partial_dir.join(format!("{key}-{epoch}"));
        debug!(origin = %origin, partial = ?partial, "Downloading asset");

        let outcome = match self.download(&origin, &partial, &cancel).await {
            Ok(entry) => self.promote(&origin, &key, &partial, &entry, epoch).await,
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            remove_dir_if_exists(&partial).await;
            self.fail(&origin, e, epoch);
        }

        self.pump();
    }

    async fn download(
        &self,
        origin: &OriginId,
        partial: &Path,
        cancel: &CancellationToken,
    ) -> Result<String> {
        remove_dir_if_exists(partial).await;
        fs::create_dir_all(partial).await?;

        let entry = self.fetcher.fetch(origin, partial, cancel).await?;
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        self.verifier.verify(partial, &entry).await?;
        Ok(entry)
    }

    fn is_current(&self, origin: &OriginId, epoch: u64) -> bool {
        let registry = self.registry.lock();
        registry.epoch == epoch
            && registry
                .active
                .get(origin)
                .is_some_and(|token| !token.is_cancelled())
    }

    /// Move a verified download into `packages/` and record its location.
    async fn promote(
        &self,
        origin: &OriginId,
        key: &str,
        partial: &Path,
        entry: &str,
        epoch: u64,
    ) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        if !self.is_current(origin, epoch) {
            return Err(CacheError::Cancelled);
        }

        let package = self.packages_dir.join(key);
        remove_dir_if_exists(&package).await;
        fs::rename(partial, &package).await?;
        let size_bytes = dir_size(&package).await?;

        let location = AssetLocation {
            entry: package.join(entry),
            package,
            size_bytes,
            verified_at: unix_millis(),
        };
        let entry_path = location.entry.clone();
        {
            let mut registry = self.registry.lock();
            registry.active.remove(origin);
            registry.lookups.remove(origin);
            registry.set_state(origin, PreloadState::Verified);
            registry.locations.insert(origin.clone(), location);
        }
        self.persist_locations().await;

        info!(origin = %origin, size_bytes, "Asset verified and cached");
        let _ = self.events.send(PreloadEvent::Verified {
            origin: origin.clone(),
            location: entry_path,
            size_bytes,
        });

        self.enforce_size_budget().await;
        Ok(())
    }

    fn fail(&self, origin: &OriginId, err: CacheError, epoch: u64) {
        let mut registry = self.registry.lock();
        if registry.epoch != epoch {
            return;
        }
        registry.active.remove(origin);

        if err.is_cancelled() {
            registry.entries.remove(origin);
            drop(registry);
            debug!(origin = %origin, "Asset download cancelled");
            let _ = self.events.send(PreloadEvent::Cancelled(origin.clone()));
        } else {
            registry.set_state(origin, PreloadState::Rejected);
            drop(registry);
            warn!(origin = %origin, error = %err, "Asset rejected");
            let _ = self.events.send(PreloadEvent::Rejected {
                origin: origin.clone(),
                reason: err.to_string(),
            });
        }
    }

    async fn persist_locations(&self) {
        let snapshot = self.registry.lock().locations.clone();
        if let Err(e) = self.location_store.save(&snapshot).await {
            warn!(path = ?self.location_store.path(), error = %e, "Failed to persist location map");
        }
    }

    /// Evict least recently used packages until under budget. Callers hold
    /// `persist_lock`.
    async fn enforce_size_budget(&self) {
        let (locations, lookups) = {
            let registry = self.registry.lock();
            (registry.locations.clone(), registry.lookups.clone())
        };

        let mut candidates = Vec::with_capacity(locations.len());
        for (origin, location) in locations {
            let size = dir_size(&location.package)
                .await
                .unwrap_or(location.size_bytes);
            let modified = modified_millis(&location.package)
                .await
                .unwrap_or(location.verified_at);
            candidates.push(EvictionCandidate {
                last_used: lookups.get(&origin).copied().unwrap_or(modified),
                key: origin,
                size,
                pinned: false,
            });
        }

        let plan = plan_eviction(candidates, self.config.max_size_bytes);
        if plan.is_empty() {
            return;
        }

        for origin in &plan.victims {
            let package = {
                let mut registry = self.registry.lock();
                registry.entries.remove(origin);
                registry.lookups.remove(origin);
                registry.locations.remove(origin).map(|l| l.package)
            };
            if let Some(package) = package {
                remove_dir_if_exists(&package).await;
            }
            debug!(origin = %origin, "Evicted preloaded asset");
        }
        self.persist_locations().await;

        // Subscribers only hear about evictions the location map already reflects.
        for origin in &plan.victims {
            let _ = self.events.send(PreloadEvent::Evicted(origin.clone()));
        }

        info!(
            evicted = plan.victims.len(),
            before = plan.total_before,
            after = plan.total_after,
            budget = self.config.max_size_bytes,
            "Preload cache trimmed"
        );
    }
}

async fn remove_dir_if_exists(path: &Path) {
    match fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?path, error = %e, "Failed to remove directory"),
    }
}

async fn reset_dir(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::create_dir_all(path).await
}

async fn remove_orphan_packages(packages_dir: &Path, locations: &BTreeMap<OriginId, AssetLocation>) {
    let known: HashSet<&Path> = locations.values().map(|l| l.package.as_path()).collect();
    let Ok(mut dir) = fs::read_dir(packages_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = dir.next_entry().await {
        let path = entry.path();
        if !known.contains(path.as_path()) {
            debug!(path = ?path, "Removing unreferenced package");
            remove_dir_if_exists(&path).await;
        }
    }
}

/// Sum of all file sizes below `path`.
async fn dir_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

async fn modified_millis(path: &Path) -> Option<u64> {
    let modified = fs::metadata(path).await.ok()?.modified().ok()?;
    Some(modified.duration_since(UNIX_EPOCH).ok()?.as_millis() as u64)
}
