//! # Metadata Store
//!
//! Directory-backed persistence for [`ResourceMetadata`] records and the sparse
//! data files they describe:
//!
//! ```text
//! <root>/
//! ├── meta/<storage-key>.json   # one record per origin
//! └── data/<storage-key>.bin    # content bytes at their true offsets
//! ```

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::fs;
use tokio::io::{self, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_stream::wrappers::ReadDirStream;
use tracing::{debug, warn};

use crate::origin::OriginId;
use crate::range::metadata::ResourceMetadata;

const RECORD_EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct MetadataStore {
    root: PathBuf,
    meta_dir: PathBuf,
    data_dir: PathBuf,
}

impl MetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            meta_dir: root.join("meta"),
            data_dir: root.join("data"),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_initialized(&self) -> io::Result<()> {
        fs::create_dir_all(&self.meta_dir).await?;
        fs::create_dir_all(&self.data_dir).await?;
        Ok(())
    }

    fn record_path(&self, origin: &OriginId) -> PathBuf {
        self.meta_dir
            .join(format!("{}.{RECORD_EXTENSION}", origin.storage_key()))
    }

    pub fn data_path(&self, origin: &OriginId) -> PathBuf {
        self.data_dir.join(format!("{}.bin", origin.storage_key()))
    }

    /// Load the record for `origin`.
    ///
    /// Missing, unreadable and corrupt records all read as `None`; a corrupt
    /// record is removed together with its data file.
    pub async fn load(&self, origin: &OriginId) -> Option<ResourceMetadata> {
        let path = self.record_path(origin);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to read cache record");
                return None;
            }
        };

        match serde_json::from_slice::<ResourceMetadata>(&bytes) {
            Ok(metadata) if metadata.origin == *origin => Some(metadata),
            Ok(metadata) => {
                warn!(
                    path = ?path,
                    expected = %origin,
                    found = %metadata.origin,
                    "Cache record belongs to a different origin"
                );
                self.discard(origin).await;
                None
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to parse cache record");
                self.discard(origin).await;
                None
            }
        }
    }

    async fn discard(&self, origin: &OriginId) {
        if let Err(e) = self.delete(origin).await {
            warn!(origin = %origin, error = %e, "Failed to remove unusable cache record");
        }
    }

    /// Persist `metadata`, replacing any previous record atomically.
    pub async fn save(&self, metadata: &ResourceMetadata) -> io::Result<()> {
        let path = self.record_path(&metadata.origin);
        let json = serde_json::to_vec(metadata).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to serialize metadata: {e}"),
            )
        })?;

        // Write to a temporary file then rename so readers never observe a
        // half-written record.
        let temp_path = path.with_extension("json.tmp");
        if let Err(e) = fs::write(&temp_path, &json).await {
            warn!(path = ?temp_path, error = %e, "Failed to write cache record");
            return Err(e);
        }
        if let Err(e) = fs::rename(&temp_path, &path).await {
            warn!(from = ?temp_path, to = ?path, error = %e, "Failed to rename cache record");
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }
        Ok(())
    }

    /// Every readable record, re-read from the directory on each call.
    pub fn enumerate_all(&self) -> BoxStream<'static, ResourceMetadata> {
        let meta_dir = self.meta_dir.clone();
        stream::once(async move { fs::read_dir(&meta_dir).await })
            .filter_map(|dir| async move {
                match dir {
                    Ok(dir) => Some(ReadDirStream::new(dir)),
                    Err(e) => {
                        if e.kind() != io::ErrorKind::NotFound {
                            warn!(error = %e, "Failed to list cache records");
                        }
                        None
                    }
                }
            })
            .flatten()
            .filter_map(|entry| async move {
                let path = entry.ok()?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                    return None;
                }
                let bytes = fs::read(&path).await.ok()?;
                match serde_json::from_slice::<ResourceMetadata>(&bytes) {
                    Ok(metadata) => Some(metadata),
                    Err(e) => {
                        warn!(path = ?path, error = %e, "Skipping corrupt cache record");
                        None
                    }
                }
            })
            .boxed()
    }

    /// Remove the record and data file of `origin`. Missing files are fine.
    pub async fn delete(&self, origin: &OriginId) -> io::Result<()> {
        let record_result = fs::remove_file(self.record_path(origin)).await;
        let data_result = fs::remove_file(self.data_path(origin)).await;

        match (record_result, data_result) {
            (Err(e), _) if e.kind() != io::ErrorKind::NotFound => Err(e),
            (_, Err(e)) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Remove every record and data file, then recreate empty directories.
    pub async fn clear(&self) -> io::Result<()> {
        for dir in [&self.meta_dir, &self.data_dir] {
            match fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(dir = ?dir, error = %e, "Failed to remove cache directory");
                    return Err(e);
                }
            }
        }
        debug!(root = ?self.root, "Cleared range cache storage");
        self.ensure_initialized().await
    }
}

/// Open (or create) a data file for positioned writes without truncating it.
pub(crate) async fn open_for_write(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await
}

/// Write `data` at `offset`; gaps before it are left sparse.
pub(crate) async fn write_at(file: &mut fs::File, offset: u64, data: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    // tokio buffers writes on a background thread; flush so a read-back sees them.
    file.flush().await
}

/// Read exactly `length` bytes at `offset`.
pub(crate) async fn read_range(path: &Path, offset: u64, length: u64) -> io::Result<Bytes> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let length = usize::try_from(length)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "read length too large"))?;
    let mut buffer = BytesMut::zeroed(length);
    file.read_exact(&mut buffer).await?;
    Ok(buffer.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::range_set::ByteRange;

    fn origin(name: &str) -> OriginId {
        OriginId::new(format!("https://example.com/{name}"))
    }

    async fn store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        store.ensure_initialized().await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn save_then_load() {
        let (_dir, store) = store().await;
        let mut meta = ResourceMetadata::new(origin("a"));
        meta.total_length = 10;
        meta.record_range(ByteRange::new(0, 5));
        store.save(&meta).await.unwrap();

        let loaded = store.load(&origin("a")).await.unwrap();
        assert_eq!(loaded, meta);
        assert!(store.load(&origin("b")).await.is_none());
    }

    #[tokio::test]
    async fn corrupt_record_reads_as_miss() {
        let (_dir, store) = store().await;
        let o = origin("broken");
        fs::write(store.record_path(&o), b"{not json").await.unwrap();
        fs::write(store.data_path(&o), b"stale").await.unwrap();
        assert!(store.load(&o).await.is_none());
        assert!(!fs::try_exists(store.record_path(&o)).await.unwrap());
        assert!(!fs::try_exists(store.data_path(&o)).await.unwrap());
    }

    #[tokio::test]
    async fn save_leaves_no_temp_file() {
        let (_dir, store) = store().await;
        let meta = ResourceMetadata::new(origin("tmp"));
        store.save(&meta).await.unwrap();
        let temp = store.record_path(&meta.origin).with_extension("json.tmp");
        assert!(!fs::try_exists(&temp).await.unwrap());
    }

    #[tokio::test]
    async fn enumerate_skips_corrupt_and_temp_files() {
        let (_dir, store) = store().await;
        for name in ["a", "b", "c"] {
            store
                .save(&ResourceMetadata::new(origin(name)))
                .await
                .unwrap();
        }
        fs::write(store.meta_dir.join("junk.json"), b"[]").await.unwrap();
        fs::write(store.meta_dir.join("x.json.tmp"), b"{}").await.unwrap();

        let mut names: Vec<String> = store
            .enumerate_all()
            .map(|m| m.origin.to_string())
            .collect()
            .await;
        names.sort();
        assert_eq!(
            names,
            vec![
                "https://example.com/a",
                "https://example.com/b",
                "https://example.com/c"
            ]
        );

        // Restartable: a second pass sees the same records.
        assert_eq!(store.enumerate_all().count().await, 3);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, store) = store().await;
        let o = origin("gone");
        store.save(&ResourceMetadata::new(o.clone())).await.unwrap();
        fs::write(store.data_path(&o), b"abc").await.unwrap();

        store.delete(&o).await.unwrap();
        assert!(store.load(&o).await.is_none());
        assert!(!fs::try_exists(store.data_path(&o)).await.unwrap());
        store.delete(&o).await.unwrap();
    }

    #[tokio::test]
    async fn sparse_writes_read_back() {
        let (_dir, store) = store().await;
        let path = store.data_path(&origin("sparse"));
        let mut file = open_for_write(&path).await.unwrap();
        write_at(&mut file, 100, b"world").await.unwrap();
        write_at(&mut file, 0, b"hello").await.unwrap();

        assert_eq!(&read_range(&path, 0, 5).await.unwrap()[..], b"hello");
        assert_eq!(&read_range(&path, 100, 5).await.unwrap()[..], b"world");
        assert!(read_range(&path, 100, 10).await.is_err());
    }

    #[tokio::test]
    async fn clear_recreates_empty_storage() {
        let (_dir, store) = store().await;
        store
            .save(&ResourceMetadata::new(origin("a")))
            .await
            .unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.enumerate_all().count().await, 0);
        assert!(fs::try_exists(&store.data_dir).await.unwrap());
    }
}
