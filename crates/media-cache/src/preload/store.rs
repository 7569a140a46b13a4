use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io;
use tracing::warn;

use crate::origin::OriginId;
use crate::preload::AssetLocation;

const LOCATIONS_FILE: &str = "locations.json";

/// Persisted origin → package map (`locations.json`).
#[derive(Debug, Clone)]
pub struct LocationStore {
    path: PathBuf,
}

impl LocationStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            path: root.as_ref().join(LOCATIONS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the map. A missing or unreadable file is an empty map.
    pub async fn load(&self) -> BTreeMap<OriginId, AssetLocation> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Failed to read location map");
                return BTreeMap::new();
            }
        };

        serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            warn!(path = ?self.path, error = %e, "Location map is corrupt, starting empty");
            BTreeMap::new()
        })
    }

    pub async fn save(&self, locations: &BTreeMap<OriginId, AssetLocation>) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(locations)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &json).await?;
        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }
        Ok(())
    }
}
