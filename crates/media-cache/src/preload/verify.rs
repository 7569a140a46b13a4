use std::collections::BTreeSet;
use std::path::{Component, Path};

use async_trait::async_trait;
use m3u8_rs::{MediaPlaylist, Playlist, parse_playlist_res};
use tokio::fs;
use tracing::debug;

use crate::error::{CacheError, Result};
use crate::preload::fetcher::AssetVerifier;

/// Accepts a package whose playlist is a finished VOD media playlist with at
/// least one segment, and whose every referenced file is present and
/// non-empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaylistVerifier;

#[async_trait]
impl AssetVerifier for PlaylistVerifier {
    async fn verify(&self, package: &Path, entry: &str) -> Result<()> {
        let path = package.join(entry);
        let bytes = fs::read(&path).await.map_err(|e| {
            CacheError::Verification(format!("Cannot read playlist {}: {e}", path.display()))
        })?;

        let playlist = match parse_playlist_res(&bytes) {
            Ok(Playlist::MediaPlaylist(playlist)) => playlist,
            Ok(Playlist::MasterPlaylist(_)) => {
                return Err(CacheError::Verification(
                    "Expected a media playlist, found a master playlist".to_string(),
                ));
            }
            Err(e) => {
                return Err(CacheError::Verification(format!(
                    "Failed to parse playlist {}: {e}",
                    path.display()
                )));
            }
        };

        if playlist.segments.is_empty() {
            return Err(CacheError::Verification("Playlist has no segments".to_string()));
        }
        if !playlist.end_list {
            return Err(CacheError::Verification(
                "Playlist is not a finished VOD playlist".to_string(),
            ));
        }

        let files = referenced_files(&playlist);
        for file in &files {
            if !is_local_name(file) {
                return Err(CacheError::Verification(format!(
                    "Playlist references a non-local file: {file}"
                )));
            }
            match fs::metadata(package.join(file)).await {
                Ok(meta) if meta.is_file() && meta.len() > 0 => {}
                Ok(_) => {
                    return Err(CacheError::Verification(format!(
                        "Referenced file is empty: {file}"
                    )));
                }
                Err(e) => {
                    return Err(CacheError::Verification(format!(
                        "Referenced file is missing: {file} ({e})"
                    )));
                }
            }
        }

        debug!(package = ?package, files = files.len(), "Package verified");
        Ok(())
    }
}

fn referenced_files(playlist: &MediaPlaylist) -> BTreeSet<&str> {
    let mut files = BTreeSet::new();
    for segment in &playlist.segments {
        files.insert(segment.uri.as_str());
        if let Some(map) = &segment.map {
            files.insert(map.uri.as_str());
        }
        if let Some(uri) = segment.key.as_ref().and_then(|key| key.uri.as_deref()) {
            files.insert(uri);
        }
    }
    files
}

/// A plain relative path that stays inside the package.
fn is_local_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains("://")
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYLIST: &str = "#EXTM3U
#EXT-X-TARGETDURATION:6
#EXT-X-PLAYLIST-TYPE:VOD
#EXTINF:6.0,
seg-00000.ts
#EXTINF:6.0,
seg-00001.ts
#EXT-X-ENDLIST
";

    async fn package(playlist: &str, files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.m3u8"), playlist).await.unwrap();
        for (name, data) in files {
            fs::write(dir.path().join(name), data).await.unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn accepts_complete_package() {
        let dir = package(PLAYLIST, &[("seg-00000.ts", "aaaa"), ("seg-00001.ts", "bbbb")]).await;
        PlaylistVerifier.verify(dir.path(), "index.m3u8").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_missing_segment() {
        let dir = package(PLAYLIST, &[("seg-00000.ts", "aaaa")]).await;
        let err = PlaylistVerifier.verify(dir.path(), "index.m3u8").await.unwrap_err();
        assert!(matches!(err, CacheError::Verification(ref msg) if msg.contains("seg-00001.ts")));
    }

    #[tokio::test]
    async fn rejects_empty_segment() {
        let dir = package(PLAYLIST, &[("seg-00000.ts", "aaaa"), ("seg-00001.ts", "")]).await;
        assert!(PlaylistVerifier.verify(dir.path(), "index.m3u8").await.is_err());
    }

    #[tokio::test]
    async fn rejects_live_playlist() {
        let live = PLAYLIST.replace("#EXT-X-ENDLIST\n", "").replace("#EXT-X-PLAYLIST-TYPE:VOD\n", "");
        let dir = package(&live, &[("seg-00000.ts", "aaaa"), ("seg-00001.ts", "bbbb")]).await;
        assert!(PlaylistVerifier.verify(dir.path(), "index.m3u8").await.is_err());
    }

    #[tokio::test]
    async fn rejects_garbage_and_missing_playlist() {
        let dir = package("not a playlist", &[]).await;
        assert!(PlaylistVerifier.verify(dir.path(), "index.m3u8").await.is_err());
        assert!(PlaylistVerifier.verify(dir.path(), "absent.m3u8").await.is_err());
    }

    #[test]
    fn local_names() {
        assert!(is_local_name("seg-00001.ts"));
        assert!(!is_local_name("../escape.ts"));
        assert!(!is_local_name("/etc/passwd"));
        assert!(!is_local_name("https://cdn.example.com/seg.ts"));
    }
}
