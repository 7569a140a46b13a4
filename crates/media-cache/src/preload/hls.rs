//! HLS package downloader.
//!
//! Resolves a master playlist to one variant, downloads every segment, init
//! map and key the media playlist references, and writes a copy of the
//! playlist whose URIs point at the local files.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use m3u8_rs::{MasterPlaylist, MediaPlaylist, Playlist, VariantStream, parse_playlist_res};
use reqwest::Client;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::config::{HttpConfig, PreloadConfig};
use crate::error::{CacheError, Result};
use crate::origin::OriginId;
use crate::preload::PACKAGE_ENTRY;
use crate::preload::fetcher::AssetFetcher;

/// A file referenced by the playlist and the name it is stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DownloadJob {
    pub url: Url,
    pub name: String,
}

pub struct HlsPackageFetcher {
    client: Client,
    request_timeout: Duration,
    segment_concurrency: usize,
    preferred_bitrate: Option<u64>,
}

impl HlsPackageFetcher {
    pub fn new(client: Client, http: &HttpConfig, preload: &PreloadConfig) -> Self {
        Self {
            client,
            request_timeout: http.request_timeout,
            segment_concurrency: preload.segment_concurrency.max(1),
            preferred_bitrate: preload.preferred_bitrate,
        }
    }

    async fn download(&self, url: &Url, cancel: &CancellationToken) -> Result<Bytes> {
        let request = async {
            let mut builder = self.client.get(url.clone());
            if !self.request_timeout.is_zero() {
                builder = builder.timeout(self.request_timeout);
            }
            let response = builder.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(CacheError::Upstream(format!(
                    "Server returned status code {status} for {url}"
                )));
            }
            Ok(response.bytes().await?)
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(CacheError::Cancelled),
            result = request => result,
        }
    }

    async fn download_job(
        &self,
        job: DownloadJob,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let data = self.download(&job.url, cancel).await?;
        fs::write(dest.join(&job.name), &data).await?;
        Ok(data.len() as u64)
    }

    async fn load_playlist(&self, url: &Url, cancel: &CancellationToken) -> Result<Playlist> {
        let bytes = self.download(url, cancel).await?;
        parse_playlist_res(&bytes)
            .map_err(|e| CacheError::Verification(format!("Failed to parse playlist {url}: {e}")))
    }

    /// The media playlist to package, following a master playlist once.
    async fn resolve_media(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<(MediaPlaylist, Url)> {
        match self.load_playlist(url, cancel).await? {
            Playlist::MediaPlaylist(playlist) => Ok((playlist, url.clone())),
            Playlist::MasterPlaylist(master) => {
                let variant = select_variant(&master, self.preferred_bitrate).ok_or_else(|| {
                    CacheError::Verification(format!("Master playlist {url} has no variants"))
                })?;
                let media_url = url.join(&variant.uri).map_err(|e| {
                    CacheError::Verification(format!(
                        "Could not join master URL with variant URI {}: {e}",
                        variant.uri
                    ))
                })?;
                debug!(bandwidth = variant.bandwidth, url = %media_url, "Selected variant");

                match self.load_playlist(&media_url, cancel).await? {
                    Playlist::MediaPlaylist(playlist) => Ok((playlist, media_url)),
                    Playlist::MasterPlaylist(_) => Err(CacheError::Verification(format!(
                        "Expected media playlist at {media_url}, got master"
                    ))),
                }
            }
        }
    }
}

#[async_trait]
impl AssetFetcher for HlsPackageFetcher {
    async fn fetch(
        &self,
        origin: &OriginId,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let url = origin
            .to_url()
            .ok_or_else(|| CacheError::Config(format!("Origin is not a URL: {origin}")))?;

        let (mut playlist, playlist_url) = self.resolve_media(&url, cancel).await?;
        if !playlist.end_list {
            return Err(CacheError::Verification(format!(
                "Playlist {playlist_url} is live and cannot be preloaded"
            )));
        }

        let jobs = localize_playlist(&mut playlist, &playlist_url)?;
        fs::create_dir_all(dest).await?;

        let file_count = jobs.len();
        let total_bytes: u64 = stream::iter(jobs)
            .map(|job| self.download_job(job, dest, cancel))
            .buffer_unordered(self.segment_concurrency)
            .try_fold(0, |total, len| async move { Ok(total + len) })
            .await?;

        let mut rewritten = Vec::new();
        playlist.write_to(&mut rewritten)?;
        fs::write(dest.join(PACKAGE_ENTRY), &rewritten).await?;

        info!(
            origin = %origin,
            files = file_count,
            bytes = total_bytes,
            "Downloaded HLS package"
        );
        Ok(PACKAGE_ENTRY.to_string())
    }
}

/// Pick a variant: closest to `preferred` bandwidth, otherwise the highest.
/// I-frame-only streams are never chosen.
pub(crate) fn select_variant(
    master: &MasterPlaylist,
    preferred: Option<u64>,
) -> Option<&VariantStream> {
    let playable = master.variants.iter().filter(|v| !v.is_i_frame);
    match preferred {
        Some(target) => playable.min_by_key(|v| v.bandwidth.abs_diff(target)),
        None => playable.max_by_key(|v| v.bandwidth),
    }
}

/// Rewrite every URI of `playlist` to a local file name and list the files
/// to download. A file referenced several times is fetched once.
pub(crate) fn localize_playlist(
    playlist: &mut MediaPlaylist,
    base: &Url,
) -> Result<Vec<DownloadJob>> {
    let mut localizer = Localizer {
        base,
        names: HashMap::new(),
        jobs: Vec::new(),
    };

    for segment in playlist.segments.iter_mut() {
        if let Some(map) = segment.map.as_mut() {
            localizer.localize(&mut map.uri, "init")?;
        }
        if let Some(uri) = segment.key.as_mut().and_then(|key| key.uri.as_mut()) {
            localizer.localize(uri, "key")?;
        }
        localizer.localize(&mut segment.uri, "seg")?;
    }

    Ok(localizer.jobs)
}

struct Localizer<'a> {
    base: &'a Url,
    names: HashMap<String, String>,
    jobs: Vec<DownloadJob>,
}

impl Localizer<'_> {
    fn localize(&mut self, uri: &mut String, prefix: &str) -> Result<()> {
        let url = self.base.join(uri).map_err(|e| {
            CacheError::Verification(format!("Invalid URI {uri} in playlist: {e}"))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CacheError::Verification(format!(
                "Unsupported URI scheme in playlist: {url}"
            )));
        }

        let name = match self.names.get(url.as_str()) {
            Some(name) => name.clone(),
            None => {
                let name = local_name(prefix, self.names.len(), &url);
                self.names.insert(url.to_string(), name.clone());
                self.jobs.push(DownloadJob {
                    url,
                    name: name.clone(),
                });
                name
            }
        };
        *uri = name;
        Ok(())
    }
}

fn local_name(prefix: &str, index: usize, url: &Url) -> String {
    let extension = url
        .path_segments()
        .and_then(|segments| segments.last())
        .and_then(|file| file.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("bin");
    format!("{prefix}-{index:05}.{extension}")
}
