use std::collections::HashSet;
use std::path::Path;

use clap::Parser;
use media_cache::{MediaCache, MediaCacheConfig, OriginId, PreloadEvent, PreloadState, RequestEvent};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

mod cli;
mod error;
mod utils;

use cli::{CliArgs, Command};
use error::AppError;
use utils::{format_bytes, parse_size};

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();

    // Logs go to stderr so fetched bytes can be piped from stdout
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(e.to_string()))?;

    let mut config = load_config(&args).await?;
    if let Command::Asset {
        bitrate: Some(bitrate),
        ..
    } = &args.command
    {
        config.preload.preferred_bitrate = Some(*bitrate);
    }
    info!(
        "Range budget: {}, asset budget: {}, asset concurrency: {}",
        format_bytes(config.range.max_size_bytes),
        format_bytes(config.preload.max_size_bytes),
        config.preload.max_concurrent
    );

    let cache = MediaCache::new(config).await?;
    let result = run(&cache, args.command).await;
    cache.shutdown().await;
    result
}

async fn load_config(args: &CliArgs) -> Result<MediaCacheConfig, AppError> {
    let config = match &args.config {
        Some(path) => {
            let raw = tokio::fs::read(path).await?;
            serde_json::from_slice::<MediaCacheConfig>(&raw)?
        }
        None => MediaCacheConfig::default(),
    };

    let mut config = config.with_root(&args.cache_dir);
    if let Some(size) = &args.max_range_size {
        config.range.max_size_bytes = parse_size(size)?;
    }
    if let Some(size) = &args.max_asset_size {
        config.preload.max_size_bytes = parse_size(size)?;
    }
    if let Some(concurrency) = args.asset_concurrency {
        config.preload.max_concurrent = concurrency;
    }
    config.validate()?;
    Ok(config)
}

async fn run(cache: &MediaCache, command: Command) -> Result<(), AppError> {
    match command {
        Command::Fetch {
            url,
            offset,
            length,
            output,
        } => fetch(cache, &parse_origin(&url)?, offset, length, output.as_deref()).await,
        Command::Preload { url, bytes } => {
            let origin = parse_origin(&url)?;
            let outcome = cache.range().preload(&origin, parse_size(&bytes)?).await?;
            info!(origin = %origin, outcome = ?outcome, "Preload finished");
            Ok(())
        }
        Command::Info { url } => {
            let info = cache.range().content_info(&parse_origin(&url)?).await?;
            println!("length:        {} ({})", info.total_length, format_bytes(info.total_length));
            println!("content-type:  {}", info.content_type);
            println!("accepts range: {}", info.accepts_ranges);
            Ok(())
        }
        Command::Asset { urls, .. } => {
            let origins = urls
                .iter()
                .map(|url| parse_origin(url))
                .collect::<Result<Vec<_>, _>>()?;
            preload_assets(cache, origins).await
        }
        Command::Stats => {
            let range = cache.range().stats().await?;
            let assets = cache.preload().stats();
            println!(
                "ranges: {} entries ({} complete), {}",
                range.entries,
                range.complete_entries,
                format_bytes(range.bytes)
            );
            println!(
                "assets: {} cached, {} rejected, {}",
                assets.cached,
                assets.rejected,
                format_bytes(assets.cached_bytes)
            );
            Ok(())
        }
        Command::Clear => {
            cache.clear_all().await?;
            info!("Cache cleared");
            Ok(())
        }
    }
}

fn parse_origin(url: &str) -> Result<OriginId, AppError> {
    OriginId::from_url(url).map_err(|e| AppError::InvalidInput(format!("{url}: {e}")))
}

async fn fetch(
    cache: &MediaCache,
    origin: &OriginId,
    offset: u64,
    length: Option<u64>,
    output: Option<&Path>,
) -> Result<(), AppError> {
    let length = match length {
        Some(length) => length,
        None => {
            let info = cache.range().content_info(origin).await?;
            info.total_length.checked_sub(offset).ok_or_else(|| {
                AppError::InvalidInput(format!(
                    "Offset {offset} is past the end of the resource ({} bytes)",
                    info.total_length
                ))
            })?
        }
    };

    let mut writer: Box<dyn AsyncWrite + Unpin + Send> = match output {
        Some(path) => Box::new(tokio::fs::File::create(path).await?),
        None => Box::new(tokio::io::stdout()),
    };

    let mut request = cache.range().request(origin, offset, length);
    let mut written = 0u64;
    while let Some(event) = request.next_event().await {
        match event {
            RequestEvent::ContentInfo(info) => {
                info!(length = info.total_length, content_type = %info.content_type, "Resource info");
            }
            RequestEvent::Data { bytes, .. } => {
                writer.write_all(&bytes).await?;
                written += bytes.len() as u64;
            }
            RequestEvent::Finished => break,
            RequestEvent::Failed(e) => return Err(e.into()),
        }
    }
    writer.flush().await?;

    info!(origin = %origin, offset, bytes = written, "Fetch finished");
    Ok(())
}

async fn preload_assets(cache: &MediaCache, origins: Vec<OriginId>) -> Result<(), AppError> {
    let preload = cache.preload();
    let mut events = preload.subscribe();

    let mut waiting: HashSet<OriginId> = origins
        .iter()
        .filter(|origin| !preload.is_cached(origin))
        .cloned()
        .collect();
    preload.enqueue(origins.iter().cloned());

    let mut rejected = 0usize;
    while !waiting.is_empty() {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed preload events");
                waiting.retain(|origin| {
                    matches!(
                        preload.state(origin),
                        Some(PreloadState::Queued | PreloadState::Active)
                    )
                });
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match &event {
            PreloadEvent::Started(origin) => info!(origin = %origin, "Downloading asset"),
            PreloadEvent::Verified {
                origin, size_bytes, ..
            } => {
                info!(origin = %origin, size = %format_bytes(*size_bytes), "Asset ready");
                waiting.remove(origin);
            }
            PreloadEvent::Rejected { origin, reason } => {
                warn!(origin = %origin, reason = %reason, "Asset rejected");
                rejected += 1;
                waiting.remove(origin);
            }
            PreloadEvent::Cancelled(origin) => {
                waiting.remove(origin);
            }
            PreloadEvent::Queued(_) | PreloadEvent::Evicted(_) => {}
        }
    }

    for origin in &origins {
        match preload.local_location(origin) {
            Some(location) => println!("{origin}\t{}", location.display()),
            None => println!("{origin}\t-"),
        }
    }

    if rejected > 0 {
        return Err(AppError::InvalidInput(format!(
            "{rejected} of {} assets failed verification",
            origins.len()
        )));
    }
    Ok(())
}
