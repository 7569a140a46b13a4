use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser)]
#[command(
    author = "hua0512 <https://github.com/hua0512>",
    version,
    about = "Media range cache and asset preloader",
    long_about = "Fetches byte ranges of remote media through a resumable on-disk cache\n\
                  and preloads complete HLS assets for offline playback.\n\
                  \n\
                  Both caches live under a single directory and keep their own\n\
                  size budgets; the least recently used entries are evicted first."
)]
pub struct CliArgs {
    /// Cache directory
    #[arg(
        short = 'c',
        long,
        default_value = "./media-cache",
        help = "Directory holding the range cache (ranges/) and preloaded assets (assets/)"
    )]
    pub cache_dir: PathBuf,

    /// JSON configuration file
    #[arg(
        long,
        help = "JSON file with range, preload and http settings. Command line options override it."
    )]
    pub config: Option<PathBuf>,

    /// Range cache budget with optional unit (B, KB, MB, GB, TB)
    #[arg(
        long,
        help = "Size budget of the range cache with optional unit (B, KB, MB, GB, TB). Examples: \"512MB\", \"2GB\""
    )]
    pub max_range_size: Option<String>,

    /// Asset cache budget with optional unit (B, KB, MB, GB, TB)
    #[arg(
        long,
        help = "Size budget of preloaded assets with optional unit (B, KB, MB, GB, TB). Examples: \"1GB\""
    )]
    pub max_asset_size: Option<String>,

    /// Concurrent asset downloads
    #[arg(long, help = "Maximum number of assets downloaded at the same time")]
    pub asset_concurrency: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long, global = true, help = "Enable detailed debug logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Read a byte range through the cache
    Fetch {
        /// Resource URL
        url: String,

        /// First byte to read
        #[arg(long, default_value = "0")]
        offset: u64,

        /// Number of bytes to read; defaults to the rest of the resource
        #[arg(long)]
        length: Option<u64>,

        /// Where to write the bytes; defaults to stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Make sure the beginning of a resource is cached
    Preload {
        /// Resource URL
        url: String,

        /// Bytes to cache from the start, with optional unit
        #[arg(long, default_value = "1MB")]
        bytes: String,
    },

    /// Show total length and content type of a resource
    Info {
        /// Resource URL
        url: String,
    },

    /// Download complete HLS assets and wait until they are verified
    Asset {
        /// Playlist URL(s)
        #[arg(required = true)]
        urls: Vec<String>,

        /// Preferred variant bandwidth in bits per second
        #[arg(long)]
        bitrate: Option<u64>,
    },

    /// Show cache usage
    Stats,

    /// Delete everything in both caches
    Clear,
}
