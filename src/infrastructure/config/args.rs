use super::app_config::LogLevel;
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::OnceCell;

use crate::domain::entities::{
    CachePolicy, CacheTier, ImageSource, LoadRequest, Priority, StreamSource, Transformation,
};

#[derive(Debug, Parser)]
#[command(
    name = "imgpipe",
    version,
    about = "Load images through a deduplicating memory and disk cache",
    long_about = None
)]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH")]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Maximum loads running at once.
    #[arg(long, value_name = "N")]
    pub max_concurrent: Option<usize>,

    /// Disk cache directory.
    #[arg(long, value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Directory `bundle:` sources resolve against.
    #[arg(long, value_name = "PATH")]
    pub bundle_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load images and report where each one came from.
    Load(LoadArgs),
    /// Warm the caches without displaying anything.
    Preload(LoadArgs),
    /// Download remote images to the disk cache without decoding.
    Download {
        /// Image URLs.
        #[arg(required = true, value_name = "URL")]
        sources: Vec<String>,

        /// Scheduling priority.
        #[arg(long, value_enum)]
        priority: Option<Priority>,
    },
    /// Remove cached entries for the given sources.
    Invalidate {
        /// Image sources.
        #[arg(required = true, value_name = "SOURCE")]
        sources: Vec<String>,

        /// Cache tier to invalidate.
        #[arg(long, value_enum, default_value_t = CacheTier::All)]
        tier: CacheTier,

        #[command(flatten)]
        transform: TransformArgs,
    },
    /// Clear a cache tier.
    Clear {
        /// Cache tier to clear.
        #[arg(long, value_enum, default_value_t = CacheTier::All)]
        tier: CacheTier,
    },
    /// Show cache statistics.
    Stats {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
}

/// Arguments shared by `load` and `preload`.
#[derive(Debug, Args)]
pub struct LoadArgs {
    /// Image sources: URL, file path, `bundle:NAME`, or `-` for stdin.
    #[arg(required = true, value_name = "SOURCE")]
    pub sources: Vec<String>,

    /// Scheduling priority.
    #[arg(long, value_enum)]
    pub priority: Option<Priority>,

    /// Cache tiers to use.
    #[arg(long, value_enum)]
    pub cache: Option<CachePolicy>,

    #[command(flatten)]
    pub transform: TransformArgs,
}

/// Options that change what is cached, and so the cache key.
#[derive(Debug, Default, Args)]
pub struct TransformArgs {
    /// Downsample to fit within the given size.
    #[arg(long, value_name = "WxH")]
    pub downsample: Option<Size>,

    /// Convert to grayscale.
    #[arg(long)]
    pub grayscale: bool,

    /// Cache key replacing the source identity.
    #[arg(long, value_name = "KEY")]
    pub cache_key: Option<String>,
}

impl TransformArgs {
    /// Applies the options to a request.
    #[must_use]
    pub fn apply(&self, mut request: LoadRequest) -> LoadRequest {
        if let Some(key) = &self.cache_key {
            request = request.with_cache_key(key.clone());
        }
        if let Some(size) = self.downsample {
            request = request.with_downsample(size.width, size.height);
        }
        if self.grayscale {
            request = request.with_transformation(Transformation::Grayscale);
        }
        request
    }
}

impl LoadArgs {
    /// Builds one request per source.
    #[must_use]
    pub fn requests(&self) -> Vec<LoadRequest> {
        self.sources
            .iter()
            .map(|raw| {
                let mut request = self.transform.apply(LoadRequest::new(parse_source(raw)));
                if let Some(priority) = self.priority {
                    request = request.with_priority(priority);
                }
                if let Some(cache) = self.cache {
                    request = request.with_cache(cache);
                }
                request
            })
            .collect()
    }
}

/// Target size given as `WIDTHxHEIGHT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl FromStr for Size {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (width, height) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{s}'"))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| format!("invalid dimension '{v}'"))
        };
        Ok(Self {
            width: parse(width)?,
            height: parse(height)?,
        })
    }
}

/// Parses a CLI source argument. `-` reads the image from stdin.
#[must_use]
pub fn parse_source(raw: &str) -> ImageSource {
    if raw == "-" {
        return ImageSource::Stream(stdin_stream());
    }
    match raw.parse::<ImageSource>() {
        Ok(source) => source,
        Err(never) => match never {},
    }
}

fn stdin_stream() -> StreamSource {
    // Stdin can only be drained once, later opens reuse the bytes.
    let buffer: Arc<OnceCell<Bytes>> = Arc::new(OnceCell::new());
    StreamSource::new("stdin", move || {
        let buffer = buffer.clone();
        async move {
            buffer
                .get_or_try_init(|| async {
                    let mut data = Vec::new();
                    tokio::io::stdin().read_to_end(&mut data).await?;
                    Ok::<_, std::io::Error>(Bytes::from(data))
                })
                .await
                .cloned()
        }
    })
}
