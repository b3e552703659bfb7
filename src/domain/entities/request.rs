//! Image load requests and their parameters.

use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::domain::errors::LoadError;
use crate::domain::ports::{ErrorObserver, FinishObserver, LoadObserver, SuccessObserver};

use super::image::LoadedImage;
use super::task::WorkHandle;

/// Opens a caller-provided byte stream.
pub type StreamOpener = Arc<dyn Fn() -> BoxFuture<'static, std::io::Result<Bytes>> + Send + Sync>;

/// A byte stream source with a stable identity.
#[derive(Clone)]
pub struct StreamSource {
    id: String,
    open: StreamOpener,
}

impl StreamSource {
    /// Creates a stream source. `id` must identify the content, it is used
    /// as the cache identity.
    pub fn new<F, Fut>(id: impl Into<String>, open: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::io::Result<Bytes>> + Send + 'static,
    {
        Self {
            id: id.into(),
            open: Arc::new(move || Box::pin(open())),
        }
    }

    /// Returns the stream identity.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Reads the stream to completion.
    ///
    /// # Errors
    /// Returns the opener's I/O error.
    pub async fn open(&self) -> std::io::Result<Bytes> {
        (self.open)().await
    }
}

impl std::fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSource")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Where an image comes from.
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// Remote HTTP(S) resource.
    Url(String),
    /// Local file path.
    File(PathBuf),
    /// Resource relative to the configured bundle directory.
    Bundle(String),
    /// Caller-provided byte stream.
    Stream(StreamSource),
}

/// Discriminant of [`ImageSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Remote HTTP(S) resource.
    Url,
    /// Local file path.
    File,
    /// Bundled resource.
    Bundle,
    /// Byte stream.
    Stream,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Url => write!(f, "url"),
            Self::File => write!(f, "file"),
            Self::Bundle => write!(f, "bundle"),
            Self::Stream => write!(f, "stream"),
        }
    }
}

impl ImageSource {
    /// Returns the kind of this source.
    #[must_use]
    pub const fn kind(&self) -> SourceKind {
        match self {
            Self::Url(_) => SourceKind::Url,
            Self::File(_) => SourceKind::File,
            Self::Bundle(_) => SourceKind::Bundle,
            Self::Stream(_) => SourceKind::Stream,
        }
    }

    /// Returns true for stream sources.
    #[must_use]
    pub const fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    /// Returns the path or URL. Streams have none.
    #[must_use]
    pub fn path(&self) -> Option<String> {
        match self {
            Self::Url(url) => Some(url.clone()),
            Self::File(path) => Some(path.to_string_lossy().into_owned()),
            Self::Bundle(name) => Some(name.clone()),
            Self::Stream(_) => None,
        }
    }

    /// Returns the identity string the cache key is derived from.
    #[must_use]
    pub fn identity(&self) -> String {
        match self {
            Self::Url(url) => format!("url:{url}"),
            Self::File(path) => format!("file:{}", path.display()),
            Self::Bundle(name) => format!("bundle:{name}"),
            Self::Stream(stream) => format!("stream:{}", stream.id()),
        }
    }
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Url(url) => write!(f, "{url}"),
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Bundle(name) => write!(f, "bundle:{name}"),
            Self::Stream(stream) => write!(f, "stream:{}", stream.id()),
        }
    }
}

impl FromStr for ImageSource {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            Ok(Self::Url(trimmed.to_string()))
        } else if let Some(name) = trimmed.strip_prefix("bundle:") {
            Ok(Self::Bundle(name.to_string()))
        } else {
            Ok(Self::File(PathBuf::from(trimmed)))
        }
    }
}

/// Scheduling priority. Higher priorities are dequeued first.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Lowest priority.
    Lowest,
    /// Low priority, the default for preloads.
    Low,
    /// Normal priority.
    #[default]
    Normal,
    /// High priority.
    High,
    /// Highest priority.
    Highest,
}

/// Which cache tiers a request reads from and writes to.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Bypass both tiers.
    None,
    /// Decoded images in memory only.
    Memory,
    /// Raw bytes on disk only.
    Disk,
    /// Both tiers.
    #[default]
    All,
}

impl CachePolicy {
    /// Returns true if the memory tier participates.
    #[must_use]
    pub const fn uses_memory(self) -> bool {
        matches!(self, Self::Memory | Self::All)
    }

    /// Returns true if the disk tier participates.
    #[must_use]
    pub const fn uses_disk(self) -> bool {
        matches!(self, Self::Disk | Self::All)
    }

    /// Combines two policies so that every tier either one uses is used.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        match (
            self.uses_memory() || other.uses_memory(),
            self.uses_disk() || other.uses_disk(),
        ) {
            (true, true) => Self::All,
            (true, false) => Self::Memory,
            (false, true) => Self::Disk,
            (false, false) => Self::None,
        }
    }

    /// Tiers used by `self` but not by `other`.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        match (
            self.uses_memory() && !other.uses_memory(),
            self.uses_disk() && !other.uses_disk(),
        ) {
            (true, true) => Self::All,
            (true, false) => Self::Memory,
            (false, true) => Self::Disk,
            (false, false) => Self::None,
        }
    }
}

/// Cache tier targeted by invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// Memory tier.
    Memory,
    /// Disk tier.
    Disk,
    /// Both tiers.
    All,
}

impl CacheTier {
    /// Returns true if the memory tier is targeted.
    #[must_use]
    pub const fn includes_memory(self) -> bool {
        matches!(self, Self::Memory | Self::All)
    }

    /// Returns true if the disk tier is targeted.
    #[must_use]
    pub const fn includes_disk(self) -> bool {
        matches!(self, Self::Disk | Self::All)
    }
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Disk => write!(f, "disk"),
            Self::All => write!(f, "all"),
        }
    }
}

/// Post-decode image transformation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transformation {
    /// Fit inside the given bounds, preserving aspect ratio.
    Downsample {
        /// Maximum width.
        width: u32,
        /// Maximum height.
        height: u32,
    },
    /// Convert to grayscale.
    Grayscale,
    /// Mirror left to right.
    FlipHorizontal,
    /// Mirror top to bottom.
    FlipVertical,
    /// Rotate 90 degrees clockwise.
    Rotate90,
    /// Gaussian blur.
    Blur {
        /// Blur radius.
        sigma: f32,
    },
}

impl Transformation {
    /// Returns the identifier mixed into the cache key.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::Downsample { width, height } => format!("downsample:{width}x{height}"),
            Self::Grayscale => "grayscale".to_string(),
            Self::FlipHorizontal => "fliph".to_string(),
            Self::FlipVertical => "flipv".to_string(),
            Self::Rotate90 => "rotate90".to_string(),
            Self::Blur { sigma } => format!("blur:{sigma}"),
        }
    }

    /// Applies the transformation.
    #[must_use]
    pub fn apply(&self, image: image::DynamicImage) -> image::DynamicImage {
        match self {
            Self::Downsample { width, height } => {
                if image.width() > *width || image.height() > *height {
                    image.resize(*width, *height, image::imageops::FilterType::Lanczos3)
                } else {
                    image
                }
            }
            Self::Grayscale => image.grayscale(),
            Self::FlipHorizontal => image.fliph(),
            Self::FlipVertical => image.flipv(),
            Self::Rotate90 => image.rotate90(),
            Self::Blur { sigma } => image.blur(*sigma),
        }
    }
}

/// Describes one image load.
///
/// Requests are values: every `with_*` method consumes the request and
/// returns an updated copy, so a request shared between preload and display
/// calls is never mutated behind another caller's back.
#[derive(Clone)]
pub struct LoadRequest {
    source: ImageSource,
    priority: Option<Priority>,
    cache: Option<CachePolicy>,
    custom_key: Option<String>,
    transformations: Vec<Transformation>,
    preload: bool,
    observers: Vec<Arc<dyn LoadObserver>>,
}

impl LoadRequest {
    /// Creates a request for the given source.
    #[must_use]
    pub fn new(source: ImageSource) -> Self {
        Self {
            source,
            priority: None,
            cache: None,
            custom_key: None,
            transformations: Vec::new(),
            preload: false,
            observers: Vec::new(),
        }
    }

    /// Creates a request for a remote URL.
    #[must_use]
    pub fn url(url: impl Into<String>) -> Self {
        Self::new(ImageSource::Url(url.into()))
    }

    /// Creates a request for a local file.
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(ImageSource::File(path.into()))
    }

    /// Creates a request for a bundled resource.
    #[must_use]
    pub fn bundle(name: impl Into<String>) -> Self {
        Self::new(ImageSource::Bundle(name.into()))
    }

    /// Creates a request for a byte stream.
    #[must_use]
    pub fn stream(stream: StreamSource) -> Self {
        Self::new(ImageSource::Stream(stream))
    }

    /// Sets the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the cache policy.
    #[must_use]
    pub const fn with_cache(mut self, cache: CachePolicy) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replaces the source identity in the cache key.
    #[must_use]
    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.custom_key = Some(key.into());
        self
    }

    /// Appends a transformation.
    #[must_use]
    pub fn with_transformation(mut self, transformation: Transformation) -> Self {
        self.transformations.push(transformation);
        self
    }

    /// Appends a downsample transformation.
    #[must_use]
    pub fn with_downsample(self, width: u32, height: u32) -> Self {
        self.with_transformation(Transformation::Downsample { width, height })
    }

    /// Appends an observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn LoadObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Observes every error raised while loading.
    #[must_use]
    pub fn on_error<F>(self, f: F) -> Self
    where
        F: Fn(&LoadError) + Send + Sync + 'static,
    {
        self.with_observer(Arc::new(ErrorObserver(f)))
    }

    /// Observes the loaded image.
    #[must_use]
    pub fn on_success<F>(self, f: F) -> Self
    where
        F: Fn(&LoadedImage) + Send + Sync + 'static,
    {
        self.with_observer(Arc::new(SuccessObserver(f)))
    }

    /// Observes the end of the load, successful or not.
    #[must_use]
    pub fn on_finish<F>(self, f: F) -> Self
    where
        F: Fn(&WorkHandle) + Send + Sync + 'static,
    {
        self.with_observer(Arc::new(FinishObserver(f)))
    }

    /// Marks the request as cache population only.
    #[must_use]
    pub(crate) const fn into_preload(mut self) -> Self {
        self.preload = true;
        self
    }

    /// Returns the source.
    #[must_use]
    pub const fn source(&self) -> &ImageSource {
        &self.source
    }

    /// Returns the explicit priority, if any.
    #[must_use]
    pub const fn priority(&self) -> Option<Priority> {
        self.priority
    }

    /// Returns the explicit cache policy, if any.
    #[must_use]
    pub const fn cache(&self) -> Option<CachePolicy> {
        self.cache
    }

    /// Returns the custom cache key, if any.
    #[must_use]
    pub fn custom_key(&self) -> Option<&str> {
        self.custom_key.as_deref()
    }

    /// Returns the transformations in application order.
    #[must_use]
    pub fn transformations(&self) -> &[Transformation] {
        &self.transformations
    }

    /// Returns true for preload requests.
    #[must_use]
    pub const fn is_preload(&self) -> bool {
        self.preload
    }

    /// Returns the observers in registration order.
    #[must_use]
    pub fn observers(&self) -> &[Arc<dyn LoadObserver>] {
        &self.observers
    }

    /// Returns true if the request names no loadable path.
    #[must_use]
    pub fn has_empty_path(&self) -> bool {
        !self.source.is_stream() && self.source.path().is_none_or(|p| p.trim().is_empty())
    }
}

impl std::fmt::Debug for LoadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadRequest")
            .field("source", &self.source)
            .field("priority", &self.priority)
            .field("cache", &self.cache)
            .field("custom_key", &self.custom_key)
            .field("transformations", &self.transformations)
            .field("preload", &self.preload)
            .field("observers", &self.observers.len())
            .finish()
    }
}
