//! Domain layer with core image loading entities and port definitions.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;

pub use entities::{CacheKey, LoadRequest, LoadedImage, ScheduledTask, WorkHandle};
pub use errors::{AggregateLoadError, LoadError, LoadFailure};
pub use ports::{ImageFetcher, ImageTarget, LoadEngine, LoadObserver};
