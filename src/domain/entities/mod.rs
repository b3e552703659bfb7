//! Domain entity definitions.

mod cache_key;
mod image;
mod request;
mod task;

pub use cache_key::CacheKey;
pub use image::{ImageOrigin, ImagePayload, LoadedImage};
pub use request::{
    CachePolicy, CacheTier, ImageSource, LoadRequest, Priority, SourceKind, StreamOpener,
    StreamSource, Transformation,
};
pub use task::{ScheduledTask, WorkHandle};
