//! Port definitions for the image loading pipeline.

mod engine_port;
mod fetcher_port;
mod image_cache_port;
mod target_port;

pub use engine_port::LoadEngine;
pub use fetcher_port::ImageFetcher;
pub use image_cache_port::{CacheError, CacheResult, ImageCachePort};
#[cfg(test)]
pub use target_port::MockImageTarget;
pub use target_port::{
    ErrorObserver, FinishObserver, ImageTarget, LoadObserver, SuccessObserver,
};
