//! Storage seam for decoded images.

use std::sync::Arc;

use image::DynamicImage;

use crate::domain::entities::CacheKey;

/// Outcome of a cache tier operation.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Failure inside a cache tier.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// Filesystem access failed.
    #[error("cache io: {0}")]
    IoError(String),
    /// A remote source could not be reached while filling the cache.
    #[error("cache network: {0}")]
    NetworkError(String),
}

/// Tier holding decoded images by key. Shared across tasks.
#[async_trait::async_trait]
pub trait ImageCachePort: Send + Sync {
    /// Looks up `key`, counting the lookup as a hit or miss.
    async fn get(&self, key: &CacheKey) -> Option<Arc<DynamicImage>>;

    /// Inserts or replaces the image under `key`.
    async fn put(&self, key: CacheKey, image: Arc<DynamicImage>);

    /// Drops `key`. Returns whether it was held.
    async fn evict(&self, key: &CacheKey) -> bool;

    /// Images held right now.
    fn len(&self) -> usize;

    /// Whether no image is held.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every image.
    async fn clear(&self);
}
