//! Port for reading image bytes from their source.

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::entities::ImageSource;
use crate::domain::errors::LoadError;

/// Reads the raw bytes of an image source.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Performs one fetch attempt. Retries are the caller's concern.
    async fn fetch(&self, source: &ImageSource) -> Result<Bytes, LoadError>;
}
