//! Reads image bytes from URLs, files, bundles and streams.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::debug;

use crate::domain::entities::ImageSource;
use crate::domain::errors::LoadError;
use crate::domain::ports::{CacheError, CacheResult, ImageFetcher};

/// Default user agent for remote fetches.
pub const DEFAULT_USER_AGENT: &str = concat!("imgpipe/", env!("CARGO_PKG_VERSION"));

/// Fetches image bytes from every supported source kind.
pub struct SourceFetcher {
    http_client: reqwest::Client,
    bundle_dir: PathBuf,
}

impl std::fmt::Debug for SourceFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceFetcher")
            .field("bundle_dir", &self.bundle_dir)
            .finish_non_exhaustive()
    }
}

impl SourceFetcher {
    /// Creates a fetcher.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new(timeout: Duration, user_agent: &str, bundle_dir: PathBuf) -> CacheResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| CacheError::NetworkError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            bundle_dir,
        })
    }

    async fn download(&self, url: &str) -> Result<Bytes, LoadError> {
        debug!(url = %url, "Downloading image from network");
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| LoadError::network(url, format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(LoadError::http_status(url, response.status().as_u16()));
        }

        response
            .bytes()
            .await
            .map_err(|e| LoadError::network(url, format!("Failed to read body: {e}")))
    }

    async fn read_file(path: &std::path::Path) -> Result<Bytes, LoadError> {
        fs::read(path)
            .await
            .map(Bytes::from)
            .map_err(|e| LoadError::io(path.display().to_string(), e.to_string()))
    }
}

#[async_trait]
impl ImageFetcher for SourceFetcher {
    async fn fetch(&self, source: &ImageSource) -> Result<Bytes, LoadError> {
        match source {
            ImageSource::Url(url) => self.download(url).await,
            ImageSource::File(path) => Self::read_file(path).await,
            ImageSource::Bundle(name) => {
                let relative = name.trim_start_matches('/');
                if std::path::Path::new(relative)
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir))
                {
                    return Err(LoadError::io(name.as_str(), "bundle path escapes bundle directory"));
                }
                Self::read_file(&self.bundle_dir.join(relative)).await
            }
            ImageSource::Stream(stream) => stream
                .open()
                .await
                .map_err(|e| LoadError::stream(stream.id(), e.to_string())),
        }
    }
}
