//! Request dispatch: the public surface for loading images.

use std::sync::Arc;

use tracing::debug;

use crate::application::services::{CompletionBridge, TaskFactory};
use crate::domain::entities::{
    CachePolicy, CacheTier, ImageSource, LoadRequest, Priority, ScheduledTask, WorkHandle,
};
use crate::domain::errors::LoadFailure;
use crate::domain::ports::{CacheResult, ImageTarget, LoadEngine};

/// Dispatches load requests to the engine.
#[derive(Clone)]
pub struct ImageDispatcher {
    engine: Arc<dyn LoadEngine>,
    factory: TaskFactory,
}

impl std::fmt::Debug for ImageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageDispatcher")
            .field("factory", &self.factory)
            .finish_non_exhaustive()
    }
}

impl ImageDispatcher {
    /// Creates a dispatcher over an engine.
    #[must_use]
    pub fn new(engine: Arc<dyn LoadEngine>, factory: TaskFactory) -> Self {
        Self { engine, factory }
    }

    /// Returns the task factory.
    #[must_use]
    pub const fn factory(&self) -> &TaskFactory {
        &self.factory
    }

    /// Loads an image into `target`.
    ///
    /// A non-stream request with an empty path clears the target and
    /// returns `None` without touching the engine.
    pub fn load_into(
        &self,
        request: LoadRequest,
        target: &Arc<dyn ImageTarget>,
    ) -> Option<WorkHandle> {
        if Self::reject_empty(&request, target) {
            return None;
        }
        Some(self.submit(self.factory.create(request, Some(target))))
    }

    /// Loads an image into `target` and waits for the load to finish.
    ///
    /// # Errors
    /// Returns every error raised during the load, or
    /// [`LoadFailure::Cancelled`] if the work was cancelled.
    pub async fn load_into_async(
        &self,
        request: LoadRequest,
        target: &Arc<dyn ImageTarget>,
    ) -> Result<Option<WorkHandle>, LoadFailure> {
        if Self::reject_empty(&request, target) {
            return Ok(None);
        }
        let (bridge, completion) = CompletionBridge::new();
        self.submit(self.factory.create(request, Some(target)).with_observer(bridge));
        completion.await.map(Some)
    }

    /// Populates the caches without a target.
    ///
    /// Priority defaults to [`Priority::Low`] when the request sets none.
    pub fn preload(&self, request: LoadRequest) -> Option<WorkHandle> {
        if request.has_empty_path() {
            debug!("Skipping preload of empty path");
            return None;
        }
        Some(self.submit(self.factory.create(Self::as_preload(request), None)))
    }

    /// Preloads and waits for the load to finish.
    ///
    /// # Errors
    /// Returns every error raised during the load, or
    /// [`LoadFailure::Cancelled`] if the work was cancelled.
    pub async fn preload_async(
        &self,
        request: LoadRequest,
    ) -> Result<Option<WorkHandle>, LoadFailure> {
        if request.has_empty_path() {
            debug!("Skipping preload of empty path");
            return Ok(None);
        }
        let (bridge, completion) = CompletionBridge::new();
        self.submit(
            self.factory
                .create(Self::as_preload(request), None)
                .with_observer(bridge),
        );
        completion.await.map(Some)
    }

    /// Downloads a remote image to the disk cache without decoding it.
    ///
    /// Only URL sources are downloaded, anything else is ignored.
    pub fn download_only(&self, request: LoadRequest) -> Option<WorkHandle> {
        Self::as_download(request).and_then(|request| self.preload(request))
    }

    /// Downloads and waits for the download to finish.
    ///
    /// # Errors
    /// Returns every error raised during the download, or
    /// [`LoadFailure::Cancelled`] if the work was cancelled.
    pub async fn download_only_async(
        &self,
        request: LoadRequest,
    ) -> Result<Option<WorkHandle>, LoadFailure> {
        match Self::as_download(request) {
            Some(request) => self.preload_async(request).await,
            None => Ok(None),
        }
    }

    /// Removes the request's cached entry from the given tiers.
    ///
    /// # Errors
    /// Returns error if an existing disk entry cannot be removed.
    pub async fn invalidate(&self, request: LoadRequest, tier: CacheTier) -> CacheResult<()> {
        let key = {
            let task = self.factory.create(request, None);
            task.key().clone()
        };
        self.engine.invalidate_cache_entry(&key, tier).await
    }

    fn reject_empty(request: &LoadRequest, target: &Arc<dyn ImageTarget>) -> bool {
        if !request.has_empty_path() {
            return false;
        }
        debug!(kind = ?request.source().kind(), "Empty source path, clearing target");
        target.set_empty();
        true
    }

    fn as_preload(request: LoadRequest) -> LoadRequest {
        let request = match request.priority() {
            Some(_) => request,
            None => request.with_priority(Priority::Low),
        };
        request.into_preload()
    }

    fn as_download(request: LoadRequest) -> Option<LoadRequest> {
        if matches!(request.source(), ImageSource::Url(_)) {
            Some(request.with_cache(CachePolicy::Disk))
        } else {
            debug!(kind = ?request.source().kind(), "Download-only ignores non-URL source");
            None
        }
    }

    fn submit(&self, task: ScheduledTask) -> WorkHandle {
        let handle = task.handle().clone();
        self.engine.load_image(task);
        handle
    }
}
