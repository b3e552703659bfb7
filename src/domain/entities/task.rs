//! Scheduled image loading work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::domain::errors::LoadError;
use crate::domain::ports::{ImageTarget, LoadObserver};

use super::cache_key::CacheKey;
use super::image::LoadedImage;
use super::request::{CachePolicy, LoadRequest, Priority};

#[derive(Debug, Default)]
struct WorkState {
    cancelled: AtomicBool,
    finished: AtomicBool,
    canceller: OnceLock<mpsc::UnboundedSender<CacheKey>>,
}

/// Handle to in-flight or completed work.
#[derive(Debug, Clone)]
pub struct WorkHandle {
    id: Uuid,
    key: CacheKey,
    state: Arc<WorkState>,
}

impl WorkHandle {
    fn new(key: CacheKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            state: Arc::new(WorkState::default()),
        }
    }

    /// Returns the unique id of this work item.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the cache key the work loads.
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Cancels the work. No callback fires after this returns.
    pub fn cancel(&self) {
        if self.is_finished() || self.state.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(key = %self.key, id = %self.id, "Cancelled image work");
        if let Some(tx) = self.state.canceller.get() {
            let _ = tx.send(self.key.clone());
        }
    }

    /// Returns true if the work was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Returns true once completion callbacks have run.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::Acquire)
    }

    /// Routes cancellation notices to the engine that owns this work.
    pub(crate) fn attach_canceller(&self, tx: mpsc::UnboundedSender<CacheKey>) {
        let _ = self.state.canceller.set(tx);
    }
}

impl PartialEq for WorkHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for WorkHandle {}

/// A request bound to a target, ready to be executed by the engine.
pub struct ScheduledTask {
    handle: WorkHandle,
    request: LoadRequest,
    priority: Priority,
    cache: CachePolicy,
    target: Option<Weak<dyn ImageTarget>>,
    observers: Vec<Arc<dyn LoadObserver>>,
    reported: AtomicBool,
}

impl ScheduledTask {
    /// Creates a task with resolved priority and cache policy.
    #[must_use]
    pub fn new(
        key: CacheKey,
        request: LoadRequest,
        priority: Priority,
        cache: CachePolicy,
        target: Option<Weak<dyn ImageTarget>>,
    ) -> Self {
        let observers = request.observers().to_vec();
        Self {
            handle: WorkHandle::new(key),
            request,
            priority,
            cache,
            target,
            observers,
            reported: AtomicBool::new(false),
        }
    }

    /// Appends an observer that runs after the request's own observers.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn LoadObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Returns the handle.
    #[must_use]
    pub const fn handle(&self) -> &WorkHandle {
        &self.handle
    }

    /// Returns the cache key.
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.handle.key
    }

    /// Returns the request.
    #[must_use]
    pub const fn request(&self) -> &LoadRequest {
        &self.request
    }

    /// Returns the resolved priority.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Returns the resolved cache policy.
    #[must_use]
    pub const fn cache(&self) -> CachePolicy {
        self.cache
    }

    /// Returns false for download-only work, which stores raw bytes only.
    #[must_use]
    pub fn wants_decoded(&self) -> bool {
        !(self.request.is_preload() && self.cache == CachePolicy::Disk)
    }

    /// Returns true if the task was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// Reports one failed attempt to every observer.
    pub fn notify_error(&self, error: &LoadError) {
        if self.is_cancelled() || self.handle.is_finished() {
            return;
        }
        self.reported.store(true, Ordering::Release);
        for observer in &self.observers {
            observer.on_error(error);
        }
    }

    /// Delivers the final outcome. Runs at most once per task and never
    /// after cancellation.
    ///
    /// Errors are not repeated here, they were delivered through
    /// [`ScheduledTask::notify_error`] as they happened. A task that joined
    /// after the last attempt failed receives the final error once.
    pub fn complete(&self, outcome: &Result<LoadedImage, LoadError>) {
        if self.is_cancelled() {
            trace!(key = %self.key(), "Skipping completion of cancelled task");
            return;
        }
        if self.handle.state.finished.swap(true, Ordering::AcqRel) {
            return;
        }

        let target = self.target.as_ref().and_then(Weak::upgrade);
        match outcome {
            Ok(image) => {
                if let Some(target) = &target {
                    target.set_image(image);
                }
                for observer in &self.observers {
                    observer.on_success(image);
                }
            }
            Err(error) => {
                if !self.reported.load(Ordering::Acquire) {
                    for observer in &self.observers {
                        observer.on_error(error);
                    }
                }
                if let Some(target) = &target {
                    target.set_failed(error);
                }
            }
        }

        for observer in &self.observers {
            observer.on_finish(&self.handle);
        }
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("handle", &self.handle)
            .field("priority", &self.priority)
            .field("cache", &self.cache)
            .field("preload", &self.request.is_preload())
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}
