//! Turns load requests into scheduled tasks.

use std::sync::Arc;

use crate::domain::entities::{CacheKey, CachePolicy, LoadRequest, Priority, ScheduledTask};
use crate::domain::ports::ImageTarget;

/// Builds tasks, filling unset request fields with configured defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskFactory {
    default_priority: Priority,
    default_cache: CachePolicy,
}

impl TaskFactory {
    /// Creates a factory with the given defaults.
    #[must_use]
    pub const fn new(default_priority: Priority, default_cache: CachePolicy) -> Self {
        Self {
            default_priority,
            default_cache,
        }
    }

    /// Returns the priority applied to requests that set none.
    #[must_use]
    pub const fn default_priority(&self) -> Priority {
        self.default_priority
    }

    /// Returns the cache policy applied to requests that set none.
    #[must_use]
    pub const fn default_cache(&self) -> CachePolicy {
        self.default_cache
    }

    /// Creates a task bound to `target`. The target is held weakly.
    #[must_use]
    pub fn create(
        &self,
        request: LoadRequest,
        target: Option<&Arc<dyn ImageTarget>>,
    ) -> ScheduledTask {
        let priority = request.priority().unwrap_or(self.default_priority);
        let cache = request.cache().unwrap_or(self.default_cache);
        let key = CacheKey::for_request(&request);
        ScheduledTask::new(key, request, priority, cache, target.map(Arc::downgrade))
    }
}
