//! Port for the engine that executes scheduled loads.

use async_trait::async_trait;

use crate::domain::entities::{CacheKey, CacheTier, ScheduledTask};
use crate::domain::ports::CacheResult;

/// Executes load tasks and manages cached entries.
#[async_trait]
pub trait LoadEngine: Send + Sync {
    /// Submits a task. Completion is reported through the task itself.
    fn load_image(&self, task: ScheduledTask);

    /// Removes a cached entry from the given tiers.
    ///
    /// # Errors
    /// Returns error if an existing entry cannot be removed.
    async fn invalidate_cache_entry(&self, key: &CacheKey, tier: CacheTier) -> CacheResult<()>;
}
