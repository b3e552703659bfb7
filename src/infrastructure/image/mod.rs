//! Image handling infrastructure.
//!
//! This module provides:
//! - Memory caching with LRU eviction
//! - Disk caching for persistence
//! - Source fetching for URLs, files, bundles and streams
//! - The deduplicating load engine

pub mod disk_cache;
pub mod fetcher;
pub mod memory_cache;
pub mod service;

pub use disk_cache::DiskImageCache;
pub use fetcher::SourceFetcher;
pub use memory_cache::{CacheStats, MemoryImageCache};
pub use service::{EngineStats, ImageService, ImageServiceConfig};
