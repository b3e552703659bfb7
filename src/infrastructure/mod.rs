//! Infrastructure layer with external service adapters.

/// Application configuration.
pub mod config;
/// Image caching, fetching and the load engine.
pub mod image;

pub use config::{
    AppConfig, CliArgs, Command, ConfigError, LogLevel, RequestDefaults, StorageManager,
};
pub use image::{
    CacheStats, DiskImageCache, EngineStats, ImageService, ImageServiceConfig, MemoryImageCache,
    SourceFetcher,
};
