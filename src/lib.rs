//! imgpipe - deduplicating image loading with memory and disk caching.
//!
//! Requests are dispatched through [`application::ImageDispatcher`] to a
//! shared [`infrastructure::ImageService`] that coalesces work per cache key,
//! schedules it by priority and serves repeats from memory or disk.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Application layer containing the dispatcher and its services.
pub mod application;
/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing caches, fetchers, the engine and configuration.
pub mod infrastructure;

/// Current version of the application.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name.
pub const NAME: &str = "imgpipe";
