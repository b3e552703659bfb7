//! Application configuration.

pub mod app_config;
pub mod args;
pub mod storage;

pub(crate) use app_config::{APP_NAME, APP_ORGANIZATION, APP_QUALIFIER};
pub use app_config::{AppConfig, LogLevel, RequestDefaults};
pub use args::{CliArgs, Command, LoadArgs, Size, TransformArgs, parse_source};
pub use storage::{ConfigError, StorageManager};
