//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::args::CliArgs;
use crate::domain::entities::{CachePolicy, Priority};
use crate::infrastructure::image::ImageServiceConfig;

pub(crate) const APP_NAME: &str = "imgpipe";
pub(crate) const APP_QUALIFIER: &str = "com";
pub(crate) const APP_ORGANIZATION: &str = "imgpipe";

/// Log level configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Defaults applied to requests that leave fields unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDefaults {
    /// Priority of requests without one.
    #[serde(default)]
    pub priority: Priority,

    /// Cache policy of requests without one.
    #[serde(default)]
    pub cache: CachePolicy,
}

/// Application configuration, read from file and overridden by CLI.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Configuration file path.
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[serde(skip)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Engine settings.
    #[serde(default)]
    pub engine: ImageServiceConfig,

    /// Request defaults.
    #[serde(default)]
    pub defaults: RequestDefaults,
}

impl AppConfig {
    /// Merges CLI arguments into the configuration.
    pub fn merge_with_args(&mut self, args: &CliArgs) {
        if let Some(config_path) = &args.config {
            self.config = Some(config_path.clone());
        }
        if let Some(log_path) = &args.log_path {
            self.log_path = Some(log_path.clone());
        }
        if let Some(log_level) = args.log_level {
            self.log_level = log_level;
        }
        if let Some(max_concurrent) = args.max_concurrent {
            self.engine.max_concurrent_loads = max_concurrent;
        }
        if let Some(cache_dir) = &args.cache_dir {
            self.engine.cache_dir = Some(cache_dir.clone());
        }
        if let Some(bundle_dir) = &args.bundle_dir {
            self.engine.bundle_dir = Some(bundle_dir.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_parse_config_sections() {
        let toml_content = r#"
            log_level = "debug"

            [engine]
            memory_cache_size = 10
            max_concurrent_loads = 2
            retry_count = 0
            bundle_dir = "/opt/app/assets"

            [defaults]
            priority = "high"
            cache = "disk"
        "#;

        let config: AppConfig = toml::from_str(toml_content).expect("Failed to parse config");

        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.engine.memory_cache_size, 10);
        assert_eq!(config.engine.max_concurrent_loads, 2);
        assert_eq!(config.engine.retry_count, 0);
        assert_eq!(
            config.engine.bundle_dir,
            Some(PathBuf::from("/opt/app/assets"))
        );
        // Unset engine fields keep their defaults.
        assert_eq!(
            config.engine.timeout_secs,
            ImageServiceConfig::default().timeout_secs
        );
        assert_eq!(config.defaults.priority, Priority::High);
        assert_eq!(config.defaults.cache, CachePolicy::Disk);
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();

        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.engine, ImageServiceConfig::default());
        assert_eq!(config.defaults.priority, Priority::Normal);
        assert_eq!(config.defaults.cache, CachePolicy::All);
    }

    #[test]
    fn test_cli_overrides_file_values() {
        let mut config = AppConfig::default();
        config.engine.max_concurrent_loads = 8;

        let args = CliArgs::parse_from([
            "imgpipe",
            "--log-level",
            "trace",
            "--max-concurrent",
            "2",
            "--cache-dir",
            "/tmp/imgpipe-cache",
            "stats",
        ]);
        config.merge_with_args(&args);

        assert_eq!(config.log_level, LogLevel::Trace);
        assert_eq!(config.engine.max_concurrent_loads, 2);
        assert_eq!(
            config.engine.cache_dir,
            Some(PathBuf::from("/tmp/imgpipe-cache"))
        );
    }

    #[test]
    fn test_unset_cli_flags_keep_file_values() {
        let mut config = AppConfig::default();
        config.engine.max_concurrent_loads = 8;

        config.merge_with_args(&CliArgs::parse_from(["imgpipe", "stats"]));

        assert_eq!(config.engine.max_concurrent_loads, 8);
        assert_eq!(config.engine.cache_dir, None);
    }
}
