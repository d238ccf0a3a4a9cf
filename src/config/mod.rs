//! Configuration management for feedpipe
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use feedpipe::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Recordings go to: {}", config.recorder.dir.display());
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `FEEDPIPE__<section>__<key>`
//!
//! Examples:
//! - `FEEDPIPE__DOWNLOAD__DIR=/srv/downloads`
//! - `FEEDPIPE__RECORDER__MAX_DURATION_SECS=3600`
//! - `FEEDPIPE__WORKERS__DOWNLOAD__CONCURRENCY=2`
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/feedpipe.toml`.
//! This can be overridden using the `FEEDPIPE_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use models::{
    CatalogConfig, Config, DownloadConfig, HttpSettings, ProducerConfig, QueueConfig,
    ReconcileConfig, RecorderConfig, RetentionConfig, ServerConfig, WorkerOverride,
    parse_queue_name,
};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// # Errors
    ///
    /// Returns an error if the file is malformed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }
}
