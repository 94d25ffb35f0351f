//! ffikit Configuration System
//!
//! Provides runtime settings for the ffikit marshaling engine:
//! - Project configuration (`ffikit.toml`)
//! - Global user configuration (`~/.ffikit/config.toml`)
//! - Environment overrides (`FFIKIT_*`)
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded and merged in the following order (later overrides earlier):
//! 1. Built-in defaults
//! 2. Global config (`~/.ffikit/config.toml`)
//! 3. Project config (`./ffikit.toml`, searched upwards)
//! 4. Environment variables (`FFIKIT_*`)
//!
//! # Example
//!
//! ```no_run
//! use ffikit_config::ConfigLoader;
//! use std::path::Path;
//!
//! let mut loader = ConfigLoader::new();
//! let config = loader.load_from_directory(Path::new(".")).unwrap();
//! println!("callback timeout: {:?}", config.callback_timeout());
//! ```

pub mod loader;
pub mod settings;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// Re-export main types
pub use loader::{Config, ConfigLoader};
pub use settings::{CallbackSettings, LayoutSettings, LoggingSettings, Settings};
