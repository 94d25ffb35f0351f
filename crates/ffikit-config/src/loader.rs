//! Configuration Loader
//!
//! Handles loading and merging configuration from multiple sources with proper precedence.

use crate::settings::Settings;
use crate::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the project configuration file
pub const PROJECT_CONFIG_FILE: &str = "ffikit.toml";

/// Default bounded wait for ThreadSafe callback handshakes
pub const DEFAULT_CALLBACK_TIMEOUT_MS: u64 = 5_000;

/// Default capacity of the foreign-thread invocation queue
pub const DEFAULT_CALLBACK_QUEUE: usize = 64;

/// Default `tracing` filter
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Configuration loader
///
/// Loads configuration from multiple sources and merges them with proper precedence:
/// 1. Global config (~/.ffikit/config.toml) - lowest priority
/// 2. Project config (./ffikit.toml) - overrides global
/// 3. Environment variables (FFIKIT_*) - overrides project
pub struct ConfigLoader {
    /// Cached global config path
    global_config_path: Option<PathBuf>,
}

/// Merged configuration result
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Effective settings after merging every layer
    pub settings: Settings,

    /// Directory where ffikit.toml was found
    pub project_root: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Create a loader that reads global settings from an explicit path
    pub fn with_global_path(path: impl Into<PathBuf>) -> Self {
        Self {
            global_config_path: Some(path.into()),
        }
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find ffikit.toml, layers it over the
    /// global config and applies environment overrides.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<Config> {
        let (project_root, project) = self.find_project_settings(start_dir)?;

        let mut settings = self.load_global_settings().unwrap_or_default();
        settings.merge(&project);

        let settings = self.apply_env_overrides(settings)?;

        Ok(Config {
            settings,
            project_root,
        })
    }

    /// Load configuration from a specific settings file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<Config> {
        let project = Settings::load_from_file(config_path)?;

        let mut settings = self.load_global_settings().unwrap_or_default();
        settings.merge(&project);

        let settings = self.apply_env_overrides(settings)?;

        Ok(Config {
            settings,
            project_root: config_path.parent().map(|p| p.to_path_buf()),
        })
    }

    /// Find project settings by walking up directory tree
    fn find_project_settings(&self, start_dir: &Path) -> ConfigResult<(Option<PathBuf>, Settings)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(PROJECT_CONFIG_FILE);

            if config_path.exists() {
                let settings = Settings::load_from_file(&config_path)?;
                return Ok((Some(current), settings));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, Settings::default())),
            }
        }
    }

    /// Load global settings from ~/.ffikit/config.toml
    fn load_global_settings(&mut self) -> ConfigResult<Settings> {
        let path = match &self.global_config_path {
            Some(path) => path.clone(),
            None => {
                let path = Self::global_config_dir()?.join("config.toml");
                self.global_config_path = Some(path.clone());
                path
            }
        };

        // Global config is optional - if it doesn't exist, return default
        if !path.exists() {
            return Ok(Settings::default());
        }

        Settings::load_from_file(&path)
    }

    /// Apply environment variable overrides
    ///
    /// Recognised variables: FFIKIT_POINTER_WIDTH, FFIKIT_CALLBACK_TIMEOUT_MS,
    /// FFIKIT_CALLBACK_QUEUE, FFIKIT_LOG_LEVEL
    fn apply_env_overrides(&self, mut settings: Settings) -> ConfigResult<Settings> {
        if let Ok(width) = env::var("FFIKIT_POINTER_WIDTH") {
            let width = parse_env("FFIKIT_POINTER_WIDTH", &width)?;
            settings
                .layout
                .get_or_insert_with(Default::default)
                .pointer_width = Some(width);
        }

        if let Ok(timeout) = env::var("FFIKIT_CALLBACK_TIMEOUT_MS") {
            let timeout = parse_env("FFIKIT_CALLBACK_TIMEOUT_MS", &timeout)?;
            settings
                .callbacks
                .get_or_insert_with(Default::default)
                .timeout_ms = Some(timeout);
        }

        if let Ok(capacity) = env::var("FFIKIT_CALLBACK_QUEUE") {
            let capacity = parse_env("FFIKIT_CALLBACK_QUEUE", &capacity)?;
            settings
                .callbacks
                .get_or_insert_with(Default::default)
                .queue_capacity = Some(capacity);
        }

        if let Ok(level) = env::var("FFIKIT_LOG_LEVEL") {
            settings.logging.get_or_insert_with(Default::default).level = Some(level);
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Get the global configuration directory (~/.ffikit)
    pub fn global_config_dir() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".ffikit"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> ConfigResult<T> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: name.to_string(),
        reason: format!("cannot parse '{}'", raw),
    })
}

impl Config {
    /// Pointer width override for layout alignment, if configured
    pub fn pointer_width(&self) -> Option<u32> {
        self.settings.layout.as_ref().and_then(|l| l.pointer_width)
    }

    /// Effective ThreadSafe callback wait
    pub fn callback_timeout(&self) -> Duration {
        let ms = self
            .settings
            .callbacks
            .as_ref()
            .and_then(|c| c.timeout_ms)
            .unwrap_or(DEFAULT_CALLBACK_TIMEOUT_MS);
        Duration::from_millis(ms)
    }

    /// Effective invocation queue capacity
    pub fn callback_queue_capacity(&self) -> usize {
        self.settings
            .callbacks
            .as_ref()
            .and_then(|c| c.queue_capacity)
            .unwrap_or(DEFAULT_CALLBACK_QUEUE)
    }

    /// Effective log filter
    pub fn log_level(&self) -> &str {
        self.settings
            .logging
            .as_ref()
            .and_then(|l| l.level.as_deref())
            .unwrap_or(DEFAULT_LOG_LEVEL)
    }

    /// Check if a project file was found
    pub fn is_project(&self) -> bool {
        self.project_root.is_some()
    }
}
