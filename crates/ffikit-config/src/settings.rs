//! Settings file schema (`ffikit.toml` and `~/.ffikit/config.toml`)
//!
//! Both files share the same schema. Every key is optional so that a file
//! only needs to mention what it overrides.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings loaded from a single configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Layout engine settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout: Option<LayoutSettings>,

    /// Callback trampoline settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callbacks: Option<CallbackSettings>,

    /// Logging settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingSettings>,
}

/// Layout engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LayoutSettings {
    /// Pointer width in bytes used as the alignment cap (4 or 8)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pointer_width: Option<u32>,
}

/// Callback trampoline settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct CallbackSettings {
    /// Bounded wait of a foreign thread for the owning context, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Capacity of the foreign-thread invocation queue
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingSettings {
    /// Default `tracing` filter directive (e.g. "info", "ffikit_runtime=debug")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl Settings {
    /// Load settings from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let settings: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate value ranges
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(width) = self.layout.as_ref().and_then(|l| l.pointer_width) {
            if width != 4 && width != 8 {
                return Err(ConfigError::InvalidValue {
                    field: "layout.pointer_width".to_string(),
                    reason: format!("expected 4 or 8, got {}", width),
                });
            }
        }

        if let Some(callbacks) = &self.callbacks {
            if callbacks.timeout_ms == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: "callbacks.timeout_ms".to_string(),
                    reason: "timeout must be non-zero".to_string(),
                });
            }
            if callbacks.queue_capacity == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: "callbacks.queue_capacity".to_string(),
                    reason: "queue capacity must be non-zero".to_string(),
                });
            }
        }

        if let Some(level) = self.logging.as_ref().and_then(|l| l.level.as_deref()) {
            if level.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "logging.level".to_string(),
                    reason: "level cannot be empty".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Merge another settings layer into this one (other takes precedence)
    pub fn merge(&mut self, other: &Settings) {
        if let Some(layout) = &other.layout {
            let mine = self.layout.get_or_insert_with(Default::default);
            if layout.pointer_width.is_some() {
                mine.pointer_width = layout.pointer_width;
            }
        }

        if let Some(callbacks) = &other.callbacks {
            let mine = self.callbacks.get_or_insert_with(Default::default);
            if callbacks.timeout_ms.is_some() {
                mine.timeout_ms = callbacks.timeout_ms;
            }
            if callbacks.queue_capacity.is_some() {
                mine.queue_capacity = callbacks.queue_capacity;
            }
        }

        if let Some(logging) = &other.logging {
            let mine = self.logging.get_or_insert_with(Default::default);
            if logging.level.is_some() {
                mine.level = logging.level.clone();
            }
        }
    }
}
