//! Process-wide runtime settings
//!
//! Everything that is resolved once per process lives in an [`FfiContext`]:
//! the target platform, callback host settings and the errno captured after
//! the latest foreign call. Most programs use [`FfiContext::global`]; tests
//! build their own with [`FfiContext::new`].

use crate::layout::LayoutBuilder;
use crate::platform::Platform;
use ffikit_config::{Config, ConfigError, ConfigLoader};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

static GLOBAL: OnceLock<FfiContext> = OnceLock::new();

#[derive(Debug)]
pub struct FfiContext {
    platform: Platform,
    callback_timeout: Duration,
    callback_queue_capacity: usize,
    log_level: String,
    last_call_errno: AtomicI32,
}

impl FfiContext {
    /// Context for an already loaded configuration
    pub fn new(config: &Config) -> Self {
        let host = Platform::host();
        let platform = match config.pointer_width() {
            Some(width) => host.with_pointer_width(width),
            None => host,
        };
        Self {
            platform,
            callback_timeout: config.callback_timeout(),
            callback_queue_capacity: config.callback_queue_capacity(),
            log_level: config.log_level().to_string(),
            last_call_errno: AtomicI32::new(0),
        }
    }

    /// The process context, configured from the working directory on first use
    ///
    /// A configuration that fails to load is reported and replaced by the
    /// built-in defaults.
    pub fn global() -> &'static FfiContext {
        GLOBAL.get_or_init(|| {
            let loaded = std::env::current_dir()
                .map_err(ConfigError::from)
                .and_then(|dir| ConfigLoader::new().load_from_directory(&dir));
            match loaded {
                Ok(config) => {
                    debug!(project = config.is_project(), "FFI context configured");
                    Self::new(&config)
                }
                Err(e) => {
                    warn!(error = %e, "Using default FFI configuration");
                    Self::new(&Config::default())
                }
            }
        })
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// How long a foreign thread waits for the owning thread
    pub fn callback_timeout(&self) -> Duration {
        self.callback_timeout
    }

    pub fn callback_queue_capacity(&self) -> usize {
        self.callback_queue_capacity
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Struct builder for this context's platform
    pub fn structure(&self) -> LayoutBuilder {
        LayoutBuilder::structure().platform(self.platform)
    }

    /// Union builder for this context's platform
    pub fn union(&self) -> LayoutBuilder {
        LayoutBuilder::union().platform(self.platform)
    }

    /// errno as it was right after the latest foreign call
    pub fn last_call_errno(&self) -> i32 {
        self.last_call_errno.load(Ordering::Relaxed)
    }

    pub(crate) fn record_errno(&self, value: i32) {
        self.last_call_errno.store(value, Ordering::Relaxed);
    }
}

impl Default for FfiContext {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

/// Current thread's errno (`GetLastError` on Windows)
pub fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Overwrite the current thread's errno
///
/// A no-op on targets without a writable errno location.
pub fn set_errno(value: i32) {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    // SAFETY: the location is thread-local and always valid
    unsafe {
        *libc::__errno_location() = value;
    }
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    // SAFETY: as above
    unsafe {
        *libc::__error() = value;
    }
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd"
    )))]
    let _ = value;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffikit_config::{CallbackSettings, LayoutSettings, Settings};

    #[test]
    fn test_defaults() {
        let ctx = FfiContext::default();
        assert_eq!(ctx.platform(), Platform::host());
        assert_eq!(ctx.callback_timeout(), Duration::from_millis(5_000));
        assert_eq!(ctx.callback_queue_capacity(), 64);
        assert_eq!(ctx.log_level(), "info");
        assert_eq!(ctx.last_call_errno(), 0);
    }

    #[test]
    fn test_configured_pointer_width() {
        let config = Config {
            settings: Settings {
                layout: Some(LayoutSettings {
                    pointer_width: Some(4),
                }),
                callbacks: Some(CallbackSettings {
                    timeout_ms: Some(250),
                    queue_capacity: Some(8),
                }),
                logging: None,
            },
            project_root: None,
        };
        let ctx = FfiContext::new(&config);
        assert_eq!(ctx.platform().pointer_width, 4);
        assert_eq!(ctx.callback_timeout(), Duration::from_millis(250));
        assert_eq!(ctx.callback_queue_capacity(), 8);

        let layout = ctx
            .structure()
            .field("a", crate::types::CType::Int8)
            .field("b", crate::types::CType::Double)
            .build()
            .unwrap();
        assert_eq!(layout.field("b").unwrap().offset, 4);
        assert_eq!(layout.size(), 12);
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn test_errno_round_trip() {
        set_errno(libc::ERANGE);
        assert_eq!(errno(), libc::ERANGE);
        set_errno(0);
        assert_eq!(errno(), 0);
    }
}
