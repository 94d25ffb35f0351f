//! Subscriber setup for binaries and tests
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the application.

use crate::context::FfiContext;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "FFIKIT_LOG";

/// Install a formatting subscriber filtered by `FFIKIT_LOG`, or by
/// `default_filter` when it is unset or invalid
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(filter(default_filter))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

/// [`init_tracing`] with the level from a context's configuration
pub fn init_from_context(ctx: &FfiContext) -> bool {
    init_tracing(ctx.log_level())
}

fn filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter))
}
