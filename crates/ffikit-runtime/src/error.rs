//! Error taxonomy
//!
//! Definition-time problems are [`LayoutError`]s and never reach an
//! instance. Everything else surfaces through [`FfiError`] to the immediate
//! caller without touching bytes of unrelated fields.

use crate::native::library::LoadError;
use ffikit_config::ConfigError;
use thiserror::Error;

/// Bad field specification, raised while a layout is being built
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("Duplicate field name '{0}'")]
    DuplicateField(String),

    #[error("Invalid field name '{0}'")]
    InvalidName(String),

    #[error("Bit field '{name}' width {width} is outside 1..={max}")]
    InvalidBitWidth { name: String, width: u32, max: u32 },

    #[error("Bit field '{name}' needs an integer base type, got {base}")]
    InvalidBitFieldBase { name: String, base: String },

    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("Field '{0}' cannot have type void")]
    VoidField(String),

    #[error("Anonymous field '{0}' must wrap a primitive, nested layout or array")]
    InvalidAnonymous(String),

    #[error("Unknown layout '{0}'")]
    UnknownLayout(String),

    #[error("Invalid layout definition: {0}")]
    InvalidDefinition(String),
}

/// Crate-wide error
#[derive(Debug, Error)]
pub enum FfiError {
    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("Buffer too small: need {needed} bytes, have {available}")]
    Bounds { needed: usize, available: usize },

    #[error("Type error: expected {expected}, got {got}")]
    Type { expected: String, got: String },

    #[error("Unknown field '{0}'")]
    UnknownField(String),

    #[error("Null pointer dereference")]
    NullPointer,

    #[error("Callback lifecycle error: {0}")]
    CallbackLifecycle(String),

    #[error("Callback handler failed: {0}")]
    CallbackHandler(String),

    #[error("Native call failed: {0}")]
    Call(String),

    #[error("Expected {expected} arguments, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("Snapshot serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl FfiError {
    /// Shorthand for a [`FfiError::Type`]
    pub fn type_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        FfiError::Type {
            expected: expected.into(),
            got: got.into(),
        }
    }
}

/// Result alias used throughout the crate
pub type FfiResult<T> = Result<T, FfiError>;
