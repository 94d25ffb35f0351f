//! Shared helpers for ffikit integration tests

#![allow(dead_code)]

use ffikit_config::{CallbackSettings, Config, Settings};
use ffikit_runtime::{CType, FfiContext, FieldSpec, Layout, LayoutBuilder, Value};
use std::sync::Arc;
use std::time::Duration;

// Re-export testing utilities
pub use pretty_assertions::{assert_eq, assert_ne};

/// Context whose callback host waits `timeout` for the owning thread
pub fn context_with_timeout(timeout: Duration) -> FfiContext {
    let config = Config {
        settings: Settings {
            callbacks: Some(CallbackSettings {
                timeout_ms: Some(timeout.as_millis() as u64),
                queue_capacity: Some(8),
            }),
            ..Settings::default()
        },
        project_root: None,
    };
    FfiContext::new(&config)
}

/// `struct Point { int32 x; int32 y; }`
pub fn point() -> Arc<Layout> {
    LayoutBuilder::structure()
        .named("Point")
        .field("x", CType::Int32)
        .field("y", CType::Int32)
        .build()
        .unwrap()
}

/// Struct layout from `(name, spec)` pairs
pub fn structure<const N: usize>(fields: [(&str, FieldSpec); N]) -> Arc<Layout> {
    fields
        .into_iter()
        .fold(LayoutBuilder::structure(), |builder, (name, spec)| {
            builder.field(name, spec)
        })
        .build()
        .unwrap()
}

/// Offsets of the declared fields, in order
pub fn offsets(layout: &Layout) -> Vec<u32> {
    layout.fields().iter().map(|f| f.offset).collect()
}

/// Assert that a value is the given signed integer
pub fn assert_int(value: Value, expected: i64) {
    match value {
        Value::Int(n) => assert_eq!(n, expected),
        Value::UInt(n) => assert_eq!(n as i64, expected),
        other => panic!("Expected integer {}, got {:?}", expected, other),
    }
}
