//! ffikit Runtime - C data layout and marshaling engine
//!
//! This library lets Rust code share memory and functions with C:
//! - Struct/union layout with packing, arrays, bit fields and anonymous members
//! - Live zero-copy views and detached snapshots of native memory
//! - Value marshaling with exact 64-bit integers and C/wide strings
//! - Typed pointers
//! - Native-callable callbacks, including ones invoked from foreign threads
//!
//! # Example
//!
//! ```
//! use ffikit_runtime::{CType, FieldMap, LayoutBuilder, Value};
//!
//! let point = LayoutBuilder::structure()
//!     .named("Point")
//!     .field("x", CType::Int32)
//!     .field("y", CType::Int32)
//!     .build()
//!     .unwrap();
//! let p = point.create(FieldMap::from([("x", 1), ("y", 2)])).unwrap();
//! assert_eq!(p.value("y").unwrap(), Value::Int(2));
//! ```

/// ffikit runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Public API modules
pub mod buffer;
pub mod callback;
pub mod context;
pub mod error;
pub mod layout;
pub mod logging;
pub mod marshal;
pub mod memory;
pub mod native;
pub mod platform;
pub mod pointer;
pub mod registry;
pub mod types;
pub mod value;
pub mod view;

// Re-export commonly used types
pub use buffer::{NativeBuffer, Region};
pub use callback::{CallbackHandle, CallbackHost, CallbackStatus, Tier};
pub use context::{errno, set_errno, FfiContext};
pub use error::{FfiError, FfiResult, LayoutError};
pub use layout::{
    ArrayLayout, ElementType, FieldDescriptor, FieldSpec, Layout, LayoutBuilder,
};
pub use marshal::MarshalContext;
pub use native::{
    promoted_type, Abi, ForeignFunction, LibffiDispatcher, Library, LoadError, NativeDispatcher,
    Signature,
};
pub use platform::Platform;
pub use pointer::Pointer;
pub use registry::TypeRegistry;
pub use types::{CType, TypeDescriptor};
pub use value::{FieldMap, Value};
pub use view::{ArrayView, Field, StructView};
