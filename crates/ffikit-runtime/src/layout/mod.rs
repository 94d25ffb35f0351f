//! C struct/union layout
//!
//! A [`Layout`] is built once from an ordered list of named [`FieldSpec`]s
//! and never changes afterwards. It records every field's offset, size and
//! alignment, plus a name lookup table in which the fields of anonymous
//! members are promoted to the parent.
//!
//! # Example
//!
//! ```
//! # use ffikit_runtime::{CType, LayoutBuilder};
//! let layout = LayoutBuilder::structure()
//!     .field("a", CType::Int8)
//!     .field("b", CType::Int32)
//!     .build()
//!     .unwrap();
//! assert_eq!(layout.size(), 8);
//! assert_eq!(layout.field("b").unwrap().offset, 4);
//! ```

pub mod array;
mod engine;

pub use array::{ArrayLayout, ElementType};

use crate::buffer::NativeBuffer;
use crate::error::{FfiResult, LayoutError};
use crate::platform::Platform;
use crate::types::CType;
use crate::value::FieldMap;
use crate::view::StructView;
use std::collections::HashMap;
use std::sync::Arc;

/// What a field holds
#[derive(Debug, Clone, PartialEq)]
pub enum FieldSpec {
    Primitive(CType),
    Nested(Arc<Layout>),
    Array(Arc<ArrayLayout>),
    BitField { base: CType, width: u32 },
    /// Inner fields are promoted into the parent's namespace
    Anonymous(Box<FieldSpec>),
}

impl FieldSpec {
    pub fn bits(base: CType, width: u32) -> Self {
        FieldSpec::BitField { base, width }
    }

    pub fn anonymous(inner: impl Into<FieldSpec>) -> Self {
        FieldSpec::Anonymous(Box::new(inner.into()))
    }

    /// `element[length]` for the host platform
    pub fn array(element: impl Into<ElementType>, length: u32) -> Result<Self, LayoutError> {
        Ok(FieldSpec::Array(ArrayLayout::new(element, length)?))
    }
}

impl From<CType> for FieldSpec {
    fn from(ty: CType) -> Self {
        FieldSpec::Primitive(ty)
    }
}

impl From<Arc<Layout>> for FieldSpec {
    fn from(layout: Arc<Layout>) -> Self {
        FieldSpec::Nested(layout)
    }
}

impl From<Arc<ArrayLayout>> for FieldSpec {
    fn from(array: Arc<ArrayLayout>) -> Self {
        FieldSpec::Array(array)
    }
}

/// A placed field
///
/// `spec` is never `Anonymous`; an anonymous member keeps its inner spec and
/// sets `anonymous`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub spec: FieldSpec,
    pub offset: u32,
    /// Zero for a bit field continuing an existing storage unit
    pub size: u32,
    pub alignment: u32,
    pub bit_offset: Option<u32>,
    pub bit_width: Option<u32>,
    pub storage_size: Option<u32>,
    pub anonymous: bool,
}

impl FieldDescriptor {
    pub fn is_bit_field(&self) -> bool {
        self.bit_width.is_some()
    }

    /// Bytes the field's value spans in the buffer
    pub fn extent(&self) -> u32 {
        self.storage_size.unwrap_or(self.size)
    }
}

/// Struct or union layout
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    name: Option<String>,
    fields: Vec<FieldDescriptor>,
    /// Every addressable name, promoted ones included, with absolute offsets
    lookup: HashMap<String, FieldDescriptor>,
    size: u32,
    alignment: u32,
    packed: bool,
    is_union: bool,
}

impl Layout {
    /// Compute a layout from ordered field specs
    ///
    /// Fails fast on the first bad field; no partial layout is returned.
    pub fn build(
        fields: Vec<(String, FieldSpec)>,
        packed: bool,
        is_union: bool,
        platform: &Platform,
    ) -> Result<Layout, LayoutError> {
        engine::compute(None, fields, packed, is_union, platform)
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name for messages, `struct`/`union` when unnamed
    pub fn display_name(&self) -> &str {
        match (&self.name, self.is_union) {
            (Some(name), _) => name,
            (None, true) => "union",
            (None, false) => "struct",
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    pub fn is_packed(&self) -> bool {
        self.packed
    }

    pub fn is_union(&self) -> bool {
        self.is_union
    }

    /// Declared fields, in declaration order
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Resolve a field or promoted anonymous sub-field, offset absolute
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.lookup.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup.contains_key(name)
    }

    /// Names visible to iteration: anonymous members replaced by their
    /// promoted fields, recursively
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        collect_keys(self, &mut keys);
        keys
    }

    /// Allocate a zeroed instance and apply `initial`
    pub fn create(self: &Arc<Self>, initial: FieldMap) -> FfiResult<StructView> {
        StructView::create(self, initial)
    }

    /// View an existing buffer of at least `size()` bytes
    pub fn wrap(self: &Arc<Self>, buffer: &NativeBuffer) -> FfiResult<StructView> {
        StructView::wrap(self, buffer)
    }
}

fn collect_keys(layout: &Layout, keys: &mut Vec<String>) {
    for field in &layout.fields {
        match (&field.spec, field.anonymous) {
            (FieldSpec::Nested(inner), true) => collect_keys(inner, keys),
            _ => keys.push(field.name.clone()),
        }
    }
}

/// Fluent construction of a [`Layout`]
#[derive(Debug, Clone)]
pub struct LayoutBuilder {
    name: Option<String>,
    fields: Vec<(String, FieldSpec)>,
    packed: bool,
    is_union: bool,
    platform: Platform,
}

impl LayoutBuilder {
    pub fn structure() -> Self {
        Self {
            name: None,
            fields: Vec::new(),
            packed: false,
            is_union: false,
            platform: Platform::host(),
        }
    }

    pub fn union() -> Self {
        Self {
            is_union: true,
            ..Self::structure()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn packed(mut self, packed: bool) -> Self {
        self.packed = packed;
        self
    }

    /// Alignment cap and widths to lay out for
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn field(mut self, name: impl Into<String>, spec: impl Into<FieldSpec>) -> Self {
        self.fields.push((name.into(), spec.into()));
        self
    }

    pub fn build(self) -> Result<Arc<Layout>, LayoutError> {
        engine::compute(
            self.name,
            self.fields,
            self.packed,
            self.is_union,
            &self.platform,
        )
        .map(Arc::new)
    }
}
