//! Live views over native memory
//!
//! - `StructView`: named access to a struct/union laid out by a `Layout`
//! - `ArrayView`: index access to an `ArrayLayout`
//! - `Field`: what a named or indexed lookup yields
//!
//! Views are cheap handles `(region, layout)`. Nested and array sub-views
//! share the top-level buffer, so writes through any of them are visible
//! through all. A view keeps its buffer alive, so it can never outlive the
//! memory it reads. Buffers are reference counted per thread; views are
//! therefore neither `Send` nor `Sync`.
//!
//! `to_object` produces a detached snapshot instead.

mod array;
pub(crate) mod bits;
mod structure;

pub use array::ArrayView;
pub use structure::StructView;

use crate::buffer::{NativeBuffer, Region};
use crate::error::{FfiError, FfiResult};
use crate::layout::{ArrayLayout, ElementType, FieldDescriptor, FieldSpec, Layout};
use crate::marshal;
use crate::value::Value;
use std::sync::Arc;

/// Result of a field or element lookup
#[derive(Debug, Clone)]
pub enum Field {
    /// Primitive or bit field, read by value
    Value(Value),
    /// Live view of a nested struct/union
    Struct(StructView),
    /// Live view of an array
    Array(ArrayView),
}

impl Field {
    /// Detached snapshot
    pub fn to_value(&self) -> FfiResult<Value> {
        match self {
            Field::Value(value) => Ok(value.clone()),
            Field::Struct(view) => Ok(Value::Struct(view.to_object()?)),
            Field::Array(view) => Ok(Value::Array(view.to_vec()?)),
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Field::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructView> {
        match self {
            Field::Struct(view) => Some(view),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayView> {
        match self {
            Field::Array(view) => Some(view),
            _ => None,
        }
    }

    pub fn into_struct(self) -> FfiResult<StructView> {
        match self {
            Field::Struct(view) => Ok(view),
            other => Err(FfiError::type_mismatch("struct", other.kind())),
        }
    }

    pub fn into_array(self) -> FfiResult<ArrayView> {
        match self {
            Field::Array(view) => Ok(view),
            other => Err(FfiError::type_mismatch("array", other.kind())),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Field::Value(value) => value.type_name(),
            Field::Struct(_) => "struct",
            Field::Array(_) => "array",
        }
    }
}

/// Read the field described by `field` from `region`
pub(crate) fn load_field(region: &Region, field: &FieldDescriptor) -> FfiResult<Field> {
    let offset = field.offset as usize;
    match &field.spec {
        FieldSpec::Primitive(ty) => Ok(Field::Value(marshal::read_scalar(*ty, region, offset)?)),
        FieldSpec::BitField { base, width } => Ok(Field::Value(bits::read(
            region,
            offset,
            *base,
            field.bit_offset.unwrap_or(0),
            *width,
        )?)),
        FieldSpec::Nested(layout) => load_struct(region, offset, layout).map(Field::Struct),
        FieldSpec::Array(array) => load_array(region, offset, array).map(Field::Array),
        FieldSpec::Anonymous(_) => Err(FfiError::type_mismatch("resolved field", "anonymous")),
    }
}

/// Write `value` into the field described by `field`
pub(crate) fn store_field(region: &Region, field: &FieldDescriptor, value: &Value) -> FfiResult<()> {
    let offset = field.offset as usize;
    match &field.spec {
        FieldSpec::Primitive(ty) => marshal::write_scalar(*ty, region, offset, value),
        FieldSpec::BitField { base, width } => bits::write(
            region,
            offset,
            *base,
            field.bit_offset.unwrap_or(0),
            *width,
            value,
        ),
        FieldSpec::Nested(layout) => load_struct(region, offset, layout)?.assign(value),
        FieldSpec::Array(array) => load_array(region, offset, array)?.assign(value),
        FieldSpec::Anonymous(_) => Err(FfiError::type_mismatch("resolved field", "anonymous")),
    }
}

/// Read one array element
pub(crate) fn load_element(
    region: &Region,
    offset: usize,
    element: &ElementType,
) -> FfiResult<Field> {
    match element {
        ElementType::Primitive(ty) => Ok(Field::Value(marshal::read_scalar(*ty, region, offset)?)),
        ElementType::Struct(layout) => load_struct(region, offset, layout).map(Field::Struct),
        ElementType::Array(array) => load_array(region, offset, array).map(Field::Array),
    }
}

/// Write one array element
pub(crate) fn store_element(
    region: &Region,
    offset: usize,
    element: &ElementType,
    value: &Value,
) -> FfiResult<()> {
    match element {
        ElementType::Primitive(ty) => marshal::write_scalar(*ty, region, offset, value),
        ElementType::Struct(layout) => load_struct(region, offset, layout)?.assign(value),
        ElementType::Array(array) => load_array(region, offset, array)?.assign(value),
    }
}

/// Run `apply` against a staged copy of `region`, then commit the staged
/// bytes in one write
///
/// On error `region` is left exactly as it was. Keep-alive entries travel
/// with the bytes in both directions.
pub(crate) fn staged<F>(region: &Region, apply: F) -> FfiResult<()>
where
    F: FnOnce(&Region) -> FfiResult<()>,
{
    if region.owner().is_none() {
        // Foreign memory cannot keep text alive; neither may its stage
        let mut scratch = region.to_vec();
        // SAFETY: `scratch` outlives `stage`, which is dropped before it is read
        let stage = unsafe { Region::foreign(scratch.as_mut_ptr() as u64, scratch.len()) };
        apply(&stage)?;
        drop(stage);
        return region.write_from(0, &scratch);
    }

    let stage = NativeBuffer::from_bytes(&region.to_vec()).region();
    for (offset, kept) in region.kept() {
        stage.keep_at(offset, kept);
    }
    apply(&stage)?;
    region.write_from(0, &stage.to_vec())?;
    for (offset, kept) in stage.kept() {
        region.keep_at(offset, kept);
    }
    Ok(())
}

fn load_struct(region: &Region, offset: usize, layout: &Arc<Layout>) -> FfiResult<StructView> {
    let sub = region.sub(offset, layout.size() as usize)?;
    StructView::wrap_region(layout, sub)
}

fn load_array(region: &Region, offset: usize, array: &Arc<ArrayLayout>) -> FfiResult<ArrayView> {
    let sub = region.sub(offset, array.size() as usize)?;
    ArrayView::wrap_region(array, sub)
}
