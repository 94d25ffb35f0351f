//! Raw memory helpers
//!
//! Reads through raw addresses are `unsafe`; everything that goes through a
//! [`NativeBuffer`] is bounds-checked.

use crate::buffer::{NativeBuffer, Region};
use crate::error::{FfiError, FfiResult};
use crate::layout::FieldSpec;
use crate::marshal;
use crate::types::CType;
use crate::value::Value;

/// Zero-filled, 16-byte aligned allocation that never moves
pub fn alloc(size: usize) -> NativeBuffer {
    NativeBuffer::alloc(size)
}

/// NUL-terminated UTF-8 copy of `text`
pub fn cstring(text: &str) -> FfiResult<NativeBuffer> {
    marshal::cstring(text)
}

/// NUL-terminated `wchar_t` copy of `text`
pub fn wstring(text: &str) -> NativeBuffer {
    marshal::wstring(text)
}

/// Read one `ty` at `address + offset`
///
/// # Safety
///
/// The addressed bytes must be readable and, for `string`/`wstring`, hold a
/// valid string address or NULL.
pub unsafe fn read_value(address: u64, ty: CType, offset: usize) -> FfiResult<Value> {
    if address == 0 {
        return Err(FfiError::NullPointer);
    }
    let region = Region::foreign(address, offset + ty.size() as usize);
    marshal::read_scalar(ty, &region, offset)
}

/// Write one `ty` at `offset` inside `buffer`
///
/// Text written to a `string`/`wstring` slot is copied into a fresh buffer
/// that `buffer` keeps alive.
pub fn write_value(buffer: &NativeBuffer, ty: CType, offset: usize, value: &Value) -> FfiResult<()> {
    marshal::write_scalar(ty, &buffer.region(), offset, value)
}

/// UTF-8 text at `address`, stopping at NUL or after `max_len` bytes
///
/// # Safety
///
/// `address` must point to a NUL-terminated string or to at least `max_len`
/// readable bytes.
pub unsafe fn read_cstring(address: u64, max_len: Option<usize>) -> FfiResult<String> {
    if address == 0 {
        return Err(FfiError::NullPointer);
    }
    Ok(marshal::read_cstring(address, max_len))
}

/// Wide text at `address`, stopping at NUL or after `max_units` units
///
/// # Safety
///
/// Same contract as [`read_cstring`], in `wchar_t` units.
pub unsafe fn read_wstring(address: u64, max_units: Option<usize>) -> FfiResult<String> {
    if address == 0 {
        return Err(FfiError::NullPointer);
    }
    Ok(marshal::read_wstring(address, max_units))
}

/// Copy `len` bytes starting at `address`
///
/// # Safety
///
/// `address..address + len` must be readable.
pub unsafe fn ptr_to_bytes(address: u64, len: usize) -> FfiResult<Vec<u8>> {
    if address == 0 {
        return Err(FfiError::NullPointer);
    }
    Ok(Region::foreign(address, len).to_vec())
}

/// Bytes a field of this kind occupies
pub fn sizeof(spec: &FieldSpec) -> u32 {
    match spec {
        FieldSpec::Primitive(ty) => ty.size(),
        FieldSpec::Nested(layout) => layout.size(),
        FieldSpec::Array(array) => array.size(),
        FieldSpec::BitField { base, .. } => base.size(),
        FieldSpec::Anonymous(inner) => sizeof(inner),
    }
}

pub fn addressof(buffer: &NativeBuffer) -> u64 {
    buffer.address()
}
