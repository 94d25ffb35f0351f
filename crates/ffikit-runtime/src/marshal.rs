//! Value marshaling - language values ↔ native bytes
//!
//! Provides:
//! - `read_scalar` / `write_scalar`: the reader/writer pair behind every
//!   `TypeDescriptor`
//! - C string and wide string encoding/decoding
//! - `MarshalContext`: argument images for a foreign call, keeping temporary
//!   strings alive until the call returns
//!
//! # Memory Safety
//!
//! - Integers travel as 64-bit bit patterns, never through `f64`
//! - Text written into a pointer slot is copied into a fresh `NativeBuffer`
//!   that the destination buffer retains for that slot
//! - Reading a string slot of owned memory dereferences only the buffer the
//!   slot retains; any other address reads back as `Value::Pointer`. NULL
//!   reads as `Value::Null`
//! - Foreign memory is dereferenced under the contract of `Region::foreign`

use crate::buffer::{NativeBuffer, Region};
use crate::error::{FfiError, FfiResult};
use crate::platform::WCHAR_WIDTH;
use crate::types::CType;
use crate::value::Value;
use std::ffi::CStr;
use std::os::raw::c_char;

/// Integer bit pattern for `value`, wrapping to 64 bits
///
/// Floats are truncated toward zero, booleans become 0/1 and pointers their
/// address. Text is a `TypeError`.
pub fn coerce_bits(target: CType, value: &Value) -> FfiResult<u64> {
    match value {
        Value::Int(i) => Ok(*i as u64),
        Value::UInt(u) => Ok(*u),
        Value::Bool(b) => Ok(*b as u64),
        Value::Float(f) => Ok(if target.is_signed() || *f < 0.0 {
            *f as i64 as u64
        } else {
            *f as u64
        }),
        Value::Pointer(p) => Ok(*p),
        Value::Null => Ok(0),
        other => Err(FfiError::type_mismatch(target.name(), other.type_name())),
    }
}

/// Sign- or zero-extend the low `bits` of `raw`
pub fn extend(raw: u64, bits: u32, signed: bool) -> Value {
    if bits == 0 {
        return if signed { Value::Int(0) } else { Value::UInt(0) };
    }
    let shift = 64 - bits.min(64);
    if signed {
        Value::Int(((raw << shift) as i64) >> shift)
    } else {
        Value::UInt((raw << shift) >> shift)
    }
}

/// Little-endian bytes → value, for types that do not dereference memory
pub fn decode(ty: CType, bytes: &[u8]) -> Value {
    let mut word = [0u8; 8];
    let n = bytes.len().min(8);
    word[..n].copy_from_slice(&bytes[..n]);
    let raw = u64::from_le_bytes(word);

    match ty {
        CType::Void => Value::Null,
        CType::Float => Value::Float(f32::from_bits(raw as u32) as f64),
        CType::Double => Value::Float(f64::from_bits(raw)),
        CType::Bool => Value::Bool(raw & 0xff != 0),
        CType::Pointer | CType::CString | CType::WString => Value::Pointer(raw),
        CType::WChar => {
            let unit = raw & if WCHAR_WIDTH == 2 { 0xffff } else { 0xffff_ffff };
            match char::from_u32(unit as u32) {
                Some(c) => Value::Str(c.to_string()),
                None => Value::UInt(unit),
            }
        }
        _ => extend(raw, ty.size() * 8, ty.is_signed()),
    }
}

/// Value → little-endian bytes of `ty.size()`, for types that do not
/// allocate
pub fn encode(ty: CType, value: &Value) -> FfiResult<Vec<u8>> {
    let size = ty.size() as usize;
    let bytes = match ty {
        CType::Void => return Ok(Vec::new()),
        CType::Float => {
            let f = value
                .as_f64()
                .ok_or_else(|| FfiError::type_mismatch("float", value.type_name()))?;
            (f as f32).to_le_bytes().to_vec()
        }
        CType::Double => {
            let f = value
                .as_f64()
                .ok_or_else(|| FfiError::type_mismatch("double", value.type_name()))?;
            f.to_le_bytes().to_vec()
        }
        CType::Bool => {
            let truthy = match value {
                Value::Bool(b) => *b,
                Value::Float(f) => *f != 0.0,
                other => coerce_bits(ty, other)? != 0,
            };
            vec![truthy as u8]
        }
        CType::WChar => {
            let unit = match value {
                Value::Str(s) => {
                    let mut chars = s.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) => c as u64,
                        _ => return Err(FfiError::type_mismatch("one character", "string")),
                    }
                }
                other => coerce_bits(ty, other)?,
            };
            unit.to_le_bytes()[..size].to_vec()
        }
        CType::Pointer | CType::CString | CType::WString => {
            let address = match value {
                Value::Buffer(buffer) => buffer.address(),
                Value::Pointer(p) => *p,
                Value::Null => 0,
                Value::Int(_) | Value::UInt(_) => coerce_bits(ty, value)?,
                other => return Err(FfiError::type_mismatch(ty.name(), other.type_name())),
            };
            address.to_le_bytes()[..size].to_vec()
        }
        _ => coerce_bits(ty, value)?.to_le_bytes()[..size].to_vec(),
    };
    Ok(bytes)
}

/// Reader of a `TypeDescriptor`
pub fn read_scalar(ty: CType, region: &Region, offset: usize) -> FfiResult<Value> {
    let mut bytes = vec![0u8; ty.size() as usize];
    region.read_into(offset, &mut bytes)?;
    if region.owner().is_none() || !matches!(ty, CType::CString | CType::WString) {
        return from_native(ty, &bytes);
    }

    match decode(ty, &bytes) {
        Value::Pointer(0) => Ok(Value::Null),
        Value::Pointer(address) => Ok(match region.kept_at(offset) {
            Some(kept) if kept.address() == address => Value::Str(kept_text(ty, &kept)),
            _ => Value::Pointer(address),
        }),
        other => Ok(other),
    }
}

// Text of a retained string buffer, bounded by its allocation
fn kept_text(ty: CType, kept: &NativeBuffer) -> String {
    let bytes = kept.to_vec();
    if ty == CType::CString {
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        return String::from_utf8_lossy(&bytes[..end]).into_owned();
    }
    let width = WCHAR_WIDTH as usize;
    let units = bytes
        .chunks_exact(width)
        .position(|unit| unit.iter().all(|b| *b == 0))
        .unwrap_or(bytes.len() / width);
    decode_wide(&bytes[..units * width], WCHAR_WIDTH)
}

/// Writer of a `TypeDescriptor`
///
/// Text written to a `string`/`wstring` slot is copied into a new buffer
/// retained by the region's owner. Buffers written to any pointer slot are
/// retained the same way. Integers are rejected for string slots; an explicit
/// `Value::Pointer` is stored but reads back as a pointer.
pub fn write_scalar(ty: CType, region: &Region, offset: usize, value: &Value) -> FfiResult<()> {
    let value = match (ty, value) {
        (CType::Void, _) => return Err(FfiError::type_mismatch("a sized type", "void")),
        (CType::CString | CType::WString, Value::Int(_) | Value::UInt(_)) => {
            return Err(FfiError::type_mismatch(
                "text, buffer, pointer or null",
                value.type_name(),
            ));
        }
        (CType::CString | CType::WString, Value::Str(text)) => {
            // Nothing could keep the copy alive
            if region.owner().is_none() {
                return Err(FfiError::type_mismatch(
                    "buffer or address for foreign memory",
                    "string",
                ));
            }
            if ty == CType::CString {
                Value::Buffer(cstring(text)?)
            } else {
                Value::Buffer(wstring(text))
            }
        }
        _ => value.clone(),
    };

    let bytes = encode(ty, &value)?;
    region.write_from(offset, &bytes)?;
    if let Value::Buffer(target) = &value {
        region.keep_at(offset, target.clone());
    }
    Ok(())
}

/// Decode a value image produced by native code (argument or return)
///
/// `string`/`wstring` images are dereferenced; NULL becomes `Value::Null`.
pub fn from_native(ty: CType, bytes: &[u8]) -> FfiResult<Value> {
    let size = ty.size() as usize;
    if bytes.len() < size {
        return Err(FfiError::Bounds {
            needed: size,
            available: bytes.len(),
        });
    }
    Ok(match (ty, decode(ty, &bytes[..size])) {
        (CType::CString | CType::WString, Value::Pointer(0)) => Value::Null,
        // SAFETY: native code declared a string at this position
        (CType::CString, Value::Pointer(address)) => {
            Value::Str(unsafe { read_cstring(address, None) })
        }
        (CType::WString, Value::Pointer(address)) => {
            Value::Str(unsafe { read_wstring(address, None) })
        }
        (_, value) => value,
    })
}

/// Allocate a NUL-terminated UTF-8 copy of `text`
pub fn cstring(text: &str) -> FfiResult<NativeBuffer> {
    if text.as_bytes().contains(&0) {
        return Err(FfiError::type_mismatch("string without NUL bytes", "string"));
    }
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(0);
    Ok(NativeBuffer::from_bytes(&bytes))
}

/// Allocate a NUL-terminated wide copy of `text` in host `wchar_t` units
pub fn wstring(text: &str) -> NativeBuffer {
    NativeBuffer::from_bytes(&encode_wide(text, WCHAR_WIDTH))
}

/// Wide encoding with a terminator: UTF-16 for 2-byte units, UTF-32 for 4
pub fn encode_wide(text: &str, unit_width: u32) -> Vec<u8> {
    let mut out = Vec::new();
    if unit_width == 2 {
        for unit in text.encode_utf16().chain(std::iter::once(0)) {
            out.extend_from_slice(&unit.to_le_bytes());
        }
    } else {
        for unit in text.chars().map(|c| c as u32).chain(std::iter::once(0)) {
            out.extend_from_slice(&unit.to_le_bytes());
        }
    }
    out
}

/// Decode wide units (without terminator) to text, replacing invalid units
pub fn decode_wide(bytes: &[u8], unit_width: u32) -> String {
    if unit_width == 2 {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .map(|u| char::from_u32(u).unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect()
    }
}

/// Read a NUL-terminated string at `address`, at most `max_len` bytes
///
/// # Safety
///
/// `address` must be non-zero and point to readable memory that either holds
/// a NUL within reach or is at least `max_len` bytes long.
pub unsafe fn read_cstring(address: u64, max_len: Option<usize>) -> String {
    let ptr = address as usize as *const c_char;
    match max_len {
        None => CStr::from_ptr(ptr).to_string_lossy().into_owned(),
        Some(max) => {
            let bytes = std::slice::from_raw_parts(ptr as *const u8, max);
            let end = bytes.iter().position(|b| *b == 0).unwrap_or(max);
            String::from_utf8_lossy(&bytes[..end]).into_owned()
        }
    }
}

/// Read a NUL-terminated wide string at `address`, at most `max_units` units
///
/// # Safety
///
/// Same contract as [`read_cstring`], in `wchar_t` units.
pub unsafe fn read_wstring(address: u64, max_units: Option<usize>) -> String {
    let width = WCHAR_WIDTH as usize;
    let mut bytes = Vec::new();
    let mut cursor = address as usize as *const u8;
    let mut count = 0usize;
    loop {
        if max_units.is_some_and(|max| count >= max) {
            break;
        }
        let unit = std::slice::from_raw_parts(cursor, width);
        if unit.iter().all(|b| *b == 0) {
            break;
        }
        bytes.extend_from_slice(unit);
        cursor = cursor.add(width);
        count += 1;
    }
    decode_wide(&bytes, WCHAR_WIDTH)
}

/// Marshal context for one foreign call
///
/// Tracks buffers allocated for string arguments so they stay valid while
/// native code runs.
///
/// # Example
///
/// ```
/// # use ffikit_runtime::{CType, MarshalContext, Value};
/// let mut ctx = MarshalContext::new();
/// let image = ctx.argument(&Value::Int(42), CType::Int32).unwrap();
/// assert_eq!(image, 42i32.to_le_bytes());
/// assert_eq!(ctx.return_value(CType::Int32, &image).unwrap(), Value::Int(42));
/// ```
pub struct MarshalContext {
    /// Temporary strings, freed when the context drops
    allocated: Vec<NativeBuffer>,
}

impl MarshalContext {
    pub fn new() -> Self {
        Self {
            allocated: Vec::new(),
        }
    }

    /// Byte image of `value` passed as a `ty` argument
    pub fn argument(&mut self, value: &Value, ty: CType) -> FfiResult<Vec<u8>> {
        let value = match (ty, value) {
            (CType::CString, Value::Str(text)) => {
                let buffer = cstring(text)?;
                self.allocated.push(buffer.clone());
                Value::Buffer(buffer)
            }
            (CType::WString, Value::Str(text)) => {
                let buffer = wstring(text);
                self.allocated.push(buffer.clone());
                Value::Buffer(buffer)
            }
            (CType::Void, _) => {
                return Err(FfiError::type_mismatch("a sized argument type", "void"));
            }
            _ => value.clone(),
        };
        encode(ty, &value)
    }

    /// Decode a raw return image
    ///
    /// `string`/`wstring` returns are dereferenced; NULL becomes `Value::Null`.
    pub fn return_value(&self, ty: CType, bytes: &[u8]) -> FfiResult<Value> {
        from_native(ty, bytes)
    }

    /// Number of temporaries held for the call
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }
}

impl Default for MarshalContext {
    fn default() -> Self {
        Self::new()
    }
}
