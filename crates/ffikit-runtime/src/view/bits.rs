//! Bit-field extraction and merge over a storage unit
//!
//! All arithmetic is 64-bit so `uint64`/`int64` bases keep every bit.

use crate::buffer::Region;
use crate::error::FfiResult;
use crate::marshal::{coerce_bits, extend};
use crate::types::CType;
use crate::value::Value;

pub(crate) fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// `(raw >> bit_offset) & mask`
pub(crate) fn extract(raw: u64, bit_offset: u32, width: u32) -> u64 {
    (raw >> bit_offset) & mask(width)
}

/// `(raw & !(mask << bit_offset)) | ((value & mask) << bit_offset)`
pub(crate) fn merge(raw: u64, bit_offset: u32, width: u32, value: u64) -> u64 {
    let m = mask(width);
    (raw & !(m << bit_offset)) | ((value & m) << bit_offset)
}

fn load_unit(region: &Region, offset: usize, storage: usize) -> FfiResult<u64> {
    let mut word = [0u8; 8];
    region.read_into(offset, &mut word[..storage])?;
    Ok(u64::from_le_bytes(word))
}

/// Read one bit field; signed bases are sign-extended from `width`
pub(crate) fn read(
    region: &Region,
    offset: usize,
    base: CType,
    bit_offset: u32,
    width: u32,
) -> FfiResult<Value> {
    let raw = load_unit(region, offset, base.size() as usize)?;
    let bits = extract(raw, bit_offset, width);
    Ok(match base {
        CType::Bool => Value::Bool(bits != 0),
        _ => extend(bits, width, base.is_signed()),
    })
}

/// Write one bit field, leaving every other bit of the unit untouched
pub(crate) fn write(
    region: &Region,
    offset: usize,
    base: CType,
    bit_offset: u32,
    width: u32,
    value: &Value,
) -> FfiResult<()> {
    let incoming = match (base, value) {
        (CType::Bool, Value::Float(f)) => (*f != 0.0) as u64,
        (CType::Bool, other) => (coerce_bits(base, other)? != 0) as u64,
        (_, other) => coerce_bits(base, other)?,
    };
    let storage = base.size() as usize;
    let raw = load_unit(region, offset, storage)?;
    let updated = merge(raw, bit_offset, width, incoming);
    region.write_from(offset, &updated.to_le_bytes()[..storage])
}
