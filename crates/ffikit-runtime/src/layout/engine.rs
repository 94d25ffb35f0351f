//! Offset, padding and bit-packing computation

use super::{FieldDescriptor, FieldSpec, Layout};
use crate::error::LayoutError;
use crate::platform::Platform;
use crate::types::CType;
use std::collections::HashMap;
use tracing::debug;

/// Storage unit currently receiving bit fields
#[derive(Clone, Copy)]
struct BitUnit {
    base: CType,
    bit_cursor: u32,
    offset: u32,
}

pub(super) fn compute(
    name: Option<String>,
    fields: Vec<(String, FieldSpec)>,
    packed: bool,
    is_union: bool,
    platform: &Platform,
) -> Result<Layout, LayoutError> {
    let mut placed: Vec<FieldDescriptor> = Vec::with_capacity(fields.len());
    let mut lookup: HashMap<String, FieldDescriptor> = HashMap::new();
    let mut cursor: u32 = 0;
    let mut max_align: u32 = 1;
    let mut max_size: u32 = 0;
    let mut unit: Option<BitUnit> = None;

    for (field_name, spec) in fields {
        validate_name(&field_name)?;
        if lookup.contains_key(&field_name) {
            return Err(LayoutError::DuplicateField(field_name));
        }

        let (spec, anonymous) = match spec {
            FieldSpec::Anonymous(inner) => match *inner {
                FieldSpec::BitField { .. } | FieldSpec::Anonymous(_) => {
                    return Err(LayoutError::InvalidAnonymous(field_name));
                }
                inner => (inner, true),
            },
            other => (other, false),
        };

        let descriptor = match spec {
            FieldSpec::BitField { base, width } => {
                check_bit_field(&field_name, base, width)?;
                let align = if packed { 1 } else { base.capped_alignment(platform) };
                max_align = max_align.max(align);
                max_size = max_size.max(base.size());

                let continuing = unit.filter(|u| {
                    !is_union && u.base == base && u.bit_cursor + width <= base.size() * 8
                });
                let (offset, bit_offset, size) = match continuing {
                    Some(current) => {
                        unit = Some(BitUnit {
                            bit_cursor: current.bit_cursor + width,
                            ..current
                        });
                        (current.offset, current.bit_cursor, 0)
                    }
                    None if is_union => (0, 0, base.size()),
                    None => {
                        let offset = align_up(cursor, align);
                        cursor = advance(offset, base.size())?;
                        unit = Some(BitUnit {
                            base,
                            bit_cursor: width,
                            offset,
                        });
                        (offset, 0, base.size())
                    }
                };

                FieldDescriptor {
                    name: field_name,
                    spec: FieldSpec::BitField { base, width },
                    offset,
                    size,
                    alignment: align,
                    bit_offset: Some(bit_offset),
                    bit_width: Some(width),
                    storage_size: Some(base.size()),
                    anonymous: false,
                }
            }
            spec => {
                // Any other field closes the open storage unit
                unit = None;

                let (size, natural) = match &spec {
                    FieldSpec::Primitive(CType::Void) => {
                        return Err(LayoutError::VoidField(field_name));
                    }
                    FieldSpec::Primitive(ty) => (ty.size(), ty.capped_alignment(platform)),
                    FieldSpec::Nested(layout) => (layout.size(), layout.alignment()),
                    FieldSpec::Array(array) => (
                        array.size(),
                        array.alignment().min(platform.pointer_width).max(1),
                    ),
                    FieldSpec::BitField { .. } | FieldSpec::Anonymous(_) => {
                        return Err(LayoutError::InvalidDefinition(format!(
                            "field '{}' has an unresolved spec",
                            field_name
                        )));
                    }
                };
                let align = if packed { 1 } else { natural };
                max_align = max_align.max(align);
                max_size = max_size.max(size);

                let offset = if is_union { 0 } else { align_up(cursor, align) };
                if !is_union {
                    cursor = advance(offset, size)?;
                }

                FieldDescriptor {
                    name: field_name,
                    spec,
                    offset,
                    size,
                    alignment: align,
                    bit_offset: None,
                    bit_width: None,
                    storage_size: None,
                    anonymous,
                }
            }
        };

        register(&mut lookup, &descriptor)?;
        placed.push(descriptor);
    }

    let size = if is_union {
        align_up(max_size, max_align)
    } else if packed {
        cursor
    } else {
        align_up(cursor, max_align)
    };

    let layout = Layout {
        name,
        fields: placed,
        lookup,
        size,
        alignment: max_align,
        packed,
        is_union,
    };

    debug!(
        layout = layout.display_name(),
        size = layout.size,
        alignment = layout.alignment,
        fields = layout.fields.len(),
        packed,
        "Layout built"
    );

    Ok(layout)
}

/// Add a field, and any names it promotes, to the lookup table
fn register(
    lookup: &mut HashMap<String, FieldDescriptor>,
    descriptor: &FieldDescriptor,
) -> Result<(), LayoutError> {
    lookup.insert(descriptor.name.clone(), descriptor.clone());

    if let (true, FieldSpec::Nested(inner)) = (descriptor.anonymous, &descriptor.spec) {
        // Sorted so the reported clash does not depend on hash order
        let mut promoted: Vec<&FieldDescriptor> = inner.lookup.values().collect();
        promoted.sort_by(|a, b| a.offset.cmp(&b.offset).then(a.name.cmp(&b.name)));

        for sub in promoted {
            if lookup.contains_key(&sub.name) {
                return Err(LayoutError::DuplicateField(sub.name.clone()));
            }
            let mut absolute = sub.clone();
            absolute.offset += descriptor.offset;
            lookup.insert(sub.name.clone(), absolute);
        }
    }
    Ok(())
}

fn check_bit_field(name: &str, base: CType, width: u32) -> Result<(), LayoutError> {
    if !base.is_integer() {
        return Err(LayoutError::InvalidBitFieldBase {
            name: name.to_string(),
            base: base.name().to_string(),
        });
    }
    let max = base.size() * 8;
    if width == 0 || width > max {
        return Err(LayoutError::InvalidBitWidth {
            name: name.to_string(),
            width,
            max,
        });
    }
    Ok(())
}

/// Identifier rules: `[A-Za-z_][A-Za-z0-9_]*`
fn validate_name(name: &str) -> Result<(), LayoutError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(LayoutError::InvalidName(name.to_string()))
    }
}

pub(crate) fn align_up(value: u32, align: u32) -> u32 {
    if align <= 1 {
        return value;
    }
    (value + align - 1) / align * align
}

fn advance(offset: u32, size: u32) -> Result<u32, LayoutError> {
    offset
        .checked_add(size)
        .ok_or_else(|| LayoutError::InvalidDefinition("layout exceeds 4 GiB".to_string()))
}
