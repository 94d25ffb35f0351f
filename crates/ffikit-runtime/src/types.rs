//! Primitive C type catalogue
//!
//! Defines:
//! - `CType`: identifier of every primitive the layout engine understands
//! - `TypeDescriptor`: size, natural alignment and the reader/writer pair
//!
//! Descriptors are process-wide constants. Widths that depend on the target
//! (`pointer`, `size_t`, `long`, `wchar_t`) are fixed at compile time.

use crate::buffer::Region;
use crate::error::{FfiResult, LayoutError};
use crate::marshal;
use crate::platform::{Platform, WCHAR_WIDTH};
use crate::value::Value;
use libffi::middle::Type;
use std::fmt;
use std::str::FromStr;

/// Primitive C type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CType {
    /// No value, only valid as a return type
    Void,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    /// C `_Bool`, one byte
    Bool,
    /// Untyped `void*`
    Pointer,
    /// `char*`, NUL-terminated UTF-8
    CString,
    /// `wchar_t*`, NUL-terminated wide string
    WString,
    /// Single `wchar_t` unit
    WChar,
    SizeT,
    SSizeT,
    /// C `long`, 4 or 8 bytes depending on target
    Long,
    ULong,
}

/// Every identifier, in descriptor table order
pub const ALL_TYPES: [CType; 20] = [
    CType::Void,
    CType::Int8,
    CType::UInt8,
    CType::Int16,
    CType::UInt16,
    CType::Int32,
    CType::UInt32,
    CType::Int64,
    CType::UInt64,
    CType::Float,
    CType::Double,
    CType::Bool,
    CType::Pointer,
    CType::CString,
    CType::WString,
    CType::WChar,
    CType::SizeT,
    CType::SSizeT,
    CType::Long,
    CType::ULong,
];

/// Accepted spellings, canonical name first
const NAMES: &[(&str, CType)] = &[
    ("void", CType::Void),
    ("int8", CType::Int8),
    ("int8_t", CType::Int8),
    ("char", CType::Int8),
    ("uint8", CType::UInt8),
    ("uint8_t", CType::UInt8),
    ("uchar", CType::UInt8),
    ("unsigned char", CType::UInt8),
    ("int16", CType::Int16),
    ("int16_t", CType::Int16),
    ("short", CType::Int16),
    ("uint16", CType::UInt16),
    ("uint16_t", CType::UInt16),
    ("ushort", CType::UInt16),
    ("int32", CType::Int32),
    ("int32_t", CType::Int32),
    ("int", CType::Int32),
    ("uint32", CType::UInt32),
    ("uint32_t", CType::UInt32),
    ("uint", CType::UInt32),
    ("unsigned int", CType::UInt32),
    ("int64", CType::Int64),
    ("int64_t", CType::Int64),
    ("long long", CType::Int64),
    ("uint64", CType::UInt64),
    ("uint64_t", CType::UInt64),
    ("unsigned long long", CType::UInt64),
    ("float", CType::Float),
    ("double", CType::Double),
    ("bool", CType::Bool),
    ("_Bool", CType::Bool),
    ("pointer", CType::Pointer),
    ("void*", CType::Pointer),
    ("ptr", CType::Pointer),
    ("string", CType::CString),
    ("char*", CType::CString),
    ("cstring", CType::CString),
    ("wstring", CType::WString),
    ("wchar_t*", CType::WString),
    ("wchar", CType::WChar),
    ("wchar_t", CType::WChar),
    ("size_t", CType::SizeT),
    ("ssize_t", CType::SSizeT),
    ("long", CType::Long),
    ("c_long", CType::Long),
    ("ulong", CType::ULong),
    ("unsigned long", CType::ULong),
    ("c_ulong", CType::ULong),
];

impl CType {
    /// Resolve a type name or alias
    ///
    /// # Examples
    ///
    /// ```
    /// # use ffikit_runtime::CType;
    /// assert_eq!(CType::from_name("int").unwrap(), CType::Int32);
    /// assert_eq!(CType::from_name("char*").unwrap(), CType::CString);
    /// assert!(CType::from_name("int128").is_err());
    /// ```
    pub fn from_name(name: &str) -> Result<CType, LayoutError> {
        let trimmed = name.trim();
        NAMES
            .iter()
            .find(|(n, _)| *n == trimmed)
            .map(|(_, ty)| *ty)
            .ok_or_else(|| LayoutError::UnknownType(name.to_string()))
    }

    /// Canonical name
    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    /// Static descriptor for this type
    pub fn descriptor(self) -> &'static TypeDescriptor {
        &DESCRIPTORS[self as usize]
    }

    /// Size in bytes on the host
    pub fn size(self) -> u32 {
        self.descriptor().size
    }

    /// Natural alignment, before any layout cap is applied
    pub fn alignment(self) -> u32 {
        self.descriptor().alignment
    }

    /// Alignment as placed by the layout engine for `platform`
    pub fn capped_alignment(self, platform: &Platform) -> u32 {
        self.alignment().min(platform.pointer_width).max(1)
    }

    /// Integer-like types usable as a bit-field base
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            CType::Int8
                | CType::UInt8
                | CType::Int16
                | CType::UInt16
                | CType::Int32
                | CType::UInt32
                | CType::Int64
                | CType::UInt64
                | CType::SizeT
                | CType::SSizeT
                | CType::Long
                | CType::ULong
                | CType::Bool
        )
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            CType::Int8
                | CType::Int16
                | CType::Int32
                | CType::Int64
                | CType::SSizeT
                | CType::Long
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, CType::Float | CType::Double)
    }

    /// Types whose bytes hold an address
    pub fn is_pointer_like(self) -> bool {
        matches!(self, CType::Pointer | CType::CString | CType::WString)
    }

    /// libffi description used for calls and trampolines
    pub fn ffi_type(self) -> Type {
        match self {
            CType::Void => Type::void(),
            CType::Int8 => Type::i8(),
            CType::UInt8 | CType::Bool => Type::u8(),
            CType::Int16 => Type::i16(),
            CType::UInt16 => Type::u16(),
            CType::Int32 => Type::i32(),
            CType::UInt32 => Type::u32(),
            CType::Int64 => Type::i64(),
            CType::UInt64 => Type::u64(),
            CType::Float => Type::f32(),
            CType::Double => Type::f64(),
            CType::Pointer | CType::CString | CType::WString => Type::pointer(),
            CType::SizeT => Type::usize(),
            CType::SSizeT => Type::isize(),
            CType::WChar => {
                if WCHAR_WIDTH == 2 {
                    Type::u16()
                } else {
                    Type::i32()
                }
            }
            CType::Long => {
                if LONG == 4 {
                    Type::i32()
                } else {
                    Type::i64()
                }
            }
            CType::ULong => {
                if LONG == 4 {
                    Type::u32()
                } else {
                    Type::u64()
                }
            }
        }
    }
}

impl fmt::Display for CType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CType {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CType::from_name(s)
    }
}

/// Size, alignment and accessors of one primitive
#[derive(Debug, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub id: CType,
    pub name: &'static str,
    pub size: u32,
    pub alignment: u32,
}

impl TypeDescriptor {
    /// Read a value at `offset` within `region`
    pub fn read(&self, region: &Region, offset: usize) -> FfiResult<Value> {
        marshal::read_scalar(self.id, region, offset)
    }

    /// Write `value` at `offset` within `region`, coercing where possible
    pub fn write(&self, region: &Region, offset: usize, value: &Value) -> FfiResult<()> {
        marshal::write_scalar(self.id, region, offset, value)
    }
}

const PTR: u32 = Platform::host().pointer_width;
const LONG: u32 = Platform::host().long_width;

const fn desc(id: CType, name: &'static str, size: u32) -> TypeDescriptor {
    TypeDescriptor {
        id,
        name,
        size,
        alignment: if size == 0 { 1 } else { size },
    }
}

static DESCRIPTORS: [TypeDescriptor; 20] = [
    desc(CType::Void, "void", 0),
    desc(CType::Int8, "int8", 1),
    desc(CType::UInt8, "uint8", 1),
    desc(CType::Int16, "int16", 2),
    desc(CType::UInt16, "uint16", 2),
    desc(CType::Int32, "int32", 4),
    desc(CType::UInt32, "uint32", 4),
    desc(CType::Int64, "int64", 8),
    desc(CType::UInt64, "uint64", 8),
    desc(CType::Float, "float", 4),
    desc(CType::Double, "double", 8),
    desc(CType::Bool, "bool", 1),
    desc(CType::Pointer, "pointer", PTR),
    desc(CType::CString, "string", PTR),
    desc(CType::WString, "wstring", PTR),
    desc(CType::WChar, "wchar", WCHAR_WIDTH),
    desc(CType::SizeT, "size_t", PTR),
    desc(CType::SSizeT, "ssize_t", PTR),
    desc(CType::Long, "long", LONG),
    desc(CType::ULong, "ulong", LONG),
];
