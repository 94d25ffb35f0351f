//! Host platform constants
//!
//! Widths that differ between targets (pointers, `wchar_t`, `long`) are
//! resolved once from the compilation target and never change afterwards.

use std::mem::size_of;
use std::os::raw::c_long;

/// Target widths relevant to C layout, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    /// Width of a data pointer, also the alignment cap of the layout engine
    pub pointer_width: u32,
    /// Width of one `wchar_t` unit (2 on Windows, 4 elsewhere)
    pub wchar_width: u32,
    /// Width of C `long` (4 on Windows and 32-bit targets)
    pub long_width: u32,
}

impl Platform {
    /// The platform this process runs on
    pub const fn host() -> Self {
        Self {
            pointer_width: size_of::<usize>() as u32,
            wchar_width: if cfg!(windows) { 2 } else { 4 },
            long_width: size_of::<c_long>() as u32,
        }
    }

    /// Same platform with a different alignment cap
    pub const fn with_pointer_width(self, pointer_width: u32) -> Self {
        Self {
            pointer_width,
            ..self
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::host()
    }
}

/// `size_of::<wchar_t>()` for the host
pub const WCHAR_WIDTH: u32 = Platform::host().wchar_width;
