//! Typed pointer handles
//!
//! A `Pointer` is an address plus an optional target type. Pointers made
//! from a `NativeBuffer` keep it alive and bounds-check every access against
//! it. Pointers made from a raw address trust the caller, which is why those
//! constructors are `unsafe`.

use crate::buffer::{NativeBuffer, Region};
use crate::error::{FfiError, FfiResult};
use crate::layout::ElementType;
use crate::value::Value;
use crate::view::{load_element, store_element, Field};
use std::fmt;

#[derive(Clone)]
pub struct Pointer {
    address: u64,
    target: Option<ElementType>,
    /// Allocation the address points into, when known
    source: Option<NativeBuffer>,
}

impl Pointer {
    /// The NULL pointer
    pub fn null() -> Self {
        Self {
            address: 0,
            target: None,
            source: None,
        }
    }

    /// Pointer to the first byte of `buffer`, keeping it alive
    pub fn from_buffer(buffer: &NativeBuffer) -> Self {
        Self {
            address: buffer.address(),
            target: None,
            source: Some(buffer.clone()),
        }
    }

    /// Pointer to memory this crate does not own
    ///
    /// # Safety
    ///
    /// Every later dereference reads or writes `address` (scaled by index) as
    /// the target type. That memory must be valid for it at that time.
    pub unsafe fn from_address(address: u64) -> Self {
        Self {
            address,
            target: None,
            source: None,
        }
    }

    /// Same address, typed as `target`
    pub fn cast(mut self, target: impl Into<ElementType>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn is_null(&self) -> bool {
        self.address == 0
    }

    pub fn target(&self) -> Option<&ElementType> {
        self.target.as_ref()
    }

    /// Buffer the pointer was made from, if any
    pub fn buffer(&self) -> Option<&NativeBuffer> {
        self.source.as_ref()
    }

    /// Repoint at a buffer, or at NULL
    ///
    /// Raw addresses go through [`Pointer::set_address`].
    pub fn set(&mut self, value: &Value) -> FfiResult<()> {
        match value {
            Value::Buffer(buffer) => {
                self.address = buffer.address();
                self.source = Some(buffer.clone());
                Ok(())
            }
            Value::Null => {
                self.address = 0;
                self.source = None;
                Ok(())
            }
            other => Err(FfiError::type_mismatch("buffer or null", other.type_name())),
        }
    }

    /// Repoint at a raw address
    ///
    /// # Safety
    ///
    /// Same contract as [`Pointer::from_address`].
    pub unsafe fn set_address(&mut self, address: u64) {
        self.address = address;
        self.source = None;
    }

    /// The pointee
    pub fn contents(&self) -> FfiResult<Field> {
        self.get(0)
    }

    /// Alias of [`Pointer::contents`]
    pub fn deref(&self) -> FfiResult<Field> {
        self.contents()
    }

    pub fn set_contents(&self, value: impl Into<Value>) -> FfiResult<()> {
        self.set_index(0, value)
    }

    /// `self[index]`, scaled by the target size
    pub fn get(&self, index: isize) -> FfiResult<Field> {
        let (region, element) = self.element_region(index)?;
        load_element(&region, 0, element)
    }

    /// `self[index] = value`
    pub fn set_index(&self, index: isize, value: impl Into<Value>) -> FfiResult<()> {
        let (region, element) = self.element_region(index)?;
        store_element(&region, 0, element, &value.into())
    }

    /// Pointer `count` elements further on
    pub fn offset(&self, count: isize) -> FfiResult<Pointer> {
        let stride = self.typed()?.size() as i128;
        let address = self.address as i128 + count as i128 * stride;
        if address < 0 || address > u64::MAX as i128 {
            return Err(FfiError::Bounds {
                needed: address.unsigned_abs().min(usize::MAX as u128) as usize,
                available: 0,
            });
        }
        Ok(Self {
            address: address as u64,
            target: self.target.clone(),
            source: self.source.clone(),
        })
    }

    /// Value to store in a pointer field
    pub fn to_value(&self) -> Value {
        match &self.source {
            Some(buffer) if buffer.address() == self.address => Value::Buffer(buffer.clone()),
            _ if self.is_null() => Value::Null,
            _ => Value::Pointer(self.address),
        }
    }

    fn typed(&self) -> FfiResult<&ElementType> {
        self.target
            .as_ref()
            .ok_or_else(|| FfiError::type_mismatch("typed pointer", "untyped pointer"))
    }

    fn element_region(&self, index: isize) -> FfiResult<(Region, &ElementType)> {
        if self.is_null() {
            return Err(FfiError::NullPointer);
        }
        let element = self.typed()?;
        let size = element.size() as usize;
        let shift = index as i128 * size as i128;

        let region = match &self.source {
            Some(buffer) => {
                let start = self.address as i128 - buffer.address() as i128 + shift;
                if start < 0 {
                    return Err(FfiError::Bounds {
                        needed: size,
                        available: 0,
                    });
                }
                buffer.region().sub(start as usize, size)?
            }
            None => {
                let address = self.address as i128 + shift;
                if address <= 0 || address > u64::MAX as i128 {
                    return Err(FfiError::NullPointer);
                }
                // SAFETY: covered by the contract of `from_address`/`set_address`
                unsafe { Region::foreign(address as u64, size) }
            }
        };
        Ok((region, element))
    }
}

impl Default for Pointer {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pointer")
            .field("address", &format_args!("0x{:x}", self.address))
            .field("target", &self.target)
            .field("owned", &self.source.is_some())
            .finish()
    }
}

impl From<&Pointer> for Value {
    fn from(pointer: &Pointer) -> Self {
        pointer.to_value()
    }
}
