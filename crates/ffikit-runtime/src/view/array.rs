//! Index access to fixed-length arrays
//!
//! Out-of-range indices never fail and never touch memory: reads yield
//! `None`, writes report `false`.

use super::{load_element, staged, store_element, Field};
use crate::buffer::{NativeBuffer, Region};
use crate::error::{FfiError, FfiResult};
use crate::layout::ArrayLayout;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Live array instance
#[derive(Clone)]
pub struct ArrayView {
    layout: Arc<ArrayLayout>,
    region: Region,
}

impl ArrayView {
    /// Allocate a zero-filled array and write `items` from index 0
    pub fn create(layout: &Arc<ArrayLayout>, items: Vec<Value>) -> FfiResult<Self> {
        let buffer = NativeBuffer::alloc(layout.size() as usize);
        let view = Self::wrap_region(layout, buffer.region())?;
        view.assign(&Value::Array(items))?;
        Ok(view)
    }

    pub fn wrap(layout: &Arc<ArrayLayout>, buffer: &NativeBuffer) -> FfiResult<Self> {
        Self::wrap_region(layout, buffer.region())
    }

    pub fn wrap_region(layout: &Arc<ArrayLayout>, region: Region) -> FfiResult<Self> {
        let size = layout.size() as usize;
        if region.len() < size {
            return Err(FfiError::Bounds {
                needed: size,
                available: region.len(),
            });
        }
        Ok(Self {
            layout: Arc::clone(layout),
            region: region.sub(0, size)?,
        })
    }

    pub fn layout(&self) -> &Arc<ArrayLayout> {
        &self.layout
    }

    pub fn address(&self) -> u64 {
        self.region.address()
    }

    pub fn buffer(&self) -> Option<&NativeBuffer> {
        self.region.owner()
    }

    pub fn len(&self) -> usize {
        self.layout.length() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `index`, `None` when out of range
    pub fn get(&self, index: usize) -> FfiResult<Option<Field>> {
        match self.offset_of(index) {
            Some(offset) => load_element(&self.region, offset, self.layout.element()).map(Some),
            None => Ok(None),
        }
    }

    /// Element `index` as a detached value
    pub fn value(&self, index: usize) -> FfiResult<Option<Value>> {
        match self.get(index)? {
            Some(field) => field.to_value().map(Some),
            None => Ok(None),
        }
    }

    /// Write element `index`; `Ok(false)` and no write when out of range
    pub fn set(&self, index: usize, value: impl Into<Value>) -> FfiResult<bool> {
        match self.offset_of(index) {
            Some(offset) => {
                store_element(&self.region, offset, self.layout.element(), &value.into())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Live elements in order
    pub fn iter(&self) -> impl Iterator<Item = FfiResult<Field>> + '_ {
        (0..self.len()).map(move |i| {
            let offset = i * self.layout.stride() as usize;
            load_element(&self.region, offset, self.layout.element())
        })
    }

    /// Eager snapshot of every element
    pub fn to_vec(&self) -> FfiResult<Vec<Value>> {
        self.iter().map(|field| field?.to_value()).collect()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.region.to_vec()
    }

    /// Write from index 0; more items than elements is a bounds error
    pub(crate) fn assign(&self, value: &Value) -> FfiResult<()> {
        match value {
            Value::Array(items) => {
                if items.len() > self.len() {
                    return Err(FfiError::Bounds {
                        needed: items.len(),
                        available: self.len(),
                    });
                }
                staged(&self.region, |stage| {
                    for (index, item) in items.iter().enumerate() {
                        let offset = index * self.layout.stride() as usize;
                        store_element(stage, offset, self.layout.element(), item)?;
                    }
                    Ok(())
                })
            }
            Value::Buffer(source) => {
                let size = self.region.len();
                if source.len() < size {
                    return Err(FfiError::Bounds {
                        needed: size,
                        available: source.len(),
                    });
                }
                self.region.write_from(0, &source.to_vec()[..size])
            }
            Value::Null => {
                self.region.clear();
                Ok(())
            }
            other => Err(FfiError::type_mismatch(
                self.layout.to_string(),
                other.type_name(),
            )),
        }
    }

    fn offset_of(&self, index: usize) -> Option<usize> {
        (index < self.len()).then(|| index * self.layout.stride() as usize)
    }
}

impl fmt::Debug for ArrayView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayView")
            .field("layout", &self.layout.to_string())
            .field("region", &self.region)
            .finish()
    }
}
