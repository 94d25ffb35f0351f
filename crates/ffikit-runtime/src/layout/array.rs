//! Fixed-length homogeneous sequences

use crate::error::{FfiResult, LayoutError};
use crate::layout::Layout;
use crate::platform::Platform;
use crate::types::CType;
use crate::value::Value;
use crate::view::ArrayView;
use std::fmt;
use std::sync::Arc;

/// Element kind of an [`ArrayLayout`]
#[derive(Debug, Clone, PartialEq)]
pub enum ElementType {
    Primitive(CType),
    Struct(Arc<Layout>),
    /// Multi-dimensional arrays nest
    Array(Arc<ArrayLayout>),
}

impl ElementType {
    pub fn size(&self) -> u32 {
        match self {
            ElementType::Primitive(ty) => ty.size(),
            ElementType::Struct(layout) => layout.size(),
            ElementType::Array(array) => array.size(),
        }
    }

    /// Alignment of one element, capped like any primitive field
    pub fn alignment(&self, platform: &Platform) -> u32 {
        match self {
            ElementType::Primitive(ty) => ty.capped_alignment(platform),
            ElementType::Struct(layout) => layout.alignment(),
            ElementType::Array(array) => array.alignment(),
        }
    }
}

impl From<CType> for ElementType {
    fn from(ty: CType) -> Self {
        ElementType::Primitive(ty)
    }
}

impl From<Arc<Layout>> for ElementType {
    fn from(layout: Arc<Layout>) -> Self {
        ElementType::Struct(layout)
    }
}

impl From<Arc<ArrayLayout>> for ElementType {
    fn from(array: Arc<ArrayLayout>) -> Self {
        ElementType::Array(array)
    }
}

/// Size/alignment description of `element[length]`
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayLayout {
    element: ElementType,
    length: u32,
    size: u32,
    alignment: u32,
}

impl ArrayLayout {
    /// Array for the host platform
    pub fn new(element: impl Into<ElementType>, length: u32) -> Result<Arc<Self>, LayoutError> {
        Self::with_platform(element, length, &Platform::host())
    }

    pub fn with_platform(
        element: impl Into<ElementType>,
        length: u32,
        platform: &Platform,
    ) -> Result<Arc<Self>, LayoutError> {
        let element = element.into();
        if element == ElementType::Primitive(CType::Void) {
            return Err(LayoutError::VoidField("array element".to_string()));
        }
        let size = element.size().checked_mul(length).ok_or_else(|| {
            LayoutError::InvalidDefinition(format!(
                "array of {} elements of {} bytes overflows",
                length,
                element.size()
            ))
        })?;
        let alignment = element.alignment(platform).min(platform.pointer_width).max(1);
        Ok(Arc::new(Self {
            element,
            length,
            size,
            alignment,
        }))
    }

    pub fn element(&self) -> &ElementType {
        &self.element
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    /// Byte stride between consecutive elements
    pub fn stride(&self) -> u32 {
        self.element.size()
    }

    /// Allocate a zeroed array and fill it from index 0
    pub fn create(self: &Arc<Self>, items: Vec<Value>) -> FfiResult<ArrayView> {
        ArrayView::create(self, items)
    }
}

impl fmt::Display for ArrayLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.element {
            ElementType::Primitive(ty) => write!(f, "{}[{}]", ty, self.length),
            ElementType::Struct(layout) => write!(f, "{}[{}]", layout.display_name(), self.length),
            ElementType::Array(inner) => write!(f, "({})[{}]", inner, self.length),
        }
    }
}
