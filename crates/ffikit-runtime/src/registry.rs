//! Declarative layout definitions
//!
//! Layouts can be described in TOML and registered by name:
//!
//! ```toml
//! [[layout]]
//! name = "Point"
//! fields = [ { name = "x", type = "int32" }, { name = "y", type = "int32" } ]
//!
//! [[layout]]
//! name = "Flags"
//! kind = "union"
//! fields = [ { name = "word", type = "uint32" }, { name = "bytes", type = "uint8", length = 4 } ]
//! ```
//!
//! Field types name a primitive first and an earlier layout second. A
//! document is applied atomically: if any definition fails, nothing from it
//! is registered.

use crate::error::{FfiResult, LayoutError};
use crate::layout::{ArrayLayout, ElementType, FieldSpec, Layout, LayoutBuilder};
use crate::platform::Platform;
use crate::types::CType;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Document {
    #[serde(default)]
    layout: Vec<LayoutDef>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LayoutKind {
    #[default]
    Struct,
    Union,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LayoutDef {
    name: String,
    #[serde(default)]
    kind: LayoutKind,
    #[serde(default)]
    packed: bool,
    #[serde(default)]
    fields: Vec<FieldDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FieldDef {
    name: String,
    #[serde(rename = "type")]
    ty: String,
    bits: Option<u32>,
    length: Option<u32>,
    #[serde(default)]
    anonymous: bool,
}

/// Named layouts for one platform
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    platform: Platform,
    layouts: HashMap<String, Arc<Layout>>,
    /// Registration order, for listing
    order: Vec<String>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::with_platform(Platform::host())
    }

    pub fn with_platform(platform: Platform) -> Self {
        Self {
            platform,
            layouts: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Register a layout built elsewhere
    pub fn register(&mut self, name: &str, layout: Arc<Layout>) -> Result<(), LayoutError> {
        if self.layouts.contains_key(name) || CType::from_name(name).is_ok() {
            return Err(LayoutError::InvalidDefinition(format!(
                "type name '{}' is already taken",
                name
            )));
        }
        self.layouts.insert(name.to_string(), layout);
        self.order.push(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Layout>> {
        self.layouts.get(name)
    }

    /// A registered layout, or `UnknownLayout`
    pub fn layout(&self, name: &str) -> Result<Arc<Layout>, LayoutError> {
        self.layouts
            .get(name)
            .cloned()
            .ok_or_else(|| LayoutError::UnknownLayout(name.to_string()))
    }

    /// Field spec for a type name: primitives first, then layouts
    pub fn resolve(&self, name: &str) -> Result<FieldSpec, LayoutError> {
        resolve_in(name, &self.layouts, &HashMap::new()).map(as_field)
    }

    /// Size in bytes of a primitive or registered layout
    pub fn sizeof(&self, name: &str) -> Result<u32, LayoutError> {
        Ok(resolve_in(name, &self.layouts, &HashMap::new())?.size())
    }

    /// Registered names in registration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Apply a TOML document; returns the names it defined
    pub fn load_str(&mut self, source: &str) -> FfiResult<Vec<String>> {
        let document: Document = toml::from_str(source)
            .map_err(|e| LayoutError::InvalidDefinition(e.to_string()))?;

        let mut staged: HashMap<String, Arc<Layout>> = HashMap::new();
        let mut defined = Vec::with_capacity(document.layout.len());
        for def in document.layout {
            if self.layouts.contains_key(&def.name)
                || staged.contains_key(&def.name)
                || CType::from_name(&def.name).is_ok()
            {
                return Err(LayoutError::InvalidDefinition(format!(
                    "type name '{}' is already taken",
                    def.name
                ))
                .into());
            }
            let layout = self.build(&def, &staged)?;
            debug!(
                layout = %def.name,
                size = layout.size(),
                alignment = layout.alignment(),
                "Layout defined"
            );
            defined.push(def.name.clone());
            staged.insert(def.name, layout);
        }

        for name in &defined {
            if let Some(layout) = staged.remove(name) {
                self.layouts.insert(name.clone(), layout);
                self.order.push(name.clone());
            }
        }
        info!(count = defined.len(), "Layouts registered");
        Ok(defined)
    }

    /// Apply a TOML file
    pub fn load_file(&mut self, path: &Path) -> FfiResult<Vec<String>> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            LayoutError::InvalidDefinition(format!("cannot read {}: {}", path.display(), e))
        })?;
        self.load_str(&source)
    }

    fn build(
        &self,
        def: &LayoutDef,
        staged: &HashMap<String, Arc<Layout>>,
    ) -> Result<Arc<Layout>, LayoutError> {
        let mut builder = match def.kind {
            LayoutKind::Struct => LayoutBuilder::structure(),
            LayoutKind::Union => LayoutBuilder::union(),
        }
        .named(def.name.clone())
        .packed(def.packed)
        .platform(self.platform);

        for field in &def.fields {
            builder = builder.field(field.name.clone(), self.field_spec(field, staged)?);
        }
        builder.build()
    }

    fn field_spec(
        &self,
        field: &FieldDef,
        staged: &HashMap<String, Arc<Layout>>,
    ) -> Result<FieldSpec, LayoutError> {
        let base = resolve_in(&field.ty, &self.layouts, staged)?;
        let spec = match (field.bits, field.length) {
            (Some(_), Some(_)) => {
                return Err(LayoutError::InvalidDefinition(format!(
                    "field '{}' cannot be both a bit field and an array",
                    field.name
                )))
            }
            (Some(width), None) => match base {
                ElementType::Primitive(ty) => FieldSpec::bits(ty, width),
                _ => {
                    return Err(LayoutError::InvalidBitFieldBase {
                        name: field.name.clone(),
                        base: field.ty.clone(),
                    })
                }
            },
            (None, Some(length)) => {
                FieldSpec::Array(ArrayLayout::with_platform(base, length, &self.platform)?)
            }
            (None, None) => as_field(base),
        };
        Ok(if field.anonymous {
            FieldSpec::anonymous(spec)
        } else {
            spec
        })
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A type name as a primitive or a layout
fn resolve_in(
    name: &str,
    layouts: &HashMap<String, Arc<Layout>>,
    staged: &HashMap<String, Arc<Layout>>,
) -> Result<ElementType, LayoutError> {
    if let Ok(ty) = CType::from_name(name) {
        return Ok(ElementType::Primitive(ty));
    }
    staged
        .get(name)
        .or_else(|| layouts.get(name))
        .map(|layout| ElementType::Struct(Arc::clone(layout)))
        .ok_or_else(|| LayoutError::UnknownType(name.to_string()))
}

fn as_field(element: ElementType) -> FieldSpec {
    match element {
        ElementType::Primitive(ty) => FieldSpec::Primitive(ty),
        ElementType::Struct(layout) => FieldSpec::Nested(layout),
        ElementType::Array(array) => FieldSpec::Array(array),
    }
}
