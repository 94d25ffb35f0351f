//! Named-field access to a struct or union

use super::{load_field, staged, store_field, Field};
use crate::buffer::{NativeBuffer, Region};
use crate::error::{FfiError, FfiResult};
use crate::layout::Layout;
use crate::value::{FieldMap, Value};
use std::fmt;
use std::sync::Arc;

/// Live struct/union instance
///
/// A top-level instance owns its buffer; nested views share it.
///
/// # Example
///
/// ```
/// # use ffikit_runtime::{CType, FieldMap, LayoutBuilder, Value};
/// let point = LayoutBuilder::structure()
///     .field("x", CType::Int32)
///     .field("y", CType::Int32)
///     .build()
///     .unwrap();
/// let p = point.create(FieldMap::from([("x", 3)])).unwrap();
/// p.set("y", 4).unwrap();
/// assert_eq!(p.value("y").unwrap(), Value::Int(4));
/// assert_eq!(p.to_bytes(), [3, 0, 0, 0, 4, 0, 0, 0]);
/// ```
#[derive(Clone)]
pub struct StructView {
    layout: Arc<Layout>,
    region: Region,
}

impl StructView {
    /// Allocate a zero-filled instance, then apply `initial` field by field
    pub fn create(layout: &Arc<Layout>, initial: FieldMap) -> FfiResult<Self> {
        let buffer = NativeBuffer::alloc(layout.size() as usize);
        let view = Self::wrap_region(layout, buffer.region())?;
        view.update(&initial)?;
        Ok(view)
    }

    /// View an existing buffer; it must hold at least `layout.size()` bytes
    pub fn wrap(layout: &Arc<Layout>, buffer: &NativeBuffer) -> FfiResult<Self> {
        Self::wrap_region(layout, buffer.region())
    }

    /// View the start of `region`
    pub fn wrap_region(layout: &Arc<Layout>, region: Region) -> FfiResult<Self> {
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

    /// View native memory at `address`
    ///
    /// # Safety
    ///
    /// `address` must point to `layout.size()` valid bytes for as long as the
    /// view and anything derived from it are used.
    pub unsafe fn from_address(layout: &Arc<Layout>, address: u64) -> FfiResult<Self> {
        if address == 0 {
            return Err(FfiError::NullPointer);
        }
        Self::wrap_region(layout, Region::foreign(address, layout.size() as usize))
    }

    pub fn layout(&self) -> &Arc<Layout> {
        &self.layout
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Address of the first byte, stable for the view's lifetime
    pub fn address(&self) -> u64 {
        self.region.address()
    }

    /// Backing buffer, `None` for views over foreign memory
    pub fn buffer(&self) -> Option<&NativeBuffer> {
        self.region.owner()
    }

    pub fn size(&self) -> usize {
        self.region.len()
    }

    /// Visible field names in declaration order, anonymous members expanded
    pub fn keys(&self) -> Vec<String> {
        self.layout.keys()
    }

    /// Look up a field; nested structs and arrays come back as live views
    pub fn get(&self, name: &str) -> FfiResult<Field> {
        let field = self
            .layout
            .field(name)
            .ok_or_else(|| FfiError::UnknownField(name.to_string()))?;
        load_field(&self.region, field)
    }

    /// Field value, snapshotting nested structs and arrays
    pub fn value(&self, name: &str) -> FfiResult<Value> {
        self.get(name)?.to_value()
    }

    /// Write one field
    ///
    /// Nested fields accept a partial `Value::Struct`, a buffer to copy from,
    /// or `Null` to zero them. A failed write leaves other fields untouched.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> FfiResult<()> {
        let field = self
            .layout
            .field(name)
            .ok_or_else(|| FfiError::UnknownField(name.to_string()))?;
        store_field(&self.region, field, &value.into())
    }

    /// Write every named field of `values`
    ///
    /// All or nothing: if any field fails, no field is written.
    pub fn update(&self, values: &FieldMap) -> FfiResult<()> {
        staged(&self.region, |stage| {
            for (name, value) in values.iter() {
                let field = self
                    .layout
                    .field(name)
                    .ok_or_else(|| FfiError::UnknownField(name.to_string()))?;
                store_field(stage, field, value)?;
            }
            Ok(())
        })
    }

    /// Zero-copy view of a nested struct/union field
    pub fn nested_view(&self, name: &str) -> FfiResult<StructView> {
        self.get(name)?.into_struct()
    }

    /// Zero-copy view of an array field
    pub fn array_view(&self, name: &str) -> FfiResult<crate::view::ArrayView> {
        self.get(name)?.into_array()
    }

    /// Eager, detached snapshot of every visible field
    ///
    /// Anonymous members contribute their fields directly. String members read
    /// as text only while they hold the buffer written through them; any other
    /// address (a union sibling's bytes, say) reads as a pointer.
    pub fn to_object(&self) -> FfiResult<FieldMap> {
        let mut map = FieldMap::new();
        for field in self.layout.fields() {
            match (field.anonymous, load_field(&self.region, field)?) {
                (true, Field::Struct(inner)) => {
                    for (name, value) in inner.to_object()? {
                        map.insert(name, value);
                    }
                }
                (_, loaded) => map.insert(field.name.clone(), loaded.to_value()?),
            }
        }
        Ok(map)
    }

    /// Snapshot rendered as JSON
    pub fn to_json(&self) -> FfiResult<String> {
        Ok(serde_json::to_string(&Value::Struct(self.to_object()?))?)
    }

    /// Snapshot rendered as indented JSON
    pub fn to_json_pretty(&self) -> FfiResult<String> {
        Ok(serde_json::to_string_pretty(&Value::Struct(
            self.to_object()?,
        ))?)
    }

    /// Copy of the raw bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.region.to_vec()
    }

    /// Replace the whole instance from a value
    pub(crate) fn assign(&self, value: &Value) -> FfiResult<()> {
        match value {
            Value::Struct(map) => self.update(map),
            Value::Buffer(source) => {
                let size = self.size();
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
                self.layout.display_name(),
                other.type_name(),
            )),
        }
    }
}

impl fmt::Debug for StructView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructView")
            .field("layout", &self.layout.display_name())
            .field("region", &self.region)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{ArrayLayout, FieldSpec, LayoutBuilder};
    use crate::types::CType;
    use pretty_assertions::assert_eq;

    fn point() -> Arc<Layout> {
        LayoutBuilder::structure()
            .named("Point")
            .field("x", CType::Int32)
            .field("y", CType::Int32)
            .build()
            .unwrap()
    }

    #[test]
    fn test_wrap_too_small() {
        let buffer = NativeBuffer::alloc(4);
        let err = StructView::wrap(&point(), &buffer).unwrap_err();
        assert!(matches!(
            err,
            FfiError::Bounds {
                needed: 8,
                available: 4
            }
        ));
    }

    #[test]
    fn test_wrap_shares_bytes() {
        let buffer = NativeBuffer::from_bytes(&[1, 0, 0, 0, 2, 0, 0, 0, 0xff]);
        let view = StructView::wrap(&point(), &buffer).unwrap();
        assert_eq!(view.size(), 8);
        assert_eq!(view.value("y").unwrap(), Value::Int(2));
        view.set("x", 7).unwrap();
        assert_eq!(buffer.to_vec()[0], 7);
    }

    #[test]
    fn test_unknown_field() {
        let view = point().create(FieldMap::new()).unwrap();
        assert!(matches!(view.get("z"), Err(FfiError::UnknownField(name)) if name == "z"));
        assert!(matches!(view.set("z", 1), Err(FfiError::UnknownField(_))));
    }

    #[test]
    fn test_failed_set_keeps_other_fields() {
        let view = point().create(FieldMap::from([("x", 5), ("y", 6)])).unwrap();
        assert!(view.set("x", "text").is_err());
        assert_eq!(view.to_bytes(), vec![5, 0, 0, 0, 6, 0, 0, 0]);
    }

    #[test]
    fn test_nested_view_is_live() {
        let line = LayoutBuilder::structure()
            .field("start", point())
            .field("end", point())
            .build()
            .unwrap();
        let view = line.create(FieldMap::new()).unwrap();
        let end = view.nested_view("end").unwrap();
        end.set("y", 9).unwrap();
        assert_eq!(view.to_bytes()[12], 9);
        assert_eq!(end.address(), view.address() + 8);

        view.set("start", FieldMap::from([("x", 4)])).unwrap();
        assert_eq!(
            view.value("start").unwrap(),
            Value::Struct(FieldMap::from([("x", 4), ("y", 0)]))
        );

        view.set("end", Value::Null).unwrap();
        assert_eq!(end.value("y").unwrap(), Value::Int(0));
    }

    #[test]
    fn test_failed_nested_set_writes_nothing() {
        let tagged = LayoutBuilder::structure()
            .field("x", CType::Int32)
            .field("label", CType::CString)
            .build()
            .unwrap();
        let outer = LayoutBuilder::structure()
            .field("head", tagged.clone())
            .field("tail", tagged)
            .build()
            .unwrap();
        let view = outer
            .create(FieldMap::from([(
                "tail",
                Value::Struct(FieldMap::from([("x", Value::Int(1)), ("label", Value::from("keep"))])),
            )]))
            .unwrap();
        let before = view.to_bytes();

        let err = view
            .set(
                "tail",
                FieldMap::from([("x", Value::Int(5)), ("label", Value::Float(1.5))]),
            )
            .unwrap_err();
        assert!(matches!(err, FfiError::Type { .. }));
        assert_eq!(view.to_bytes(), before);
        assert_eq!(
            view.value("tail").unwrap(),
            Value::Struct(FieldMap::from([("x", Value::Int(1)), ("label", Value::from("keep"))]))
        );

        // Partial update keeps the untouched string alive and readable
        view.set("tail", FieldMap::from([("x", 7)])).unwrap();
        assert_eq!(
            view.nested_view("tail").unwrap().value("label").unwrap(),
            Value::from("keep")
        );
        assert_eq!(view.buffer().unwrap().retained_count(), 1);
    }

    #[test]
    fn test_string_member_of_union_reads_sibling_bits_as_pointer() {
        let either = LayoutBuilder::union()
            .field("text", CType::CString)
            .field("number", CType::UInt64)
            .build()
            .unwrap();
        let view = either.create(FieldMap::from([("number", 8u64)])).unwrap();
        let snapshot = view.to_object().unwrap();
        assert_eq!(snapshot.get("text"), Some(&Value::Pointer(8)));
        assert_eq!(snapshot.get("number"), Some(&Value::UInt(8)));

        view.set("text", "word").unwrap();
        assert_eq!(view.value("text").unwrap(), Value::from("word"));
    }

    #[test]
    fn test_nested_view_requires_struct() {
        let view = point().create(FieldMap::new()).unwrap();
        assert!(matches!(view.nested_view("x"), Err(FfiError::Type { .. })));
    }

    #[test]
    fn test_snapshot_is_detached() {
        let view = point().create(FieldMap::from([("x", 1)])).unwrap();
        let snapshot = view.to_object().unwrap();
        view.set("x", 2).unwrap();
        assert_eq!(snapshot.get("x"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_to_json() {
        let holder = LayoutBuilder::structure()
            .field("id", CType::UInt64)
            .field("name", CType::CString)
            .field("values", ArrayLayout::new(CType::Int16, 2).unwrap())
            .build()
            .unwrap();
        let view = holder
            .create(FieldMap::from([
                ("id", Value::UInt(u64::MAX)),
                ("name", Value::from("sensor")),
                ("values", Value::from(vec![-1, 1])),
            ]))
            .unwrap();
        assert_eq!(
            view.to_json().unwrap(),
            r#"{"id":18446744073709551615,"name":"sensor","values":[-1,1]}"#
        );
    }

    #[test]
    fn test_anonymous_union_member() {
        let bits = LayoutBuilder::union()
            .field("word", CType::UInt32)
            .field("bytes", ArrayLayout::new(CType::UInt8, 4).unwrap())
            .build()
            .unwrap();
        let packet = LayoutBuilder::structure()
            .field("kind", CType::UInt8)
            .field("payload", FieldSpec::anonymous(bits))
            .build()
            .unwrap();
        let view = packet.create(FieldMap::from([("word", 0x0403_0201u32)])).unwrap();
        assert_eq!(
            view.value("bytes").unwrap(),
            Value::from(vec![1u8, 2, 3, 4])
        );
        assert_eq!(view.keys(), vec!["kind", "word", "bytes"]);
    }

    #[test]
    fn test_from_null_address() {
        let err = unsafe { StructView::from_address(&point(), 0) }.unwrap_err();
        assert!(matches!(err, FfiError::NullPointer));
    }
}
