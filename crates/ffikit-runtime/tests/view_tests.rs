// Live views, arrays and detached snapshots

mod common;

use common::*;
#[allow(unused_imports)]
use common::{assert_eq, assert_ne};
use ffikit_runtime::{
    memory, ArrayLayout, CType, FfiError, FieldMap, FieldSpec, LayoutBuilder, NativeBuffer,
    StructView, Value,
};
use proptest::prelude::*;

fn ints(values: &[i32]) -> Vec<Value> {
    values.iter().map(|v| Value::from(*v)).collect()
}

// ===== Arrays =====

#[test]
fn test_int_array_indexing() {
    let layout = ArrayLayout::new(CType::Int32, 5).unwrap();
    let arr = layout.create(ints(&[1, 2, 3, 4, 5])).unwrap();

    assert_eq!(arr.len(), 5);
    assert_eq!(arr.to_vec().unwrap(), ints(&[1, 2, 3, 4, 5]));
    assert_eq!(arr.value(10).unwrap(), None);

    assert!(arr.set(2, 99).unwrap());
    assert_eq!(arr.value(2).unwrap(), Some(Value::Int(99)));
}

#[test]
fn test_array_out_of_range_write_is_ignored() {
    let layout = ArrayLayout::new(CType::UInt8, 3).unwrap();
    let arr = layout
        .create(vec![Value::from(7u8), Value::from(8u8), Value::from(9u8)])
        .unwrap();
    let before = arr.to_bytes();
    assert!(!arr.set(3, 1).unwrap());
    assert!(!arr.set(usize::MAX, 1).unwrap());
    assert_eq!(arr.to_bytes(), before);
}

#[test]
fn test_array_field_view_is_live() {
    let layout = LayoutBuilder::structure()
        .field("count", CType::UInt8)
        .field("samples", ArrayLayout::new(CType::Int16, 3).unwrap())
        .build()
        .unwrap();
    let record = layout.create(FieldMap::new()).unwrap();

    let samples = record.array_view("samples").unwrap();
    samples.set(1, -300).unwrap();
    assert_eq!(
        record.value("samples").unwrap(),
        Value::from(vec![0i16, -300, 0])
    );
    assert_eq!(samples.address(), record.address() + 2);
}

#[test]
fn test_struct_array_elements() {
    let layout = ArrayLayout::new(point(), 2).unwrap();
    let points = layout
        .create(vec![
            Value::Struct(FieldMap::from([("x", 1), ("y", 2)])),
            Value::Struct(FieldMap::from([("x", 3)])),
        ])
        .unwrap();
    let second = points.get(1).unwrap().unwrap().into_struct().unwrap();
    second.set("y", 4).unwrap();
    assert_eq!(
        points.value(1).unwrap(),
        Some(Value::Struct(FieldMap::from([("x", 3), ("y", 4)])))
    );
}

// ===== Structs =====

#[test]
fn test_nested_writes_visible_through_parent() {
    let line = structure([
        ("start", FieldSpec::Nested(point())),
        ("end", FieldSpec::Nested(point())),
    ]);
    let l = line.create(FieldMap::new()).unwrap();
    let end = l.nested_view("end").unwrap();
    end.set("x", 5).unwrap();

    assert_eq!(l.to_bytes()[8..12].to_vec(), 5i32.to_le_bytes().to_vec());
    l.set("end", Value::Struct(FieldMap::from([("y", 6)]))).unwrap();
    assert_eq!(end.value("x").unwrap(), Value::Int(5));
    assert_eq!(end.value("y").unwrap(), Value::Int(6));

    l.set("end", Value::Null).unwrap();
    assert_eq!(end.to_bytes(), vec![0; 8]);
}

#[test]
fn test_view_outlives_parent_handle() {
    let line = structure([("start", FieldSpec::Nested(point()))]);
    let start = {
        let l = line.create(FieldMap::from([(
            "start",
            Value::Struct(FieldMap::from([("x", 9)])),
        )]))
        .unwrap();
        l.nested_view("start").unwrap()
    };
    assert_eq!(start.value("x").unwrap(), Value::Int(9));
}

#[test]
fn test_wrap_requires_enough_bytes() {
    let err = point().wrap(&NativeBuffer::alloc(7)).unwrap_err();
    assert!(matches!(
        err,
        FfiError::Bounds {
            needed: 8,
            available: 7
        }
    ));

    let buffer = NativeBuffer::from_bytes(&[1, 0, 0, 0, 2, 0, 0, 0, 0xff]);
    let view = StructView::wrap(&point(), &buffer).unwrap();
    assert_eq!(view.value("y").unwrap(), Value::Int(2));
    assert_eq!(view.size(), 8);
}

#[test]
fn test_unknown_field_leaves_bytes_alone() {
    let p = point().create(FieldMap::from([("x", 1), ("y", 2)])).unwrap();
    let before = p.to_bytes();
    assert!(matches!(p.set("z", 3), Err(FfiError::UnknownField(name)) if name == "z"));
    assert!(matches!(p.set("y", "two"), Err(FfiError::Type { .. })));
    assert_eq!(p.to_bytes(), before);
}

#[test]
fn test_string_members() {
    let layout = LayoutBuilder::structure()
        .field("name", CType::CString)
        .field("wide", CType::WString)
        .field("initial", CType::WChar)
        .build()
        .unwrap();
    let record = layout
        .create(FieldMap::from([
            ("name", "ferris"),
            ("wide", "crab 🦀"),
            ("initial", "f"),
        ]))
        .unwrap();
    let buffer = record.buffer().unwrap();
    assert_eq!(buffer.retained_count(), 2);

    assert_eq!(record.value("name").unwrap(), Value::from("ferris"));
    assert_eq!(record.value("wide").unwrap(), Value::from("crab 🦀"));
    assert_eq!(record.value("initial").unwrap(), Value::from("f"));

    record.set("name", Value::Null).unwrap();
    assert_eq!(record.value("name").unwrap(), Value::Null);
}

#[test]
fn test_string_member_over_arbitrary_bytes_is_not_dereferenced() {
    let layout = LayoutBuilder::structure()
        .field("name", CType::CString)
        .build()
        .unwrap();
    let bytes = NativeBuffer::from_bytes(&8u64.to_le_bytes());
    let view = StructView::wrap(&layout, &bytes).unwrap();
    assert_eq!(view.value("name").unwrap(), Value::Pointer(8));

    let err = view.set("name", Value::UInt(8)).unwrap_err();
    assert!(matches!(err, FfiError::Type { .. }));
    assert_eq!(bytes.to_vec(), 8u64.to_le_bytes().to_vec());
}

#[test]
fn test_repeated_string_sets_hold_one_buffer() {
    let layout = LayoutBuilder::structure()
        .field("name", CType::CString)
        .field("wide", CType::WString)
        .build()
        .unwrap();
    let record = layout.create(FieldMap::new()).unwrap();
    for i in 0..1000 {
        record.set("name", format!("name {i}")).unwrap();
        record.set("wide", format!("wide {i}")).unwrap();
    }
    let buffer = record.buffer().unwrap();
    assert_eq!(buffer.retained_count(), 2);
    assert_eq!(record.value("name").unwrap(), Value::from("name 999"));

    record.set("wide", Value::Null).unwrap();
    assert_eq!(buffer.retained_count(), 1);
}

#[test]
fn test_failed_array_assignment_writes_nothing() {
    let layout = LayoutBuilder::structure()
        .field("values", ArrayLayout::new(CType::Int32, 3).unwrap())
        .build()
        .unwrap();
    let record = layout
        .create(FieldMap::from([("values", Value::from(vec![1, 2, 3]))]))
        .unwrap();
    let err = record
        .set(
            "values",
            Value::Array(vec![Value::Int(7), Value::Int(8), Value::from("nine")]),
        )
        .unwrap_err();
    assert!(matches!(err, FfiError::Type { .. }));
    assert_eq!(record.value("values").unwrap(), Value::from(vec![1, 2, 3]));
}

#[test]
fn test_signed_bit_fields_sign_extend() {
    let layout = structure([
        ("delta", FieldSpec::bits(CType::Int32, 3)),
        ("count", FieldSpec::bits(CType::UInt32, 3)),
    ]);
    let record = layout
        .create(FieldMap::from([("delta", -1), ("count", 7)]))
        .unwrap();
    assert_eq!(record.value("delta").unwrap(), Value::Int(-1));
    assert_eq!(record.value("count").unwrap(), Value::UInt(7));

    record.set("delta", 3).unwrap();
    assert_eq!(record.value("delta").unwrap(), Value::Int(3));
    record.set("delta", 4).unwrap();
    assert_eq!(record.value("delta").unwrap(), Value::Int(-4));
    assert_eq!(record.value("count").unwrap(), Value::UInt(7));
}

#[test]
fn test_pointer_member_from_buffer() {
    let layout = LayoutBuilder::structure()
        .field("data", CType::Pointer)
        .field("len", CType::SizeT)
        .build()
        .unwrap();
    let payload = memory::alloc(32);
    let header = layout
        .create(FieldMap::from([
            ("data", Value::Buffer(payload.clone())),
            ("len", Value::UInt(32)),
        ]))
        .unwrap();
    assert_eq!(
        header.value("data").unwrap(),
        Value::Pointer(memory::addressof(&payload))
    );
    assert_eq!(header.buffer().unwrap().retained_count(), 1);
}

#[test]
fn test_snapshot_json() {
    let layout = LayoutBuilder::structure()
        .field("id", CType::Int64)
        .field("ratio", CType::Double)
        .field("ok", CType::Bool)
        .field("origin", point())
        .build()
        .unwrap();
    let record = layout
        .create(FieldMap::from([
            ("id", Value::Int(i64::MIN)),
            ("ratio", Value::Float(0.25)),
            ("ok", Value::Bool(true)),
        ]))
        .unwrap();
    assert_eq!(
        record.to_json().unwrap(),
        r#"{"id":-9223372036854775808,"ratio":0.25,"ok":true,"origin":{"x":0,"y":0}}"#
    );
    assert!(record.to_json_pretty().unwrap().contains("\n  \"origin\": {"));
}

proptest! {
    #[test]
    fn prop_array_bounds_never_mutate(
        values in prop::collection::vec(any::<i32>(), 1..16),
        extra in 0usize..64,
        incoming in any::<i32>(),
    ) {
        let layout = ArrayLayout::new(CType::Int32, values.len() as u32).unwrap();
        let arr = layout.create(ints(&values)).unwrap();
        let before = arr.to_bytes();
        let index = values.len() + extra;

        prop_assert!(arr.get(index).unwrap().is_none());
        prop_assert!(!arr.set(index, incoming).unwrap());
        prop_assert_eq!(arr.to_bytes(), before);
    }
}
