// Pointers stored in and followed out of native memory

mod common;

use common::*;
#[allow(unused_imports)]
use common::{assert_eq, assert_ne};
use ffikit_runtime::{
    memory, ArrayLayout, CType, FfiError, FieldMap, LayoutBuilder, NativeBuffer, Pointer, Value,
};

#[test]
fn test_follow_pointer_field_to_struct() {
    let node = LayoutBuilder::structure()
        .named("Node")
        .field("value", CType::Int32)
        .field("next", CType::Pointer)
        .build()
        .unwrap();

    let tail = node.create(FieldMap::from([("value", 2)])).unwrap();
    let head = node
        .create(FieldMap::from([
            ("value", Value::Int(1)),
            ("next", Pointer::from_buffer(tail.buffer().unwrap()).to_value()),
        ]))
        .unwrap();

    let next = head.value("next").unwrap().as_u64().unwrap();
    assert_eq!(next, tail.address());

    let pointer = unsafe { Pointer::from_address(next) }.cast(node.clone());
    let followed = pointer.deref().unwrap().into_struct().unwrap();
    assert_eq!(followed.value("value").unwrap(), Value::Int(2));
    assert_eq!(followed.value("next").unwrap(), Value::Pointer(0));
}

#[test]
fn test_pointer_walks_array() {
    let layout = ArrayLayout::new(CType::Double, 4).unwrap();
    let arr = layout
        .create(vec![1.0.into(), 2.0.into(), 3.0.into(), 4.0.into()])
        .unwrap();

    let base = unsafe { Pointer::from_address(arr.address()) }.cast(CType::Double);
    let third = base.offset(2).unwrap();
    assert_eq!(third.address(), arr.address() + 16);
    assert_eq!(third.contents().unwrap().as_value(), Some(&Value::Float(3.0)));

    third.set_index(1, 8.5).unwrap();
    assert_eq!(arr.value(3).unwrap(), Some(Value::Float(8.5)));
    assert_eq!(base.get(3).unwrap().to_value().unwrap(), Value::Float(8.5));
}

#[test]
fn test_pointer_to_array_target() {
    let row = ArrayLayout::new(CType::UInt16, 2).unwrap();
    let buffer = memory::alloc(8);
    let rows = Pointer::from_buffer(&buffer).cast(row);

    rows.set_index(1, Value::from(vec![5u16, 6])).unwrap();
    assert_eq!(buffer.to_vec(), vec![0, 0, 0, 0, 5, 0, 6, 0]);

    let second = rows.get(1).unwrap().into_array().unwrap();
    assert_eq!(second.to_vec().unwrap(), vec![Value::UInt(5), Value::UInt(6)]);
    assert!(matches!(rows.get(2), Err(FfiError::Bounds { .. })));
}

#[test]
fn test_null_pointer_errors() {
    let pointer = Pointer::default().cast(CType::Int64);
    assert!(pointer.is_null());
    assert!(matches!(pointer.deref(), Err(FfiError::NullPointer)));
    assert!(matches!(pointer.set_index(1, 5), Err(FfiError::NullPointer)));
    assert_eq!(pointer.to_value(), Value::Null);
}

#[test]
fn test_repoint_to_raw_address() {
    let target = NativeBuffer::from_bytes(&42u32.to_le_bytes());
    let mut pointer = Pointer::null().cast(CType::UInt32);
    unsafe { pointer.set_address(target.address()) };
    assert!(pointer.buffer().is_none());
    assert_eq!(pointer.contents().unwrap().as_value(), Some(&Value::UInt(42)));
    assert_eq!(pointer.to_value(), Value::Pointer(target.address()));

    pointer.set(&Value::Buffer(target.clone())).unwrap();
    assert!(pointer.buffer().is_some());
}
