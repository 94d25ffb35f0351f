// Layout engine and view behaviour through the public API
//
// Covers the documented layout scenarios plus property tests for alignment,
// round trips, union aliasing, bit-field isolation and anonymous promotion.

mod common;

use common::*;
#[allow(unused_imports)]
use common::{assert_eq, assert_ne};
use ffikit_runtime::{
    ArrayLayout, CType, FieldMap, FieldSpec, LayoutBuilder, LayoutError, Platform, Value,
};
use proptest::prelude::*;
use rstest::rstest;

fn wide() -> Platform {
    Platform::host().with_pointer_width(8)
}

fn mixed(packed: bool) -> std::sync::Arc<ffikit_runtime::Layout> {
    LayoutBuilder::structure()
        .platform(wide())
        .packed(packed)
        .field("a", CType::Int8)
        .field("b", CType::Int32)
        .field("c", CType::Int8)
        .field("d", CType::Double)
        .build()
        .unwrap()
}

// ===== Concrete scenarios =====

#[test]
fn test_natural_mixed_struct() {
    let layout = mixed(false);
    assert_eq!(layout.size(), 24);
    assert_eq!(layout.alignment(), 8);
    assert_eq!(offsets(&layout), vec![0, 4, 8, 16]);
}

#[test]
fn test_packed_mixed_struct() {
    let layout = mixed(true);
    assert_eq!(layout.size(), 14);
    assert_eq!(layout.alignment(), 1);
    assert_eq!(offsets(&layout), vec![0, 1, 5, 6]);

    let instance = layout
        .create(FieldMap::from([
            ("a", Value::Int(-1)),
            ("b", Value::Int(0x01020304)),
            ("d", Value::Float(2.5)),
        ]))
        .unwrap();
    let bytes = instance.to_bytes();
    assert_eq!(&bytes[..6], &[0xff, 4, 3, 2, 1, 0]);
    assert_eq!(&bytes[6..], &2.5f64.to_le_bytes());
}

#[test]
fn test_union_type_punning() {
    let layout = LayoutBuilder::union()
        .field("asInt", CType::Int32)
        .field("asFloat", CType::Float)
        .build()
        .unwrap();
    assert_eq!(layout.size(), 4);

    let instance = layout.create(FieldMap::new()).unwrap();
    instance.set("asInt", 0x3F80_0000).unwrap();
    assert_eq!(instance.value("asFloat").unwrap(), Value::Float(1.0));

    instance.set("asFloat", -2.0f32).unwrap();
    assert_int(
        instance.value("asInt").unwrap(),
        (-2.0f32).to_bits() as i32 as i64,
    );
}

#[test]
fn test_bit_flags_share_one_byte() {
    let layout = structure([
        ("flag1", FieldSpec::bits(CType::UInt8, 1)),
        ("flag2", FieldSpec::bits(CType::UInt8, 1)),
        ("flag3", FieldSpec::bits(CType::UInt8, 1)),
        ("reserved", FieldSpec::bits(CType::UInt8, 5)),
    ]);
    assert_eq!(layout.size(), 1);

    let flags = layout
        .create(FieldMap::from([
            ("flag1", 1),
            ("flag2", 0),
            ("flag3", 1),
            ("reserved", 0b10101),
        ]))
        .unwrap();
    assert_eq!(flags.to_bytes(), vec![0b1010_1101]);
    assert_eq!(flags.value("reserved").unwrap(), Value::UInt(0b10101));

    flags.set("flag2", 1).unwrap();
    assert_eq!(flags.to_bytes(), vec![0b1010_1111]);
}

#[test]
fn test_plain_field_of_same_base_breaks_bit_unit() {
    let layout = structure([
        ("low", FieldSpec::bits(CType::UInt16, 4)),
        ("plain", FieldSpec::Primitive(CType::UInt16)),
        ("high", FieldSpec::bits(CType::UInt16, 4)),
    ]);
    assert_eq!(offsets(&layout), vec![0, 2, 4]);
    assert_eq!(layout.size(), 6);
}

#[test]
fn test_anonymous_point_in_circle() {
    let circle = structure([
        ("center", FieldSpec::anonymous(point())),
        ("radius", FieldSpec::Primitive(CType::Double)),
    ]);
    assert_eq!(circle.keys(), vec!["x", "y", "radius"]);

    let c = circle.create(FieldMap::from([("radius", 1.5)])).unwrap();
    c.set("x", 10).unwrap();

    let snapshot = c.to_object().unwrap();
    assert_eq!(
        snapshot,
        FieldMap::from([
            ("x", Value::Int(10)),
            ("y", Value::Int(0)),
            ("radius", Value::Float(1.5)),
        ])
    );
    assert!(!snapshot.contains("center"));
    assert_eq!(
        c.nested_view("center").unwrap().value("x").unwrap(),
        Value::Int(10)
    );
}

#[rstest]
#[case(FieldSpec::bits(CType::UInt8, 0), "InvalidBitWidth")]
#[case(FieldSpec::bits(CType::UInt8, 9), "InvalidBitWidth")]
#[case(FieldSpec::bits(CType::Double, 3), "InvalidBitFieldBase")]
#[case(FieldSpec::Primitive(CType::Void), "VoidField")]
fn test_rejected_field_specs(#[case] spec: FieldSpec, #[case] kind: &str) {
    let err = LayoutBuilder::structure()
        .field("bad", spec)
        .build()
        .unwrap_err();
    let matched = match err {
        LayoutError::InvalidBitWidth { .. } => "InvalidBitWidth",
        LayoutError::InvalidBitFieldBase { .. } => "InvalidBitFieldBase",
        LayoutError::VoidField(_) => "VoidField",
        _ => "other",
    };
    assert_eq!(matched, kind);
}

#[test]
fn test_unknown_type_name() {
    assert_eq!(
        "int128".parse::<CType>(),
        Err(LayoutError::UnknownType("int128".to_string()))
    );
    assert_eq!("unsigned char".parse::<CType>(), Ok(CType::UInt8));
}

#[test]
fn test_array_field_in_union() {
    let layout = LayoutBuilder::union()
        .field("word", CType::UInt32)
        .field("bytes", ArrayLayout::new(CType::UInt8, 4).unwrap())
        .build()
        .unwrap();
    let u = layout.create(FieldMap::new()).unwrap();
    u.set("word", 0xAABB_CCDDu32).unwrap();
    assert_eq!(
        u.value("bytes").unwrap(),
        Value::from(vec![0xDDu8, 0xCC, 0xBB, 0xAA])
    );
}

// ===== Properties =====

fn primitive() -> impl Strategy<Value = CType> {
    prop::sample::select(vec![
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
        CType::SizeT,
        CType::Long,
    ])
}

proptest! {
    #[test]
    fn prop_unpacked_size_is_multiple_of_alignment(
        types in prop::collection::vec(primitive(), 1..12),
        is_union in any::<bool>(),
        width in prop::sample::select(vec![4u32, 8]),
    ) {
        let base = if is_union { LayoutBuilder::union() } else { LayoutBuilder::structure() };
        let layout = types
            .iter()
            .enumerate()
            .fold(base.platform(Platform::host().with_pointer_width(width)), |b, (i, ty)| {
                b.field(format!("f{}", i), *ty)
            })
            .build()
            .unwrap();
        prop_assert_eq!(layout.size() % layout.alignment(), 0);
        for field in layout.fields() {
            prop_assert_eq!(field.offset % field.alignment, 0);
            prop_assert!(field.offset + field.extent() <= layout.size());
        }
    }

    #[test]
    fn prop_create_then_snapshot_round_trips(
        a in any::<i8>(),
        b in any::<u16>(),
        c in any::<i32>(),
        d in any::<i64>(),
        e in any::<u64>(),
        f in -1.0e300f64..1.0e300,
        g in any::<bool>(),
        packed in any::<bool>(),
    ) {
        let layout = LayoutBuilder::structure()
            .packed(packed)
            .field("a", CType::Int8)
            .field("b", CType::UInt16)
            .field("c", CType::Int32)
            .field("d", CType::Int64)
            .field("e", CType::UInt64)
            .field("f", CType::Double)
            .field("g", CType::Bool)
            .build()
            .unwrap();
        let values = FieldMap::from([
            ("a", Value::from(a)),
            ("b", Value::from(b)),
            ("c", Value::from(c)),
            ("d", Value::from(d)),
            ("e", Value::from(e)),
            ("f", Value::from(f)),
            ("g", Value::from(g)),
        ]);
        let snapshot = layout.create(values.clone()).unwrap().to_object().unwrap();
        prop_assert_eq!(snapshot, values);
    }

    #[test]
    fn prop_union_reads_little_endian_bytes(word in any::<u32>()) {
        let layout = LayoutBuilder::union()
            .field("word", CType::UInt32)
            .field("bytes", ArrayLayout::new(CType::UInt8, 4).unwrap())
            .field("low", CType::UInt16)
            .build()
            .unwrap();
        let u = layout.create(FieldMap::from([("word", word)])).unwrap();
        let expected: Vec<Value> = word.to_le_bytes().iter().map(|b| Value::from(*b)).collect();
        prop_assert_eq!(u.value("bytes").unwrap(), Value::Array(expected));
        prop_assert_eq!(u.value("low").unwrap(), Value::from(word as u16));
    }

    #[test]
    fn prop_bit_field_write_is_isolated(
        widths in prop::collection::vec(1u32..=8, 4),
        initial in prop::collection::vec(any::<u64>(), 4),
        target in 0usize..4,
        replacement in any::<u64>(),
    ) {
        let layout = widths
            .iter()
            .enumerate()
            .fold(LayoutBuilder::structure(), |b, (i, w)| {
                b.field(format!("f{}", i), FieldSpec::bits(CType::UInt32, *w))
            })
            .build()
            .unwrap();
        prop_assert_eq!(layout.size(), 4);

        let mask = |w: u32| (1u64 << w) - 1;
        let view = layout.create(FieldMap::new()).unwrap();
        for (i, (w, v)) in widths.iter().zip(&initial).enumerate() {
            view.set(&format!("f{}", i), Value::UInt(v & mask(*w))).unwrap();
        }
        view.set(&format!("f{}", target), Value::UInt(replacement & mask(widths[target]))).unwrap();

        for (i, (w, v)) in widths.iter().zip(&initial).enumerate() {
            let expected = if i == target { replacement & mask(*w) } else { v & mask(*w) };
            prop_assert_eq!(view.value(&format!("f{}", i)).unwrap(), Value::UInt(expected));
        }
    }

    #[test]
    fn prop_anonymous_members_alias_inner_view(x in any::<i32>(), y in any::<i32>()) {
        let outer = structure([
            ("tag", FieldSpec::Primitive(CType::UInt8)),
            ("pos", FieldSpec::anonymous(point())),
        ]);
        let instance = outer.create(FieldMap::from([("x", x), ("y", y)])).unwrap();
        let inner = instance.nested_view("pos").unwrap();
        for name in ["x", "y"] {
            prop_assert_eq!(instance.value(name).unwrap(), inner.value(name).unwrap());
        }
    }
}
