// Declarative layouts loaded from TOML files

mod common;

use common::*;
#[allow(unused_imports)]
use common::{assert_eq, assert_ne};
use ffikit_runtime::{FfiError, FieldMap, LayoutError, TypeRegistry, Value};
use std::fs;
use tempfile::TempDir;

const SHAPES: &str = r#"
[[layout]]
name = "Point"
fields = [ { name = "x", type = "int32" }, { name = "y", type = "int32" } ]

[[layout]]
name = "Polygon"
fields = [
  { name = "count", type = "uint8" },
  { name = "corners", type = "Point", length = 3 },
  { name = "label", type = "string" },
]
"#;

#[test]
fn test_load_file_and_instantiate() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shapes.toml");
    fs::write(&path, SHAPES).unwrap();

    let mut registry = TypeRegistry::new();
    let defined = registry.load_file(&path).unwrap();
    assert_eq!(defined, vec!["Point", "Polygon"]);
    assert_eq!(registry.names().collect::<Vec<_>>(), vec!["Point", "Polygon"]);

    let polygon = registry.layout("Polygon").unwrap();
    assert_eq!(polygon.field("corners").unwrap().offset, 4);
    #[cfg(target_pointer_width = "64")]
    {
        assert_eq!(polygon.field("label").unwrap().offset, 32);
        assert_eq!(registry.sizeof("Polygon").unwrap(), 40);
    }

    let instance = polygon
        .create(FieldMap::from([
            ("count", Value::from(1u8)),
            (
                "corners",
                Value::Array(vec![Value::Struct(FieldMap::from([("x", 3), ("y", 4)]))]),
            ),
            ("label", Value::from("tri")),
        ]))
        .unwrap();
    assert_eq!(
        instance.to_json().unwrap(),
        r#"{"count":1,"corners":[{"x":3,"y":4},{"x":0,"y":0},{"x":0,"y":0}],"label":"tri"}"#
    );
}

#[test]
fn test_later_documents_reference_earlier_ones() {
    let mut registry = TypeRegistry::new();
    registry.load_str(SHAPES).unwrap();
    registry
        .load_str(
            r#"
[[layout]]
name = "Marker"
packed = true
fields = [
  { name = "kind", type = "uint8" },
  { name = "at", type = "Point", anonymous = true },
]
"#,
        )
        .unwrap();

    let marker = registry.layout("Marker").unwrap();
    assert_eq!(marker.size(), 9);
    assert_eq!(marker.field("y").unwrap().offset, 5);
    assert_eq!(marker.keys(), vec!["kind", "x", "y"]);
    assert_eq!(registry.len(), 3);
}

#[test]
fn test_unknown_type_aborts_document() {
    let mut registry = TypeRegistry::new();
    let err = registry
        .load_str(
            r#"
[[layout]]
name = "Good"
fields = [ { name = "a", type = "int8" } ]

[[layout]]
name = "Bad"
fields = [ { name = "b", type = "Missing" } ]
"#,
        )
        .unwrap_err();
    assert!(matches!(err, FfiError::Layout(LayoutError::UnknownType(ref t)) if t == "Missing"));
    assert!(registry.is_empty());
    assert!(matches!(
        registry.layout("Good"),
        Err(LayoutError::UnknownLayout(_))
    ));
}

#[test]
fn test_unknown_keys_rejected() {
    let mut registry = TypeRegistry::new();
    let err = registry
        .load_str("[[layout]]\nname = \"P\"\nalign = 16\nfields = []\n")
        .unwrap_err();
    assert!(matches!(err, FfiError::Layout(LayoutError::InvalidDefinition(_))));
}

#[test]
fn test_missing_file() {
    let dir = TempDir::new().unwrap();
    let mut registry = TypeRegistry::new();
    let err = registry.load_file(&dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().contains("absent.toml"));
}
