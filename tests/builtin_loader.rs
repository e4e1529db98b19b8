//! Loading builtin-module descriptors from files and directories.

mod common;

use std::fs;

use ozboot::builtins::BuiltinRegistry;

const VALUE_JSON: &str = r#"{
  "name": "Value",
  "builtins": [
    {
      "fullCppName": "mozart::builtins::ModValue::Dot",
      "name": ".",
      "inlineable": true,
      "inlineOpCode": 64,
      "params": [ {"kind": "In"}, {"kind": "In"}, {"kind": "Out"} ]
    }
  ]
}"#;

const SYSTEM_JSON: &str = r#"{
  "name": "System",
  "builtins": [
    {
      "fullCppName": "mozart::builtins::ModSystem::Show",
      "name": "show",
      "inlineable": false,
      "params": [ {"kind": "In"} ]
    }
  ]
}"#;

#[test]
fn loads_a_single_descriptor_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Value-builtin.json");
    fs::write(&path, VALUE_JSON).unwrap();

    let mut registry = BuiltinRegistry::new();
    registry.load_path(&path).unwrap();

    let dot = registry.lookup("Value", ".").unwrap();
    assert_eq!(dot.full_cpp_name(), "mozart::builtins::ModValue::Dot");
    assert_eq!(dot.arity(), 3);
    assert_eq!(dot.inline_op_code(), Some(64));
}

#[test]
fn scans_a_directory_for_descriptor_files() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("Value-builtin.json"), VALUE_JSON).unwrap();
    fs::write(dir.path().join("System-builtin.json"), SYSTEM_JSON).unwrap();
    // Files without the descriptor suffix are ignored
    fs::write(dir.path().join("notes.json"), "{}").unwrap();
    fs::write(dir.path().join("README"), "not json at all").unwrap();

    let mut registry = BuiltinRegistry::new();
    registry.load_path(dir.path()).unwrap();

    assert!(registry.lookup("Value", ".").is_some());
    assert!(registry.lookup("System", "show").is_some());
    assert_eq!(registry.module_names().count(), 2);
}

#[test]
fn malformed_descriptor_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Broken-builtin.json");
    fs::write(&path, "{ \"name\": \"Broken\" }").unwrap();

    let mut registry = BuiltinRegistry::new();
    assert!(registry.load_path(&path).is_err());
}

#[test]
fn boot_urls_resolve_loaded_modules() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("Value-builtin.json"), VALUE_JSON).unwrap();

    let mut registry = BuiltinRegistry::new();
    registry.load_path(dir.path()).unwrap();

    assert!(registry.boot_module("x-oz://boot/Value").is_some());
    assert!(registry.boot_module("x-oz://boot/System").is_none());
}

#[test]
fn export_record_lists_every_builtin() {
    let registry = common::boot_registry();
    let record = registry
        .export_record("Value", &ozboot::Pos::dummy())
        .unwrap();
    match record {
        ozboot::Expression::Record { fields, .. } => {
            assert_eq!(fields.len(), 7);
        }
        other => panic!("expected record, got {:?}", other),
    }
}
