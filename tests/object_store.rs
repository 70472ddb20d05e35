//! # Object Store Integration Tests
//!
//! End-to-end coverage of the record path: save/fetch round trips, oid
//! allocation, soft delete and restore, heap-backed collection fields and
//! nested object graphs.

use tempfile::TempDir;

use ferrobase::{Database, DbError, FieldMeta, FieldType, ObjectInfo, TypeDescription, Value};

fn create_test_db() -> (TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    (dir, db)
}

fn person_type() -> TypeDescription {
    TypeDescription::new("Person")
        .field(FieldMeta::new("X", FieldType::Int))
        .field(FieldMeta::new("Name", FieldType::String).max_length(10))
}

fn person(x: i32, name: &str) -> ObjectInfo {
    let mut obj = ObjectInfo::new("Person");
    obj.set("X", Value::Int(x));
    obj.set("Name", Value::Str(name.into()));
    obj
}

#[test]
fn test_first_save_assigns_oid_one() {
    let (_dir, db) = create_test_db();
    db.register_type(&person_type()).unwrap();

    let oid = db.save(&person(42, "hello")).unwrap();
    assert_eq!(oid, 1);

    let back = db.fetch("Person", 1).unwrap();
    assert_eq!(back.oid, 1);
    assert_eq!(back.get("X"), Some(&Value::Int(42)));
    assert_eq!(back.get("Name"), Some(&Value::Str("hello".into())));
}

#[test]
fn test_oids_are_dense_and_sequential() {
    let (_dir, db) = create_test_db();
    db.register_type(&person_type()).unwrap();
    for i in 1..=5 {
        assert_eq!(db.save(&person(i, "p")).unwrap(), i);
    }
    assert_eq!(db.record_count("Person").unwrap(), 5);
}

#[test]
fn test_update_in_place_keeps_oid() {
    let (_dir, db) = create_test_db();
    db.register_type(&person_type()).unwrap();
    let oid = db.save(&person(1, "a")).unwrap();

    let mut updated = person(2, "b");
    updated.oid = oid;
    assert_eq!(db.save(&updated).unwrap(), oid);

    assert_eq!(db.record_count("Person").unwrap(), 1);
    let back = db.fetch("Person", oid).unwrap();
    assert_eq!(back.get("X"), Some(&Value::Int(2)));
}

#[test]
fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(dir.path()).unwrap();
        db.register_type(&person_type()).unwrap();
        db.save(&person(7, "seven")).unwrap();
        db.sync().unwrap();
    }
    let db = Database::open(dir.path()).unwrap();
    db.register_type(&person_type()).unwrap();
    let back = db.fetch("Person", 1).unwrap();
    assert_eq!(back.get("X"), Some(&Value::Int(7)));
    assert_eq!(back.get("Name"), Some(&Value::Str("seven".into())));
}

#[test]
fn test_string_over_declared_length_rejected() {
    let (_dir, db) = create_test_db();
    db.register_type(&person_type()).unwrap();
    // "Name" is declared with max_length 10.
    let err = db.save(&person(1, "this name is far too long")).unwrap_err();
    assert!(err.to_string().contains("Name") || err.downcast_ref::<DbError>().is_some());
}

#[test]
fn test_delete_and_restore() {
    let (_dir, db) = create_test_db();
    db.register_type(&person_type()).unwrap();
    let oid = db.save(&person(1, "a")).unwrap();

    db.delete("Person", oid).unwrap();
    assert!(db.is_deleted("Person", oid).unwrap());
    let err = db.fetch("Person", oid).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DbError>(),
        Some(DbError::ObjectDeleted { oid: 1 })
    ));
    // The slot is kept; the count does not shrink.
    assert_eq!(db.record_count("Person").unwrap(), 1);

    db.restore_deleted("Person", oid).unwrap();
    let back = db.fetch("Person", oid).unwrap();
    assert_eq!(back.get("X"), Some(&Value::Int(1)));
}

#[test]
fn test_fetch_all_skips_deleted() {
    let (_dir, db) = create_test_db();
    db.register_type(&person_type()).unwrap();
    for i in 1..=4 {
        db.save(&person(i, "p")).unwrap();
    }
    db.delete("Person", 2).unwrap();
    db.delete("Person", 4).unwrap();

    let all = db.fetch_all("Person").unwrap();
    let xs: Vec<_> = all.iter().map(|o| o.get("X").cloned().unwrap()).collect();
    assert_eq!(xs, vec![Value::Int(1), Value::Int(3)]);
}

#[test]
fn test_array_field_roundtrip_and_growth() {
    let (_dir, db) = create_test_db();
    db.register_type(
        &TypeDescription::new("Bag")
            .field(FieldMeta::new("Items", FieldType::Array))
            .field(FieldMeta::new("Note", FieldType::Text)),
    )
    .unwrap();

    let mut bag = ObjectInfo::new("Bag");
    bag.set("Items", Value::Array(vec![Value::Int(1), Value::Int(2)]));
    bag.set("Note", Value::Str("short".into()));
    let oid = db.save(&bag).unwrap();

    // Grow both heap payloads well past their initial reservations.
    let big: Vec<Value> = (0..200).map(Value::Int).collect();
    db.set_field("Bag", oid, "Items", &Value::Array(big.clone())).unwrap();
    db.set_field("Bag", oid, "Note", &Value::Str("x".repeat(500))).unwrap();

    let back = db.fetch("Bag", oid).unwrap();
    assert_eq!(back.get("Items"), Some(&Value::Array(big)));
    assert_eq!(back.get("Note"), Some(&Value::Str("x".repeat(500))));
}

#[test]
fn test_jagged_array_with_nulls() {
    let (_dir, db) = create_test_db();
    db.register_type(
        &TypeDescription::new("Doc").field(FieldMeta::new("Lines", FieldType::Array)),
    )
    .unwrap();

    let lines = Value::Array(vec![
        Value::Str("alpha".into()),
        Value::Null,
        Value::Str("".into()),
        Value::Str("gamma".into()),
    ]);
    let mut doc = ObjectInfo::new("Doc");
    doc.set("Lines", lines.clone());
    let oid = db.save(&doc).unwrap();
    assert_eq!(db.fetch("Doc", oid).unwrap().get("Lines"), Some(&lines));
}

#[test]
fn test_dict_field_roundtrip() {
    let (_dir, db) = create_test_db();
    db.register_type(
        &TypeDescription::new("Env").field(FieldMeta::new("Vars", FieldType::Dictionary)),
    )
    .unwrap();

    let vars = Value::Dict(vec![
        (Value::Str("PATH".into()), Value::Str("/usr/bin".into())),
        (Value::Str("LANG".into()), Value::Null),
    ]);
    let mut env = ObjectInfo::new("Env");
    env.set("Vars", vars.clone());
    let oid = db.save(&env).unwrap();
    assert_eq!(db.fetch("Env", oid).unwrap().get("Vars"), Some(&vars));
}

#[test]
fn test_nested_object_graph_saves_both_types() {
    let (_dir, db) = create_test_db();
    db.register_type(&person_type()).unwrap();
    db.register_type(
        &TypeDescription::new("Team")
            .field(FieldMeta::new("Lead", FieldType::Complex))
            .field(FieldMeta::new("Name", FieldType::String).max_length(20)),
    )
    .unwrap();

    let mut team = ObjectInfo::new("Team");
    team.set("Lead", Value::Object(Box::new(person(9, "lead"))));
    team.set("Name", Value::Str("core".into()));
    let team_oid = db.save(&team).unwrap();

    assert_eq!(db.record_count("Person").unwrap(), 1);
    let loaded = db.fetch("Team", team_oid).unwrap();
    match loaded.get("Lead") {
        Some(Value::Object(lead)) => assert_eq!(lead.get("X"), Some(&Value::Int(9))),
        other => panic!("expected nested object, got {:?}", other),
    }
}

#[test]
fn test_graph_key_dedupes_shared_child() {
    let (_dir, db) = create_test_db();
    db.register_type(&person_type()).unwrap();
    db.register_type(
        &TypeDescription::new("Pair")
            .field(FieldMeta::new("A", FieldType::Complex))
            .field(FieldMeta::new("B", FieldType::Complex)),
    )
    .unwrap();

    // The same logical person appears twice in the graph.
    let mut shared = person(5, "shared");
    shared.graph_key = Some(77);
    let mut pair = ObjectInfo::new("Pair");
    pair.set("A", Value::Object(Box::new(shared.clone())));
    pair.set("B", Value::Object(Box::new(shared)));
    let oid = db.save(&pair).unwrap();

    // One record, both handles pointing at it.
    assert_eq!(db.record_count("Person").unwrap(), 1);
    let loaded = db.fetch("Pair", oid).unwrap();
    let (Some(Value::Object(a)), Some(Value::Object(b))) = (loaded.get("A"), loaded.get("B"))
    else {
        panic!("children did not inflate");
    };
    assert_eq!(a.oid, b.oid);
}

#[test]
fn test_null_complex_field_roundtrips() {
    let (_dir, db) = create_test_db();
    db.register_type(
        &TypeDescription::new("Node").field(FieldMeta::new("Next", FieldType::Complex)),
    )
    .unwrap();
    let mut node = ObjectInfo::new("Node");
    node.set("Next", Value::Null);
    let oid = db.save(&node).unwrap();
    assert_eq!(db.fetch("Node", oid).unwrap().get("Next"), Some(&Value::Null));
}

#[test]
fn test_document_field_with_serializer() {
    use ferrobase::JsonDocumentSerializer;
    use std::sync::Arc;

    let dir = tempfile::tempdir().unwrap();
    let db = Database::builder(dir.path())
        .document_serializer(Arc::new(JsonDocumentSerializer))
        .open()
        .unwrap();
    db.register_type(
        &TypeDescription::new("Event").field(FieldMeta::new("Meta", FieldType::Document)),
    )
    .unwrap();

    let doc = serde_json::json!({"kind": "click", "coords": [3, 4]});
    let mut event = ObjectInfo::new("Event");
    event.set("Meta", Value::Document(doc.clone()));
    let oid = db.save(&event).unwrap();
    assert_eq!(db.fetch("Event", oid).unwrap().get("Meta"), Some(&Value::Document(doc)));
}

#[test]
fn test_document_field_without_serializer_rejected() {
    let (_dir, db) = create_test_db();
    db.register_type(
        &TypeDescription::new("Event").field(FieldMeta::new("Meta", FieldType::Document)),
    )
    .unwrap();
    let mut event = ObjectInfo::new("Event");
    event.set("Meta", Value::Document(serde_json::json!({})));
    let err = db.save(&event).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DbError>(),
        Some(DbError::DocumentSerializerNotSet)
    ));
}

/// Toy length-preserving cipher, enough to exercise the encryption seam.
struct XorCipher(u8);

impl ferrobase::Encryptor for XorCipher {
    fn encrypt(&self, buf: &mut [u8]) -> eyre::Result<()> {
        for b in buf {
            *b ^= self.0;
        }
        Ok(())
    }

    fn decrypt(&self, buf: &mut [u8]) -> eyre::Result<()> {
        self.encrypt(buf)
    }

    fn block_size_bits(&self) -> usize {
        64
    }
}

#[test]
fn test_encrypted_strings_roundtrip_across_sessions() {
    use std::sync::Arc;

    let dir = tempfile::tempdir().unwrap();
    let secret_type = TypeDescription::new("Secret")
        .field(FieldMeta::new("Name", FieldType::String).max_length(10))
        .field(FieldMeta::new("Body", FieldType::Text));
    {
        let db = Database::builder(dir.path())
            .encryptor(Arc::new(XorCipher(0x5A)))
            .open()
            .unwrap();
        db.register_type(&secret_type).unwrap();
        let mut s = ObjectInfo::new("Secret");
        s.set("Name", Value::Str("hush".into()));
        s.set("Body", Value::Str("the long confidential body".into()));
        db.save(&s).unwrap();
        db.sync().unwrap();
    }
    let db = Database::builder(dir.path())
        .encryptor(Arc::new(XorCipher(0x5A)))
        .open()
        .unwrap();
    db.register_type(&secret_type).unwrap();
    let back = db.fetch("Secret", 1).unwrap();
    assert_eq!(back.get("Name"), Some(&Value::Str("hush".into())));
    assert_eq!(back.get("Body"), Some(&Value::Str("the long confidential body".into())));
}

#[test]
fn test_unregistered_type_rejected() {
    let (_dir, db) = create_test_db();
    let err = db.fetch("Ghost", 1).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DbError>(),
        Some(DbError::UnsupportedOperation(_))
    ));
}

#[test]
fn test_drop_type_retires_name() {
    let (_dir, db) = create_test_db();
    db.register_type(&person_type()).unwrap();
    db.save(&person(1, "a")).unwrap();
    db.drop_type("Person").unwrap();
    assert!(!db.type_names().contains(&"Person".to_string()));
    assert!(db.fetch("Person", 1).is_err());
}
