//! # Secondary Index Integration Tests
//!
//! Equality and range queries through B-tree indexes, unique constraints,
//! index maintenance on update and delete, and persistence across sessions.

use rand::seq::SliceRandom;
use tempfile::TempDir;

use ferrobase::{Database, DbError, FieldMeta, FieldType, ObjectInfo, TypeDescription, Value};

fn create_test_db() -> (TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    (dir, db)
}

fn account_type() -> TypeDescription {
    TypeDescription::new("Account")
        .field(FieldMeta::new("Balance", FieldType::Int).indexed())
        .field(FieldMeta::new("Owner", FieldType::String).max_length(20).unique())
        .field(FieldMeta::new("Notes", FieldType::String).max_length(20))
}

fn account(balance: i32, owner: &str) -> ObjectInfo {
    let mut obj = ObjectInfo::new("Account");
    obj.set("Balance", Value::Int(balance));
    obj.set("Owner", Value::Str(owner.into()));
    obj.set("Notes", Value::Str("".into()));
    obj
}

#[test]
fn test_find_by_indexed_field() {
    let (_dir, db) = create_test_db();
    db.register_type(&account_type()).unwrap();
    db.save(&account(100, "alice")).unwrap();
    db.save(&account(200, "bob")).unwrap();
    db.save(&account(100, "carol")).unwrap();

    let hundred = db.find("Account", "Balance", &Value::Int(100)).unwrap();
    assert_eq!(hundred.len(), 2);
    assert!(db.find("Account", "Balance", &Value::Int(999)).unwrap().is_empty());
}

#[test]
fn test_find_range_returns_key_order() {
    let (_dir, db) = create_test_db();
    db.register_type(&account_type()).unwrap();

    let mut balances: Vec<i32> = (0..300).collect();
    balances.shuffle(&mut rand::thread_rng());
    for (i, b) in balances.iter().enumerate() {
        db.save(&account(*b, &format!("owner{}", i))).unwrap();
    }

    let hits = db
        .find_range("Account", "Balance", Some(&Value::Int(50)), Some(&Value::Int(59)))
        .unwrap();
    let got: Vec<_> = hits.iter().map(|o| o.get("Balance").cloned().unwrap()).collect();
    let want: Vec<_> = (50..=59).map(Value::Int).collect();
    assert_eq!(got, want);

    // Open bounds scan everything, still ordered.
    let all = db.find_range("Account", "Balance", None, None).unwrap();
    assert_eq!(all.len(), 300);
    for pair in all.windows(2) {
        let (Some(Value::Int(a)), Some(Value::Int(b))) =
            (pair[0].get("Balance"), pair[1].get("Balance"))
        else {
            panic!("balance missing");
        };
        assert!(a <= b);
    }
}

#[test]
fn test_range_on_unindexed_field_rejected() {
    let (_dir, db) = create_test_db();
    db.register_type(&account_type()).unwrap();
    let err = db
        .find_range("Account", "Notes", None, Some(&Value::Str("z".into())))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DbError>(),
        Some(DbError::UnsupportedOperation(_))
    ));
}

#[test]
fn test_find_on_unindexed_field_scans() {
    let (_dir, db) = create_test_db();
    db.register_type(&account_type()).unwrap();
    let mut a = account(1, "a");
    a.set("Notes", Value::Str("vip".into()));
    db.save(&a).unwrap();
    db.save(&account(2, "b")).unwrap();

    let vips = db.find("Account", "Notes", &Value::Str("vip".into())).unwrap();
    assert_eq!(vips.len(), 1);
    assert_eq!(vips[0].get("Owner"), Some(&Value::Str("a".into())));
}

#[test]
fn test_unique_index_rejects_duplicate_on_save() {
    let (_dir, db) = create_test_db();
    db.register_type(&account_type()).unwrap();
    db.save(&account(1, "alice")).unwrap();
    let err = db.save(&account(2, "alice")).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DbError>(),
        Some(DbError::UniqueViolation(_))
    ));
    // The failed save left nothing behind.
    assert_eq!(db.find("Account", "Owner", &Value::Str("alice".into())).unwrap().len(), 1);
}

#[test]
fn test_unique_index_rejects_duplicate_on_set_field() {
    let (_dir, db) = create_test_db();
    db.register_type(&account_type()).unwrap();
    db.save(&account(1, "alice")).unwrap();
    let bob = db.save(&account(2, "bob")).unwrap();
    let err = db
        .set_field("Account", bob, "Owner", &Value::Str("alice".into()))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DbError>(),
        Some(DbError::UniqueViolation(_))
    ));
    // Writing a record's own current key back is not a violation.
    db.set_field("Account", bob, "Owner", &Value::Str("bob".into())).unwrap();
}

#[test]
fn test_update_moves_index_entry() {
    let (_dir, db) = create_test_db();
    db.register_type(&account_type()).unwrap();
    let oid = db.save(&account(100, "alice")).unwrap();

    db.set_field("Account", oid, "Balance", &Value::Int(500)).unwrap();
    assert!(db.find("Account", "Balance", &Value::Int(100)).unwrap().is_empty());
    let hits = db.find("Account", "Balance", &Value::Int(500)).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].oid, oid);
}

#[test]
fn test_delete_unlinks_index_entries() {
    let (_dir, db) = create_test_db();
    db.register_type(&account_type()).unwrap();
    let oid = db.save(&account(100, "alice")).unwrap();
    db.delete("Account", oid).unwrap();
    assert!(db.find("Account", "Balance", &Value::Int(100)).unwrap().is_empty());

    // Restore puts the entries back.
    db.restore_deleted("Account", oid).unwrap();
    assert_eq!(db.find("Account", "Balance", &Value::Int(100)).unwrap().len(), 1);
    // And the owner can be claimed again only after a real delete.
    db.delete("Account", oid).unwrap();
    db.save(&account(7, "alice")).unwrap();
}

#[test]
fn test_index_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(dir.path()).unwrap();
        db.register_type(&account_type()).unwrap();
        for i in 0..100 {
            db.save(&account(i, &format!("owner{}", i))).unwrap();
        }
        db.sync().unwrap();
    }
    let db = Database::open(dir.path()).unwrap();
    db.register_type(&account_type()).unwrap();
    let hits = db.find("Account", "Balance", &Value::Int(42)).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].get("Owner"), Some(&Value::Str("owner42".into())));
    let range = db
        .find_range("Account", "Balance", Some(&Value::Int(90)), None)
        .unwrap();
    assert_eq!(range.len(), 10);
}

#[test]
fn test_index_added_over_existing_records_populates() {
    let dir = tempfile::tempdir().unwrap();
    let plain = TypeDescription::new("City")
        .field(FieldMeta::new("Pop", FieldType::Int))
        .field(FieldMeta::new("Name", FieldType::String).max_length(20));
    {
        let db = Database::open(dir.path()).unwrap();
        db.register_type(&plain).unwrap();
        for (name, pop) in [("rome", 2), ("lima", 10), ("oslo", 1)] {
            let mut c = ObjectInfo::new("City");
            c.set("Pop", Value::Int(pop));
            c.set("Name", Value::Str(name.into()));
            db.save(&c).unwrap();
        }
        db.sync().unwrap();
    }
    // Second session declares the field indexed; the tree is built from the
    // records already on disk.
    let db = Database::open(dir.path()).unwrap();
    db.register_type(
        &TypeDescription::new("City")
            .field(FieldMeta::new("Pop", FieldType::Int).indexed())
            .field(FieldMeta::new("Name", FieldType::String).max_length(20)),
    )
    .unwrap();
    let ordered = db.find_range("City", "Pop", None, None).unwrap();
    let names: Vec<_> = ordered.iter().map(|c| c.get("Name").cloned().unwrap()).collect();
    assert_eq!(
        names,
        vec![
            Value::Str("oslo".into()),
            Value::Str("rome".into()),
            Value::Str("lima".into()),
        ]
    );
}

#[test]
fn test_create_index_builds_from_existing_records() {
    let (_dir, db) = create_test_db();
    db.register_type(
        &TypeDescription::new("Reading")
            .field(FieldMeta::new("Temp", FieldType::Int))
            .field(FieldMeta::new("Station", FieldType::String).max_length(10)),
    )
    .unwrap();
    for t in [21, 3, 17, 9] {
        let mut r = ObjectInfo::new("Reading");
        r.set("Temp", Value::Int(t));
        r.set("Station", Value::Str("north".into()));
        db.save(&r).unwrap();
    }

    db.create_index("Reading", "Temp", false).unwrap();
    let ordered = db.find_range("Reading", "Temp", Some(&Value::Int(5)), None).unwrap();
    let temps: Vec<_> = ordered.iter().map(|r| r.get("Temp").cloned().unwrap()).collect();
    assert_eq!(temps, vec![Value::Int(9), Value::Int(17), Value::Int(21)]);

    // Creating it again is a no-op.
    db.create_index("Reading", "Temp", false).unwrap();
    assert_eq!(db.find("Reading", "Temp", &Value::Int(17)).unwrap().len(), 1);
}

#[test]
fn test_null_keys_allowed_in_unique_index() {
    let (_dir, db) = create_test_db();
    db.register_type(
        &TypeDescription::new("Tag")
            .field(FieldMeta::new("Label", FieldType::String).max_length(10).nullable().unique()),
    )
    .unwrap();
    for _ in 0..3 {
        let mut t = ObjectInfo::new("Tag");
        t.set("Label", Value::Null);
        db.save(&t).unwrap();
    }
    assert_eq!(db.record_count("Tag").unwrap(), 3);
}
