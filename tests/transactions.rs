//! # Transaction Integration Tests
//!
//! Commit visibility, atomicity of multi-object transactions, rollback from
//! the before-image log, and crash recovery from a log left by an
//! interrupted commit.

use tempfile::TempDir;

use ferrobase::{
    Database, DbError, FieldMeta, FieldType, ObjectInfo, TxnState, TypeDescription, Value,
};

fn create_test_db() -> (TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    (dir, db)
}

fn item_type() -> TypeDescription {
    TypeDescription::new("Item")
        .field(FieldMeta::new("Qty", FieldType::Int).indexed())
        .field(FieldMeta::new("Name", FieldType::String).max_length(20))
}

fn item(qty: i32, name: &str) -> ObjectInfo {
    let mut obj = ObjectInfo::new("Item");
    obj.set("Qty", Value::Int(qty));
    obj.set("Name", Value::Str(name.into()));
    obj
}

#[test]
fn test_commit_applies_all_operations() {
    let (_dir, db) = create_test_db();
    db.register_type(&item_type()).unwrap();
    let oid = db.save(&item(100, "widget")).unwrap();

    let mut txn = db.begin_transaction();
    txn.set_field("Item", oid, "Qty", Value::Int(10)).unwrap();
    txn.save(item(5, "gadget")).unwrap();
    db.commit(&mut txn).unwrap();

    assert_eq!(txn.state(), TxnState::Committed);
    assert_eq!(db.fetch_field("Item", oid, "Qty").unwrap(), Value::Int(10));
    assert_eq!(db.record_count("Item").unwrap(), 2);
    assert_eq!(db.find("Item", "Qty", &Value::Int(5)).unwrap().len(), 1);
}

#[test]
fn test_commit_with_delete() {
    let (_dir, db) = create_test_db();
    db.register_type(&item_type()).unwrap();
    let a = db.save(&item(1, "a")).unwrap();
    let b = db.save(&item(2, "b")).unwrap();

    let mut txn = db.begin_transaction();
    txn.delete("Item", a).unwrap();
    txn.set_field("Item", b, "Qty", Value::Int(20)).unwrap();
    db.commit(&mut txn).unwrap();

    assert!(db.is_deleted("Item", a).unwrap());
    assert_eq!(db.fetch_field("Item", b, "Qty").unwrap(), Value::Int(20));
}

#[test]
fn test_rollback_of_clean_transaction_discards_ops() {
    let (_dir, db) = create_test_db();
    db.register_type(&item_type()).unwrap();
    let oid = db.save(&item(100, "widget")).unwrap();

    let mut txn = db.begin_transaction();
    txn.set_field("Item", oid, "Qty", Value::Int(1)).unwrap();
    db.rollback(&mut txn).unwrap();

    assert_eq!(txn.state(), TxnState::RolledBack);
    assert_eq!(db.fetch_field("Item", oid, "Qty").unwrap(), Value::Int(100));
}

#[test]
fn test_failed_commit_rolls_back_applied_prefix() {
    let (_dir, db) = create_test_db();
    db.register_type(&item_type()).unwrap();
    let oid = db.save(&item(100, "widget")).unwrap();
    let doomed = db.save(&item(1, "doomed")).unwrap();
    db.delete("Item", doomed).unwrap();

    // The first op applies, the second targets a deleted record and fails.
    let mut txn = db.begin_transaction();
    txn.set_field("Item", oid, "Qty", Value::Int(10)).unwrap();
    txn.delete("Item", doomed).unwrap();
    assert!(db.commit(&mut txn).is_err());

    // The transaction is still open; rolling it back restores the snapshot.
    assert_eq!(txn.state(), TxnState::Open);
    db.rollback(&mut txn).unwrap();
    assert_eq!(db.fetch_field("Item", oid, "Qty").unwrap(), Value::Int(100));
}

#[test]
fn test_failed_commit_discards_index_changes() {
    let (_dir, db) = create_test_db();
    db.register_type(&item_type()).unwrap();
    let oid = db.save(&item(100, "widget")).unwrap();
    let doomed = db.save(&item(1, "doomed")).unwrap();
    db.delete("Item", doomed).unwrap();

    let mut txn = db.begin_transaction();
    txn.set_field("Item", oid, "Qty", Value::Int(10)).unwrap();
    txn.delete("Item", doomed).unwrap();
    assert!(db.commit(&mut txn).is_err());
    db.rollback(&mut txn).unwrap();

    let hits = db.find("Item", "Qty", &Value::Int(100)).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].oid, oid);
    assert!(db.find("Item", "Qty", &Value::Int(10)).unwrap().is_empty());
}

#[test]
fn test_rolled_back_insert_releases_its_slot() {
    let (_dir, db) = create_test_db();
    db.register_type(&item_type()).unwrap();
    db.save(&item(1, "first")).unwrap();
    let doomed = db.save(&item(1, "doomed")).unwrap();
    db.delete("Item", doomed).unwrap();

    let mut txn = db.begin_transaction();
    txn.save(item(5, "phantom")).unwrap();
    txn.delete("Item", doomed).unwrap();
    assert!(db.commit(&mut txn).is_err());
    db.rollback(&mut txn).unwrap();

    // The count snapshot was restored, so the next save reuses the slot the
    // failed insert had claimed.
    assert_eq!(db.record_count("Item").unwrap(), 2);
    let next = db.save(&item(9, "real")).unwrap();
    assert_eq!(next, 3);
    assert_eq!(db.fetch_field("Item", next, "Name").unwrap(), Value::Str("real".into()));
}

#[test]
fn test_recovery_on_reopen_after_interrupted_commit() {
    let dir = tempfile::tempdir().unwrap();
    let oid;
    {
        let db = Database::open(dir.path()).unwrap();
        db.register_type(&item_type()).unwrap();
        oid = db.save(&item(100, "widget")).unwrap();
        let doomed = db.save(&item(1, "doomed")).unwrap();
        db.delete("Item", doomed).unwrap();

        let mut txn = db.begin_transaction();
        txn.set_field("Item", oid, "Qty", Value::Int(10)).unwrap();
        txn.delete("Item", doomed).unwrap();
        assert!(db.commit(&mut txn).is_err());
        // Session dies with the log still on disk.
    }
    assert!(dir.path().join("ferrobase.txlog").exists());

    let db = Database::open(dir.path()).unwrap();
    assert!(!dir.path().join("ferrobase.txlog").exists());
    db.register_type(&item_type()).unwrap();
    assert_eq!(db.fetch_field("Item", oid, "Qty").unwrap(), Value::Int(100));
}

#[test]
fn test_rollback_covers_types_first_touched_by_the_commit() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(dir.path()).unwrap();
        db.register_type(&item_type()).unwrap();
        db.save(&item(1, "a")).unwrap();
        let doomed = db.save(&item(2, "doomed")).unwrap();
        db.delete("Item", doomed).unwrap();
    }

    // A fresh session that never registers the type: the store is only
    // instantiated when the commit itself reaches for it, and the count
    // snapshot must still be logged before the insert applies.
    let db = Database::open(dir.path()).unwrap();
    let mut txn = db.begin_transaction();
    txn.save(item(5, "phantom")).unwrap();
    txn.delete("Item", 2).unwrap();
    assert!(db.commit(&mut txn).is_err());
    db.rollback(&mut txn).unwrap();

    assert_eq!(db.record_count("Item").unwrap(), 2);
    assert!(db.fetch("Item", 3).is_err());
    assert_eq!(db.fetch_field("Item", 1, "Qty").unwrap(), Value::Int(1));
}

#[test]
fn test_closed_transaction_cannot_commit_again() {
    let (_dir, db) = create_test_db();
    db.register_type(&item_type()).unwrap();

    let mut txn = db.begin_transaction();
    txn.save(item(1, "once")).unwrap();
    db.commit(&mut txn).unwrap();

    let err = db.commit(&mut txn).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DbError>(),
        Some(DbError::TransactionClosed)
    ));
    let err = txn.save(item(2, "twice")).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DbError>(),
        Some(DbError::TransactionClosed)
    ));
}

#[test]
fn test_empty_transaction_commits_cleanly() {
    let (_dir, db) = create_test_db();
    db.register_type(&item_type()).unwrap();
    let mut txn = db.begin_transaction();
    db.commit(&mut txn).unwrap();
    assert_eq!(txn.state(), TxnState::Committed);
}

#[test]
fn test_transaction_save_of_nested_graph() {
    let (_dir, db) = create_test_db();
    db.register_type(&item_type()).unwrap();
    db.register_type(
        &TypeDescription::new("Order").field(FieldMeta::new("Line", FieldType::Complex)),
    )
    .unwrap();

    let mut order = ObjectInfo::new("Order");
    order.set("Line", Value::Object(Box::new(item(3, "nested"))));
    let mut txn = db.begin_transaction();
    txn.save(order).unwrap();
    db.commit(&mut txn).unwrap();

    assert_eq!(db.record_count("Item").unwrap(), 1);
    let loaded = db.fetch("Order", 1).unwrap();
    match loaded.get("Line") {
        Some(Value::Object(line)) => assert_eq!(line.get("Qty"), Some(&Value::Int(3))),
        other => panic!("expected nested object, got {:?}", other),
    }
}
