//! # Record Stores
//!
//! One [`RecordStore`] per registered type, addressing fixed-length records
//! by oid:
//!
//! ```text
//! position = header_size + (oid - 1) * record_length
//! ```
//!
//! The first 4 bytes of every record hold the owning oid; a negated stored
//! oid marks the record soft-deleted. Variable-length field contents are
//! placed in the raw-data heap during serialization and only their 8-byte
//! handles land in the record.
//!
//! Nested objects cross into other stores through the [`ComplexResolver`]
//! seam. The record store never walks the object graph itself; it hands
//! `Value::Object` fields to the resolver and persists the `{oid, tid}`
//! handle it gets back.

mod store;

use eyre::Result;

use crate::types::{ObjectInfo, Value};

pub use store::{RecordStore, SlotState};

/// Resolves complex references across type stores.
///
/// `need_save` persists (or locates) a nested object and returns its handle;
/// `need_read` inflates a stored handle back into a value. The database
/// session implements this over its store map; a store with no resolver can
/// still round-trip `Value::ComplexRef` handles untouched.
pub trait ComplexResolver: Send + Sync {
    fn need_read(&self, oid: i32, tid: i32) -> Result<Value>;
    fn need_save(&self, obj: &ObjectInfo) -> Result<(i32, i32)>;
}
