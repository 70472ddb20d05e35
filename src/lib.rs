//! # ferrobase - Embedded Object Database
//!
//! ferrobase is an embedded, file-backed object database. Objects of
//! registered types are stored as fixed-layout binary records addressed by
//! object id, with variable-length payloads spilled to a shared raw-data
//! heap and secondary B-tree indexes stored self-referentially as records.
//!
//! ## Quick Start
//!
//! ```ignore
//! use ferrobase::{Database, FieldMeta, FieldType, ObjectInfo, TypeDescription, Value};
//!
//! let db = Database::open("./mydb")?;
//! db.register_type(
//!     &TypeDescription::new("Person")
//!         .field(FieldMeta::new("Age", FieldType::Int).indexed())
//!         .field(FieldMeta::new("Name", FieldType::String).max_length(64)),
//! )?;
//!
//! let mut alice = ObjectInfo::new("Person");
//! alice.set("Age", Value::Int(30));
//! alice.set("Name", Value::Str("Alice".into()));
//! let oid = db.save(&alice)?;
//!
//! let thirties = db.find_range("Person", "Age",
//!     Some(&Value::Int(30)), Some(&Value::Int(39)))?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │       Public API (Database)          │
//! ├─────────────────────────────────────┤
//! │  Graph Resolution │  Transactions    │
//! ├───────────────────┼─────────────────┤
//! │   B-Tree Index    │  Before-Image Log│
//! ├─────────────────────────────────────┤
//! │     Record Stores (one per type)     │
//! ├─────────────────────────────────────┤
//! │  Field Codec  │  Raw-Data Heap       │
//! ├─────────────────────────────────────┤
//! │   Storage Files + Schema Headers     │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! One directory per database, one file per registered type:
//!
//! ```text
//! database_dir/
//! ├── person.fbd           # Type header + fixed-length record array
//! ├── rawdatainfo.fbd      # Heap span bookkeeping (self-hosted)
//! ├── indexinfo.fbd        # One root pointer per B-tree index
//! ├── ferro_btree_node_... # Index node records
//! ├── ferrobase.raw        # Variable-length payload heap
//! └── ferrobase.txlog      # Present only while a commit is in flight
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: Positioned file IO and the per-database file registry
//! - [`schema`]: Type descriptions, on-disk headers, record layout
//! - [`codec`]: Fixed-width field encoding, format versioning, encryption
//! - [`record`]: Oid-addressed record stores and the resolver seam
//! - [`heap`]: Raw-data heap and collection payload encoding
//! - [`btree`]: Secondary indexes stored as records
//! - [`txn`]: Client-side transactions and the before-image log
//! - [`database`]: The session facade tying it all together

pub mod btree;
pub mod codec;
pub mod database;
pub mod document;
pub mod encryption;
pub mod error;
pub mod heap;
pub mod record;
pub mod schema;
pub mod storage;
pub mod txn;
pub mod types;

pub use database::{Database, DatabaseBuilder};
pub use document::{DocumentSerializer, JsonDocumentSerializer};
pub use encryption::Encryptor;
pub use error::DbError;
pub use schema::{FieldMeta, TypeDescription};
pub use txn::{Transaction, TxnState};
pub use types::{FieldType, ObjectInfo, TimeKind, Value};
