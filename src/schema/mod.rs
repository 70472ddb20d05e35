//! # Type Schemas
//!
//! A [`TypeSchema`] describes how one registered type lays out on disk: its
//! tid, the ordered field descriptors, the record length, and the header that
//! occupies the front of the type's file. Schemas come from explicit
//! [`TypeDescription`] registration (the schema-provider seam; ferrobase
//! performs no reflection) or from parsing an existing file header.
//!
//! ## Layout Invariants
//!
//! - `record_length = 4 (oid) + Σ field lengths`
//! - each field's byte offset is the running prefix sum, starting at 4
//! - `position_first_record == header_size`
//!
//! String fields are sized by their declared maximum (rounded up to the
//! cipher block when an encryptor is active); handle-based fields occupy 8
//! bytes; nullable scalar fields carry one extra flag byte.

pub mod header;
pub mod store;

use eyre::{ensure, Result};

use crate::encryption::align_to_block;
use crate::error::DbError;
use crate::types::FieldType;

pub use store::SchemaStore;

/// Type-name prefix of generated B-tree node types. Schemas loaded from disk
/// with this prefix are treated as index-node types, which re-signals their
/// decode failures as index corruption.
pub const INDEX_NODE_TYPE_PREFIX: &str = "ferro_btree_node_";

/// In-record size of a complex / heap handle: two little-endian i32s.
pub const HANDLE_SIZE: usize = 8;

/// Field declaration supplied by the caller at registration time.
#[derive(Debug, Clone)]
pub struct FieldMeta {
    pub name: String,
    pub field_type: FieldType,
    /// Declared maximum byte length; meaningful for `String` and `Bytes`.
    pub max_length: usize,
    pub nullable: bool,
    pub indexed: bool,
    pub unique_index: bool,
}

impl FieldMeta {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            max_length: 0,
            nullable: false,
            indexed: false,
            unique_index: false,
        }
    }

    pub fn max_length(mut self, len: usize) -> Self {
        self.max_length = len;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.indexed = true;
        self.unique_index = true;
        self
    }
}

/// Ordered field declarations for one type.
#[derive(Debug, Clone)]
pub struct TypeDescription {
    pub name: String,
    pub fields: Vec<FieldMeta>,
}

impl TypeDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), fields: Vec::new() }
    }

    pub fn field(mut self, meta: FieldMeta) -> Self {
        self.fields.push(meta);
        self
    }
}

/// One field's resolved on-disk layout.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
    /// Bytes occupied in the fixed record, including the nullable flag byte.
    pub len: usize,
    /// Byte offset within the record.
    pub offset: usize,
    /// Logical length before padding (declared maximum for strings).
    pub real_len: usize,
    pub nullable: bool,
}

impl FieldDescriptor {
    pub fn is_variable_length(&self) -> bool {
        self.field_type.is_handle()
    }

    pub fn is_text(&self) -> bool {
        matches!(self.field_type, FieldType::String | FieldType::Text)
    }

    /// Length available to the value itself, excluding the nullable flag.
    pub fn inner_len(&self) -> usize {
        if self.nullable {
            self.len - 1
        } else {
            self.len
        }
    }
}

/// In-memory schema for one registered type.
#[derive(Debug, Clone)]
pub struct TypeSchema {
    pub tid: i32,
    pub name: String,
    pub version: i32,
    pub fields: Vec<FieldDescriptor>,
    pub record_length: usize,
    pub header_size: usize,
    pub record_count: u32,
    pub last_updated: i64,
    /// True for generated B-tree node types (not persisted; derived from the
    /// type-name prefix on load).
    pub is_index_node: bool,
}

impl TypeSchema {
    /// Builds a schema from a registration-time description, computing field
    /// lengths and prefix-sum offsets. `block` is the encryptor block size,
    /// used to round string slots up so ciphertext fits.
    pub fn build(
        desc: &TypeDescription,
        tid: i32,
        version: i32,
        block: Option<usize>,
    ) -> Result<Self> {
        ensure!(!desc.name.is_empty(), "type name must not be empty");
        let mut fields = Vec::with_capacity(desc.fields.len());
        let mut offset = 4usize;
        for meta in &desc.fields {
            ensure!(
                meta.name.len() <= header::FIELD_NAME_CAP,
                "field name '{}' exceeds {} bytes",
                meta.name,
                header::FIELD_NAME_CAP
            );
            let (base_len, real_len) = match meta.field_type {
                FieldType::String => {
                    ensure!(
                        meta.max_length > 0,
                        "string field '{}' requires a declared max length (or use Text)",
                        meta.name
                    );
                    let padded = match block {
                        Some(b) => align_to_block(meta.max_length, b),
                        None => meta.max_length,
                    };
                    (padded, meta.max_length)
                }
                FieldType::Bytes => {
                    ensure!(
                        meta.max_length > 0,
                        "bytes field '{}' requires a declared length",
                        meta.name
                    );
                    (meta.max_length, meta.max_length)
                }
                ft if ft.is_handle() => {
                    ensure!(
                        !meta.nullable,
                        "field '{}': handle-based kinds encode null as a zero handle, \
                         not a nullable flag",
                        meta.name
                    );
                    (HANDLE_SIZE, HANDLE_SIZE)
                }
                ft => {
                    let len = ft.fixed_len().ok_or_else(|| {
                        DbError::NotSupported(format!("{:?} has no fixed width", ft))
                    })?;
                    (len, len)
                }
            };
            let len = if meta.nullable { base_len + 1 } else { base_len };
            fields.push(FieldDescriptor {
                name: meta.name.clone(),
                field_type: meta.field_type,
                len,
                offset,
                real_len,
                nullable: meta.nullable,
            });
            offset += len;
        }
        let record_length = offset;
        let header_size = header::header_size(desc.name.len(), fields.len(), version);
        Ok(Self {
            tid,
            name: desc.name.clone(),
            version,
            fields,
            record_length,
            header_size,
            record_count: 0,
            last_updated: now_millis(),
            is_index_node: desc.name.starts_with(INDEX_NODE_TYPE_PREFIX),
        })
    }

    pub fn field(&self, name: &str) -> Result<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name).ok_or_else(|| {
            DbError::MissingField { type_name: self.name.clone(), field: name.to_string() }.into()
        })
    }

    /// Absolute file position of the record with the given oid.
    pub fn record_position(&self, oid: i32) -> u64 {
        self.header_size as u64 + (oid as u64 - 1) * self.record_length as u64
    }

    /// File offset of the persisted record-count header field.
    pub fn record_count_offset(&self) -> u64 {
        header::record_count_offset(self.name.len())
    }
}

pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
