//! # Error Taxonomy
//!
//! Typed failures callers are expected to match on. Everything else travels
//! as a contextual `eyre::Report`; these variants are the ones with distinct
//! recovery paths, such as calling `restore_deleted` after `ObjectDeleted`
//! or rebuilding an index after `IndexCorrupted`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    /// The storage format has no representation for the requested type or
    /// value.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// A saved object is missing a field its schema declares.
    #[error("type '{type_name}' has no value for field '{field}'")]
    MissingField { type_name: String, field: String },

    /// A value's kind does not match the declared field type.
    #[error("value kind mismatch for field '{field}' of type '{type_name}'")]
    TypeMismatch { type_name: String, field: String },

    /// An index node failed to decode. Distinct from generic decode errors
    /// so callers can trigger an index rebuild instead of failing the read.
    #[error("index corrupted: {0}")]
    IndexCorrupted(String),

    /// The record exists but is soft-deleted.
    #[error("object {oid} is deleted")]
    ObjectDeleted { oid: i32 },

    /// The transaction was already committed or rolled back.
    #[error("transaction is closed")]
    TransactionClosed,

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A unique index already holds the inserted key.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    /// A document field was used without a configured serializer.
    #[error("no document serializer is configured")]
    DocumentSerializerNotSet,
}
