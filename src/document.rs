//! # Document Serializer Capability
//!
//! Document-typed fields hold schemaless payloads. The record store does not
//! know their wire format; it delegates to a [`DocumentSerializer`] that must
//! be configured before any document field is read or written; using a
//! document field without one raises `DbError::DocumentSerializerNotSet`.
//!
//! [`JsonDocumentSerializer`] is the bundled implementation, encoding the
//! `serde_json::Value` payload as compact JSON bytes.

use eyre::{Result, WrapErr};

/// Converts document payloads to and from heap bytes.
pub trait DocumentSerializer: Send + Sync {
    fn serialize(&self, doc: &serde_json::Value) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value>;
}

/// JSON-backed document serializer.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDocumentSerializer;

impl DocumentSerializer for JsonDocumentSerializer {
    fn serialize(&self, doc: &serde_json::Value) -> Result<Vec<u8>> {
        serde_json::to_vec(doc).wrap_err("failed to serialize document")
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        serde_json::from_slice(bytes).wrap_err("failed to deserialize document")
    }
}
