//! In-memory node image and its record mapping.
//!
//! A node is one record of a generated `ferro_btree_node_*` type with five
//! fields: KeyCount (Int), IsLeaf (Bool), Keys (Bytes, 31 fixed-width key
//! slots), EntryOids (Bytes, 31 i32s) and Children (Bytes, 32 i32s). Unused
//! slots are zero. Keys are serialized with the same codec as the indexed
//! field, so an index over an encrypted string column stores ciphertext.

use eyre::{ensure, Result};

use crate::codec::Codec;
use crate::error::DbError;
use crate::schema::{FieldMeta, TypeDescription, INDEX_NODE_TYPE_PREFIX};
use crate::types::{FieldType, ObjectInfo, Value};

/// Maximum keys per node (2t - 1 with minimum degree t = 16).
pub const KEYS_PER_NODE: usize = 31;
pub const CHILDREN_PER_NODE: usize = KEYS_PER_NODE + 1;
/// CLRS minimum degree.
pub const MIN_DEGREE: usize = 16;

pub const FIELD_KEY_COUNT: &str = "KeyCount";
pub const FIELD_IS_LEAF: &str = "IsLeaf";
pub const FIELD_KEYS: &str = "Keys";
pub const FIELD_ENTRY_OIDS: &str = "EntryOids";
pub const FIELD_CHILDREN: &str = "Children";

/// Type name of the node store backing the index with the given name.
pub fn node_type_name(index_name: &str) -> String {
    format!("{}{}", INDEX_NODE_TYPE_PREFIX, index_name)
}

/// Registration-time description of a node type for keys of `key_len` bytes.
pub fn node_type_description(index_name: &str, key_len: usize) -> TypeDescription {
    TypeDescription::new(node_type_name(index_name))
        .field(FieldMeta::new(FIELD_KEY_COUNT, FieldType::Int))
        .field(FieldMeta::new(FIELD_IS_LEAF, FieldType::Bool))
        .field(FieldMeta::new(FIELD_KEYS, FieldType::Bytes).max_length(KEYS_PER_NODE * key_len))
        .field(FieldMeta::new(FIELD_ENTRY_OIDS, FieldType::Bytes).max_length(KEYS_PER_NODE * 4))
        .field(FieldMeta::new(FIELD_CHILDREN, FieldType::Bytes).max_length(CHILDREN_PER_NODE * 4))
}

/// One index entry: the key value and the oid of the indexed record. The
/// pair is the unit of comparison, which keeps duplicate keys unique inside
/// the tree.
pub type Entry = (Value, i32);

#[derive(Debug, Clone)]
pub struct Node {
    /// 0 until first persisted.
    pub oid: i32,
    pub is_leaf: bool,
    pub entries: Vec<Entry>,
    /// Child node oids; `entries.len() + 1` of them for internal nodes,
    /// empty for leaves.
    pub children: Vec<i32>,
}

impl Node {
    pub fn new_leaf() -> Self {
        Self { oid: 0, is_leaf: true, entries: Vec::new(), children: Vec::new() }
    }

    pub fn new_internal() -> Self {
        Self { oid: 0, is_leaf: false, entries: Vec::new(), children: Vec::new() }
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= KEYS_PER_NODE
    }

    /// Maps the node onto its record object.
    pub fn to_object(&self, type_name: &str, codec: &Codec, key: &KeyCodec) -> Result<ObjectInfo> {
        ensure!(self.entries.len() <= KEYS_PER_NODE, "node overflows {} keys", KEYS_PER_NODE);
        let mut keys = vec![0u8; KEYS_PER_NODE * key.len];
        let mut entry_oids = vec![0u8; KEYS_PER_NODE * 4];
        for (i, (value, entry_oid)) in self.entries.iter().enumerate() {
            let slot = key.encode(value, codec)?;
            keys[i * key.len..(i + 1) * key.len].copy_from_slice(&slot);
            entry_oids[i * 4..(i + 1) * 4].copy_from_slice(&entry_oid.to_le_bytes());
        }
        let mut children = vec![0u8; CHILDREN_PER_NODE * 4];
        for (i, child) in self.children.iter().enumerate() {
            children[i * 4..(i + 1) * 4].copy_from_slice(&child.to_le_bytes());
        }
        let mut obj = ObjectInfo::with_oid(type_name, self.oid.max(0));
        obj.set(FIELD_KEY_COUNT, Value::Int(self.entries.len() as i32));
        obj.set(FIELD_IS_LEAF, Value::Bool(self.is_leaf));
        obj.set(FIELD_KEYS, Value::Bytes(keys));
        obj.set(FIELD_ENTRY_OIDS, Value::Bytes(entry_oids));
        obj.set(FIELD_CHILDREN, Value::Bytes(children));
        Ok(obj)
    }

    /// Rebuilds a node from its record object. Any malformed content is
    /// index corruption.
    pub fn from_object(obj: &ObjectInfo, codec: &Codec, key: &KeyCodec) -> Result<Self> {
        let corrupt = |what: &str| DbError::IndexCorrupted(format!("node {}: {}", obj.oid, what));
        let count = match obj.get(FIELD_KEY_COUNT) {
            Some(Value::Int(v)) if (0..=KEYS_PER_NODE as i32).contains(v) => *v as usize,
            _ => return Err(corrupt("bad key count").into()),
        };
        let is_leaf = match obj.get(FIELD_IS_LEAF) {
            Some(Value::Bool(v)) => *v,
            _ => return Err(corrupt("bad leaf flag").into()),
        };
        let (Some(Value::Bytes(keys)), Some(Value::Bytes(entry_oids)), Some(Value::Bytes(children))) = (
            obj.get(FIELD_KEYS),
            obj.get(FIELD_ENTRY_OIDS),
            obj.get(FIELD_CHILDREN),
        ) else {
            return Err(corrupt("missing slot arrays").into());
        };
        if keys.len() < count * key.len || entry_oids.len() < count * 4 {
            return Err(corrupt("slot arrays truncated").into());
        }

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let value = key
                .decode(&keys[i * key.len..(i + 1) * key.len], codec)
                .map_err(|e| corrupt(&format!("key slot {}: {}", i, e)))?;
            let entry_oid = i32::from_le_bytes(
                entry_oids[i * 4..(i + 1) * 4].try_into().map_err(|_| corrupt("oid slot"))?,
            );
            entries.push((value, entry_oid));
        }

        let mut child_oids = Vec::new();
        if !is_leaf {
            let needed = count + 1;
            if children.len() < needed * 4 {
                return Err(corrupt("child array truncated").into());
            }
            for i in 0..needed {
                let child = i32::from_le_bytes(
                    children[i * 4..(i + 1) * 4].try_into().map_err(|_| corrupt("child slot"))?,
                );
                if child <= 0 {
                    return Err(corrupt("zero child oid").into());
                }
                child_oids.push(child);
            }
        }
        Ok(Self { oid: obj.oid, is_leaf, entries, children: child_oids })
    }
}

/// Fixed-width serialization parameters of the indexed field.
#[derive(Debug, Clone, Copy)]
pub struct KeyCodec {
    pub field_type: FieldType,
    /// Slot width in bytes, including the nullable flag when present.
    pub len: usize,
    pub real_len: usize,
    pub nullable: bool,
}

impl KeyCodec {
    pub fn encode(&self, value: &Value, codec: &Codec) -> Result<Vec<u8>> {
        codec.encode(value, self.field_type, self.len, self.real_len, self.nullable)
    }

    pub fn decode(&self, slot: &[u8], codec: &Codec) -> Result<Value> {
        codec.decode(self.field_type, slot, self.nullable, true)
    }
}
