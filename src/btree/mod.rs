//! # B-Tree Secondary Indexes
//!
//! An index is a B-tree whose nodes are ordinary records of a generated
//! `ferro_btree_node_<index>` type, so index persistence rides on the same
//! record machinery as user data (including deferred writes during commits).
//! The root oid of every index lives in an `IndexInfo` record, one per
//! index, in its own type store.
//!
//! Entries are `(key, entry_oid)` pairs compared lexicographically, which
//! makes duplicate keys distinct inside the tree; an equality lookup is a
//! range scan over the key with any entry oid. The algorithms are the
//! classic preemptive-split insert and borrow-or-merge delete with minimum
//! degree 16 (31 keys per node).

pub mod node;

use std::cmp::Ordering;
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::Mutex;

use crate::codec::Codec;
use crate::error::DbError;
use crate::record::RecordStore;
use crate::schema::{FieldMeta, TypeDescription};
use crate::types::{FieldType, ObjectInfo, Value};

pub use node::{node_type_description, node_type_name, KeyCodec, KEYS_PER_NODE, MIN_DEGREE};
use node::{Entry, Node};

/// Type holding one root-pointer record per index.
pub const INDEX_INFO_TYPE_NAME: &str = "IndexInfo";
const FIELD_INDEX_NAME: &str = "IndexName";
const FIELD_ROOT_OID: &str = "RootOid";
const INDEX_NAME_CAP: usize = 200;

pub fn index_info_description() -> TypeDescription {
    TypeDescription::new(INDEX_INFO_TYPE_NAME)
        .field(FieldMeta::new(FIELD_INDEX_NAME, FieldType::String).max_length(INDEX_NAME_CAP))
        .field(FieldMeta::new(FIELD_ROOT_OID, FieldType::Int))
}

pub struct BTreeIndex {
    name: String,
    unique: bool,
    key: KeyCodec,
    codec: Codec,
    /// Node records.
    store: Arc<RecordStore>,
    /// Shared `IndexInfo` store.
    info: Arc<RecordStore>,
    info_oid: i32,
    root: Mutex<i32>,
}

impl BTreeIndex {
    /// Opens an index over an existing node store, creating the root leaf
    /// and the `IndexInfo` record on first use.
    pub fn open(
        name: impl Into<String>,
        unique: bool,
        key: KeyCodec,
        codec: Codec,
        store: Arc<RecordStore>,
        info: Arc<RecordStore>,
    ) -> Result<Self> {
        let name = name.into();
        ensure!(name.len() <= INDEX_NAME_CAP, "index name '{}' too long", name);
        let mut existing = None;
        for oid in 1..=info.record_count() as i32 {
            let rec = match info.read_object(oid) {
                Ok(rec) => rec,
                Err(e) if matches!(e.downcast_ref::<DbError>(), Some(DbError::ObjectDeleted { .. })) => {
                    continue
                }
                Err(e) => return Err(e),
            };
            if rec.get(FIELD_INDEX_NAME) == Some(&Value::Str(name.clone())) {
                match rec.get(FIELD_ROOT_OID) {
                    Some(Value::Int(root)) if *root > 0 => existing = Some((oid, *root)),
                    other => {
                        return Err(DbError::IndexCorrupted(format!(
                            "index '{}' root pointer holds {:?}",
                            name, other
                        ))
                        .into())
                    }
                }
                break;
            }
        }

        let (info_oid, root_oid) = match existing {
            Some(found) => found,
            None => {
                // First open: persist an empty root leaf and its pointer.
                let leaf = Node::new_leaf();
                let obj = leaf.to_object(&store.type_name(), &codec, &key)?;
                let root = store.write_object(&obj)?;
                let mut rec = ObjectInfo::new(INDEX_INFO_TYPE_NAME);
                rec.set(FIELD_INDEX_NAME, Value::Str(name.clone()));
                rec.set(FIELD_ROOT_OID, Value::Int(root));
                (info.write_object(&rec)?, root)
            }
        };

        Ok(Self {
            name,
            unique,
            key,
            codec,
            store,
            info,
            info_oid,
            root: Mutex::new(root_oid),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Record store holding this index's nodes. The transaction layer puts
    /// it in deferred-write mode during commits.
    pub fn node_store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Oid of this index's `IndexInfo` record.
    pub fn info_record_oid(&self) -> i32 {
        self.info_oid
    }

    /// Re-reads the root pointer from disk. Called after a commit's deferred
    /// writes are discarded, when the cached root may name a node that was
    /// never flushed.
    pub fn reload_root(&self) -> Result<()> {
        let rec = self.info.read_object(self.info_oid)?;
        match rec.get(FIELD_ROOT_OID) {
            Some(Value::Int(root)) if *root > 0 => {
                *self.root.lock() = *root;
                Ok(())
            }
            other => Err(DbError::IndexCorrupted(format!(
                "index '{}' root pointer holds {:?}",
                self.name, other
            ))
            .into()),
        }
    }

    pub fn insert(&self, key: Value, entry_oid: i32) -> Result<()> {
        let mut root_guard = self.root.lock();
        if self.unique && !key.is_null() {
            let mut hits = Vec::new();
            self.collect(*root_guard, Some(&key), Some(&key), &mut hits)?;
            if !hits.is_empty() {
                return Err(DbError::UniqueViolation(format!(
                    "index '{}' already holds key {:?}",
                    self.name, key
                ))
                .into());
            }
        }
        let entry = (key, entry_oid);
        let mut root = self.read_node(*root_guard)?;
        if root.is_full() {
            let mut new_root = Node::new_internal();
            new_root.children.push(root.oid);
            self.split_child(&mut new_root, 0, &mut root)?;
            *root_guard = new_root.oid;
            self.set_root(new_root.oid)?;
            self.insert_nonfull(new_root, &entry)
        } else {
            self.insert_nonfull(root, &entry)
        }
    }

    /// Removes one entry. Returns false when the pair is not present.
    pub fn remove(&self, key: &Value, entry_oid: i32) -> Result<bool> {
        let mut root_guard = self.root.lock();
        let target = (key.clone(), entry_oid);
        let mut root = self.read_node(*root_guard)?;
        let removed = self.delete_from(&mut root, &target)?;
        if root.entries.is_empty() && !root.is_leaf {
            let collapsed = root.children[0];
            self.store.mark_deleted(root.oid)?;
            *root_guard = collapsed;
            self.set_root(collapsed)?;
        }
        Ok(removed)
    }

    /// Oids of every record whose key equals `key`, in oid order.
    pub fn lookup(&self, key: &Value) -> Result<Vec<i32>> {
        let root = *self.root.lock();
        let mut hits = Vec::new();
        self.collect(root, Some(key), Some(key), &mut hits)?;
        Ok(hits.into_iter().map(|(_, oid)| oid).collect())
    }

    /// In-order `(key, oid)` pairs with keys in `min..=max`; `None` bounds
    /// are open.
    pub fn range(&self, min: Option<&Value>, max: Option<&Value>) -> Result<Vec<(Value, i32)>> {
        let root = *self.root.lock();
        let mut hits = Vec::new();
        self.collect(root, min, max, &mut hits)?;
        Ok(hits)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.range(None, None)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    // ---- node IO ----

    fn read_node(&self, oid: i32) -> Result<Node> {
        let obj = self.store.read_object(oid)?;
        Node::from_object(&obj, &self.codec, &self.key)
    }

    fn write_node(&self, node: &mut Node) -> Result<()> {
        let obj = node.to_object(&self.store.type_name(), &self.codec, &self.key)?;
        let oid = self.store.write_object(&obj)?;
        if node.oid == 0 {
            node.oid = oid;
        }
        Ok(())
    }

    fn set_root(&self, root_oid: i32) -> Result<()> {
        self.info
            .write_field(self.info_oid, FIELD_ROOT_OID, &Value::Int(root_oid))
    }

    // ---- insertion ----

    /// Splits the full `child` at `parent.children[idx]`, lifting its median
    /// entry into the parent.
    fn split_child(&self, parent: &mut Node, idx: usize, child: &mut Node) -> Result<()> {
        let mut sibling = if child.is_leaf { Node::new_leaf() } else { Node::new_internal() };
        sibling.entries = child.entries.split_off(MIN_DEGREE);
        let median = child
            .entries
            .pop()
            .ok_or_else(|| DbError::IndexCorrupted(format!("split of underfull node in '{}'", self.name)))?;
        if !child.is_leaf {
            sibling.children = child.children.split_off(MIN_DEGREE);
        }
        self.write_node(&mut sibling)?;
        self.write_node(child)?;
        parent.entries.insert(idx, median);
        parent.children.insert(idx + 1, sibling.oid);
        self.write_node(parent)
    }

    fn insert_nonfull(&self, mut node: Node, entry: &Entry) -> Result<()> {
        loop {
            if node.is_leaf {
                let pos = upper_bound(&node.entries, entry)?;
                node.entries.insert(pos, entry.clone());
                return self.write_node(&mut node);
            }
            let mut idx = upper_bound(&node.entries, entry)?;
            let mut child = self.read_node(node.children[idx])?;
            if child.is_full() {
                self.split_child(&mut node, idx, &mut child)?;
                if cmp(entry, &node.entries[idx])? == Ordering::Greater {
                    idx += 1;
                }
                child = self.read_node(node.children[idx])?;
            }
            node = child;
        }
    }

    // ---- deletion ----

    fn delete_from(&self, node: &mut Node, target: &Entry) -> Result<bool> {
        let (idx, found) = lower_bound(&node.entries, target)?;
        if found {
            if node.is_leaf {
                node.entries.remove(idx);
                self.write_node(node)?;
                return Ok(true);
            }
            let mut left = self.read_node(node.children[idx])?;
            if left.entries.len() >= MIN_DEGREE {
                let pred = self.max_entry(&left)?;
                node.entries[idx] = pred.clone();
                self.write_node(node)?;
                self.delete_from(&mut left, &pred)?;
                return Ok(true);
            }
            let right = self.read_node(node.children[idx + 1])?;
            if right.entries.len() >= MIN_DEGREE {
                let succ = self.min_entry(&right)?;
                node.entries[idx] = succ.clone();
                self.write_node(node)?;
                let mut right = right;
                self.delete_from(&mut right, &succ)?;
                return Ok(true);
            }
            let mut merged = self.merge_children(node, idx, left, right)?;
            return self.delete_from(&mut merged, target);
        }
        if node.is_leaf {
            return Ok(false);
        }
        let mut child = self.read_node(node.children[idx])?;
        if child.entries.len() < MIN_DEGREE {
            child = self.fill_child(node, idx)?;
        }
        self.delete_from(&mut child, target)
    }

    /// Brings `parent.children[idx]` up to at least `MIN_DEGREE` entries by
    /// borrowing from a sibling or merging with one. Returns the node to
    /// descend into.
    fn fill_child(&self, parent: &mut Node, idx: usize) -> Result<Node> {
        if idx > 0 {
            let mut left = self.read_node(parent.children[idx - 1])?;
            if left.entries.len() >= MIN_DEGREE {
                let mut child = self.read_node(parent.children[idx])?;
                child.entries.insert(0, parent.entries[idx - 1].clone());
                if !child.is_leaf {
                    let shifted = left.children.pop().ok_or_else(|| {
                        DbError::IndexCorrupted(format!("childless internal node in '{}'", self.name))
                    })?;
                    child.children.insert(0, shifted);
                }
                parent.entries[idx - 1] = left
                    .entries
                    .pop()
                    .ok_or_else(|| DbError::IndexCorrupted(format!("empty sibling in '{}'", self.name)))?;
                self.write_node(&mut left)?;
                self.write_node(&mut child)?;
                self.write_node(parent)?;
                return Ok(child);
            }
        }
        if idx + 1 < parent.children.len() {
            let mut right = self.read_node(parent.children[idx + 1])?;
            if right.entries.len() >= MIN_DEGREE {
                let mut child = self.read_node(parent.children[idx])?;
                child.entries.push(parent.entries[idx].clone());
                if !child.is_leaf {
                    child.children.push(right.children.remove(0));
                }
                parent.entries[idx] = right.entries.remove(0);
                self.write_node(&mut right)?;
                self.write_node(&mut child)?;
                self.write_node(parent)?;
                return Ok(child);
            }
        }
        if idx + 1 < parent.children.len() {
            let left = self.read_node(parent.children[idx])?;
            let right = self.read_node(parent.children[idx + 1])?;
            self.merge_children(parent, idx, left, right)
        } else {
            let left = self.read_node(parent.children[idx - 1])?;
            let right = self.read_node(parent.children[idx])?;
            self.merge_children(parent, idx - 1, left, right)
        }
    }

    /// Folds `right` and the separator at `idx` into `left`; the right node
    /// record is soft-deleted.
    fn merge_children(
        &self,
        parent: &mut Node,
        idx: usize,
        mut left: Node,
        right: Node,
    ) -> Result<Node> {
        left.entries.push(parent.entries.remove(idx));
        left.entries.extend(right.entries);
        left.children.extend(right.children);
        parent.children.remove(idx + 1);
        self.store.mark_deleted(right.oid)?;
        self.write_node(&mut left)?;
        self.write_node(parent)?;
        Ok(left)
    }

    fn max_entry(&self, node: &Node) -> Result<Entry> {
        let mut current = node.clone();
        loop {
            if current.is_leaf {
                return current.entries.last().cloned().ok_or_else(|| {
                    DbError::IndexCorrupted(format!("empty leaf on max-descent in '{}'", self.name))
                        .into()
                });
            }
            let last = *current.children.last().ok_or_else(|| {
                DbError::IndexCorrupted(format!("childless internal node in '{}'", self.name))
            })?;
            current = self.read_node(last)?;
        }
    }

    fn min_entry(&self, node: &Node) -> Result<Entry> {
        let mut current = node.clone();
        loop {
            if current.is_leaf {
                return current.entries.first().cloned().ok_or_else(|| {
                    DbError::IndexCorrupted(format!("empty leaf on min-descent in '{}'", self.name))
                        .into()
                });
            }
            current = self.read_node(current.children[0])?;
        }
    }

    // ---- scans ----

    fn collect(
        &self,
        oid: i32,
        min: Option<&Value>,
        max: Option<&Value>,
        out: &mut Vec<Entry>,
    ) -> Result<()> {
        let node = self.read_node(oid)?;
        let n = node.entries.len();
        for i in 0..n {
            let key = &node.entries[i].0;
            let key_ge_min = match min {
                Some(m) => key.compare(m)? != Ordering::Less,
                None => true,
            };
            if !node.is_leaf && key_ge_min {
                self.collect(node.children[i], min, max, out)?;
            }
            let key_le_max = match max {
                Some(m) => key.compare(m)? != Ordering::Greater,
                None => true,
            };
            if !key_le_max {
                return Ok(());
            }
            if key_ge_min {
                out.push(node.entries[i].clone());
            }
        }
        if !node.is_leaf {
            self.collect(node.children[n], min, max, out)?;
        }
        Ok(())
    }
}

fn cmp(a: &Entry, b: &Entry) -> Result<Ordering> {
    match a.0.compare(&b.0)? {
        Ordering::Equal => Ok(a.1.cmp(&b.1)),
        ord => Ok(ord),
    }
}

/// First position whose entry is greater than `e`.
fn upper_bound(entries: &[Entry], e: &Entry) -> Result<usize> {
    for (i, cur) in entries.iter().enumerate() {
        if cmp(e, cur)? == Ordering::Less {
            return Ok(i);
        }
    }
    Ok(entries.len())
}

/// First position whose entry is not less than `e`, and whether it matches.
fn lower_bound(entries: &[Entry], e: &Entry) -> Result<(usize, bool)> {
    for (i, cur) in entries.iter().enumerate() {
        match cmp(e, cur)? {
            Ordering::Less => return Ok((i, false)),
            Ordering::Equal => return Ok((i, true)),
            Ordering::Greater => {}
        }
    }
    Ok((entries.len(), false))
}
