//! # Database Session
//!
//! [`Database`] is the single entry point: it owns the file registry, the
//! schema store, the raw-data heap, one record store per registered type and
//! the B-tree indexes over them. It is also the [`ComplexResolver`] the
//! record stores call back into, which is how nested objects and complex
//! references cross type boundaries.
//!
//! ## Graph Saves
//!
//! `save` walks nested `Value::Object` fields depth first. An object
//! carrying a `graph_key` is assigned its oid before its children serialize;
//! a child referencing the same key resolves to that in-flight oid instead
//! of recursing forever. Reads break cycles the other way round: a record
//! already being inflated resolves to a `Value::ComplexRef` instead of a
//! nested object.
//!
//! ## Commit Protocol
//!
//! Commits run under a global lock in three phases (snapshot, apply,
//! publish); see [`crate::txn`]. On open, a leftover `ferrobase.txlog` is
//! applied as a rollback before anything else touches the files.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use eyre::{eyre, Result};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::btree::{
    index_info_description, node_type_description, BTreeIndex, KeyCodec, INDEX_INFO_TYPE_NAME,
};
use crate::codec::{Codec, FormatVersion, CURRENT_FORMAT_VERSION};
use crate::document::DocumentSerializer;
use crate::encryption::{block_len, Encryptor};
use crate::error::DbError;
use crate::heap::{RawDataHeap, RAW_INFO_TYPE_NAME};
use crate::record::{ComplexResolver, RecordStore, SlotState};
use crate::schema::{SchemaStore, TypeDescription, TypeSchema, INDEX_NODE_TYPE_PREFIX};
use crate::storage::FileRegistry;
use crate::txn::{Frame, Transaction, TxnLog, TxnOp};
use crate::types::{ObjectInfo, Value};

pub struct DatabaseBuilder {
    path: PathBuf,
    encryptor: Option<Arc<dyn Encryptor>>,
    document: Option<Arc<dyn DocumentSerializer>>,
}

impl DatabaseBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), encryptor: None, document: None }
    }

    pub fn encryptor(mut self, encryptor: Arc<dyn Encryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn document_serializer(mut self, serializer: Arc<dyn DocumentSerializer>) -> Self {
        self.document = Some(serializer);
        self
    }

    pub fn open(self) -> Result<Database> {
        let registry = Arc::new(FileRegistry::new(&self.path)?);
        let block = self.encryptor.as_ref().map(|e| block_len(e.as_ref()));
        let codec = Codec::new(
            FormatVersion::from_header(CURRENT_FORMAT_VERSION),
            self.encryptor,
        );
        let schemas = Arc::new(SchemaStore::new(
            Arc::clone(&registry),
            CURRENT_FORMAT_VERSION,
            block,
        ));
        schemas.load_existing()?;
        let heap = RawDataHeap::open(&registry, &schemas, &codec)?;

        let info_schema = schemas.register(&index_info_description())?;
        let info_file = registry.get(&SchemaStore::file_name_for(INDEX_INFO_TYPE_NAME))?;
        let info_store = Arc::new(RecordStore::new(
            info_schema,
            info_file,
            codec.clone(),
            None,
            None,
        ));

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| Shared {
            self_ref: weak.clone(),
            registry,
            schemas,
            heap,
            codec,
            document: self.document,
            info_store,
            stores: RwLock::new(HashMap::new()),
            indexes: RwLock::new(HashMap::new()),
            commit_lock: Mutex::new(()),
            save_lock: Mutex::new(()),
            in_flight: Mutex::new(HashMap::new()),
            reading: Mutex::new(HashSet::new()),
        });

        if TxnLog::exists(&shared.registry) {
            warn!(path = %self.path.display(), "transaction log present, rolling back interrupted commit");
            shared.recover()?;
        }
        info!(path = %self.path.display(), "database opened");
        Ok(Database { shared })
    }
}

pub struct Database {
    shared: Arc<Shared>,
}

struct Shared {
    self_ref: Weak<Shared>,
    registry: Arc<FileRegistry>,
    schemas: Arc<SchemaStore>,
    heap: Arc<RawDataHeap>,
    codec: Codec,
    document: Option<Arc<dyn DocumentSerializer>>,
    /// `IndexInfo` records, one root pointer per index.
    info_store: Arc<RecordStore>,
    /// User data stores by tid. Internal stores (heap bookkeeping, index
    /// info, index nodes) are deliberately not in this map; commit snapshots
    /// iterate it.
    stores: RwLock<HashMap<i32, Arc<RecordStore>>>,
    /// Per tid: indexed field name and its tree.
    indexes: RwLock<HashMap<i32, Vec<(String, Arc<BTreeIndex>)>>>,
    commit_lock: Mutex<()>,
    save_lock: Mutex<()>,
    /// Graph-key to assigned oid for the save currently in flight.
    in_flight: Mutex<HashMap<(i32, u64), i32>>,
    /// Records currently being inflated; hits resolve to `ComplexRef`.
    reading: Mutex<HashSet<(i32, i32)>>,
}

impl Database {
    pub fn builder(path: impl Into<PathBuf>) -> DatabaseBuilder {
        DatabaseBuilder::new(path)
    }

    /// Opens (creating if absent) a database directory with default options.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::builder(path).open()
    }

    pub fn path(&self) -> &Path {
        self.shared.registry.root()
    }

    /// Registers a type and opens its indexes. Re-registering an existing
    /// type validates the description against the stored layout. An index
    /// added over existing data is populated on the spot.
    pub fn register_type(&self, desc: &TypeDescription) -> Result<()> {
        let shared = &self.shared;
        let schema = shared.schemas.register(desc)?;
        let tid = schema.read().tid;
        let store = shared.store_for_tid(tid)?;

        let mut index_list = Vec::new();
        for meta in &desc.fields {
            if !meta.indexed {
                continue;
            }
            let index = shared.open_field_index(&schema, &store, &meta.name, meta.unique_index)?;
            index_list.push((meta.name.clone(), index));
        }
        shared.indexes.write().insert(tid, index_list);
        Ok(())
    }

    /// Creates (or opens) a B-tree index over one field of a registered
    /// type, building it from the records already on disk.
    pub fn create_index(&self, type_name: &str, field: &str, unique: bool) -> Result<()> {
        let shared = &self.shared;
        let store = shared.store_by_type_name(type_name)?;
        let tid = store.tid();
        if shared.index_on(tid, field).is_some() {
            return Ok(());
        }
        let schema = shared
            .schemas
            .get(tid)
            .ok_or_else(|| DbError::UnsupportedOperation(format!("unknown type id {}", tid)))?;
        let index = shared.open_field_index(&schema, &store, field, unique)?;
        shared
            .indexes
            .write()
            .entry(tid)
            .or_default()
            .push((field.to_string(), index));
        Ok(())
    }

    /// Registered user type names, internal bookkeeping types excluded.
    pub fn type_names(&self) -> Vec<String> {
        self.shared
            .schemas
            .type_names()
            .into_iter()
            .filter(|n| {
                n != RAW_INFO_TYPE_NAME
                    && n != INDEX_INFO_TYPE_NAME
                    && !n.starts_with(INDEX_NODE_TYPE_PREFIX)
            })
            .collect()
    }

    /// Saves an object graph and returns the root object's oid.
    pub fn save(&self, obj: &ObjectInfo) -> Result<i32> {
        let _guard = self.shared.save_lock.lock();
        self.shared.in_flight.lock().clear();
        self.shared.save_graph(obj)
    }

    pub fn fetch(&self, type_name: &str, oid: i32) -> Result<ObjectInfo> {
        let store = self.shared.store_by_type_name(type_name)?;
        self.shared.guarded_read(store.tid(), oid, &store)
    }

    pub fn fetch_field(&self, type_name: &str, oid: i32, field: &str) -> Result<Value> {
        self.shared
            .store_by_type_name(type_name)?
            .read_field(oid, field)
    }

    pub fn set_field(&self, type_name: &str, oid: i32, field: &str, value: &Value) -> Result<()> {
        let _guard = self.shared.save_lock.lock();
        self.shared.set_field_internal(type_name, oid, field, value)
    }

    /// Soft-deletes a record and unlinks its index entries.
    pub fn delete(&self, type_name: &str, oid: i32) -> Result<()> {
        let _guard = self.shared.save_lock.lock();
        self.shared.delete_internal(type_name, oid)
    }

    /// Restores a soft-deleted record and reinserts its index entries.
    pub fn restore_deleted(&self, type_name: &str, oid: i32) -> Result<()> {
        let _guard = self.shared.save_lock.lock();
        let shared = &self.shared;
        let store = shared.store_by_type_name(type_name)?;
        store.restore_deleted(oid)?;
        for (field, index) in shared.indexes_for(store.tid()) {
            index.insert(store.read_field(oid, &field)?, oid)?;
        }
        Ok(())
    }

    pub fn is_deleted(&self, type_name: &str, oid: i32) -> Result<bool> {
        self.shared.store_by_type_name(type_name)?.is_deleted(oid)
    }

    /// Record slots ever allocated for a type, soft-deleted ones included.
    pub fn record_count(&self, type_name: &str) -> Result<u32> {
        Ok(self.shared.store_by_type_name(type_name)?.record_count())
    }

    /// Objects whose `field` equals `key`. Uses the field's index when one
    /// exists, otherwise scans.
    pub fn find(&self, type_name: &str, field: &str, key: &Value) -> Result<Vec<ObjectInfo>> {
        let shared = &self.shared;
        let store = shared.store_by_type_name(type_name)?;
        let tid = store.tid();
        if let Some(index) = shared.index_on(tid, field) {
            let mut out = Vec::new();
            for oid in index.lookup(key)? {
                match shared.guarded_read(tid, oid, &store) {
                    Ok(obj) => out.push(obj),
                    Err(e)
                        if matches!(
                            e.downcast_ref::<DbError>(),
                            Some(DbError::ObjectDeleted { .. })
                        ) => {}
                    Err(e) => return Err(e),
                }
            }
            return Ok(out);
        }
        // Unindexed field: full scan.
        let mut out = Vec::new();
        for oid in 1..=store.record_count() as i32 {
            if store.slot_state(oid)? != SlotState::Live {
                continue;
            }
            let value = store.read_field(oid, field)?;
            if matches!(value.compare(key), Ok(std::cmp::Ordering::Equal)) {
                out.push(shared.guarded_read(tid, oid, &store)?);
            }
        }
        Ok(out)
    }

    /// Objects whose indexed `field` lies in `min..=max`, in key order.
    /// Requires an index on the field.
    pub fn find_range(
        &self,
        type_name: &str,
        field: &str,
        min: Option<&Value>,
        max: Option<&Value>,
    ) -> Result<Vec<ObjectInfo>> {
        let shared = &self.shared;
        let store = shared.store_by_type_name(type_name)?;
        let tid = store.tid();
        let index = shared.index_on(tid, field).ok_or_else(|| {
            DbError::UnsupportedOperation(format!(
                "range query needs an index on '{}.{}'",
                type_name, field
            ))
        })?;
        let mut out = Vec::new();
        for (_, oid) in index.range(min, max)? {
            match shared.guarded_read(tid, oid, &store) {
                Ok(obj) => out.push(obj),
                Err(e)
                    if matches!(
                        e.downcast_ref::<DbError>(),
                        Some(DbError::ObjectDeleted { .. })
                    ) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// All live objects of a type in oid order.
    pub fn fetch_all(&self, type_name: &str) -> Result<Vec<ObjectInfo>> {
        let shared = &self.shared;
        let store = shared.store_by_type_name(type_name)?;
        let tid = store.tid();
        let count = store.record_count() as i32;
        if count == 0 {
            return Ok(Vec::new());
        }
        store.preload_range(1, count)?;
        let mut out = Vec::new();
        for oid in 1..=count {
            if store.slot_state(oid)? == SlotState::Live {
                out.push(shared.guarded_read(tid, oid, &store)?);
            }
        }
        store.clear_preload();
        Ok(out)
    }

    pub fn begin_transaction(&self) -> Transaction {
        Transaction::new()
    }

    /// Applies a transaction's mutations atomically. On failure the
    /// transaction stays open with its log on disk; call [`Self::rollback`]
    /// (or reopen the database) to restore the snapshots.
    pub fn commit(&self, txn: &mut Transaction) -> Result<()> {
        if !txn.is_open() {
            return Err(DbError::TransactionClosed.into());
        }
        let shared = &self.shared;
        let _commit = shared.commit_lock.lock();
        let _save = shared.save_lock.lock();
        let log = TxnLog::create(&shared.registry)?;

        // Phase 1: snapshot counts and before-images, then make them durable.
        // Each involved type's count is logged exactly once, lazily; a save
        // of a nested graph involves every type reachable through it.
        {
            let mut counted: HashSet<i32> = HashSet::new();
            let mut imaged: HashSet<(i32, i32)> = HashSet::new();
            for op in txn.ops() {
                let (type_name, oid) = match op {
                    TxnOp::Save(obj) => {
                        for nested in nested_type_names(obj) {
                            let store = shared.store_by_type_name(&nested)?;
                            if counted.insert(store.tid()) {
                                log.append_count(&store.type_name(), store.record_count())?;
                            }
                        }
                        (obj.type_name.as_str(), obj.oid)
                    }
                    TxnOp::SetField { type_name, oid, .. } => (type_name.as_str(), *oid),
                    TxnOp::Delete { type_name, oid } => (type_name.as_str(), *oid),
                };
                let store = shared.store_by_type_name(type_name)?;
                if counted.insert(store.tid()) {
                    log.append_count(&store.type_name(), store.record_count())?;
                }
                if oid != 0 && imaged.insert((store.tid(), oid)) {
                    log.append_image(&store.type_name(), oid, &store.read_record_raw(oid)?)?;
                }
            }
            log.sync()?;
        }

        // Phase 2: apply with index persistence suspended.
        shared.enter_commit_mode();
        let applied = shared.apply_ops(txn.ops());

        // Phase 3: publish.
        let published = applied.and_then(|()| shared.publish());
        match published {
            Ok(()) => {
                shared.leave_commit_mode();
                log.delete(&shared.registry)?;
                txn.mark_committed();
                Ok(())
            }
            Err(e) => {
                // The log stays on disk; rollback (or recovery) consumes it.
                shared.abort_commit()?;
                Err(e)
            }
        }
    }

    /// Discards a transaction. If a commit failed part way, the logged
    /// snapshots are restored first.
    pub fn rollback(&self, txn: &mut Transaction) -> Result<()> {
        if !txn.is_open() {
            return Err(DbError::TransactionClosed.into());
        }
        let shared = &self.shared;
        let _commit = shared.commit_lock.lock();
        if TxnLog::exists(&shared.registry) {
            let log = TxnLog::open_existing(&shared.registry)?;
            let frames = log.read_all()?;
            shared.apply_rollback(&frames)?;
            log.delete(&shared.registry)?;
        }
        txn.mark_rolled_back();
        Ok(())
    }

    /// Removes a type, its file and its indexes. Oids and tids are never
    /// reused; heap payloads of the dropped records become unreferenced.
    pub fn drop_type(&self, name: &str) -> Result<()> {
        let shared = &self.shared;
        let tid = shared
            .schemas
            .tid_for(name)
            .ok_or_else(|| DbError::UnsupportedOperation(format!("type '{}' is not registered", name)))?;
        if let Some(list) = shared.indexes.write().remove(&tid) {
            for (_, index) in list {
                shared.info_store.mark_deleted(index.info_record_oid())?;
                shared.schemas.drop_type(&index.node_store().type_name())?;
            }
        }
        shared.stores.write().remove(&tid);
        shared.schemas.drop_type(name)
    }

    pub fn sync(&self) -> Result<()> {
        self.shared.registry.sync_all()
    }
}

impl Shared {
    fn resolver(&self) -> Arc<dyn ComplexResolver> {
        Arc::new(GraphResolver { shared: self.self_ref.clone() })
    }

    fn store_by_type_name(&self, name: &str) -> Result<Arc<RecordStore>> {
        let tid = self.schemas.tid_for(name).ok_or_else(|| {
            DbError::UnsupportedOperation(format!("type '{}' is not registered", name))
        })?;
        self.store_for_tid(tid)
    }

    fn store_for_tid(&self, tid: i32) -> Result<Arc<RecordStore>> {
        if let Some(store) = self.stores.read().get(&tid) {
            return Ok(Arc::clone(store));
        }
        let schema = self
            .schemas
            .get(tid)
            .ok_or_else(|| DbError::UnsupportedOperation(format!("unknown type id {}", tid)))?;
        let name = schema.read().name.clone();
        let file = self.registry.get(&SchemaStore::file_name_for(&name))?;
        let store = Arc::new(RecordStore::new(
            schema,
            file,
            self.codec.clone(),
            Some(Arc::clone(&self.heap)),
            self.document.clone(),
        ));
        store.set_resolver(self.resolver());
        self.stores.write().insert(tid, Arc::clone(&store));
        Ok(store)
    }

    /// Opens (creating on first use) the index over one field, populating it
    /// from existing live records when the tree is empty.
    fn open_field_index(
        &self,
        schema: &Arc<RwLock<TypeSchema>>,
        store: &Arc<RecordStore>,
        field: &str,
        unique: bool,
    ) -> Result<Arc<BTreeIndex>> {
        let (key, index_name) = {
            let s = schema.read();
            let fd = s.field(field)?;
            if fd.field_type.is_handle() {
                return Err(DbError::UnsupportedOperation(format!(
                    "cannot index handle-based field '{}' of '{}'",
                    field, s.name
                ))
                .into());
            }
            (
                KeyCodec {
                    field_type: fd.field_type,
                    len: fd.len,
                    real_len: fd.real_len,
                    nullable: fd.nullable,
                },
                format!("{}_{}", s.name, field),
            )
        };

        let node_schema = self.schemas.register(&node_type_description(&index_name, key.len))?;
        let node_name = node_schema.read().name.clone();
        let node_file = self.registry.get(&SchemaStore::file_name_for(&node_name))?;
        let node_store = Arc::new(RecordStore::new(
            node_schema,
            node_file,
            self.codec.clone(),
            None,
            None,
        ));
        let index = Arc::new(BTreeIndex::open(
            index_name,
            unique,
            key,
            self.codec.clone(),
            node_store,
            Arc::clone(&self.info_store),
        )?);

        if index.is_empty()? && store.record_count() > 0 {
            debug!(index = index.name(), "populating index over existing records");
            for oid in 1..=store.record_count() as i32 {
                if store.slot_state(oid)? != SlotState::Live {
                    continue;
                }
                index.insert(store.read_field(oid, field)?, oid)?;
            }
        }
        Ok(index)
    }

    fn indexes_for(&self, tid: i32) -> Vec<(String, Arc<BTreeIndex>)> {
        self.indexes.read().get(&tid).cloned().unwrap_or_default()
    }

    fn index_on(&self, tid: i32, field: &str) -> Option<Arc<BTreeIndex>> {
        self.indexes
            .read()
            .get(&tid)?
            .iter()
            .find(|(f, _)| f == field)
            .map(|(_, idx)| Arc::clone(idx))
    }

    fn guarded_read(&self, tid: i32, oid: i32, store: &RecordStore) -> Result<ObjectInfo> {
        self.reading.lock().insert((tid, oid));
        let result = store.read_object(oid);
        self.reading.lock().remove(&(tid, oid));
        result
    }

    /// Saves one object, recursing into nested objects through the resolver.
    fn save_graph(&self, obj: &ObjectInfo) -> Result<i32> {
        let store = self.store_by_type_name(&obj.type_name)?;
        let tid = store.tid();
        if let Some(key) = obj.graph_key {
            if let Some(&oid) = self.in_flight.lock().get(&(tid, key)) {
                return Ok(oid);
            }
        }

        let is_update = obj.oid != 0;
        let old_keys = if is_update {
            self.current_index_keys(tid, &store, obj.oid)?
        } else {
            Vec::new()
        };
        let indexes = self.indexes_for(tid);

        let oid = if is_update { obj.oid } else { store.reserve_oid()? };
        self.check_unique(&indexes, obj, oid)?;
        if let Some(key) = obj.graph_key {
            self.in_flight.lock().insert((tid, key), oid);
        }
        let mut to_write = obj.clone();
        to_write.oid = oid;
        store.write_object(&to_write)?;

        for (field, index) in indexes {
            let new_key = obj.get(&field).cloned().unwrap_or(Value::Null);
            if is_update {
                if let Some((_, old_key)) = old_keys.iter().find(|(f, _)| *f == field) {
                    if *old_key == new_key {
                        continue;
                    }
                    index.remove(old_key, oid)?;
                }
            }
            index.insert(new_key, oid)?;
        }
        Ok(oid)
    }

    fn set_field_internal(
        &self,
        type_name: &str,
        oid: i32,
        field: &str,
        value: &Value,
    ) -> Result<()> {
        let store = self.store_by_type_name(type_name)?;
        let tid = store.tid();
        let index = self.index_on(tid, field);
        let old_key = match &index {
            Some(_) => Some(store.read_field(oid, field)?),
            None => None,
        };
        if let (Some(index), Some(old_key)) = (&index, &old_key) {
            if index.is_unique() && !value.is_null() && old_key != value {
                let hits = index.lookup(value)?;
                if hits.iter().any(|&hit| hit != oid) {
                    return Err(DbError::UniqueViolation(format!(
                        "index '{}' already holds key {:?}",
                        index.name(),
                        value
                    ))
                    .into());
                }
            }
        }
        store.write_field(oid, field, value)?;
        if let (Some(index), Some(old_key)) = (index, old_key) {
            if old_key != *value {
                index.remove(&old_key, oid)?;
                index.insert(value.clone(), oid)?;
            }
        }
        Ok(())
    }

    fn delete_internal(&self, type_name: &str, oid: i32) -> Result<()> {
        let store = self.store_by_type_name(type_name)?;
        let tid = store.tid();
        let keys = self.current_index_keys(tid, &store, oid)?;
        store.mark_deleted(oid)?;
        for (field, index) in self.indexes_for(tid) {
            if let Some((_, key)) = keys.iter().find(|(f, _)| *f == field) {
                index.remove(key, oid)?;
            }
        }
        Ok(())
    }

    fn current_index_keys(
        &self,
        tid: i32,
        store: &RecordStore,
        oid: i32,
    ) -> Result<Vec<(String, Value)>> {
        let mut keys = Vec::new();
        for (field, _) in self.indexes_for(tid) {
            let value = store.read_field(oid, &field)?;
            keys.push((field, value));
        }
        Ok(keys)
    }

    /// Fails fast before any bytes land when a unique index would reject the
    /// save.
    fn check_unique(
        &self,
        indexes: &[(String, Arc<BTreeIndex>)],
        obj: &ObjectInfo,
        oid: i32,
    ) -> Result<()> {
        for (field, index) in indexes {
            if !index.is_unique() {
                continue;
            }
            let Some(key) = obj.get(field) else { continue };
            if key.is_null() {
                continue;
            }
            let hits = index.lookup(key)?;
            if hits.iter().any(|&hit| hit != oid) {
                return Err(DbError::UniqueViolation(format!(
                    "index '{}' already holds key {:?}",
                    index.name(),
                    key
                ))
                .into());
            }
        }
        Ok(())
    }

    // ---- commit machinery ----

    fn all_indexes(&self) -> Vec<Arc<BTreeIndex>> {
        self.indexes
            .read()
            .values()
            .flat_map(|list| list.iter().map(|(_, idx)| Arc::clone(idx)))
            .collect()
    }

    fn enter_commit_mode(&self) {
        for store in self.stores.read().values() {
            store.set_copy_on_write(true);
        }
        for index in self.all_indexes() {
            index.node_store().begin_deferred();
        }
        self.info_store.begin_deferred();
    }

    fn leave_commit_mode(&self) {
        for store in self.stores.read().values() {
            store.set_copy_on_write(false);
        }
    }

    fn apply_ops(&self, ops: &[TxnOp]) -> Result<()> {
        self.in_flight.lock().clear();
        for op in ops {
            match op {
                TxnOp::Save(obj) => {
                    self.save_graph(obj)?;
                }
                TxnOp::SetField { type_name, oid, field, value } => {
                    self.set_field_internal(type_name, *oid, field, value)?;
                }
                TxnOp::Delete { type_name, oid } => {
                    self.delete_internal(type_name, *oid)?;
                }
            }
        }
        Ok(())
    }

    fn publish(&self) -> Result<()> {
        for index in self.all_indexes() {
            index.node_store().flush_deferred()?;
        }
        self.info_store.flush_deferred()?;
        self.registry.sync_all()
    }

    /// Unwinds a failed commit's in-memory state. The data files are left to
    /// the rollback that consumes the log.
    fn abort_commit(&self) -> Result<()> {
        self.leave_commit_mode();
        for index in self.all_indexes() {
            index.node_store().discard_deferred()?;
        }
        self.info_store.discard_deferred()?;
        for index in self.all_indexes() {
            index.reload_root()?;
        }
        Ok(())
    }

    fn recover(&self) -> Result<()> {
        let log = TxnLog::open_existing(&self.registry)?;
        let frames = log.read_all()?;
        self.apply_rollback(&frames)?;
        log.delete(&self.registry)
    }

    fn apply_rollback(&self, frames: &[Frame]) -> Result<()> {
        for frame in frames {
            match frame {
                // Image restorations are independent of each other; one
                // failing record must not leave the rest unrestored.
                Frame::Image { type_name, oid, bytes } => {
                    let restored = self
                        .store_by_type_name(type_name)
                        .and_then(|store| store.write_record_raw(*oid, bytes));
                    if let Err(err) = restored {
                        warn!(type_name = %type_name, oid = *oid, %err, "failed to restore before-image");
                    }
                }
                Frame::Count { type_name, count } => {
                    self.store_by_type_name(type_name)?.set_record_count(*count)?;
                }
            }
        }
        self.registry.sync_all()
    }
}

/// Type names of objects nested inside a save graph, in field order. The
/// root's own type is not included.
fn nested_type_names(obj: &ObjectInfo) -> Vec<String> {
    fn walk(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::Object(inner) => {
                out.push(inner.type_name.clone());
                for (_, v) in inner.fields() {
                    walk(v, out);
                }
            }
            Value::Array(items) => {
                for v in items {
                    walk(v, out);
                }
            }
            Value::Dict(pairs) => {
                for (k, v) in pairs {
                    walk(k, out);
                    walk(v, out);
                }
            }
            _ => {}
        }
    }
    let mut out = Vec::new();
    for (_, v) in obj.fields() {
        walk(v, &mut out);
    }
    out
}

struct GraphResolver {
    shared: Weak<Shared>,
}

impl GraphResolver {
    fn shared(&self) -> Result<Arc<Shared>> {
        self.shared
            .upgrade()
            .ok_or_else(|| eyre!("database session is closed"))
    }
}

impl ComplexResolver for GraphResolver {
    fn need_read(&self, oid: i32, tid: i32) -> Result<Value> {
        let shared = self.shared()?;
        if shared.reading.lock().contains(&(tid, oid)) {
            // Cycle: hand back the reference instead of recursing.
            return Ok(Value::ComplexRef { oid, tid });
        }
        let store = shared.store_for_tid(tid)?;
        let obj = shared.guarded_read(tid, oid, &store)?;
        Ok(Value::Object(Box::new(obj)))
    }

    fn need_save(&self, obj: &ObjectInfo) -> Result<(i32, i32)> {
        let shared = self.shared()?;
        let store = shared.store_by_type_name(&obj.type_name)?;
        let oid = shared.save_graph(obj)?;
        Ok((oid, store.tid()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldMeta;
    use crate::types::FieldType;

    fn person_desc() -> TypeDescription {
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
    fn save_assigns_first_oid_and_fetches_back() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.register_type(&person_desc()).unwrap();
        let oid = db.save(&person(42, "hello")).unwrap();
        assert_eq!(oid, 1);
        let back = db.fetch("Person", 1).unwrap();
        assert_eq!(back.get("X"), Some(&Value::Int(42)));
        assert_eq!(back.get("Name"), Some(&Value::Str("hello".into())));
    }

    #[test]
    fn unregistered_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let err = db.save(&person(1, "x")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn nested_object_saves_through_resolver() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.register_type(&person_desc()).unwrap();
        db.register_type(
            &TypeDescription::new("Team")
                .field(FieldMeta::new("Lead", FieldType::Complex))
                .field(FieldMeta::new("Size", FieldType::Int)),
        )
        .unwrap();

        let mut team = ObjectInfo::new("Team");
        team.set("Lead", Value::Object(Box::new(person(7, "lead"))));
        team.set("Size", Value::Int(3));
        let team_oid = db.save(&team).unwrap();

        let loaded = db.fetch("Team", team_oid).unwrap();
        let Some(Value::Object(lead)) = loaded.get("Lead") else {
            panic!("lead did not inflate");
        };
        assert_eq!(lead.get("X"), Some(&Value::Int(7)));
        assert_eq!(db.record_count("Person").unwrap(), 1);
    }

    #[test]
    fn drop_type_removes_file_and_keeps_tid_retired() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.register_type(&person_desc()).unwrap();
        db.save(&person(1, "a")).unwrap();
        db.drop_type("Person").unwrap();
        assert!(db.fetch("Person", 1).is_err());
        assert!(!db.type_names().contains(&"Person".to_string()));
    }
}
