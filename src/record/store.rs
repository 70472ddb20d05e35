//! Fixed-record persistence for one type.
//!
//! Writes keep the crash ordering the format relies on: a new record's oid is
//! allocated by bumping the in-memory count first, the record bytes are
//! written next, and the header's count field is persisted last. A crash
//! between the last two steps leaves unreferenced bytes past the persisted
//! count, which the next session never reads.
//!
//! The store also carries two modes used by the transaction layer:
//!
//! - **deferred writes** buffer record and count writes in memory until
//!   `flush_deferred`, so B-tree node updates inside a commit hit the file
//!   only after every before-image is logged;
//! - **preload** caches a contiguous record range for scans.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::codec::Codec;
use crate::document::DocumentSerializer;
use crate::encryption::{align_to_block, block_len};
use crate::error::DbError;
use crate::heap::{payload, RawDataHeap};
use crate::schema::{FieldDescriptor, TypeSchema};
use crate::storage::StorageFile;
use crate::types::{FieldType, ObjectInfo, Value};

use super::ComplexResolver;

struct PreloadCache {
    start_pos: u64,
    bytes: Vec<u8>,
}

impl PreloadCache {
    fn slice(&self, pos: u64, len: usize) -> Option<&[u8]> {
        let start = pos.checked_sub(self.start_pos)? as usize;
        self.bytes.get(start..start + len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Live,
    Deleted,
    Vacant,
}

#[derive(Default)]
struct DeferredWrites {
    /// Record position to full record bytes.
    records: HashMap<u64, Vec<u8>>,
    count_dirty: bool,
}

pub struct RecordStore {
    schema: Arc<RwLock<TypeSchema>>,
    file: Arc<StorageFile>,
    codec: Codec,
    /// None only for the heap's own bookkeeping store.
    heap: Option<Arc<RawDataHeap>>,
    document: Option<Arc<dyn DocumentSerializer>>,
    resolver: RwLock<Option<Arc<dyn ComplexResolver>>>,
    preload: Mutex<Option<PreloadCache>>,
    deferred: Mutex<Option<DeferredWrites>>,
    /// While set, heap payload updates always relocate and never free the
    /// previous span, so a logged before-image still points at intact bytes.
    copy_on_write: AtomicBool,
}

impl RecordStore {
    pub fn new(
        schema: Arc<RwLock<TypeSchema>>,
        file: Arc<StorageFile>,
        codec: Codec,
        heap: Option<Arc<RawDataHeap>>,
        document: Option<Arc<dyn DocumentSerializer>>,
    ) -> Self {
        Self {
            schema,
            file,
            codec,
            heap,
            document,
            resolver: RwLock::new(None),
            preload: Mutex::new(None),
            deferred: Mutex::new(None),
            copy_on_write: AtomicBool::new(false),
        }
    }

    pub fn set_copy_on_write(&self, on: bool) {
        self.copy_on_write.store(on, Ordering::SeqCst);
    }

    pub fn set_resolver(&self, resolver: Arc<dyn ComplexResolver>) {
        *self.resolver.write() = Some(resolver);
    }

    pub fn schema(&self) -> &Arc<RwLock<TypeSchema>> {
        &self.schema
    }

    pub fn type_name(&self) -> String {
        self.schema.read().name.clone()
    }

    pub fn tid(&self) -> i32 {
        self.schema.read().tid
    }

    pub fn record_count(&self) -> u32 {
        self.schema.read().record_count
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    /// Inserts a new object (oid 0) or rewrites an existing one. Returns the
    /// record's oid.
    pub fn write_object(&self, obj: &ObjectInfo) -> Result<i32> {
        // A negative oid is the stored form of a soft-deleted record.
        if obj.oid < 0 {
            return Err(DbError::ObjectDeleted { oid: -obj.oid }.into());
        }
        let (oid, old) = if obj.oid == 0 {
            (self.allocate_oid(), None)
        } else {
            let old = self.read_record_bytes(obj.oid)?;
            if stored_oid(&old)? == 0 {
                // A reserved slot not yet written.
                (obj.oid, None)
            } else {
                self.check_live(obj.oid, &old)?;
                (obj.oid, Some(old))
            }
        };
        let record = self.serialize(oid, obj, old.as_deref())?;
        self.write_record(oid, &record)?;
        self.persist_record_count()?;
        trace!(type_name = %self.type_name(), oid, "wrote object");
        Ok(oid)
    }

    pub fn read_object(&self, oid: i32) -> Result<ObjectInfo> {
        let record = self.read_record_bytes(oid)?;
        self.check_live(oid, &record)?;
        let schema = self.schema.read().clone();
        let mut obj = ObjectInfo::with_oid(&schema.name, oid);
        for field in &schema.fields {
            let value = self
                .decode_field(field, &record)
                .map_err(|e| self.index_guard(field, e))?;
            obj.set(&field.name, value);
        }
        Ok(obj)
    }

    pub fn read_field(&self, oid: i32, name: &str) -> Result<Value> {
        let record = self.read_record_bytes(oid)?;
        self.check_live(oid, &record)?;
        let schema = self.schema.read().clone();
        let field = schema.field(name)?;
        self.decode_field(field, &record)
            .map_err(|e| self.index_guard(field, e))
    }

    /// Rewrites a single field in place. Heap handles of the previous value
    /// are reused or freed; the record count is untouched.
    pub fn write_field(&self, oid: i32, name: &str, value: &Value) -> Result<()> {
        let record = self.read_record_bytes(oid)?;
        self.check_live(oid, &record)?;
        let schema = self.schema.read().clone();
        let field = schema.field(name)?;
        let slot = self.encode_field(field, value, Some(&record))?;
        self.write_slot(oid, field.offset, &slot)
    }

    /// Soft-deletes a record by negating its stored oid. Heap payloads and
    /// the record bytes stay in place; only the sign flips.
    pub fn mark_deleted(&self, oid: i32) -> Result<()> {
        let record = self.read_record_bytes(oid)?;
        self.check_live(oid, &record)?;
        self.write_slot(oid, 0, &(-oid).to_le_bytes())
    }

    /// Restores a soft-deleted record. Rejected if the record is live.
    pub fn restore_deleted(&self, oid: i32) -> Result<()> {
        let record = self.read_record_bytes(oid)?;
        let stored = stored_oid(&record)?;
        ensure!(stored == -oid, "record {} is not deleted (stored oid {})", oid, stored);
        self.write_slot(oid, 0, &oid.to_le_bytes())
    }

    pub fn is_deleted(&self, oid: i32) -> Result<bool> {
        let record = self.read_record_bytes(oid)?;
        Ok(stored_oid(&record)? == -oid)
    }

    /// Cheap probe used by scans: reads only the stored-oid word.
    pub fn slot_state(&self, oid: i32) -> Result<SlotState> {
        let record = self.read_record_bytes(oid)?;
        let stored = stored_oid(&record)?;
        if stored == oid {
            Ok(SlotState::Live)
        } else if stored == -oid {
            Ok(SlotState::Deleted)
        } else if stored == 0 {
            // Reserved by an interrupted save and never written.
            Ok(SlotState::Vacant)
        } else {
            eyre::bail!("record {} of '{}' stores oid {}", oid, self.type_name(), stored)
        }
    }

    // ---- raw access for the transaction layer ----

    /// Reads the full record bytes without the soft-delete check. Used to
    /// capture before-images.
    pub fn read_record_raw(&self, oid: i32) -> Result<Vec<u8>> {
        self.read_record_bytes(oid)
    }

    /// Writes full record bytes straight to the file, bypassing the deferred
    /// buffer. Used to restore before-images during rollback.
    pub fn write_record_raw(&self, oid: i32, bytes: &[u8]) -> Result<()> {
        ensure!(oid >= 1, "oid {} has no record position", oid);
        let (pos, len) = {
            let s = self.schema.read();
            (s.record_position(oid), s.record_length)
        };
        ensure!(bytes.len() == len, "record image of {} bytes, expected {}", bytes.len(), len);
        *self.preload.lock() = None;
        self.file.write_at(pos, bytes)
    }

    /// Forces the in-memory and persisted record count. Used by rollback.
    pub fn set_record_count(&self, count: u32) -> Result<()> {
        self.schema.write().record_count = count;
        let offset = {
            let s = self.schema.read();
            s.record_count_offset()
        };
        self.file.write_at(offset, &(count as i32).to_le_bytes())
    }

    // ---- deferred-write mode ----

    pub fn begin_deferred(&self) {
        *self.deferred.lock() = Some(DeferredWrites::default());
    }

    pub fn deferred_active(&self) -> bool {
        self.deferred.lock().is_some()
    }

    /// Applies every buffered write to the file and leaves deferred mode.
    pub fn flush_deferred(&self) -> Result<()> {
        let Some(buffered) = self.deferred.lock().take() else {
            return Ok(());
        };
        let mut writes: Vec<(u64, Vec<u8>)> = buffered.records.into_iter().collect();
        writes.sort_by_key(|(pos, _)| *pos);
        for (pos, bytes) in writes {
            self.file.write_at(pos, &bytes)?;
        }
        if buffered.count_dirty {
            let (offset, count) = {
                let s = self.schema.read();
                (s.record_count_offset(), s.record_count)
            };
            self.file.write_at(offset, &(count as i32).to_le_bytes())?;
        }
        Ok(())
    }

    /// Drops every buffered write and re-reads the record count from the
    /// header, leaving the store exactly as the file has it.
    pub fn discard_deferred(&self) -> Result<()> {
        if self.deferred.lock().take().is_none() {
            return Ok(());
        }
        let offset = self.schema.read().record_count_offset();
        let mut buf = [0u8; 4];
        self.file.read_at(offset, &mut buf)?;
        self.schema.write().record_count = i32::from_le_bytes(buf) as u32;
        Ok(())
    }

    // ---- preload ----

    /// Reads the records `start_oid..=end_oid` into a cache consulted by
    /// subsequent reads. Any write drops the cache.
    pub fn preload_range(&self, start_oid: i32, end_oid: i32) -> Result<()> {
        ensure!(start_oid >= 1 && end_oid >= start_oid, "bad preload range");
        let (pos, record_length) = {
            let s = self.schema.read();
            (s.record_position(start_oid), s.record_length)
        };
        let mut bytes = vec![0u8; (end_oid - start_oid + 1) as usize * record_length];
        self.file.read_at(pos, &mut bytes)?;
        *self.preload.lock() = Some(PreloadCache { start_pos: pos, bytes });
        Ok(())
    }

    pub fn clear_preload(&self) {
        *self.preload.lock() = None;
    }

    // ---- internals ----

    /// Reserves the next oid without writing anything. The caller must
    /// follow up with a `write_object` carrying this oid; until then the
    /// slot reads as zeroes. Used to give graph-cycle saves a stable oid
    /// before their children serialize.
    pub fn reserve_oid(&self) -> Result<i32> {
        let oid = self.allocate_oid();
        // Extend the file so the reserved slot reads as zeroes.
        let (pos, len) = {
            let s = self.schema.read();
            (s.record_position(oid), s.record_length)
        };
        self.file.ensure_len(pos + len as u64)?;
        Ok(oid)
    }

    /// Bumps the in-memory record count and returns the new oid. The header
    /// copy of the count is persisted only after the record bytes land.
    fn allocate_oid(&self) -> i32 {
        let mut schema = self.schema.write();
        schema.record_count += 1;
        schema.record_count as i32
    }

    fn persist_record_count(&self) -> Result<()> {
        if let Some(buffered) = self.deferred.lock().as_mut() {
            buffered.count_dirty = true;
            return Ok(());
        }
        let (offset, count) = {
            let s = self.schema.read();
            (s.record_count_offset(), s.record_count)
        };
        self.file.write_at(offset, &(count as i32).to_le_bytes())
    }

    fn read_record_bytes(&self, oid: i32) -> Result<Vec<u8>> {
        // The range check must come first: the position formula is only
        // defined for oids >= 1.
        let (len, count) = {
            let s = self.schema.read();
            (s.record_length, s.record_count)
        };
        ensure!(
            oid >= 1 && oid as u32 <= count,
            "oid {} outside record range 1..={}",
            oid,
            count
        );
        let pos = self.schema.read().record_position(oid);
        if let Some(buffered) = self.deferred.lock().as_ref() {
            if let Some(bytes) = buffered.records.get(&pos) {
                return Ok(bytes.clone());
            }
        }
        if let Some(cache) = self.preload.lock().as_ref() {
            if let Some(slice) = cache.slice(pos, len) {
                return Ok(slice.to_vec());
            }
        }
        let mut buf = vec![0u8; len];
        self.file.read_at(pos, &mut buf)?;
        Ok(buf)
    }

    fn write_record(&self, oid: i32, bytes: &[u8]) -> Result<()> {
        let pos = self.schema.read().record_position(oid);
        *self.preload.lock() = None;
        if let Some(buffered) = self.deferred.lock().as_mut() {
            buffered.records.insert(pos, bytes.to_vec());
            return Ok(());
        }
        self.file.write_at(pos, bytes)
    }

    /// Patches `bytes` into a record at `offset`, going through the deferred
    /// buffer when active.
    fn write_slot(&self, oid: i32, offset: usize, bytes: &[u8]) -> Result<()> {
        *self.preload.lock() = None;
        let pos = self.schema.read().record_position(oid);
        let mut deferred = self.deferred.lock();
        if deferred.is_some() {
            // Read-modify-write against the buffered copy.
            let mut record = match deferred.as_ref().unwrap().records.get(&pos) {
                Some(r) => r.clone(),
                None => {
                    let len = self.schema.read().record_length;
                    let mut buf = vec![0u8; len];
                    self.file.read_at(pos, &mut buf)?;
                    buf
                }
            };
            record[offset..offset + bytes.len()].copy_from_slice(bytes);
            deferred.as_mut().unwrap().records.insert(pos, record);
            return Ok(());
        }
        drop(deferred);
        self.file.write_at(pos + offset as u64, bytes)
    }

    fn check_live(&self, oid: i32, record: &[u8]) -> Result<()> {
        let stored = stored_oid(record)?;
        if stored == -oid {
            return Err(DbError::ObjectDeleted { oid }.into());
        }
        if stored != oid {
            let msg = format!(
                "record {} of '{}' stores oid {}",
                oid,
                self.type_name(),
                stored
            );
            if self.schema.read().is_index_node {
                return Err(DbError::IndexCorrupted(msg).into());
            }
            eyre::bail!(msg);
        }
        Ok(())
    }

    /// Decode failures inside an index-node store surface as index
    /// corruption, never as a generic decode error.
    fn index_guard(&self, field: &FieldDescriptor, err: eyre::Report) -> eyre::Report {
        if !self.schema.read().is_index_node {
            return err;
        }
        if matches!(err.downcast_ref::<DbError>(), Some(DbError::IndexCorrupted(_))) {
            return err;
        }
        DbError::IndexCorrupted(format!(
            "field '{}' of '{}': {}",
            field.name,
            self.type_name(),
            err
        ))
        .into()
    }

    fn serialize(&self, oid: i32, obj: &ObjectInfo, old: Option<&[u8]>) -> Result<Vec<u8>> {
        let schema = self.schema.read().clone();
        let mut record = vec![0u8; schema.record_length];
        record[..4].copy_from_slice(&oid.to_le_bytes());
        for field in &schema.fields {
            let value = obj.get(&field.name).ok_or_else(|| DbError::MissingField {
                type_name: schema.name.clone(),
                field: field.name.clone(),
            })?;
            let slot = self.encode_field(field, value, old)?;
            record[field.offset..field.offset + field.len].copy_from_slice(&slot);
        }
        Ok(record)
    }

    fn encode_field(
        &self,
        field: &FieldDescriptor,
        value: &Value,
        old: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        if field.field_type.is_heap_backed() {
            return self.encode_heap_field(field, value, old);
        }
        if field.field_type == FieldType::Complex {
            let (oid, tid) = match value {
                Value::Null => (0, 0),
                Value::ComplexRef { oid, tid } => (*oid, *tid),
                Value::Object(obj) => self.require_resolver()?.need_save(obj)?,
                other => return Err(self.mismatch(field, other)),
            };
            return Ok(encode_handle(oid, tid));
        }
        self.check_kind(field, value)?;
        self.codec
            .encode(value, field.field_type, field.len, field.real_len, field.nullable)
    }

    fn encode_heap_field(
        &self,
        field: &FieldDescriptor,
        value: &Value,
        old: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let heap = self.heap.as_ref().ok_or_else(|| {
            DbError::UnsupportedOperation(format!(
                "type '{}' has no raw-data heap for field '{}'",
                self.type_name(),
                field.name
            ))
        })?;
        let copy_on_write = self.copy_on_write.load(Ordering::SeqCst);
        let old_raw = if copy_on_write {
            0
        } else {
            old.map(|record| decode_handle(&record[field.offset..field.offset + 8]).0)
                .unwrap_or(0)
        };

        if value.is_null() {
            if old_raw != 0 {
                heap.mark_free(old_raw)?;
            }
            return Ok(encode_handle(0, 0));
        }

        let (bytes, second) = match (field.field_type, value) {
            (FieldType::Text, Value::Str(s)) => {
                let logical = s.len();
                let mut buf = s.as_bytes().to_vec();
                if let Some(enc) = self.codec.encryptor() {
                    buf.resize(align_to_block(logical, block_len(enc.as_ref())), 0);
                    enc.encrypt(&mut buf)?;
                }
                (buf, logical as i32)
            }
            (FieldType::Array, Value::Array(values)) => {
                let resolved = self.resolve_elements(values)?;
                (payload::encode_array(&resolved, &self.codec)?, values.len() as i32)
            }
            (FieldType::Dictionary, Value::Dict(entries)) => {
                (payload::encode_dict(entries, &self.codec)?, entries.len() as i32)
            }
            (FieldType::Document, Value::Document(doc)) => {
                let serializer = self
                    .document
                    .as_ref()
                    .ok_or(DbError::DocumentSerializerNotSet)?;
                let bytes = serializer.serialize(doc)?;
                let len = bytes.len() as i32;
                (bytes, len)
            }
            (_, other) => return Err(self.mismatch(field, other)),
        };
        let element_length = match field.field_type {
            FieldType::Array => payload_element_length(value),
            _ => 1,
        };
        let raw_oid = heap.store(old_raw, &bytes, element_length)?;
        Ok(encode_handle(raw_oid, second))
    }

    /// Replaces in-memory `Value::Object` elements with saved handles before
    /// the payload serializes.
    fn resolve_elements(&self, values: &[Value]) -> Result<Vec<Value>> {
        if !values.iter().any(|v| matches!(v, Value::Object(_))) {
            return Ok(values.to_vec());
        }
        let resolver = self.require_resolver()?;
        values
            .iter()
            .map(|v| match v {
                Value::Object(obj) => {
                    let (oid, tid) = resolver.need_save(obj)?;
                    Ok(Value::ComplexRef { oid, tid })
                }
                other => Ok(other.clone()),
            })
            .collect()
    }

    fn decode_field(&self, field: &FieldDescriptor, record: &[u8]) -> Result<Value> {
        let slot = &record[field.offset..field.offset + field.len];
        if field.field_type == FieldType::Complex {
            let (oid, tid) = decode_handle(slot);
            if oid == 0 {
                return Ok(Value::Null);
            }
            return match self.resolver.read().as_ref() {
                Some(resolver) => resolver.need_read(oid, tid),
                None => Ok(Value::ComplexRef { oid, tid }),
            };
        }
        if field.field_type.is_heap_backed() {
            return self.decode_heap_field(field, slot);
        }
        self.codec.decode(field.field_type, slot, field.nullable, true)
    }

    fn decode_heap_field(&self, field: &FieldDescriptor, slot: &[u8]) -> Result<Value> {
        let (raw_oid, second) = decode_handle(slot);
        if raw_oid == 0 {
            return Ok(Value::Null);
        }
        let heap = self.heap.as_ref().ok_or_else(|| {
            DbError::UnsupportedOperation(format!(
                "type '{}' has no raw-data heap for field '{}'",
                self.type_name(),
                field.name
            ))
        })?;
        let data = heap.read(raw_oid)?;
        match field.field_type {
            FieldType::Text => {
                let logical = second as usize;
                let content = match self.codec.encryptor() {
                    Some(enc) => {
                        let padded = align_to_block(logical, block_len(enc.as_ref()));
                        ensure!(data.len() >= padded, "text payload shorter than its handle");
                        let mut buf = data[..padded].to_vec();
                        enc.decrypt(&mut buf)?;
                        buf.truncate(logical);
                        buf
                    }
                    None => {
                        ensure!(data.len() >= logical, "text payload shorter than its handle");
                        data[..logical].to_vec()
                    }
                };
                Ok(Value::Str(String::from_utf8(content)?))
            }
            FieldType::Array => Ok(Value::Array(payload::decode_array(&data, &self.codec)?)),
            FieldType::Dictionary => Ok(Value::Dict(payload::decode_dict(&data, &self.codec)?)),
            FieldType::Document => {
                let serializer = self
                    .document
                    .as_ref()
                    .ok_or(DbError::DocumentSerializerNotSet)?;
                let len = second as usize;
                ensure!(data.len() >= len, "document payload shorter than its handle");
                Ok(Value::Document(serializer.deserialize(&data[..len])?))
            }
            other => Err(DbError::NotSupported(format!(
                "{:?} is not a heap-backed kind",
                other
            ))
            .into()),
        }
    }

    fn require_resolver(&self) -> Result<Arc<dyn ComplexResolver>> {
        self.resolver.read().clone().ok_or_else(|| {
            DbError::UnsupportedOperation(format!(
                "type '{}' stores complex references but no resolver is configured",
                self.type_name()
            ))
            .into()
        })
    }

    fn check_kind(&self, field: &FieldDescriptor, value: &Value) -> Result<()> {
        if value.is_null() || field.field_type == FieldType::Enum {
            return Ok(());
        }
        let Some(vt) = value.field_type() else { return Ok(()) };
        if vt != field.field_type {
            return Err(self.mismatch(field, value));
        }
        Ok(())
    }

    fn mismatch(&self, field: &FieldDescriptor, value: &Value) -> eyre::Report {
        let _ = value;
        DbError::TypeMismatch {
            type_name: self.type_name(),
            field: field.name.clone(),
        }
        .into()
    }
}

fn stored_oid(record: &[u8]) -> Result<i32> {
    ensure!(record.len() >= 4, "record truncated");
    Ok(i32::from_le_bytes(record[..4].try_into()?))
}

fn encode_handle(first: i32, second: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&first.to_le_bytes());
    out.extend_from_slice(&second.to_le_bytes());
    out
}

fn decode_handle(slot: &[u8]) -> (i32, i32) {
    let first = i32::from_le_bytes(slot[..4].try_into().unwrap_or_default());
    let second = i32::from_le_bytes(slot[4..8].try_into().unwrap_or_default());
    (first, second)
}

/// Element stride recorded in the heap bookkeeping for flat array payloads;
/// jagged and reference payloads record 1.
fn payload_element_length(value: &Value) -> i32 {
    let Value::Array(values) = value else { return 1 };
    values
        .iter()
        .find(|v| !v.is_null())
        .and_then(|v| v.field_type())
        .and_then(|ft| ft.fixed_len())
        .map_or(1, |len| len as i32)
}
