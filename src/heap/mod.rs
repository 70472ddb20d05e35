//! # Raw-Data Heap
//!
//! Variable-length payloads (text, array, dictionary and document contents)
//! live in one flat file, `ferrobase.raw`, carved up by a bump allocator.
//! Bookkeeping is self-hosted: every span has a `RawDataInfo` record in an
//! ordinary record store (`rawdatainfo.fbd`) holding its position, reserved
//! length, element stride and free flag. The heap's info store is the one
//! record store built without a heap reference, which is what breaks the
//! recursion.
//!
//! ## Allocation Policy
//!
//! `allocate` reserves twice the requested length so in-place growth usually
//! succeeds, and always takes space from the file tail. An update that still
//! fits its reserved span is written in place; one that does not marks the
//! old span free and relocates to a fresh tail allocation. Freed spans are
//! never reclaimed in this storage format; [`RawDataHeap::find_free`] exposes
//! the probe a compacting allocator would start from.
//!
//! The allocation tail is not persisted separately. It is recomputed on open
//! from the newest `RawDataInfo` record, whose span is always the highest
//! because allocation order matches info-record order.

pub mod payload;

use std::sync::Arc;

use eyre::{bail, ensure, Result};
use parking_lot::Mutex;

use crate::codec::Codec;
use crate::record::RecordStore;
use crate::schema::{FieldMeta, SchemaStore, TypeDescription};
use crate::storage::{FileRegistry, StorageFile, RAW_FILE_NAME};
use crate::types::{FieldType, ObjectInfo, Value};

/// Bookkeeping type registered for heap spans.
pub const RAW_INFO_TYPE_NAME: &str = "RawDataInfo";

const FIELD_ELEMENT_LENGTH: &str = "ElementLength";
const FIELD_LENGTH: &str = "Length";
const FIELD_POSITION: &str = "Position";
const FIELD_IS_FREE: &str = "IsFree";

/// A reserved span of the raw file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHandle {
    pub raw_oid: i32,
    pub position: u64,
    /// Reserved bytes, not the logical payload length.
    pub length: usize,
    pub is_free: bool,
}

pub struct RawDataHeap {
    raw: Arc<StorageFile>,
    info: RecordStore,
    tail: Mutex<u64>,
}

impl RawDataHeap {
    /// Opens the heap under a database root: registers the bookkeeping type,
    /// opens `ferrobase.raw` and recomputes the allocation tail.
    pub fn open(
        registry: &Arc<FileRegistry>,
        schemas: &SchemaStore,
        codec: &Codec,
    ) -> Result<Arc<Self>> {
        let desc = TypeDescription::new(RAW_INFO_TYPE_NAME)
            .field(FieldMeta::new(FIELD_ELEMENT_LENGTH, FieldType::Int))
            .field(FieldMeta::new(FIELD_LENGTH, FieldType::Int))
            .field(FieldMeta::new(FIELD_POSITION, FieldType::Long))
            .field(FieldMeta::new(FIELD_IS_FREE, FieldType::Bool));
        let schema = schemas.register(&desc)?;
        let file = registry.get(&SchemaStore::file_name_for(RAW_INFO_TYPE_NAME))?;
        let info = RecordStore::new(schema, file, codec.clone(), None, None);
        let raw = registry.get(RAW_FILE_NAME)?;

        let tail = match info.record_count() {
            0 => 0,
            count => {
                let newest = info.read_object(count as i32)?;
                let position = field_i64(&newest, FIELD_POSITION)? as u64;
                position + field_i32(&newest, FIELD_LENGTH)? as u64
            }
        };
        Ok(Arc::new(Self { raw, info, tail: Mutex::new(tail) }))
    }

    /// Reserves `2 * len` bytes at the file tail and records the span.
    pub fn allocate(&self, len: usize, element_length: i32) -> Result<RawHandle> {
        let reserve = len.max(1) * 2;
        // The tail lock is held across the info write so info-record order
        // matches allocation order.
        let mut tail = self.tail.lock();
        let position = *tail;
        *tail += reserve as u64;
        self.raw.ensure_len(*tail)?;

        let mut info = ObjectInfo::new(RAW_INFO_TYPE_NAME);
        info.set(FIELD_ELEMENT_LENGTH, Value::Int(element_length));
        info.set(FIELD_LENGTH, Value::Int(reserve as i32));
        info.set(FIELD_POSITION, Value::Long(position as i64));
        info.set(FIELD_IS_FREE, Value::Bool(false));
        let raw_oid = self.info.write_object(&info)?;
        Ok(RawHandle { raw_oid, position, length: reserve, is_free: false })
    }

    /// Writes a payload, reusing the previous span when it still fits.
    /// Returns the raw oid the caller should put in its handle.
    pub fn store(&self, old_raw_oid: i32, bytes: &[u8], element_length: i32) -> Result<i32> {
        if old_raw_oid != 0 {
            let old = self.handle(old_raw_oid)?;
            if bytes.len() <= old.length {
                if old.is_free {
                    self.info.write_field(old_raw_oid, FIELD_IS_FREE, &Value::Bool(false))?;
                }
                self.write(&old, bytes)?;
                return Ok(old_raw_oid);
            }
            self.mark_free(old_raw_oid)?;
        }
        let fresh = self.allocate(bytes.len(), element_length)?;
        self.write(&fresh, bytes)?;
        Ok(fresh.raw_oid)
    }

    pub fn write(&self, handle: &RawHandle, bytes: &[u8]) -> Result<()> {
        ensure!(
            bytes.len() <= handle.length,
            "payload of {} bytes overflows reserved span of {}",
            bytes.len(),
            handle.length
        );
        self.raw.write_at(handle.position, bytes)
    }

    /// Reads the full reserved span. Payload parsers consume only what their
    /// own headers describe; trailing bytes are slack.
    pub fn read(&self, raw_oid: i32) -> Result<Vec<u8>> {
        let handle = self.handle(raw_oid)?;
        if handle.is_free {
            bail!("raw data {} is freed, a handle still points at it", raw_oid);
        }
        let mut buf = vec![0u8; handle.length];
        self.raw.read_at(handle.position, &mut buf)?;
        Ok(buf)
    }

    /// Marks a span free. The bytes stay in place.
    pub fn mark_free(&self, raw_oid: i32) -> Result<()> {
        self.info.write_field(raw_oid, FIELD_IS_FREE, &Value::Bool(true))
    }

    /// First freed span with at least `len` reserved bytes. The bump
    /// allocator never reuses spans; this probe exists for offline
    /// compaction tooling.
    pub fn find_free(&self, len: usize) -> Result<Option<RawHandle>> {
        for oid in 1..=self.info.record_count() as i32 {
            let handle = self.handle(oid)?;
            if handle.is_free && handle.length >= len {
                return Ok(Some(handle));
            }
        }
        Ok(None)
    }

    pub fn handle(&self, raw_oid: i32) -> Result<RawHandle> {
        let info = self.info.read_object(raw_oid)?;
        Ok(RawHandle {
            raw_oid,
            position: field_i64(&info, FIELD_POSITION)? as u64,
            length: field_i32(&info, FIELD_LENGTH)? as usize,
            is_free: matches!(info.get(FIELD_IS_FREE), Some(Value::Bool(true))),
        })
    }

    pub fn sync(&self) -> Result<()> {
        self.raw.sync()?;
        self.info.sync()
    }
}

fn field_i32(obj: &ObjectInfo, name: &str) -> Result<i32> {
    match obj.get(name) {
        Some(Value::Int(v)) => Ok(*v),
        other => bail!("raw info field '{}' holds {:?}", name, other),
    }
}

fn field_i64(obj: &ObjectInfo, name: &str) -> Result<i64> {
    match obj.get(name) {
        Some(Value::Long(v)) => Ok(*v),
        other => bail!("raw info field '{}' holds {:?}", name, other),
    }
}
