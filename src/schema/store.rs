//! # Schema Store
//!
//! Loads, registers and persists type schemas. Each type owns one file under
//! the database root (`<sanitized_name>.fbd`) whose header is the schema and
//! whose body is the record array. Schemas are parsed once and cached; the
//! record store mutates the cached copy and persists the count field
//! separately.
//!
//! ## Type Id Allocation
//!
//! Tids are handed out by a monotonically increasing counter floored by the
//! highest tid seen across all loaded schemas. A dropped type's tid is never
//! reassigned.
//!
//! ## Tolerant Directory Scan
//!
//! `load_existing` walks the database directory and tries to parse every
//! `.fbd` file. A file that fails to parse is not a database type file as far
//! as the store is concerned: it is logged and skipped, never fatal.

use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::error::DbError;
use crate::storage::{FileRegistry, TYPE_FILE_EXTENSION};

use super::{header, TypeDescription, TypeSchema};

pub struct SchemaStore {
    registry: Arc<FileRegistry>,
    schemas: RwLock<HashMap<i32, Arc<RwLock<TypeSchema>>>>,
    by_name: RwLock<HashMap<String, i32>>,
    next_tid: Mutex<i32>,
    version: i32,
    /// Cipher block size, when an encryptor is active; string slots are
    /// rounded up to it.
    block: Option<usize>,
}

impl SchemaStore {
    pub fn new(registry: Arc<FileRegistry>, version: i32, block: Option<usize>) -> Self {
        Self {
            registry,
            schemas: RwLock::new(HashMap::new()),
            by_name: RwLock::new(HashMap::new()),
            next_tid: Mutex::new(0),
            version,
            block,
        }
    }

    /// File name (relative to the database root) holding a type's header and
    /// records.
    pub fn file_name_for(type_name: &str) -> String {
        let stem: String = type_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        format!("{}.{}", stem, TYPE_FILE_EXTENSION)
    }

    /// Scans the database directory and loads every parseable type header.
    pub fn load_existing(&self) -> Result<()> {
        let mut max_tid = self.next_tid.lock();
        for entry in std::fs::read_dir(self.registry.root())? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TYPE_FILE_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match self.load_header(name) {
                Ok(schema) => {
                    *max_tid = (*max_tid).max(schema.tid);
                    self.by_name.write().insert(schema.name.clone(), schema.tid);
                    self.schemas
                        .write()
                        .insert(schema.tid, Arc::new(RwLock::new(schema)));
                }
                Err(err) => {
                    warn!(file = name, %err, "not a database type file, skipping");
                }
            }
        }
        Ok(())
    }

    fn load_header(&self, file_name: &str) -> Result<TypeSchema> {
        let file = self.registry.get(file_name)?;
        let mut size_buf = [0u8; 4];
        file.read_at(0, &mut size_buf)?;
        let header_size = i32::from_le_bytes(size_buf);
        ensure!(
            (36..=4 * 1024 * 1024).contains(&header_size),
            "implausible header size {}",
            header_size
        );
        let mut buf = vec![0u8; header_size as usize];
        file.read_at(0, &mut buf)?;
        header::decode(&buf)
    }

    /// Registers a type. If a schema with the same name is already loaded,
    /// the registration is validated against it (a field changing between
    /// scalar and collection kinds is rejected) and the stored layout wins.
    pub fn register(&self, desc: &TypeDescription) -> Result<Arc<RwLock<TypeSchema>>> {
        if let Some(tid) = self.by_name.read().get(&desc.name).copied() {
            let existing = self
                .schemas
                .read()
                .get(&tid)
                .cloned()
                .expect("name map points at a loaded schema");
            self.validate_evolution(&existing.read(), desc)?;
            return Ok(existing);
        }

        let tid = {
            let mut next = self.next_tid.lock();
            *next += 1;
            *next
        };
        let schema = TypeSchema::build(desc, tid, self.version, self.block)?;
        self.persist(&schema)?;
        let arc = Arc::new(RwLock::new(schema));
        self.by_name.write().insert(desc.name.clone(), tid);
        self.schemas.write().insert(tid, Arc::clone(&arc));
        Ok(arc)
    }

    fn validate_evolution(&self, existing: &TypeSchema, desc: &TypeDescription) -> Result<()> {
        for meta in &desc.fields {
            if let Ok(stored) = existing.field(&meta.name) {
                if stored.field_type.is_collection() != meta.field_type.is_collection() {
                    return Err(DbError::UnsupportedOperation(format!(
                        "field '{}' of '{}' cannot change between scalar and collection kinds",
                        meta.name, existing.name
                    ))
                    .into());
                }
                if stored.field_type != meta.field_type {
                    return Err(DbError::TypeMismatch {
                        type_name: existing.name.clone(),
                        field: meta.name.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Writes the full header for a schema.
    pub fn persist(&self, schema: &TypeSchema) -> Result<()> {
        let file = self.registry.get(&Self::file_name_for(&schema.name))?;
        file.write_at(0, &header::encode(schema))
    }

    pub fn get(&self, tid: i32) -> Option<Arc<RwLock<TypeSchema>>> {
        self.schemas.read().get(&tid).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<RwLock<TypeSchema>>> {
        let tid = self.by_name.read().get(name).copied()?;
        self.get(tid)
    }

    pub fn tid_for(&self, name: &str) -> Option<i32> {
        self.by_name.read().get(name).copied()
    }

    pub fn type_names(&self) -> Vec<String> {
        self.by_name.read().keys().cloned().collect()
    }

    /// Drops a type: its file is deleted and its cache entries removed. The
    /// tid counter is untouched, so the tid is never reused.
    pub fn drop_type(&self, name: &str) -> Result<()> {
        let Some(tid) = self.by_name.write().remove(name) else {
            return Err(DbError::MissingField {
                type_name: name.to_string(),
                field: "<type>".to_string(),
            }
            .into());
        };
        self.schemas.write().remove(&tid);
        self.registry.remove(&Self::file_name_for(name))
    }
}
