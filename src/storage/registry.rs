//! One open handle per file, owned by the database session. Every component
//! that touches a given path goes through the same [`StorageFile`], so a
//! mutation through one handle is visible to all callers. This replaces a
//! process-global path cache with an explicit registry whose lifetime is the
//! session's.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::Mutex;

use super::StorageFile;

pub struct FileRegistry {
    root: PathBuf,
    files: Mutex<HashMap<PathBuf, Arc<StorageFile>>>,
}

impl FileRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, files: Mutex::new(HashMap::new()) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the shared handle for `name` (relative to the database root),
    /// opening it on first use.
    pub fn get(&self, name: &str) -> Result<Arc<StorageFile>> {
        let path = self.root.join(name);
        let mut files = self.files.lock();
        if let Some(file) = files.get(&path) {
            return Ok(Arc::clone(file));
        }
        let file = Arc::new(StorageFile::open(&path)?);
        files.insert(path, Arc::clone(&file));
        Ok(file)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.root.join(name).exists()
    }

    /// Drops the cached handle and deletes the file from disk.
    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.root.join(name);
        self.files.lock().remove(&path);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    pub fn sync_all(&self) -> Result<()> {
        for file in self.files.lock().values() {
            file.sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_name_yields_same_handle() {
        let dir = tempfile::tempdir().unwrap();
        let reg = FileRegistry::new(dir.path()).unwrap();
        let a = reg.get("t.fbd").unwrap();
        let b = reg.get("t.fbd").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn remove_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let reg = FileRegistry::new(dir.path()).unwrap();
        let f = reg.get("gone.fbd").unwrap();
        f.write_at(0, b"x").unwrap();
        assert!(reg.exists("gone.fbd"));
        reg.remove("gone.fbd").unwrap();
        assert!(!reg.exists("gone.fbd"));
    }
}
