//! Positioned file I/O. Records, heap payloads and headers all address their
//! file by absolute offset, so the storage primitive is a seek-and-read /
//! seek-and-write wrapper over a shared handle. The handle is shared
//! process-wide through the [`super::FileRegistry`]; the mutex here is the
//! per-call serialization point for that shared handle.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use parking_lot::Mutex;

pub struct StorageFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl StorageFile {
    /// Opens (creating if absent) a file for read/write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .wrap_err_with(|| format!("failed to open {}", path.display()))?;
        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64> {
        let file = self.file.lock();
        Ok(file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Reads exactly `buf.len()` bytes starting at `pos`.
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(buf)
            .wrap_err_with(|| format!("short read of {} bytes at {} in {}", buf.len(), pos, self.path.display()))?;
        Ok(())
    }

    /// Writes all of `buf` starting at `pos`, extending the file if needed.
    pub fn write_at(&self, pos: u64, buf: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pos))?;
        file.write_all(buf)
            .wrap_err_with(|| format!("failed write of {} bytes at {} in {}", buf.len(), pos, self.path.display()))?;
        Ok(())
    }

    /// Grows the file to at least `len` bytes. Never shrinks.
    pub fn ensure_len(&self, len: u64) -> Result<()> {
        let file = self.file.lock();
        if file.metadata()?.len() < len {
            file.set_len(len)?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}
