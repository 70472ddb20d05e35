//! Before-image transaction log.
//!
//! `ferrobase.txlog` exists only while a commit is in flight. It is written
//! in one pass before any data file is touched and deleted once the commit
//! (or a rollback) finishes, so its mere presence on open means the previous
//! session died mid-commit and its content must be applied as a rollback.
//!
//! Two frame kinds, each a fixed header followed by the type name and an
//! optional payload:
//!
//! ```text
//! kind(1) pad(3) name_len(4) oid(4) count(4) crc(4) | name | payload
//! ```
//!
//! - **count** frames snapshot a type's record count (`count`, no payload);
//! - **image** frames snapshot one record's full bytes (`count` is the
//!   payload length).
//!
//! The CRC (Castagnoli) covers the name and payload, so a torn tail is
//! detected and everything before it still applies.

use std::sync::Arc;

use crc::{Crc, CRC_32_ISCSI};
use eyre::{bail, ensure, Result};
use parking_lot::Mutex;
use tracing::warn;
use zerocopy::little_endian::{I32, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::storage::{FileRegistry, StorageFile, TXN_LOG_FILE_NAME};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const KIND_COUNT: u8 = 1;
const KIND_IMAGE: u8 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct FrameHeader {
    kind: u8,
    _pad: [u8; 3],
    name_len: U32,
    oid: I32,
    count: U32,
    crc: U32,
}

const FRAME_HEADER_SIZE: usize = 20;
const _: () = assert!(std::mem::size_of::<FrameHeader>() == FRAME_HEADER_SIZE);

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Record count of `type_name` before the transaction.
    Count { type_name: String, count: u32 },
    /// Full record bytes of `oid` before the transaction.
    Image { type_name: String, oid: i32, bytes: Vec<u8> },
}

pub struct TxnLog {
    file: Arc<StorageFile>,
    tail: Mutex<u64>,
}

impl TxnLog {
    /// Starts a fresh log. Fails if one is already present: that is a
    /// pending rollback the caller must apply first.
    pub fn create(registry: &FileRegistry) -> Result<Self> {
        if registry.exists(TXN_LOG_FILE_NAME) {
            bail!("a transaction log is already present, rollback is pending");
        }
        let file = registry.get(TXN_LOG_FILE_NAME)?;
        Ok(Self { file, tail: Mutex::new(0) })
    }

    pub fn exists(registry: &FileRegistry) -> bool {
        registry.exists(TXN_LOG_FILE_NAME)
    }

    /// Opens an existing log left by an interrupted commit.
    pub fn open_existing(registry: &FileRegistry) -> Result<Self> {
        ensure!(registry.exists(TXN_LOG_FILE_NAME), "no transaction log to open");
        let file = registry.get(TXN_LOG_FILE_NAME)?;
        let len = file.len()?;
        Ok(Self { file, tail: Mutex::new(len) })
    }

    /// Deletes the log file. The commit becomes durable at this point.
    pub fn delete(self, registry: &FileRegistry) -> Result<()> {
        drop(self.file);
        registry.remove(TXN_LOG_FILE_NAME)
    }

    pub fn append_count(&self, type_name: &str, count: u32) -> Result<()> {
        self.append(KIND_COUNT, type_name, 0, count, &[])
    }

    pub fn append_image(&self, type_name: &str, oid: i32, bytes: &[u8]) -> Result<()> {
        self.append(KIND_IMAGE, type_name, oid, bytes.len() as u32, bytes)
    }

    fn append(&self, kind: u8, type_name: &str, oid: i32, count: u32, payload: &[u8]) -> Result<()> {
        let name = type_name.as_bytes();
        let mut digest = CASTAGNOLI.digest();
        digest.update(name);
        digest.update(payload);
        let header = FrameHeader {
            kind,
            _pad: [0; 3],
            name_len: U32::new(name.len() as u32),
            oid: I32::new(oid),
            count: U32::new(count),
            crc: U32::new(digest.finalize()),
        };
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + name.len() + payload.len());
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(name);
        frame.extend_from_slice(payload);

        let mut tail = self.tail.lock();
        self.file.write_at(*tail, &frame)?;
        *tail += frame.len() as u64;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    /// Every intact frame in write order. Stops at the first frame whose CRC
    /// or framing is broken (a torn tail from the interrupted write).
    pub fn read_all(&self) -> Result<Vec<Frame>> {
        let len = *self.tail.lock();
        let mut buf = vec![0u8; len as usize];
        self.file.read_at(0, &mut buf)?;

        let mut frames = Vec::new();
        let mut pos = 0usize;
        while pos + FRAME_HEADER_SIZE <= buf.len() {
            let header =
                match FrameHeader::ref_from_bytes(&buf[pos..pos + FRAME_HEADER_SIZE]) {
                    Ok(h) => h,
                    Err(_) => break,
                };
            let name_len = header.name_len.get() as usize;
            let payload_len = match header.kind {
                KIND_COUNT => 0,
                KIND_IMAGE => header.count.get() as usize,
                other => {
                    warn!(kind = other, at = pos, "unknown log frame kind, truncating");
                    break;
                }
            };
            let body_start = pos + FRAME_HEADER_SIZE;
            let body_end = body_start + name_len + payload_len;
            if body_end > buf.len() {
                warn!(at = pos, "torn log frame, truncating");
                break;
            }
            let name = &buf[body_start..body_start + name_len];
            let payload = &buf[body_start + name_len..body_end];
            let mut digest = CASTAGNOLI.digest();
            digest.update(name);
            digest.update(payload);
            if digest.finalize() != header.crc.get() {
                warn!(at = pos, "log frame checksum mismatch, truncating");
                break;
            }
            let type_name = std::str::from_utf8(name)?.to_string();
            frames.push(match header.kind {
                KIND_COUNT => Frame::Count { type_name, count: header.count.get() },
                _ => Frame::Image { type_name, oid: header.oid.get(), bytes: payload.to_vec() },
            });
            pos = body_end;
        }
        Ok(frames)
    }
}
