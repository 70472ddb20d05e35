//! # Storage Layer
//!
//! Positioned file I/O and the session-owned handle registry. Type record
//! stores, the raw-data heap and the transaction log all sit on top of
//! [`StorageFile`], obtained through the [`FileRegistry`] so each path has a
//! single shared handle for the life of the session.

mod file;
mod registry;

pub use file::StorageFile;
pub use registry::FileRegistry;

/// Extension for type record files (header + fixed records).
pub const TYPE_FILE_EXTENSION: &str = "fbd";

/// Flat payload file of the raw-data heap.
pub const RAW_FILE_NAME: &str = "ferrobase.raw";

/// Before-image transaction log.
pub const TXN_LOG_FILE_NAME: &str = "ferrobase.txlog";
