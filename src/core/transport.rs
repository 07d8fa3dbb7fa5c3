//! The opaque device transport boundary.
//!
//! The underlying channel is a blocking, single-outstanding-call protocol:
//! one request travels to the device at a time, and a handle becomes
//! permanently unusable once the physical device is removed. Every call is
//! fallible and reports a native protocol error code on failure.

use std::io::SeekFrom;
use std::time::SystemTime;

/// Opaque file handle as issued by the device protocol.
pub type FileHandle = u64;

/// A protocol-level failure reported by the device channel, carrying the
/// native error code for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("device transport error (native code {code})")]
pub struct TransportError {
    pub code: i32,
}

impl TransportError {
    pub fn new(code: i32) -> Self {
        Self { code }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    WriteOnly,
}

/// File metadata as reported by the device.
///
/// The device reports `st_size`, `st_mtime` and `st_birthtime`; timestamps
/// may be absent on some filesystems.
#[derive(Debug, Clone, Default)]
pub struct FileStat {
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub created: Option<SystemTime>,
}

/// Blocking device file-transfer protocol.
///
/// Implementations are not required to be thread-safe; all concurrent access
/// is serialized by [`crate::core::DeviceSession`]. A call may block the
/// calling thread for one native round-trip.
pub trait DeviceTransport: Send {
    /// List entry names of a directory on the device.
    fn list_dir(&mut self, path: &str) -> Result<Vec<String>, TransportError>;

    /// Fetch file metadata.
    fn stat(&mut self, path: &str) -> Result<FileStat, TransportError>;

    /// Open a device file, returning a protocol handle.
    fn open(&mut self, path: &str, mode: OpenMode) -> Result<FileHandle, TransportError>;

    /// Read into `buf` at the handle's current position. `Ok(0)` means EOF.
    fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write `data` at the handle's current position, returning bytes accepted.
    fn write(&mut self, handle: FileHandle, data: &[u8]) -> Result<usize, TransportError>;

    /// Reposition the handle, returning the new absolute offset.
    fn seek(&mut self, handle: FileHandle, pos: SeekFrom) -> Result<u64, TransportError>;

    /// Close a handle. The handle must not be reused afterwards.
    fn close(&mut self, handle: FileHandle) -> Result<(), TransportError>;
}
