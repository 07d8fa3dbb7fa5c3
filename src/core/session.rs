//! Synchronized operation gateway for a single device.
//!
//! Every transport call made anywhere in the process goes through a
//! [`DeviceSession`], which holds the device's lock for the full duration of
//! the native call, including the validity check immediately before it. A
//! concurrent removal ([`DeviceSession::invalidate`]) takes the same lock, so
//! teardown waits for in-flight calls and in-flight calls never observe a
//! half-torn-down transport.
//!
//! Instead of a reentrant lock, compound flows that need several calls under
//! one critical section acquire an explicit [`TransportGuard`] token and make
//! all their calls through it. Single calls use the convenience methods,
//! which acquire and release internally. A *sequence* of such single calls is
//! not atomic as a whole: the device can disappear between any two of them,
//! and every caller must treat a failed call as abort-this-operation.

use std::io::SeekFrom;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::core::error::DeviceError;
use crate::core::transport::{DeviceTransport, FileHandle, FileStat, OpenMode};

struct DeviceHandle {
    id: String,
    // `None` marks the transport as invalidated by a removal.
    transport: Mutex<Option<Box<dyn DeviceTransport>>>,
}

/// Cheaply cloneable, thread-safe handle to one device's transport.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<DeviceHandle>,
}

/// Token proving the device lock is held and the transport was live when it
/// was acquired. All transport access goes through this guard; dropping it
/// releases the lock on every exit path.
pub struct TransportGuard<'a> {
    guard: MutexGuard<'a, Option<Box<dyn DeviceTransport>>>,
}

impl<'a> TransportGuard<'a> {
    fn transport(&mut self) -> Result<&mut dyn DeviceTransport, DeviceError> {
        // Present by construction; checked again so the failure stays typed.
        match self.guard.as_mut() {
            Some(transport) => Ok(&mut **transport),
            None => Err(DeviceError::DeviceGone),
        }
    }

    pub fn list_dir(&mut self, path: &str) -> Result<Vec<String>, DeviceError> {
        Ok(self.transport()?.list_dir(path)?)
    }

    pub fn stat(&mut self, path: &str) -> Result<FileStat, DeviceError> {
        Ok(self.transport()?.stat(path)?)
    }

    pub fn open(&mut self, path: &str, mode: OpenMode) -> Result<FileHandle, DeviceError> {
        Ok(self.transport()?.open(path, mode)?)
    }

    pub fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> Result<usize, DeviceError> {
        Ok(self.transport()?.read(handle, buf)?)
    }

    pub fn write(&mut self, handle: FileHandle, data: &[u8]) -> Result<usize, DeviceError> {
        Ok(self.transport()?.write(handle, data)?)
    }

    pub fn seek(&mut self, handle: FileHandle, pos: SeekFrom) -> Result<u64, DeviceError> {
        Ok(self.transport()?.seek(handle, pos)?)
    }

    pub fn close(&mut self, handle: FileHandle) -> Result<(), DeviceError> {
        Ok(self.transport()?.close(handle)?)
    }
}

impl DeviceSession {
    pub fn new(id: impl Into<String>, transport: Box<dyn DeviceTransport>) -> Self {
        Self {
            inner: Arc::new(DeviceHandle {
                id: id.into(),
                transport: Mutex::new(Some(transport)),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn DeviceTransport>>> {
        // A panic while holding the lock cannot leave the Option torn, so a
        // poisoned mutex is still safe to use.
        self.inner
            .transport
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Acquire the device lock and verify the transport is still live.
    ///
    /// Blocks until any in-flight operation releases the lock. Fails with
    /// [`DeviceError::DeviceGone`] when a teardown raced in first.
    pub fn acquire(&self) -> Result<TransportGuard<'_>, DeviceError> {
        let guard = self.lock();
        if guard.is_none() {
            return Err(DeviceError::DeviceGone);
        }
        Ok(TransportGuard { guard })
    }

    /// Whether the transport has not been invalidated. Advisory only; the
    /// device can disappear right after this returns true.
    pub fn is_live(&self) -> bool {
        self.lock().is_some()
    }

    /// Tear the transport down. Blocks until the current in-flight operation
    /// (at most one) releases the lock, then frees the transport. All later
    /// operations fail with [`DeviceError::DeviceGone`]. Idempotent.
    pub fn invalidate(&self) {
        let transport = self.lock().take();
        if transport.is_some() {
            debug!(device = %self.inner.id, "device transport invalidated");
        }
        // Transport dropped outside the critical section.
        drop(transport);
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, DeviceError> {
        self.acquire()?.list_dir(path)
    }

    pub fn stat(&self, path: &str) -> Result<FileStat, DeviceError> {
        self.acquire()?.stat(path)
    }

    pub fn open_file(&self, path: &str, mode: OpenMode) -> Result<FileHandle, DeviceError> {
        self.acquire()?.open(path, mode)
    }

    pub fn read(&self, handle: FileHandle, buf: &mut [u8]) -> Result<usize, DeviceError> {
        self.acquire()?.read(handle, buf)
    }

    pub fn write(&self, handle: FileHandle, data: &[u8]) -> Result<usize, DeviceError> {
        self.acquire()?.write(handle, data)
    }

    pub fn seek(&self, handle: FileHandle, pos: SeekFrom) -> Result<u64, DeviceError> {
        self.acquire()?.seek(handle, pos)
    }

    pub fn close_file(&self, handle: FileHandle) -> Result<(), DeviceError> {
        self.acquire()?.close(handle)
    }

    /// Read an entire device file into memory under a single critical
    /// section, so the open/read/close sequence cannot interleave with a
    /// teardown.
    pub fn read_file_to_vec(&self, path: &str) -> Result<Vec<u8>, DeviceError> {
        let mut guard = self.acquire()?;
        let handle = guard.open(path, OpenMode::ReadOnly)?;

        let mut data = Vec::new();
        let mut buf = [0u8; 8192];
        let result = loop {
            match guard.read(handle, &mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => data.extend_from_slice(&buf[..n]),
                Err(e) => break Err(e),
            }
        };
        let _ = guard.close(handle);

        result.map(|_| data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedTransport;

    fn session_with(files: &[(&str, &[u8])]) -> DeviceSession {
        let mut transport = SimulatedTransport::new();
        for (path, data) in files {
            transport.add_file(path, data.to_vec());
        }
        DeviceSession::new("test-device", Box::new(transport))
    }

    #[test]
    fn stat_and_read_through_gateway() {
        let session = session_with(&[("/DCIM/IMG_0001.MOV", b"abcdef")]);

        let stat = session.stat("/DCIM/IMG_0001.MOV").unwrap();
        assert_eq!(stat.size, 6);

        let data = session.read_file_to_vec("/DCIM/IMG_0001.MOV").unwrap();
        assert_eq!(data, b"abcdef");
    }

    #[test]
    fn operations_fail_after_invalidate() {
        let session = session_with(&[("/a", b"x")]);
        assert!(session.is_live());

        session.invalidate();

        assert!(!session.is_live());
        assert!(matches!(session.stat("/a"), Err(DeviceError::DeviceGone)));
        assert_eq!(
            session.open_file("/a", OpenMode::ReadOnly),
            Err(DeviceError::DeviceGone)
        );
    }

    #[test]
    fn invalidate_is_idempotent() {
        let session = session_with(&[]);
        session.invalidate();
        session.invalidate();
        assert!(!session.is_live());
    }

    #[test]
    fn transport_error_carries_native_code() {
        let session = session_with(&[]);
        match session.stat("/missing") {
            Err(DeviceError::Transport { code }) => {
                assert_eq!(code, crate::adapters::simulated::ERR_OBJECT_NOT_FOUND)
            }
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[test]
    fn guard_holds_lock_across_compound_flow() {
        let session = session_with(&[("/f", b"hello")]);

        let mut guard = session.acquire().unwrap();
        let handle = guard.open("/f", OpenMode::ReadOnly).unwrap();
        let mut buf = [0u8; 16];
        let n = guard.read(handle, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        guard.close(handle).unwrap();
        drop(guard);

        // Lock is released; an independent call succeeds.
        assert_eq!(session.stat("/f").unwrap().size, 5);
    }

    #[test]
    fn invalidate_blocks_until_inflight_call_releases() {
        use std::sync::mpsc;
        use std::time::Duration;

        let mut transport = SimulatedTransport::new();
        transport.add_file("/slow", vec![0u8; 64]);
        let probe = transport.probe();
        probe.gate_reads("/slow", 0);

        let session = DeviceSession::new("gated", Box::new(transport));

        let reader = {
            let session = session.clone();
            std::thread::spawn(move || {
                let handle = session.open_file("/slow", OpenMode::ReadOnly).unwrap();
                let mut buf = [0u8; 16];
                // Blocks on the gate while holding the device lock.
                let res = session.read(handle, &mut buf);
                (handle, res)
            })
        };

        // Give the reader time to enter the gated read.
        std::thread::sleep(Duration::from_millis(50));

        let (done_tx, done_rx) = mpsc::channel();
        let invalidator = {
            let session = session.clone();
            std::thread::spawn(move || {
                session.invalidate();
                done_tx.send(()).unwrap();
            })
        };

        // Teardown must wait for the in-flight read.
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

        probe.release_reads("/slow");
        let (_, res) = reader.join().unwrap();
        assert!(res.is_ok());

        done_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("invalidate should finish once the read releases the lock");
        invalidator.join().unwrap();
        assert!(!session.is_live());
    }
}
