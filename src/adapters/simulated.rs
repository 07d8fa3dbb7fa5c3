//! In-memory device transport and event bus for tests and `--simulation`.
//!
//! `SimulatedTransport` behaves like the real single-outstanding-call
//! channel: path-keyed files, opaque `u64` handles, native error codes. A
//! [`TransportProbe`] lets tests yank the device mid-operation, inject
//! per-path failures, gate reads for deterministic interleavings, and count
//! open/close calls.

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::sync::{Arc, Condvar, Mutex};
use std::time::SystemTime;

use tokio::sync::mpsc;
use tracing::debug;

use crate::core::transport::{DeviceTransport, FileHandle, FileStat, OpenMode, TransportError};
use crate::core::DeviceEvent;

/// Native error codes, AFC-style.
pub const ERR_UNKNOWN: i32 = 1;
pub const ERR_OBJECT_NOT_FOUND: i32 = 8;
pub const ERR_PERM_DENIED: i32 = 10;
pub const ERR_IO: i32 = 30;
pub const ERR_DEVICE_DETACHED: i32 = 37;

struct FileEntry {
    data: Vec<u8>,
    modified: Option<SystemTime>,
    created: Option<SystemTime>,
}

struct OpenFile {
    path: String,
    pos: u64,
    mode: OpenMode,
}

#[derive(Clone)]
struct ReadGate {
    /// Reads at or past this offset block until the gate is released.
    after: u64,
    state: Arc<(Mutex<bool>, Condvar)>,
}

#[derive(Default)]
struct Inner {
    files: HashMap<String, FileEntry>,
    open: HashMap<FileHandle, OpenFile>,
    next_handle: FileHandle,
    yanked: bool,
    fail_stat: HashSet<String>,
    fail_open: HashSet<String>,
    /// Reads at or past the given offset fail with `ERR_IO`.
    fail_read_at: HashMap<String, u64>,
    gates: HashMap<String, ReadGate>,
    opens: usize,
    closes: usize,
    stats: usize,
}

/// In-memory implementation of the device file protocol.
pub struct SimulatedTransport {
    inner: Arc<Mutex<Inner>>,
}

/// Shared view into a [`SimulatedTransport`] for tests; stays usable after
/// the transport has been boxed into a session.
#[derive(Clone)]
pub struct TransportProbe {
    inner: Arc<Mutex<Inner>>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_handle: 1,
                ..Inner::default()
            })),
        }
    }

    pub fn probe(&self) -> TransportProbe {
        TransportProbe {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn add_file(&mut self, path: &str, data: impl Into<Vec<u8>>) {
        self.add_file_with_times(path, data, Some(SystemTime::now()), None);
    }

    pub fn add_file_with_times(
        &mut self,
        path: &str,
        data: impl Into<Vec<u8>>,
        modified: Option<SystemTime>,
        created: Option<SystemTime>,
    ) {
        self.lock().files.insert(
            path.to_string(),
            FileEntry {
                data: data.into(),
                modified,
                created,
            },
        );
    }

    /// Make `stat` on this path fail with `ERR_PERM_DENIED`.
    pub fn fail_stat(&mut self, path: &str) {
        self.lock().fail_stat.insert(path.to_string());
    }

    /// Make `open` on this path fail with `ERR_PERM_DENIED`.
    pub fn fail_open(&mut self, path: &str) {
        self.lock().fail_open.insert(path.to_string());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl TransportProbe {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Simulate a physical yank: every subsequent call fails with
    /// `ERR_DEVICE_DETACHED`.
    pub fn yank(&self) {
        self.lock().yanked = true;
    }

    /// Reads at or past `offset` fail with `ERR_IO`.
    pub fn fail_reads_at(&self, path: &str, offset: u64) {
        self.lock().fail_read_at.insert(path.to_string(), offset);
    }

    /// Block reads at or past `offset` until [`Self::release_reads`].
    pub fn gate_reads(&self, path: &str, offset: u64) {
        self.lock().gates.insert(
            path.to_string(),
            ReadGate {
                after: offset,
                state: Arc::new((Mutex::new(false), Condvar::new())),
            },
        );
    }

    pub fn release_reads(&self, path: &str) {
        let gate = self.lock().gates.get(path).cloned();
        if let Some(gate) = gate {
            let (released, cvar) = &*gate.state;
            *released.lock().unwrap_or_else(|p| p.into_inner()) = true;
            cvar.notify_all();
        }
    }

    pub fn open_handles(&self) -> usize {
        self.lock().open.len()
    }

    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    pub fn stat_count(&self) -> usize {
        self.lock().stats
    }
}

impl Inner {
    fn check_attached(&self) -> Result<(), TransportError> {
        if self.yanked {
            Err(TransportError::new(ERR_DEVICE_DETACHED))
        } else {
            Ok(())
        }
    }
}

impl DeviceTransport for SimulatedTransport {
    fn list_dir(&mut self, path: &str) -> Result<Vec<String>, TransportError> {
        let inner = self.lock();
        inner.check_attached()?;

        let prefix = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{path}/")
        };
        let mut names: Vec<String> = inner
            .files
            .keys()
            .filter_map(|p| p.strip_prefix(&prefix))
            .map(|rest| match rest.split_once('/') {
                Some((dir, _)) => format!("{dir}/"),
                None => rest.to_string(),
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn stat(&mut self, path: &str) -> Result<FileStat, TransportError> {
        let mut inner = self.lock();
        inner.stats += 1;
        inner.check_attached()?;

        if inner.fail_stat.contains(path) {
            return Err(TransportError::new(ERR_PERM_DENIED));
        }
        let entry = inner
            .files
            .get(path)
            .ok_or(TransportError::new(ERR_OBJECT_NOT_FOUND))?;
        Ok(FileStat {
            size: entry.data.len() as u64,
            modified: entry.modified,
            created: entry.created,
        })
    }

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<FileHandle, TransportError> {
        let mut inner = self.lock();
        inner.check_attached()?;

        if inner.fail_open.contains(path) {
            return Err(TransportError::new(ERR_PERM_DENIED));
        }
        if mode == OpenMode::ReadOnly && !inner.files.contains_key(path) {
            return Err(TransportError::new(ERR_OBJECT_NOT_FOUND));
        }
        if mode == OpenMode::WriteOnly {
            inner.files.entry(path.to_string()).or_insert(FileEntry {
                data: Vec::new(),
                modified: Some(SystemTime::now()),
                created: Some(SystemTime::now()),
            });
        }

        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.open.insert(
            handle,
            OpenFile {
                path: path.to_string(),
                pos: 0,
                mode,
            },
        );
        inner.opens += 1;
        Ok(handle)
    }

    fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> Result<usize, TransportError> {
        loop {
            let gate = {
                let inner = self.lock();
                inner.check_attached()?;

                let open = inner
                    .open
                    .get(&handle)
                    .ok_or(TransportError::new(ERR_UNKNOWN))?;
                match inner.gates.get(&open.path) {
                    Some(gate) if open.pos >= gate.after => {
                        let released =
                            *gate.state.0.lock().unwrap_or_else(|p| p.into_inner());
                        if released {
                            None
                        } else {
                            Some(gate.clone())
                        }
                    }
                    _ => None,
                }
            };

            match gate {
                None => break,
                Some(gate) => {
                    // Wait outside the inner lock so probes stay usable.
                    let (released, cvar) = &*gate.state;
                    let mut released = released.lock().unwrap_or_else(|p| p.into_inner());
                    while !*released {
                        released = cvar.wait(released).unwrap_or_else(|p| p.into_inner());
                    }
                }
            }
        }

        let mut inner = self.lock();
        inner.check_attached()?;

        let open = inner
            .open
            .get(&handle)
            .ok_or(TransportError::new(ERR_UNKNOWN))?;
        let path = open.path.clone();
        let pos = open.pos;

        if let Some(&at) = inner.fail_read_at.get(&path) {
            if pos >= at {
                return Err(TransportError::new(ERR_IO));
            }
        }

        let entry = inner
            .files
            .get(&path)
            .ok_or(TransportError::new(ERR_OBJECT_NOT_FOUND))?;
        let data = &entry.data;
        if pos >= data.len() as u64 {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - pos as usize);
        buf[..n].copy_from_slice(&data[pos as usize..pos as usize + n]);

        if let Some(open) = inner.open.get_mut(&handle) {
            open.pos += n as u64;
        }
        Ok(n)
    }

    fn write(&mut self, handle: FileHandle, data: &[u8]) -> Result<usize, TransportError> {
        let mut inner = self.lock();
        inner.check_attached()?;

        let open = inner
            .open
            .get(&handle)
            .ok_or(TransportError::new(ERR_UNKNOWN))?;
        if open.mode != OpenMode::WriteOnly {
            return Err(TransportError::new(ERR_PERM_DENIED));
        }
        let path = open.path.clone();
        let pos = open.pos as usize;

        let entry = inner
            .files
            .get_mut(&path)
            .ok_or(TransportError::new(ERR_OBJECT_NOT_FOUND))?;
        if entry.data.len() < pos + data.len() {
            entry.data.resize(pos + data.len(), 0);
        }
        entry.data[pos..pos + data.len()].copy_from_slice(data);

        if let Some(open) = inner.open.get_mut(&handle) {
            open.pos += data.len() as u64;
        }
        Ok(data.len())
    }

    fn seek(&mut self, handle: FileHandle, pos: SeekFrom) -> Result<u64, TransportError> {
        let mut inner = self.lock();
        inner.check_attached()?;

        let size = {
            let open = inner
                .open
                .get(&handle)
                .ok_or(TransportError::new(ERR_UNKNOWN))?;
            inner
                .files
                .get(&open.path)
                .map(|e| e.data.len() as u64)
                .unwrap_or(0)
        };

        let open = inner
            .open
            .get_mut(&handle)
            .ok_or(TransportError::new(ERR_UNKNOWN))?;
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => size as i64 + offset,
            SeekFrom::Current(offset) => open.pos as i64 + offset,
        };
        if new_pos < 0 {
            return Err(TransportError::new(ERR_UNKNOWN));
        }
        open.pos = new_pos as u64;
        Ok(open.pos)
    }

    fn close(&mut self, handle: FileHandle) -> Result<(), TransportError> {
        let mut inner = self.lock();
        // Closing is allowed even after a yank so callers can release
        // handles during cleanup; it simply drops local state.
        if inner.open.remove(&handle).is_none() {
            return Err(TransportError::new(ERR_UNKNOWN));
        }
        inner.closes += 1;
        Ok(())
    }
}

enum BusCommand {
    Plug(String, Box<SimulatedTransport>),
    Unplug(String),
}

/// Injection handle for [`SimulatedDeviceBus`].
#[derive(Clone)]
pub struct BusController {
    tx: mpsc::UnboundedSender<BusCommand>,
}

impl BusController {
    /// Plug in a device with a small default filesystem.
    pub fn plug(&self, id: &str) {
        let mut transport = SimulatedTransport::new();
        transport.add_file(
            &format!("/DCIM/100APPLE/IMG_{id}.JPG"),
            format!("simulated photo on {id}").into_bytes(),
        );
        self.plug_with(id, transport);
    }

    pub fn plug_with(&self, id: &str, transport: SimulatedTransport) {
        let _ = self
            .tx
            .send(BusCommand::Plug(id.to_string(), Box::new(transport)));
    }

    pub fn unplug(&self, id: &str) {
        let _ = self.tx.send(BusCommand::Unplug(id.to_string()));
    }
}

/// Event bus fed by a [`BusController`] instead of real hardware.
pub struct SimulatedDeviceBus {
    // Wrapped so `start(&self)` can move the receiver out; start is only
    // called once.
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<BusCommand>>>,
}

impl SimulatedDeviceBus {
    pub fn new() -> (Self, BusController) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                cmd_rx: Mutex::new(Some(rx)),
            },
            BusController { tx },
        )
    }
}

impl super::DeviceBus for SimulatedDeviceBus {
    fn start(&self, event_sender: mpsc::Sender<DeviceEvent>) {
        let mut rx = self
            .cmd_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .expect("SimulatedDeviceBus::start() called twice");

        debug!("simulated device bus listening for controller commands");

        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                let event = match cmd {
                    BusCommand::Plug(id, transport) => DeviceEvent::Added { id, transport },
                    BusCommand::Unplug(id) => DeviceEvent::Removed { id },
                };

                if event_sender.send(event).await.is_err() {
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_roundtrip() {
        let mut t = SimulatedTransport::new();
        let h = t.open("/out.bin", OpenMode::WriteOnly).unwrap();
        t.write(h, b"hello").unwrap();
        t.close(h).unwrap();

        let h = t.open("/out.bin", OpenMode::ReadOnly).unwrap();
        let mut buf = [0u8; 8];
        let n = t.read(h, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(t.read(h, &mut buf).unwrap(), 0);
        t.close(h).unwrap();
    }

    #[test]
    fn seek_repositions_reads() {
        let mut t = SimulatedTransport::new();
        t.add_file("/f", b"0123456789".to_vec());
        let h = t.open("/f", OpenMode::ReadOnly).unwrap();
        t.seek(h, SeekFrom::Start(4)).unwrap();
        let mut buf = [0u8; 3];
        t.read(h, &mut buf).unwrap();
        assert_eq!(&buf, b"456");
    }

    #[test]
    fn yank_detaches_every_call() {
        let mut t = SimulatedTransport::new();
        t.add_file("/f", b"x".to_vec());
        let probe = t.probe();
        let h = t.open("/f", OpenMode::ReadOnly).unwrap();

        probe.yank();

        let mut buf = [0u8; 1];
        assert_eq!(
            t.read(h, &mut buf).unwrap_err().code,
            ERR_DEVICE_DETACHED
        );
        assert_eq!(t.stat("/f").unwrap_err().code, ERR_DEVICE_DETACHED);
        // Close still releases local state.
        assert!(t.close(h).is_ok());
        assert_eq!(probe.open_handles(), 0);
    }

    #[test]
    fn stat_missing_file_reports_not_found() {
        let mut t = SimulatedTransport::new();
        assert_eq!(t.stat("/nope").unwrap_err().code, ERR_OBJECT_NOT_FOUND);
    }

    #[test]
    fn injected_read_fault_fires_at_offset() {
        let mut t = SimulatedTransport::new();
        t.add_file("/f", vec![7u8; 100]);
        t.probe().fail_reads_at("/f", 50);

        let h = t.open("/f", OpenMode::ReadOnly).unwrap();
        let mut buf = [0u8; 50];
        assert_eq!(t.read(h, &mut buf).unwrap(), 50);
        assert_eq!(t.read(h, &mut buf).unwrap_err().code, ERR_IO);
    }

    #[test]
    fn list_dir_returns_children() {
        let mut t = SimulatedTransport::new();
        t.add_file("/DCIM/a.jpg", b"a".to_vec());
        t.add_file("/DCIM/sub/b.jpg", b"b".to_vec());
        t.add_file("/other.txt", b"o".to_vec());

        let names = t.list_dir("/DCIM").unwrap();
        assert_eq!(names, vec!["a.jpg".to_string(), "sub/".to_string()]);
    }

    #[tokio::test]
    async fn bus_bridges_plug_and_unplug() {
        let (bus, controller) = SimulatedDeviceBus::new();
        let (tx, mut rx) = mpsc::channel(8);

        use crate::adapters::DeviceBus;
        bus.start(tx);

        controller.plug("dev-1");
        controller.unplug("dev-1");

        match rx.recv().await.expect("event") {
            DeviceEvent::Added { id, .. } => assert_eq!(id, "dev-1"),
            other => panic!("expected Added, got {other:?}"),
        }
        match rx.recv().await.expect("event") {
            DeviceEvent::Removed { id } => assert_eq!(id, "dev-1"),
            other => panic!("expected Removed, got {other:?}"),
        }
    }
}
