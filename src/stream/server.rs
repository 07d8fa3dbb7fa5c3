//! Loopback HTTP server streaming one device-resident file to a local media
//! player, with byte-range support.
//!
//! Each accepted connection gets its own task and its own
//! [`StreamingContext`]; contexts never share a device file handle. Chunk
//! production is gated by socket backpressure: the drive loop's `write_all`
//! suspends while the kernel send buffer is full, and the next device read is
//! only issued once it drains. The device channel is pulled, never
//! free-running.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::core::transport::OpenMode;
use crate::core::{DeviceError, DeviceSession, FileHandle};
use crate::stream::http::{self, HttpRequest};

/// Upper bound on a request head; anything larger is dropped.
const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Bytes pulled from the device per round-trip while streaming.
const CHUNK_SIZE: u64 = 64 * 1024;

struct Shared {
    session: DeviceSession,
    /// Path of the single file this server instance exposes.
    file_path: String,
    /// File size cached after the first successful stat, for the lifetime
    /// of the server instance.
    cached_size: Mutex<Option<u64>>,
}

/// HTTP range-streaming server bound to `127.0.0.1` on an ephemeral port.
pub struct MediaStreamer {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl MediaStreamer {
    pub async fn bind(session: DeviceSession, file_path: impl Into<String>) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let local_addr = listener.local_addr()?;
        let file_path = file_path.into();

        info!(
            addr = %local_addr,
            file = %file_path,
            device = %session.id(),
            "media streamer listening"
        );

        Ok(Self {
            listener,
            local_addr,
            shared: Arc::new(Shared {
                session,
                file_path,
                cached_size: Mutex::new(None),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL to hand to a media player. The path component is informational
    /// only; any request path is accepted.
    pub fn url(&self) -> String {
        let file_name = self
            .shared
            .file_path
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or("media");
        format!("http://127.0.0.1:{}/{file_name}", self.local_addr.port())
    }

    /// Run the accept loop on a background task.
    pub fn spawn(self) -> StreamerHandle {
        let url = self.url();
        let local_addr = self.local_addr;
        let shutdown = CancellationToken::new();
        let connections = TaskTracker::new();

        let accept_task = tokio::spawn({
            let shutdown = shutdown.clone();
            let connections = connections.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        accepted = self.listener.accept() => {
                            match accepted {
                                Ok((stream, peer)) => {
                                    debug!(%peer, "client connected");
                                    connections.spawn(handle_connection(
                                        Arc::clone(&self.shared),
                                        stream,
                                    ));
                                }
                                Err(e) => {
                                    warn!(error = %e, "accept failed");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });

        StreamerHandle {
            url,
            local_addr,
            shutdown,
            connections,
            accept_task,
        }
    }
}

/// Running server handle; shutting down stops accepting and waits for
/// in-flight connections to finish their teardown.
pub struct StreamerHandle {
    url: String,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    connections: TaskTracker,
    accept_task: JoinHandle<()>,
}

impl StreamerHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.accept_task.await;
        self.connections.close();
        self.connections.wait().await;
    }
}

async fn handle_connection(shared: Arc<Shared>, mut stream: TcpStream) {
    let request = match read_request_head(&mut stream).await {
        Some(request) => request,
        // Malformed or oversized request; no device file handle was opened.
        None => return,
    };

    if request.method != "GET" && request.method != "HEAD" {
        send_error(&mut stream, 405, &shared.file_path).await;
        return;
    }

    let size = match file_size(&shared).await {
        Some(size) if size > 0 => size,
        _ => {
            send_error(&mut stream, 404, &shared.file_path).await;
            return;
        }
    };

    let (status, range) = match request.range {
        Some(spec) => match http::resolve_range(spec, size) {
            Some(range) => (206, range),
            None => {
                send_error(&mut stream, 416, &shared.file_path).await;
                return;
            }
        },
        None => (
            200,
            http::ResolvedRange {
                start: 0,
                end: size - 1,
            },
        ),
    };

    let head = http::response_head(
        status,
        http::mime_type(&shared.file_path),
        range.len(),
        (status == 206).then_some((range.start, range.end, size)),
    );
    if stream.write_all(head.as_bytes()).await.is_err() {
        return;
    }

    if request.method == "HEAD" {
        let _ = stream.shutdown().await;
        return;
    }

    stream_file_range(shared, stream, range.start, range.end).await;
}

/// Read bytes until the blank line terminating the request head, bounded by
/// [`MAX_HEAD_SIZE`]. Returns `None` on malformed input or disconnect.
async fn read_request_head(stream: &mut TcpStream) -> Option<HttpRequest> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];

    loop {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        head.extend_from_slice(&buf[..n]);

        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_HEAD_SIZE {
            return None;
        }
    }

    http::parse_request(&String::from_utf8_lossy(&head))
}

async fn send_error(stream: &mut TcpStream, status: u16, file_path: &str) {
    let head = http::response_head(status, http::mime_type(file_path), 0, None);
    let _ = stream.write_all(head.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Stat through the gateway, caching the size after the first success.
async fn file_size(shared: &Arc<Shared>) -> Option<u64> {
    if let Some(size) = *shared
        .cached_size
        .lock()
        .unwrap_or_else(|p| p.into_inner())
    {
        return Some(size);
    }

    let session = shared.session.clone();
    let path = shared.file_path.clone();
    let stat = task::spawn_blocking(move || session.stat(&path))
        .await
        .ok()?
        .ok()?;

    if stat.size > 0 {
        *shared
            .cached_size
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(stat.size);
    }
    Some(stat.size)
}

/// Single owner of one open device file handle. `close` is idempotent and
/// `Drop` is a best-effort fallback, so the handle is closed exactly once on
/// success, error, or connection loss.
struct DeviceFileGuard {
    session: DeviceSession,
    handle: FileHandle,
    closed: bool,
}

impl DeviceFileGuard {
    fn new(session: DeviceSession, handle: FileHandle) -> Self {
        Self {
            session,
            handle,
            closed: false,
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Err(e) = self.session.close_file(self.handle) {
                debug!(error = %e, "device file close failed");
            }
        }
    }
}

impl Drop for DeviceFileGuard {
    fn drop(&mut self) {
        self.close();
    }
}

/// Per-connection streaming state machine.
enum StreamState {
    /// Pull the next chunk from the device.
    Reading,
    /// Push the chunk to the socket; the await inside is the backpressure
    /// suspension point.
    Writing(Vec<u8>),
    /// Range exhausted or device EOF; graceful end.
    Done,
    /// Socket or device fault; connection is dropped.
    Failed(&'static str),
}

/// State owned by one connection while its body is streaming.
struct StreamingContext {
    shared: Arc<Shared>,
    socket: TcpStream,
    file: DeviceFileGuard,
    bytes_remaining: u64,
}

async fn stream_file_range(shared: Arc<Shared>, socket: TcpStream, start: u64, end: u64) {
    // Open and seek under one critical section so the pair cannot
    // interleave with a teardown.
    let opened = {
        let session = shared.session.clone();
        let path = shared.file_path.clone();
        task::spawn_blocking(move || -> Result<FileHandle, DeviceError> {
            let mut guard = session.acquire()?;
            let handle = guard.open(&path, OpenMode::ReadOnly)?;
            if start > 0 {
                if let Err(e) = guard.seek(handle, io::SeekFrom::Start(start)) {
                    let _ = guard.close(handle);
                    return Err(e);
                }
            }
            Ok(handle)
        })
        .await
    };

    let handle = match opened {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => {
            warn!(file = %shared.file_path, error = %e, "failed to open device file for streaming");
            return;
        }
        Err(_) => return,
    };

    debug!(
        file = %shared.file_path,
        start,
        end,
        bytes = end - start + 1,
        "streaming range"
    );

    let mut ctx = StreamingContext {
        file: DeviceFileGuard::new(shared.session.clone(), handle),
        shared,
        socket,
        bytes_remaining: end - start + 1,
    };

    let mut state = StreamState::Reading;
    loop {
        state = match state {
            StreamState::Reading => read_chunk(&mut ctx).await,
            StreamState::Writing(chunk) => write_chunk(&mut ctx, chunk).await,
            StreamState::Done => {
                debug!(file = %ctx.shared.file_path, "streaming completed");
                break;
            }
            StreamState::Failed(reason) => {
                debug!(file = %ctx.shared.file_path, reason, "streaming terminated");
                break;
            }
        };
    }

    // Close the device file handle off the async thread. Re-entrant
    // teardown is a no-op via the guard's `closed` flag.
    let mut file = ctx.file;
    let _ = task::spawn_blocking(move || file.close()).await;
    let _ = ctx.socket.shutdown().await;
}

async fn read_chunk(ctx: &mut StreamingContext) -> StreamState {
    if ctx.bytes_remaining == 0 {
        return StreamState::Done;
    }

    let want = CHUNK_SIZE.min(ctx.bytes_remaining) as usize;
    let session = ctx.shared.session.clone();
    let handle = ctx.file.handle;

    let read = task::spawn_blocking(move || {
        let mut chunk = vec![0u8; want];
        session.read(handle, &mut chunk).map(|n| {
            chunk.truncate(n);
            chunk
        })
    })
    .await;

    match read {
        // Device EOF before the advertised range was exhausted; treated as
        // a graceful end, matching a device that shrank or lied about size.
        Ok(Ok(chunk)) if chunk.is_empty() => StreamState::Done,
        Ok(Ok(chunk)) => StreamState::Writing(chunk),
        Ok(Err(_)) => StreamState::Failed("device read failed"),
        Err(_) => StreamState::Failed("read task failed"),
    }
}

async fn write_chunk(ctx: &mut StreamingContext, chunk: Vec<u8>) -> StreamState {
    // Suspends while the socket is back-pressured; chunk production resumes
    // only once the send buffer drains.
    match ctx.socket.write_all(&chunk).await {
        Ok(()) => {
            ctx.bytes_remaining -= chunk.len() as u64;
            StreamState::Reading
        }
        Err(_) => StreamState::Failed("socket write failed"),
    }
}
