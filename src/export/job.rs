//! Export worker: the sequential per-item copy loop.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use filetime::FileTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use crate::core::transport::OpenMode;
use crate::core::DeviceSession;
use crate::export::engine::{ExportEvent, ExportItem, ExportResult, ExportSummary, JobId};
use crate::logging::LogThrottle;

/// Chunk size for the device-to-local copy loop. The device channel performs
/// one round-trip per chunk, so this also bounds cancellation latency.
const CHUNK_SIZE: usize = 8 * 1024;

/// Cap on `<base>_<n>` collision probes. Past the cap the last candidate is
/// reused even if it exists; a directory with ten thousand colliding names
/// is out of scope.
const MAX_COLLISION_ATTEMPTS: u32 = 10_000;

/// Runs on a blocking worker thread; all gateway calls may block for one
/// native round-trip each.
pub(crate) fn run(
    job_id: JobId,
    session: DeviceSession,
    items: Vec<ExportItem>,
    destination: PathBuf,
    cancel: CancellationToken,
    tx: mpsc::Sender<ExportEvent>,
) {
    let span = info_span!("export_job", %job_id, device = %session.id());
    let _entered = span.enter();

    let total = items.len();
    let _ = tx.blocking_send(ExportEvent::Started { total });

    let mut summary = ExportSummary::default();

    for (i, item) in items.iter().enumerate() {
        if cancel.is_cancelled() {
            info!("export job cancelled before item {}", i + 1);
            let _ = tx.blocking_send(ExportEvent::Cancelled);
            return;
        }

        let _ = tx.blocking_send(ExportEvent::Progress {
            index: i + 1,
            total,
            file_name: item.file_name.clone(),
        });

        let result = export_single_item(&session, item, &destination, &cancel);

        if result.success {
            summary.successful += 1;
            summary.total_bytes += result.bytes_transferred;
            debug!(file = %item.file_name, bytes = result.bytes_transferred, "item exported");
        } else {
            summary.failed += 1;
            warn!(file = %item.file_name, error = %result.error, "item failed");
        }

        let _ = tx.blocking_send(ExportEvent::ItemDone(result));

        // Re-check after a potentially long copy so a cancel that landed
        // mid-item terminates the job here.
        if cancel.is_cancelled() {
            info!("export job cancelled after item {}", i + 1);
            let _ = tx.blocking_send(ExportEvent::Cancelled);
            return;
        }
    }

    info!(
        successful = summary.successful,
        failed = summary.failed,
        total_bytes = summary.total_bytes,
        "export job finished"
    );
    let _ = tx.blocking_send(ExportEvent::Finished(summary));
}

fn export_single_item(
    session: &DeviceSession,
    item: &ExportItem,
    destination: &Path,
    cancel: &CancellationToken,
) -> ExportResult {
    let mut result = ExportResult {
        source_path: item.source_path.clone(),
        output_path: PathBuf::new(),
        success: false,
        bytes_transferred: 0,
        error: String::new(),
    };

    // Stat first for size and timestamps; a stat failure fails this item
    // only, the batch continues.
    let stat = match session.stat(&item.source_path) {
        Ok(stat) => stat,
        Err(e) => {
            result.error = format!("failed to stat {} on device: {e}", item.source_path);
            return result;
        }
    };

    let output_path = unique_output_path(destination.join(&item.file_name));
    result.output_path = output_path.clone();

    let handle = match session.open_file(&item.source_path, OpenMode::ReadOnly) {
        Ok(handle) => handle,
        Err(e) => {
            result.error = format!("failed to open {} on device: {e}", item.source_path);
            return result;
        }
    };

    let mut output = match File::create(&output_path) {
        Ok(file) => file,
        Err(e) => {
            let _ = session.close_file(handle);
            result.error = format!("failed to create local file {}: {e}", output_path.display());
            return result;
        }
    };

    let throttle = LogThrottle::new(Duration::from_millis(500));
    let mut buf = [0u8; CHUNK_SIZE];
    let mut total_bytes: u64 = 0;

    loop {
        // Cooperative cancellation, checked before each chunk read. A cancel
        // mid-item removes the partial local file.
        if cancel.is_cancelled() {
            drop(output);
            let _ = fs::remove_file(&output_path);
            let _ = session.close_file(handle);
            result.error = "export cancelled".to_string();
            return result;
        }

        let n = match session.read(handle, &mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                // Device gone or protocol fault mid-copy: this item fails,
                // partial output is removed, the batch continues.
                drop(output);
                let _ = fs::remove_file(&output_path);
                let _ = session.close_file(handle);
                result.error = format!("device read failed after {total_bytes} bytes: {e}");
                return result;
            }
        };

        if let Err(e) = output.write_all(&buf[..n]) {
            drop(output);
            let _ = fs::remove_file(&output_path);
            let _ = session.close_file(handle);
            result.error = format!("local write failed: {e}");
            return result;
        }

        total_bytes += n as u64;
        if throttle.should_log() {
            debug!(
                file = %item.file_name,
                bytes = total_bytes,
                total = stat.size,
                "copy progress"
            );
        }
    }

    drop(output);
    if let Err(e) = session.close_file(handle) {
        debug!(file = %item.file_name, error = %e, "device close failed");
    }

    if total_bytes == 0 {
        let _ = fs::remove_file(&output_path);
        result.error = "no data read from device file".to_string();
        return result;
    }

    // Restore the device-reported modification time. Birth time is not
    // portably settable; mtime is mirrored into atime.
    if let Some(modified) = stat.modified {
        let mtime = FileTime::from_system_time(modified);
        if let Err(e) = filetime::set_file_times(&output_path, mtime, mtime) {
            warn!(path = %output_path.display(), error = %e, "failed to set file times");
        }
    }

    result.success = true;
    result.bytes_transferred = total_bytes;
    result
}

/// Resolve a collision-free output path by appending `_<n>` before the
/// extension until an unused name is found, capped at
/// [`MAX_COLLISION_ATTEMPTS`].
pub(crate) fn unique_output_path(base: PathBuf) -> PathBuf {
    if !base.exists() {
        return base;
    }

    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = base.extension().map(|e| e.to_string_lossy().into_owned());
    let dir = base.parent().unwrap_or(Path::new(".")).to_path_buf();

    let numbered = |n: u32| {
        let name = match &extension {
            Some(ext) => format!("{stem}_{n}.{ext}"),
            None => format!("{stem}_{n}"),
        };
        dir.join(name)
    };

    let mut n = 1;
    let mut candidate = numbered(n);
    while candidate.exists() && n < MAX_COLLISION_ATTEMPTS {
        n += 1;
        candidate = numbered(n);
    }
    candidate
}
