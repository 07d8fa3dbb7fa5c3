//! Cancellable, progress-reporting batch export of device files.
//!
//! One job runs on one blocking worker; multiple jobs for different devices
//! run concurrently. The engine's job table has its own lock, distinct from
//! any device lock. Results are delivered over a channel so the core has no
//! dependency on any UI event loop.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::DeviceSession;
use crate::export::job;

pub type JobId = Uuid;

/// One file to export: where it lives on the device and what to call the
/// local copy.
#[derive(Debug, Clone)]
pub struct ExportItem {
    pub source_path: String,
    pub file_name: String,
}

impl ExportItem {
    pub fn new(source_path: impl Into<String>) -> Self {
        let source_path = source_path.into();
        let file_name = source_path
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or(&source_path)
            .to_string();
        Self {
            source_path,
            file_name,
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }
}

/// Per-item outcome. `error` is non-empty exactly when `success` is false.
#[derive(Debug, Clone)]
pub struct ExportResult {
    pub source_path: String,
    pub output_path: PathBuf,
    pub success: bool,
    pub bytes_transferred: u64,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExportSummary {
    pub successful: usize,
    pub failed: usize,
    pub total_bytes: u64,
}

#[derive(Debug)]
pub enum ExportEvent {
    Started {
        total: usize,
    },
    /// 1-based item index; indices never decrease within a job.
    Progress {
        index: usize,
        total: usize,
        file_name: String,
    },
    ItemDone(ExportResult),
    /// Terminal. Exactly one of `Finished` / `Cancelled` is emitted per job.
    Finished(ExportSummary),
    /// Terminal.
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("no items to export")]
    NoItems,
    #[error("cannot prepare destination directory {path}: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Clone, Default)]
pub struct ExportEngine {
    jobs: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
}

impl ExportEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate inputs, register a job and launch its worker. Returns
    /// immediately with the job id and the event receiver.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_export(
        &self,
        session: DeviceSession,
        items: Vec<ExportItem>,
        destination: impl Into<PathBuf>,
    ) -> Result<(JobId, mpsc::Receiver<ExportEvent>), ExportError> {
        let destination = destination.into();

        if items.is_empty() {
            return Err(ExportError::NoItems);
        }
        std::fs::create_dir_all(&destination).map_err(|source| ExportError::Destination {
            path: destination.clone(),
            source,
        })?;

        let job_id = Uuid::now_v7();
        let cancel = CancellationToken::new();
        self.lock_jobs().insert(job_id, cancel.clone());

        info!(
            %job_id,
            device = %session.id(),
            items = items.len(),
            destination = %destination.display(),
            "starting export job"
        );

        let (tx, rx) = mpsc::channel(64);
        let worker = tokio::task::spawn_blocking({
            let cancel = cancel.clone();
            move || job::run(job_id, session, items, destination, cancel, tx)
        });

        // Drop the job record once the worker exits, any outcome.
        let jobs = Arc::clone(&self.jobs);
        tokio::spawn(async move {
            let _ = worker.await;
            jobs.lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&job_id);
            debug!(%job_id, "export job record removed");
        });

        Ok((job_id, rx))
    }

    /// Request cooperative cancellation. The worker observes the flag
    /// between items and between chunks; worst-case latency is one chunk
    /// copy. No-op for unknown or already-finished jobs.
    pub fn cancel_export(&self, job_id: JobId) {
        if let Some(cancel) = self.lock_jobs().get(&job_id) {
            debug!(%job_id, "export cancellation requested");
            cancel.cancel();
        }
    }

    pub fn is_job_running(&self, job_id: JobId) -> bool {
        self.lock_jobs().contains_key(&job_id)
    }

    pub fn active_jobs(&self) -> usize {
        self.lock_jobs().len()
    }

    fn lock_jobs(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner())
    }
}
