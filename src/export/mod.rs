pub mod engine;
pub mod job;

pub use engine::{
    ExportEngine, ExportError, ExportEvent, ExportItem, ExportResult, ExportSummary, JobId,
};
