use std::path::PathBuf;

use thiserror::Error;

use crate::classify::KeyError;
use crate::ledger::LedgerError;
use crate::transform::TransformError;
use crate::upload::UploadError;

/// Per-file failures. They end in a `Failed` record and never affect
/// other files.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Checksum failed: {0}")]
    Checksum(#[source] std::io::Error),

    #[error("Invalid destination key: {0}")]
    Key(#[from] KeyError),

    #[error("Transform failed: {0}")]
    Transform(#[from] TransformError),

    #[error("Upload failed: {0}")]
    Upload(#[from] UploadError),

    #[error("Background task failed: {0}")]
    Task(String),

    /// Escalated to [`FatalError`] by the runner.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Conditions under which no file may be processed safely.
#[derive(Error, Debug)]
pub enum FatalError {
    #[error("Ledger failure while processing '{path}': {source}")]
    Ledger {
        path: PathBuf,
        #[source]
        source: LedgerError,
    },
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(e: tokio::task::JoinError) -> Self {
        PipelineError::Task(e.to_string())
    }
}
