//! Pipeline error types

use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

use crate::store::StoreError;

/// Result type alias for ingestion operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// Fatal ingestion errors. Malformed input lines never surface here; they are
/// dropped and counted by the workers.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to open input file {path}: {source}")]
    OpenInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn generator '{program}': {source}")]
    SpawnGenerator {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read input: {0}")]
    Read(#[source] std::io::Error),

    #[error("Generator '{program}' exited with {status}")]
    GeneratorFailed { program: String, status: ExitStatus },

    #[error("Batch {batch_id} failed after {attempts} attempt(s): {source}")]
    Batch {
        batch_id: u64,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Common(#[from] hashvault_common::HashvaultError),

    #[error("Work queue closed before all batches were submitted")]
    QueueClosed,

    #[error("Ingestion aborted after a fatal error elsewhere in the pipeline")]
    Aborted,

    #[error("Worker task failed: {0}")]
    WorkerJoin(#[from] tokio::task::JoinError),
}

impl IngestError {
    /// Secondary failures caused by another task cancelling the run.
    pub fn is_abort(&self) -> bool {
        matches!(self, IngestError::Aborted | IngestError::QueueClosed)
    }
}
