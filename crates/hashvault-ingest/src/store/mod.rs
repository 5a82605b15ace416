//! Canonical store interface
//!
//! A [`HashStore`] owns the canonical `hashes(hash PRIMARY KEY, count)` table.
//! Workers hand it one filtered batch at a time; the store stages the batch
//! privately, deduplicates it, and folds it into the canonical table with
//! max-of-counts conflict resolution in a single atomic step. Because that
//! merge is idempotent and commutative, batches may arrive in any order, overlap,
//! or be retried.
//!
//! - [`postgres::PgHashStore`]: PostgreSQL via sqlx (COPY + upsert)
//! - [`memory::MemoryHashStore`]: in-process, same semantics, for dry runs and tests

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::batch::FilteredBatch;

pub mod memory;
pub mod postgres;
pub mod session;

pub use memory::MemoryHashStore;
pub use postgres::PgHashStore;
pub use session::SessionTuning;

/// Name of the canonical table read by the lookup service.
pub const CANONICAL_TABLE: &str = "hashes";

/// Staging relation name for a batch. Batch ids are unique within a run, so
/// two concurrent workers never share a name.
pub fn staging_table_name(batch_id: u64) -> String {
    format!("hash_stage_{}", batch_id)
}

/// Store operation errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to connect to the store: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("Timed out connecting to the store after {0:?}")]
    ConnectTimeout(Duration),

    /// Internal invariant violation: a staging name was reused
    #[error("Staging table '{table}' already exists")]
    StagingCollision { table: String },

    #[error("{operation} failed: {source}")]
    Query {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("Stored count {count} for {hash} is negative")]
    InvalidCount { hash: String, count: i64 },
}

impl StoreError {
    pub(crate) fn query(operation: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| StoreError::Query { operation, source }
    }

    /// Whether retrying the batch on a fresh connection may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Connect(_) | StoreError::ConnectTimeout(_) => true,
            StoreError::Query { source, .. } => is_transient(source),
            StoreError::StagingCollision { .. } | StoreError::InvalidCount { .. } => false,
        }
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| {
            // serialization_failure, deadlock_detected, admin/crash shutdown,
            // cannot_connect_now, and the connection_exception class
            matches!(code.as_ref(), "40001" | "40P01" | "57P01" | "57P02" | "57P03")
                || code.starts_with("08")
        }),
        _ => false,
    }
}

/// Result of merging one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    /// Records staged (before in-batch deduplication)
    pub staged: u64,
    /// Canonical rows inserted or raised
    pub changed: u64,
}

/// The canonical table and its bulk-load contract
#[async_trait]
pub trait HashStore: Send + Sync {
    /// Short name used in logs
    fn kind(&self) -> &'static str;

    /// Create the canonical table if it does not exist
    async fn prepare(&self) -> Result<(), StoreError>;

    /// Stage, deduplicate, and max-merge one batch atomically
    async fn merge_batch(&self, batch: &FilteredBatch) -> Result<MergeOutcome, StoreError>;

    /// Refresh planner statistics on the canonical table
    async fn finalize(&self) -> Result<(), StoreError>;

    /// Count stored for an already-normalized hash
    async fn lookup(&self, hash: &str) -> Result<Option<u64>, StoreError>;
}
