//! Hashvault Ingest Library
//!
//! Bulk-loads `HASH:COUNT` lines into a canonical PostgreSQL table keyed by
//! hash, keeping the largest count ever seen for each hash.
//!
//! # Pipeline
//!
//! - [`source`]: reads lines from a file or a generator process
//! - [`batch`]: groups lines into fixed-size batches
//! - [`queue`]: bounded FIFO between the producer and the workers
//! - [`worker`]: filters, merges, and retries batches concurrently
//! - [`store`]: the canonical table (PostgreSQL or in-memory)
//! - [`progress`]: shared counters and periodic throughput logging
//! - [`pipeline`]: wires the above together and runs the finalizer
//!
//! # Example
//!
//! ```no_run
//! use hashvault_ingest::{IngestConfig, IngestPipeline, LineSource, MemoryHashStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pipeline = IngestPipeline::new(IngestConfig::default(), Arc::new(MemoryHashStore::new()));
//!     let summary = pipeline.run(LineSource::File("pwned-passwords.txt".into())).await?;
//!     println!("{} hashes merged", summary.lines_merged);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod batch;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod source;
pub mod store;
pub mod worker;

pub use config::{DatabaseConfig, IngestConfig};
pub use error::{IngestError, IngestResult};
pub use pipeline::{IngestPipeline, RunSummary};
pub use source::LineSource;
pub use store::{HashStore, MemoryHashStore, PgHashStore, SessionTuning, StoreError};
