//! Ingest orchestration
//!
//! ```text
//! source ─▶ Batcher ─▶ bounded queue ─▶ N × IngestWorker ─▶ HashStore
//!                                              │
//!                                       ProgressCounter
//! ```
//!
//! Shutdown order: the producer exhausts the input, the queue is drained
//! (every batch acknowledged), one stop marker per worker is enqueued, the
//! workers are joined, the generator exit status is checked, and only then
//! does the finalizer run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::batch::Batcher;
use crate::config::IngestConfig;
use crate::error::{IngestError, IngestResult};
use crate::progress::{format_count, ProgressCounter, ProgressMonitor};
use crate::queue::work_queue;
use crate::source::LineSource;
use crate::store::HashStore;
use crate::worker::{IngestWorker, RetryPolicy, WorkerReport};

/// Outcome of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
    pub batches: u64,
    pub lines_read: u64,
    pub lines_merged: u64,
    pub lines_rejected: u64,
    pub retries: u64,
    pub workers: usize,
    pub finalized: bool,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

pub struct IngestPipeline {
    config: IngestConfig,
    store: Arc<dyn HashStore>,
}

impl IngestPipeline {
    pub fn new(config: IngestConfig, store: Arc<dyn HashStore>) -> Self {
        Self { config, store }
    }

    /// Ingest every line of `source` into the store
    pub async fn run(&self, source: LineSource) -> IngestResult<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        let workers = self.config.workers.max(1);

        info!(
            %run_id,
            source = %source.describe(),
            store = self.store.kind(),
            workers,
            batch_size = self.config.batch_size,
            queue_capacity = self.config.queue_capacity(),
            max_buffered_lines = self.config.max_buffered_lines(),
            "Starting ingest"
        );

        self.store.prepare().await?;
        let mut lines = source.open().await?;

        let (sender, receiver) = work_queue(self.config.queue_capacity());
        let cancel = CancellationToken::new();
        let progress = Arc::new(ProgressCounter::new());
        let retry = RetryPolicy {
            max_retries: self.config.max_retries,
            backoff: self.config.retry_backoff,
        };

        let handles: Vec<JoinHandle<IngestResult<WorkerReport>>> = (0..workers)
            .map(|id| {
                let worker = IngestWorker::new(
                    id,
                    receiver.clone(),
                    self.store.clone(),
                    progress.clone(),
                    cancel.clone(),
                    self.config.hash_length,
                    retry,
                );
                tokio::spawn(worker.run())
            })
            .collect();
        drop(receiver);

        let monitor_stop = CancellationToken::new();
        let monitor = self
            .config
            .progress_interval
            .map(|every| ProgressMonitor::spawn(progress.clone(), every, monitor_stop.clone()));

        let produced = Batcher::new(self.config.batch_size)
            .run(&mut lines, &sender, &cancel)
            .await;

        // Drain, then one stop marker per worker. Skipped on failure: the
        // token already stops every worker.
        if produced.is_ok() {
            let shutdown = async {
                sender.join().await;
                sender.stop_workers(workers).await
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                stopped = shutdown => {
                    if let Err(e) = stopped {
                        warn!(error = %e, "Could not enqueue stop markers");
                        cancel.cancel();
                    }
                }
            }
        } else {
            cancel.cancel();
        }

        let mut first_error: Option<IngestError> = None;
        let mut reports = Vec::with_capacity(workers);
        for handle in handles {
            match handle.await {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => keep_first(&mut first_error, e),
                Err(join) => {
                    cancel.cancel();
                    keep_first(&mut first_error, IngestError::WorkerJoin(join));
                }
            }
        }

        monitor_stop.cancel();
        if let Some(monitor) = monitor {
            monitor.await.ok();
        }

        let stats = match produced {
            Ok(stats) => stats,
            Err(e) => {
                keep_first(&mut first_error, e);
                Default::default()
            }
        };
        if let Some(e) = first_error {
            return Err(e);
        }

        // A generator that died mid-stream may have produced a clean EOF
        lines.finish().await?;

        let finalized = if self.config.finalize {
            self.store.finalize().await?;
            true
        } else {
            info!("Skipping statistics refresh");
            false
        };

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            elapsed: start.elapsed(),
            batches: stats.batches,
            lines_read: stats.lines,
            lines_merged: progress.merged(),
            lines_rejected: progress.rejected(),
            retries: reports.iter().map(|r| r.retries).sum(),
            workers,
            finalized,
        };

        info!(
            %run_id,
            batches = summary.batches,
            lines_read = summary.lines_read,
            lines_merged = summary.lines_merged,
            lines_rejected = summary.lines_rejected,
            retries = summary.retries,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            "Ingest complete: {} hashes merged",
            format_count(summary.lines_merged)
        );

        Ok(summary)
    }
}

/// Keep the root cause: a real failure beats the aborts it triggered
fn keep_first(slot: &mut Option<IngestError>, err: IngestError) {
    match slot {
        None => *slot = Some(err),
        Some(existing) if existing.is_abort() && !err.is_abort() => *slot = Some(err),
        Some(_) => {}
    }
}
