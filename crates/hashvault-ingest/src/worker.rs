//! Merge workers
//!
//! Each worker repeatedly takes a batch from the shared queue, filters it,
//! merges it through the [`HashStore`], and acknowledges it. A worker exits on
//! a stop marker, when the queue closes, or when the run is cancelled.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::{Batch, FilteredBatch};
use crate::error::{IngestError, IngestResult};
use crate::progress::ProgressCounter;
use crate::queue::{WorkItem, WorkReceiver};
use crate::store::{HashStore, MergeOutcome, StoreError};

/// Retry settings for a single batch
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `n × backoff`
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

/// What a worker did before it exited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub batches: u64,
    pub merged: u64,
    pub rejected: u64,
    pub retries: u64,
}

pub struct IngestWorker {
    id: usize,
    receiver: WorkReceiver,
    store: Arc<dyn HashStore>,
    progress: Arc<ProgressCounter>,
    cancel: CancellationToken,
    hash_length: Option<usize>,
    retry: RetryPolicy,
}

impl IngestWorker {
    pub fn new(
        id: usize,
        receiver: WorkReceiver,
        store: Arc<dyn HashStore>,
        progress: Arc<ProgressCounter>,
        cancel: CancellationToken,
        hash_length: Option<usize>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            id,
            receiver,
            store,
            progress,
            cancel,
            hash_length,
            retry,
        }
    }

    /// Dequeue loop. A fatal batch error cancels the whole run.
    pub async fn run(self) -> IngestResult<WorkerReport> {
        let mut report = WorkerReport::default();
        debug!(worker = self.id, "Worker started");

        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(worker = self.id, "Worker cancelled");
                    return Err(IngestError::Aborted);
                }
                item = self.receiver.recv() => item,
            };

            let batch = match item {
                Some(WorkItem::Batch(batch)) => batch,
                Some(WorkItem::Stop) | None => break,
            };

            let in_flight = InFlight::new(&self.receiver, &self.cancel);
            if let Err(e) = self.process(batch, &mut report).await {
                if !e.is_abort() {
                    error!(worker = self.id, error = %e, "Batch failed, aborting ingest");
                }
                in_flight.fail();
                return Err(e);
            }
            in_flight.complete();
        }

        debug!(
            worker = self.id,
            batches = report.batches,
            merged = report.merged,
            "Worker stopped"
        );
        Ok(report)
    }

    async fn process(&self, batch: Batch, report: &mut WorkerReport) -> IngestResult<()> {
        let filtered = FilteredBatch::from_batch(batch, self.hash_length);
        report.batches += 1;

        if filtered.rejected > 0 {
            report.rejected += filtered.rejected as u64;
            self.progress.add_rejected(filtered.rejected as u64);
            warn!(
                worker = self.id,
                batch_id = filtered.id,
                rejected = filtered.rejected,
                "Dropped malformed lines"
            );
        }

        if filtered.is_empty() {
            debug!(worker = self.id, batch_id = filtered.id, "Nothing to merge");
            return Ok(());
        }

        let outcome = self.merge_with_retry(&filtered, report).await?;

        let batch_size = filtered.len() as u64;
        report.merged += batch_size;
        let total = self.progress.add_merged(batch_size);
        info!(
            worker = self.id,
            batch_id = filtered.id,
            batch_size,
            rejected = filtered.rejected,
            changed = outcome.changed,
            total,
            "Batch merged"
        );
        Ok(())
    }

    async fn merge_with_retry(
        &self,
        batch: &FilteredBatch,
        report: &mut WorkerReport,
    ) -> IngestResult<MergeOutcome> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.store.merge_batch(batch).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => err,
            };

            if !should_retry(&err, attempt, self.retry.max_retries) {
                return Err(IngestError::Batch {
                    batch_id: batch.id,
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.retry.delay(attempt);
            report.retries += 1;
            warn!(
                worker = self.id,
                batch_id = batch.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying batch"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(IngestError::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Acknowledges the batch being processed exactly once.
///
/// Dropped without [`InFlight::complete`] (an error, a panic unwinding the
/// task, or the task being aborted) it cancels the run first, so the drain
/// never observes an empty queue for a failed run.
struct InFlight<'a> {
    receiver: &'a WorkReceiver,
    cancel: &'a CancellationToken,
    succeeded: bool,
}

impl<'a> InFlight<'a> {
    fn new(receiver: &'a WorkReceiver, cancel: &'a CancellationToken) -> Self {
        Self {
            receiver,
            cancel,
            succeeded: false,
        }
    }

    fn complete(mut self) {
        self.succeeded = true;
    }

    fn fail(self) {}
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.succeeded {
            self.cancel.cancel();
        }
        self.receiver.task_done();
    }
}

fn should_retry(err: &StoreError, attempt: u32, max_retries: u32) -> bool {
    err.is_retryable() && attempt <= max_retries
}
