//! Batching of the raw line stream
//!
//! The producer groups lines into batches of at most `batch_size` and numbers
//! them 1, 2, 3, ... Batch ids are diagnostic and make staging names unique;
//! they impose no ordering on the merge.

use futures::{Stream, StreamExt};
use hashvault_common::{types::parse_line, HashRecord};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{IngestError, IngestResult};
use crate::queue::WorkSender;

/// A group of raw, unvalidated input lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub id: u64,
    pub lines: Vec<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// A batch after malformed lines have been dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredBatch {
    pub id: u64,
    pub records: Vec<HashRecord>,
    /// Lines dropped as malformed
    pub rejected: usize,
}

impl FilteredBatch {
    /// Validate every line, keeping the well-formed records in input order
    pub fn from_batch(batch: Batch, expected_hash_len: Option<usize>) -> Self {
        let mut records = Vec::with_capacity(batch.lines.len());
        let mut rejected = 0;

        for line in &batch.lines {
            match parse_line(line, expected_hash_len) {
                Ok(record) => records.push(record),
                Err(reason) => {
                    rejected += 1;
                    trace!(batch_id = batch.id, %reason, "Dropping malformed line");
                }
            }
        }

        Self {
            id: batch.id,
            records,
            rejected,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Totals reported by the producer once the input is exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatcherStats {
    pub batches: u64,
    pub lines: u64,
}

/// Accumulates lines into fixed-size batches
#[derive(Debug)]
pub struct Batcher {
    batch_size: usize,
    next_id: u64,
    pending: Vec<String>,
    stats: BatcherStats,
}

impl Batcher {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            next_id: 1,
            pending: Vec::with_capacity(batch_size),
            stats: BatcherStats::default(),
        }
    }

    /// Add a line; returns a full batch once the threshold is reached
    pub fn push(&mut self, line: String) -> Option<Batch> {
        self.pending.push(line);
        self.stats.lines += 1;
        if self.pending.len() >= self.batch_size {
            let lines = std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size));
            Some(self.seal(lines))
        } else {
            None
        }
    }

    /// The trailing partial batch. Empty input still yields one (empty) batch;
    /// an empty remainder after full batches yields none.
    pub fn finish(&mut self) -> Option<Batch> {
        if self.pending.is_empty() && self.stats.batches > 0 {
            return None;
        }
        let lines = std::mem::take(&mut self.pending);
        Some(self.seal(lines))
    }

    pub fn stats(&self) -> BatcherStats {
        self.stats
    }

    fn seal(&mut self, lines: Vec<String>) -> Batch {
        let id = self.next_id;
        self.next_id += 1;
        self.stats.batches += 1;
        Batch { id, lines }
    }

    /// Drain `lines` into the work queue, blocking whenever the queue is full.
    ///
    /// A read error is fatal. Cancellation (a worker failed) stops the
    /// producer at the next line or blocked submission.
    pub async fn run<S>(
        mut self,
        mut lines: S,
        queue: &WorkSender,
        cancel: &CancellationToken,
    ) -> IngestResult<BatcherStats>
    where
        S: Stream<Item = std::io::Result<String>> + Unpin,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IngestError::Aborted),
                next = lines.next() => next,
            };

            let Some(line) = next else { break };
            let line = line.map_err(IngestError::Read)?;

            if let Some(batch) = self.push(line) {
                submit(queue, batch, cancel).await?;
            }
        }

        if let Some(batch) = self.finish() {
            submit(queue, batch, cancel).await?;
        }

        Ok(self.stats)
    }
}

async fn submit(queue: &WorkSender, batch: Batch, cancel: &CancellationToken) -> IngestResult<()> {
    let (id, len) = (batch.id, batch.len());
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(IngestError::Aborted),
        sent = queue.submit(batch) => {
            sent?;
            debug!(batch_id = id, batch_size = len, "Batch queued");
            Ok(())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::queue::{work_queue, WorkItem};

    fn lines(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{:040X}:{}", i, i)).collect()
    }

    #[test]
    fn test_push_emits_full_batches_with_increasing_ids() {
        let mut batcher = Batcher::new(2);
        let mut emitted = Vec::new();
        for line in lines(5) {
            if let Some(batch) = batcher.push(line) {
                emitted.push(batch);
            }
        }
        emitted.extend(batcher.finish());

        let ids: Vec<u64> = emitted.iter().map(|b| b.id).collect();
        let sizes: Vec<usize> = emitted.iter().map(Batch::len).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(batcher.stats(), BatcherStats { batches: 3, lines: 5 });
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let mut batcher = Batcher::new(2);
        let full: Vec<Batch> = lines(4).into_iter().filter_map(|l| batcher.push(l)).collect();
        assert_eq!(full.len(), 2);
        assert!(batcher.finish().is_none());
    }

    #[test]
    fn test_empty_input_still_submits_one_batch() {
        let mut batcher = Batcher::new(10);
        let tail = batcher.finish().unwrap();
        assert_eq!(tail.id, 1);
        assert!(tail.is_empty());
    }

    #[test]
    fn test_filtered_batch_drops_malformed_lines() {
        let batch = Batch {
            id: 9,
            lines: vec![
                format!("{}:5", "a".repeat(40)),
                "no delimiter".to_string(),
                format!("{}:many", "b".repeat(40)),
                ":3".to_string(),
                format!("{}:1", "c".repeat(40)),
            ],
        };

        let filtered = FilteredBatch::from_batch(batch, Some(40));
        assert_eq!(filtered.id, 9);
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered.rejected, 3);
        assert_eq!(filtered.records[0].hash, "A".repeat(40));
        assert_eq!(filtered.records[1].count, 1);
    }

    #[tokio::test]
    async fn test_run_submits_every_batch() {
        let (sender, receiver) = work_queue(8);
        let cancel = CancellationToken::new();
        let stream = futures::stream::iter(lines(7).into_iter().map(Ok));

        let stats = Batcher::new(3).run(stream, &sender, &cancel).await.unwrap();
        assert_eq!(stats, BatcherStats { batches: 3, lines: 7 });

        let mut sizes = Vec::new();
        for _ in 0..3 {
            match receiver.recv().await {
                Some(WorkItem::Batch(batch)) => sizes.push(batch.len()),
                other => panic!("unexpected item: {:?}", other),
            }
        }
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn test_run_propagates_read_errors() {
        let (sender, _receiver) = work_queue(8);
        let cancel = CancellationToken::new();
        let stream = futures::stream::iter(vec![
            Ok("A:1".to_string()),
            Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated")),
        ]);

        let result = Batcher::new(10).run(stream, &sender, &cancel).await;
        assert!(matches!(result, Err(IngestError::Read(_))));
    }

    #[tokio::test]
    async fn test_run_stops_when_cancelled() {
        let (sender, _receiver) = work_queue(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stream = futures::stream::iter(lines(10).into_iter().map(Ok));
        let result = Batcher::new(1).run(stream, &sender, &cancel).await;
        assert!(matches!(result, Err(IngestError::Aborted)));
    }
}
