//! Bounded work queue between the producer and the worker pool
//!
//! A FIFO `tokio::sync::mpsc` channel of fixed capacity. The producer blocks
//! while it is full, which caps buffered input at `capacity × batch_size`
//! lines. Workers share the receiving half and each block until an item or a
//! stop marker arrives.
//!
//! Shutdown follows drain-then-poison-pill: [`WorkSender::join`] waits until
//! every submitted batch has been acknowledged with
//! [`WorkReceiver::task_done`], then [`WorkSender::stop_workers`] enqueues one
//! [`WorkItem::Stop`] per worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::batch::Batch;
use crate::error::{IngestError, IngestResult};

/// A unit of work for the pool
#[derive(Debug)]
pub enum WorkItem {
    Batch(Batch),
    /// Terminal marker: the worker that receives it exits
    Stop,
}

#[derive(Debug, Default)]
struct Outstanding {
    count: AtomicU64,
    drained: Notify,
}

/// Producer half
#[derive(Debug, Clone)]
pub struct WorkSender {
    tx: mpsc::Sender<WorkItem>,
    outstanding: Arc<Outstanding>,
}

/// Consumer half, cloned into every worker
#[derive(Debug, Clone)]
pub struct WorkReceiver {
    rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    outstanding: Arc<Outstanding>,
}

/// Create a bounded queue holding at most `capacity` items (minimum 1)
pub fn work_queue(capacity: usize) -> (WorkSender, WorkReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let outstanding = Arc::new(Outstanding::default());
    (
        WorkSender {
            tx,
            outstanding: outstanding.clone(),
        },
        WorkReceiver {
            rx: Arc::new(Mutex::new(rx)),
            outstanding,
        },
    )
}

impl WorkSender {
    /// Enqueue a batch, waiting while the queue is full
    ///
    /// The batch counts as outstanding from the start of the call. If the send
    /// fails, or this future is dropped while waiting, the count is released.
    pub async fn submit(&self, batch: Batch) -> IngestResult<()> {
        let pending = Pending::new(&self.outstanding);
        self.tx
            .send(WorkItem::Batch(batch))
            .await
            .map_err(|_| IngestError::QueueClosed)?;
        pending.enqueued();
        Ok(())
    }

    /// Wait until every submitted batch has been acknowledged
    pub async fn join(&self) {
        loop {
            let drained = self.outstanding.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.outstanding.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Enqueue one stop marker per worker
    pub async fn stop_workers(&self, workers: usize) -> IngestResult<()> {
        for _ in 0..workers {
            self.tx
                .send(WorkItem::Stop)
                .await
                .map_err(|_| IngestError::QueueClosed)?;
        }
        Ok(())
    }

    /// Batches submitted but not yet acknowledged
    pub fn outstanding(&self) -> u64 {
        self.outstanding.count.load(Ordering::SeqCst)
    }

    /// Items currently buffered in the channel
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

}

/// An outstanding slot taken by a submission that has not reached the channel
struct Pending<'a> {
    outstanding: Option<&'a Outstanding>,
}

impl<'a> Pending<'a> {
    fn new(outstanding: &'a Outstanding) -> Self {
        outstanding.count.fetch_add(1, Ordering::SeqCst);
        Self {
            outstanding: Some(outstanding),
        }
    }

    /// The batch is in the channel; a worker acknowledges it from here on
    fn enqueued(mut self) {
        self.outstanding = None;
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if let Some(outstanding) = self.outstanding {
            release(outstanding);
        }
    }
}

impl WorkReceiver {
    /// Wait for the next item; `None` once every sender is gone and the queue is empty
    pub async fn recv(&self) -> Option<WorkItem> {
        self.rx.lock().await.recv().await
    }

    /// Acknowledge a batch taken from the queue, whether it succeeded or not
    pub fn task_done(&self) {
        release(&self.outstanding);
    }
}

fn release(outstanding: &Outstanding) {
    let previous = outstanding
        .count
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .unwrap_or(0);
    if previous == 1 {
        outstanding.drained.notify_waiters();
    }
}
