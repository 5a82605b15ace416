//! Shared progress counter and periodic rate reporting
//!
//! Workers add the size of each successfully merged batch; the running total
//! after each increment is what they log, so totals are never lost under
//! concurrent updates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Process-wide counters updated by every worker
#[derive(Debug, Default)]
pub struct ProgressCounter {
    merged: AtomicU64,
    rejected: AtomicU64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `records` merged lines and return the new total
    pub fn add_merged(&self, records: u64) -> u64 {
        self.merged.fetch_add(records, Ordering::SeqCst) + records
    }

    pub fn add_rejected(&self, lines: u64) -> u64 {
        self.rejected.fetch_add(lines, Ordering::SeqCst) + lines
    }

    pub fn merged(&self) -> u64 {
        self.merged.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }
}

/// Logs throughput at a fixed interval until cancelled
pub struct ProgressMonitor;

impl ProgressMonitor {
    pub fn spawn(
        counter: Arc<ProgressCounter>,
        every: Duration,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            let mut last = 0u64;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let total = counter.merged();
                let elapsed = started.elapsed().as_secs_f64();
                let rate = if elapsed > 0.0 { total as f64 / elapsed } else { 0.0 };
                info!(
                    total,
                    since_last = total - last,
                    rejected = counter.rejected(),
                    lines_per_sec = rate.round() as u64,
                    "Ingest progress"
                );
                last = total;
            }
        })
    }
}

/// Human-readable line count, e.g. `1.25M`
pub fn format_count(n: u64) -> String {
    const UNITS: &[&str] = &["", "K", "M", "B"];
    let mut value = n as f64;
    let mut unit = 0;

    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{}", n)
    } else {
        format!("{:.2}{}", value, UNITS[unit])
    }
}
