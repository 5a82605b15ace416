//! In-process store with the same merge semantics as PostgreSQL
//!
//! Backs `--dry-run` and the pipeline tests. Staging is modelled as a set of
//! live batch ids so that a reused staging name fails the same way it would in
//! the database.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

use super::{staging_table_name, HashStore, MergeOutcome, StoreError};
use crate::batch::FilteredBatch;

#[derive(Debug, Default)]
pub struct MemoryHashStore {
    table: Mutex<HashMap<String, u64>>,
    staging: Mutex<HashSet<u64>>,
    merges: AtomicU64,
    finalized: AtomicU64,
}

impl MemoryHashStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `records`, as if loaded by an earlier run
    pub fn with_records<I, S>(records: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        let table = records.into_iter().map(|(h, c)| (h.into(), c)).collect();
        Self {
            table: Mutex::new(table),
            ..Default::default()
        }
    }

    /// Sorted copy of the canonical table
    pub async fn snapshot(&self) -> BTreeMap<String, u64> {
        self.table
            .lock()
            .await
            .iter()
            .map(|(h, c)| (h.clone(), *c))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.lock().await.is_empty()
    }

    /// Batches merged so far
    pub fn merge_count(&self) -> u64 {
        self.merges.load(Ordering::SeqCst)
    }

    /// Times the statistics refresh ran
    pub fn finalize_count(&self) -> u64 {
        self.finalized.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HashStore for MemoryHashStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn prepare(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn merge_batch(&self, batch: &FilteredBatch) -> Result<MergeOutcome, StoreError> {
        if !self.staging.lock().await.insert(batch.id) {
            return Err(StoreError::StagingCollision {
                table: staging_table_name(batch.id),
            });
        }

        // Deduplicate within the batch first, keeping the largest count
        let mut staged: HashMap<&str, u64> = HashMap::with_capacity(batch.records.len());
        for record in &batch.records {
            staged
                .entry(record.hash.as_str())
                .and_modify(|c| *c = (*c).max(record.count))
                .or_insert(record.count);
        }

        let mut changed = 0u64;
        {
            let mut table = self.table.lock().await;
            for (hash, count) in staged {
                match table.get_mut(hash) {
                    Some(existing) if *existing < count => {
                        *existing = count;
                        changed += 1;
                    }
                    Some(_) => {}
                    None => {
                        table.insert(hash.to_string(), count);
                        changed += 1;
                    }
                }
            }
        }

        self.staging.lock().await.remove(&batch.id);
        self.merges.fetch_add(1, Ordering::SeqCst);

        debug!(batch_id = batch.id, staged = batch.len(), changed, "Batch merged in memory");
        Ok(MergeOutcome {
            staged: batch.len() as u64,
            changed,
        })
    }

    async fn finalize(&self) -> Result<(), StoreError> {
        self.finalized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn lookup(&self, hash: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.table.lock().await.get(hash).copied())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use hashvault_common::HashRecord;

    fn batch(id: u64, records: &[(&str, u64)]) -> FilteredBatch {
        FilteredBatch {
            id,
            records: records.iter().map(|(h, c)| HashRecord::new(*h, *c)).collect(),
            rejected: 0,
        }
    }

    #[tokio::test]
    async fn test_in_batch_duplicates_keep_max() {
        let store = MemoryHashStore::new();
        let outcome = store
            .merge_batch(&batch(1, &[("AA", 5), ("AA", 3), ("BB", 1)]))
            .await
            .unwrap();

        assert_eq!(outcome, MergeOutcome { staged: 3, changed: 2 });
        assert_eq!(store.lookup("AA").await.unwrap(), Some(5));
        assert_eq!(store.lookup("BB").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_lower_count_never_overwrites() {
        let store = MemoryHashStore::with_records([("AA", 5)]);
        let outcome = store.merge_batch(&batch(1, &[("AA", 2)])).await.unwrap();

        assert_eq!(outcome.changed, 0);
        assert_eq!(store.lookup("AA").await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_higher_count_raises_row() {
        let store = MemoryHashStore::with_records([("AA", 5)]);
        let outcome = store.merge_batch(&batch(2, &[("AA", 9)])).await.unwrap();

        assert_eq!(outcome.changed, 1);
        assert_eq!(store.lookup("AA").await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_remerge_is_idempotent() {
        let store = MemoryHashStore::new();
        let b = batch(1, &[("AA", 5), ("BB", 1)]);
        store.merge_batch(&b).await.unwrap();
        let first = store.snapshot().await;

        let again = store.merge_batch(&b).await.unwrap();
        assert_eq!(again.changed, 0);
        assert_eq!(store.snapshot().await, first);
        assert_eq!(store.merge_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_staging_name_collides() {
        let store = MemoryHashStore::new();
        store.staging.lock().await.insert(7);

        let result = store.merge_batch(&batch(7, &[("AA", 1)])).await;
        assert!(matches!(result, Err(StoreError::StagingCollision { .. })));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_lookup_absent_and_finalize_count() {
        let store = MemoryHashStore::new();
        assert_eq!(store.lookup("FF").await.unwrap(), None);
        store.finalize().await.unwrap();
        assert_eq!(store.finalize_count(), 1);
    }
}
