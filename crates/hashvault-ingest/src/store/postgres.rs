//! PostgreSQL canonical store
//!
//! Each batch attempt runs on its own freshly opened, tuned session:
//!
//! ```text
//! BEGIN
//! CREATE TEMP TABLE hash_stage_N (...) ON COMMIT DROP
//! COPY hash_stage_N FROM STDIN          -- bulk load
//! INSERT INTO hashes SELECT ... GROUP BY hash ON CONFLICT DO UPDATE ...
//! COMMIT                                -- staging dropped here
//! ```
//!
//! The staging table is session-private, so concurrent workers never see each
//! other's staging data, and a failed attempt leaves nothing behind.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::session::SessionTuning;
use super::{staging_table_name, HashStore, MergeOutcome, StoreError, CANONICAL_TABLE};
use crate::batch::FilteredBatch;
use crate::config::DatabaseConfig;

/// Bytes buffered before each COPY round trip
const COPY_CHUNK_BYTES: usize = 4 * 1024 * 1024;

/// SQLSTATE `duplicate_table`
const DUPLICATE_TABLE: &str = "42P07";

pub struct PgHashStore {
    options: PgConnectOptions,
    connect_timeout: Duration,
    tuning: SessionTuning,
    hash_length: Option<usize>,
}

impl PgHashStore {
    pub fn new(
        options: PgConnectOptions,
        connect_timeout: Duration,
        tuning: SessionTuning,
        hash_length: Option<usize>,
    ) -> Self {
        Self {
            options,
            connect_timeout,
            tuning,
            hash_length,
        }
    }

    pub fn from_config(
        database: &DatabaseConfig,
        tuning: SessionTuning,
        hash_length: Option<usize>,
    ) -> hashvault_common::Result<Self> {
        Ok(Self::new(
            database.connect_options()?,
            database.connect_timeout(),
            tuning,
            hash_length,
        ))
    }

    /// Open and tune a new session
    async fn session(&self) -> Result<PgConnection, StoreError> {
        let mut conn = tokio::time::timeout(self.connect_timeout, PgConnection::connect_with(&self.options))
            .await
            .map_err(|_| StoreError::ConnectTimeout(self.connect_timeout))?
            .map_err(StoreError::Connect)?;

        self.tuning
            .apply(&mut conn)
            .await
            .map_err(StoreError::query("session tuning"))?;
        Ok(conn)
    }

    fn create_table_sql(&self) -> String {
        create_table_sql(self.hash_length)
    }
}

fn create_table_sql(hash_length: Option<usize>) -> String {
    let hash_type = match hash_length {
        Some(n) => format!("CHAR({})", n),
        None => "TEXT".to_string(),
    };
    format!(
        "CREATE TABLE IF NOT EXISTS {} (hash {} PRIMARY KEY, count BIGINT NOT NULL)",
        CANONICAL_TABLE, hash_type
    )
}

fn create_staging_sql(table: &str) -> String {
    format!(
        "CREATE TEMP TABLE {} (hash TEXT NOT NULL, count BIGINT NOT NULL) ON COMMIT DROP",
        table
    )
}

fn copy_sql(table: &str) -> String {
    format!(
        "COPY {} (hash, count) FROM STDIN WITH (FORMAT text, DELIMITER ':')",
        table
    )
}

/// Deduplicate the staging rows and fold them into the canonical table.
/// Rows are sorted so concurrent merges lock keys in the same order.
fn merge_sql(table: &str) -> String {
    format!(
        "INSERT INTO {canonical} (hash, count) \
         SELECT hash, MAX(count) FROM {staging} GROUP BY hash ORDER BY hash \
         ON CONFLICT (hash) DO UPDATE SET count = GREATEST({canonical}.count, EXCLUDED.count) \
         WHERE {canonical}.count < EXCLUDED.count",
        canonical = CANONICAL_TABLE,
        staging = table
    )
}

fn is_duplicate_table(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == DUPLICATE_TABLE)
}

#[async_trait]
impl HashStore for PgHashStore {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn prepare(&self) -> Result<(), StoreError> {
        let mut conn = self.session().await?;
        sqlx::query(&self.create_table_sql())
            .execute(&mut conn)
            .await
            .map_err(StoreError::query("create canonical table"))?;
        conn.close().await.ok();

        info!(table = CANONICAL_TABLE, "Canonical table ready");
        Ok(())
    }

    async fn merge_batch(&self, batch: &FilteredBatch) -> Result<MergeOutcome, StoreError> {
        let start = Instant::now();
        let staging = staging_table_name(batch.id);

        let mut conn = self.session().await?;
        let mut tx = conn.begin().await.map_err(StoreError::query("begin"))?;

        sqlx::query(&create_staging_sql(&staging))
            .execute(&mut *tx)
            .await
            .map_err(|source| {
                if is_duplicate_table(&source) {
                    StoreError::StagingCollision {
                        table: staging.clone(),
                    }
                } else {
                    StoreError::Query {
                        operation: "create staging table",
                        source,
                    }
                }
            })?;

        let copy_start = Instant::now();
        let mut copy = tx
            .copy_in_raw(&copy_sql(&staging))
            .await
            .map_err(StoreError::query("COPY start"))?;

        let mut buf = Vec::with_capacity(COPY_CHUNK_BYTES + 64);
        for record in &batch.records {
            // Hashes are hex-only, so no COPY escaping is needed
            buf.extend_from_slice(record.hash.as_bytes());
            buf.push(b':');
            buf.extend_from_slice(record.count.to_string().as_bytes());
            buf.push(b'\n');

            if buf.len() >= COPY_CHUNK_BYTES {
                copy.send(buf.as_slice())
                    .await
                    .map_err(StoreError::query("COPY send"))?;
                buf.clear();
            }
        }
        if !buf.is_empty() {
            copy.send(buf.as_slice())
                .await
                .map_err(StoreError::query("COPY send"))?;
        }
        let staged = copy.finish().await.map_err(StoreError::query("COPY finish"))?;
        let copy_time = copy_start.elapsed();

        let merge_start = Instant::now();
        let changed = sqlx::query(&merge_sql(&staging))
            .execute(&mut *tx)
            .await
            .map_err(StoreError::query("merge"))?
            .rows_affected();

        tx.commit().await.map_err(StoreError::query("commit"))?;
        conn.close().await.ok();

        debug!(
            batch_id = batch.id,
            staged,
            changed,
            copy_ms = copy_time.as_millis() as u64,
            merge_ms = merge_start.elapsed().as_millis() as u64,
            total_ms = start.elapsed().as_millis() as u64,
            "Batch merged into canonical table"
        );

        Ok(MergeOutcome { staged, changed })
    }

    async fn finalize(&self) -> Result<(), StoreError> {
        let start = Instant::now();
        let mut conn = self.session().await?;

        info!(table = CANONICAL_TABLE, "Refreshing planner statistics");
        // Unbound `&str`: sent unprepared over the simple-query protocol
        let vacuum = format!("VACUUM ANALYZE {}", CANONICAL_TABLE);
        sqlx::Executor::execute(&mut conn, vacuum.as_str())
            .await
            .map_err(StoreError::query("VACUUM ANALYZE"))?;
        conn.close().await.ok();

        info!(
            table = CANONICAL_TABLE,
            duration_secs = start.elapsed().as_secs_f64(),
            "Statistics refreshed"
        );
        Ok(())
    }

    async fn lookup(&self, hash: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.session().await?;
        let count: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT count FROM {} WHERE hash = $1",
            CANONICAL_TABLE
        ))
        .bind(hash)
        .fetch_optional(&mut conn)
        .await
        .map_err(StoreError::query("lookup"))?;
        conn.close().await.ok();

        count
            .map(|c| {
                u64::try_from(c).map_err(|_| StoreError::InvalidCount {
                    hash: hash.to_string(),
                    count: c,
                })
            })
            .transpose()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_create_table_sql_uses_fixed_width_when_known() {
        assert_eq!(
            create_table_sql(Some(40)),
            "CREATE TABLE IF NOT EXISTS hashes (hash CHAR(40) PRIMARY KEY, count BIGINT NOT NULL)"
        );
        assert!(create_table_sql(None).contains("hash TEXT PRIMARY KEY"));
    }

    #[test]
    fn test_staging_is_session_private() {
        let sql = create_staging_sql("hash_stage_4");
        assert!(sql.starts_with("CREATE TEMP TABLE hash_stage_4"));
        assert!(sql.ends_with("ON COMMIT DROP"));
    }

    #[test]
    fn test_copy_uses_colon_delimiter() {
        assert_eq!(
            copy_sql("hash_stage_1"),
            "COPY hash_stage_1 (hash, count) FROM STDIN WITH (FORMAT text, DELIMITER ':')"
        );
    }

    #[test]
    fn test_merge_sql_keeps_maximum() {
        let sql = merge_sql("hash_stage_2");
        assert!(sql.contains("SELECT hash, MAX(count) FROM hash_stage_2 GROUP BY hash ORDER BY hash"));
        assert!(sql.contains("GREATEST(hashes.count, EXCLUDED.count)"));
        assert!(sql.contains("WHERE hashes.count < EXCLUDED.count"));
    }

    #[test]
    fn test_duplicate_table_detection_ignores_other_errors() {
        assert!(!is_duplicate_table(&sqlx::Error::RowNotFound));
    }

    #[tokio::test]
    async fn test_store_calls_run_on_spawned_tasks() {
        // Nothing listens on port 1; every call fails at connect time, after
        // the session and tuning futures have been driven on another task.
        let options = PgConnectOptions::new().host("127.0.0.1").port(1);
        let store: std::sync::Arc<dyn HashStore> = std::sync::Arc::new(PgHashStore::new(
            options,
            Duration::from_secs(2),
            SessionTuning::default(),
            Some(40),
        ));

        let finalize = tokio::spawn({
            let store = store.clone();
            async move { store.finalize().await }
        });
        let prepare = tokio::spawn({
            let store = store.clone();
            async move { store.prepare().await }
        });

        for result in [finalize.await.unwrap(), prepare.await.unwrap()] {
            let err = result.unwrap_err();
            assert!(err.is_retryable(), "unexpected error: {}", err);
        }
    }
}
