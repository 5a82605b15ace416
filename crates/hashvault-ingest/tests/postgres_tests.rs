//! PostgreSQL end-to-end tests
//!
//! Require Docker. Run with:
//!
//! ```bash
//! cargo test -p hashvault-ingest --test postgres_tests -- --ignored
//! ```

use anyhow::Result;
use hashvault_ingest::batch::FilteredBatch;
use hashvault_ingest::store::session::SessionTuning;
use hashvault_ingest::{HashStore, IngestConfig, IngestPipeline, LineSource, PgHashStore};
use hashvault_common::HashRecord;
use serial_test::serial;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::info;

const A: &str = "5BAA61E4C9B93F3F0682250B6CF8331B7EE68FD8";
const B: &str = "7C4A8D09CA3762AF61E59520943DC26494F8941B";

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,hashvault_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

async fn start_postgres() -> Result<(ContainerAsync<Postgres>, String)> {
    let container = Postgres::default().with_tag("16-alpine").start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);
    Ok((container, url))
}

fn store(url: &str) -> Result<PgHashStore> {
    Ok(PgHashStore::new(
        PgConnectOptions::from_str(url)?,
        Duration::from_secs(10),
        SessionTuning::default(),
        Some(40),
    ))
}

fn config(workers: usize, batch_size: usize) -> IngestConfig {
    IngestConfig {
        workers,
        batch_size,
        progress_interval: None,
        retry_backoff: Duration::from_millis(50),
        ..Default::default()
    }
}

async fn ingest_lines(store: Arc<dyn HashStore>, cfg: IngestConfig, lines: &[String]) -> Result<hashvault_ingest::RunSummary> {
    let mut file = tempfile::NamedTempFile::new()?;
    for line in lines {
        writeln!(file, "{}", line)?;
    }
    file.flush()?;
    Ok(IngestPipeline::new(cfg, store)
        .run(LineSource::File(file.path().to_path_buf()))
        .await?)
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_merge_keeps_maximum_across_runs() -> Result<()> {
    init_tracing();
    let (_container, url) = start_postgres().await?;
    let store = Arc::new(store(&url)?);

    let lines = vec![format!("{}:5", A), format!("{}:3", A), format!("{}:1", B)];
    let summary = ingest_lines(store.clone(), config(2, 2), &lines).await?;
    info!(?summary, "First run complete");

    assert_eq!(store.lookup(A).await?, Some(5));
    assert_eq!(store.lookup(B).await?, Some(1));
    assert_eq!(summary.lines_merged, 3);
    assert!(summary.finalized);

    ingest_lines(store.clone(), config(2, 2), &[format!("{}:2", A), format!("{}:8", B)]).await?;
    assert_eq!(store.lookup(A).await?, Some(5));
    assert_eq!(store.lookup(B).await?, Some(8));
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_concurrent_workers_with_overlapping_batches() -> Result<()> {
    init_tracing();
    let (_container, url) = start_postgres().await?;
    let store = Arc::new(store(&url)?);

    // Every batch touches the same small key space
    let lines: Vec<String> = (0..5_000u64)
        .map(|i| format!("{:040X}:{}", i % 97, i))
        .collect();
    ingest_lines(store.clone(), config(6, 250), &lines).await?;

    let pool = PgPoolOptions::new().max_connections(1).connect(&url).await?;
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM hashes").fetch_one(&pool).await?;
    assert_eq!(rows, 97);

    let max: i64 = sqlx::query_scalar("SELECT count FROM hashes WHERE hash = $1")
        .bind(format!("{:040X}", 0))
        .fetch_one(&pool)
        .await?;
    assert_eq!(max, (0..5_000i64).filter(|i| i % 97 == 0).max().unwrap_or(0));
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_staging_tables_do_not_outlive_the_batch() -> Result<()> {
    init_tracing();
    let (_container, url) = start_postgres().await?;
    let store = store(&url)?;
    store.prepare().await?;

    let batch = FilteredBatch {
        id: 1,
        records: vec![HashRecord::new(A, 4), HashRecord::new(A, 6)],
        rejected: 0,
    };
    let outcome = store.merge_batch(&batch).await?;
    assert_eq!(outcome.staged, 2);
    assert_eq!(outcome.changed, 1);

    // Same id again: a fresh session, so no collision, and nothing changes
    let again = store.merge_batch(&batch).await?;
    assert_eq!(again.changed, 0);

    let pool = PgPoolOptions::new().max_connections(1).connect(&url).await?;
    let leftovers: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pg_class WHERE relname LIKE 'hash_stage_%'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(leftovers, 0);
    assert_eq!(store.lookup(A).await?, Some(6));
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_lookup_absent_hash_and_vacuum() -> Result<()> {
    init_tracing();
    let (_container, url) = start_postgres().await?;
    let store = store(&url)?;

    store.prepare().await?;
    store.prepare().await?;
    assert_eq!(store.lookup(B).await?, None);
    store.finalize().await?;
    Ok(())
}
