//! Hashvault Ingest - bulk loader for the breached-password hash table

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hashvault_common::logging::{init_logging, LogConfig, LogLevel};
use hashvault_common::types::normalize_hash;
use hashvault_ingest::{
    HashStore, IngestConfig, IngestPipeline, LineSource, MemoryHashStore, PgHashStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "hashvault-ingest")]
#[command(author, version, about = "Bulk-load HASH:COUNT records into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest records from a file or a generator process
    Ingest {
        #[command(flatten)]
        options: IngestOptions,

        #[command(subcommand)]
        input: Option<Input>,
    },

    /// Create the canonical table if it does not exist
    InitSchema,

    /// Look up the stored count of a hash
    Lookup {
        /// Hex-encoded hash (case-insensitive)
        hash: String,
    },

    /// Refresh planner statistics on the canonical table
    Vacuum,
}

#[derive(Subcommand, Debug)]
enum Input {
    /// Read HASH:COUNT lines from a file
    File {
        path: PathBuf,
    },

    /// Read HASH:COUNT lines from a generator's stdout
    Generate {
        /// Program and arguments (default: haveibeenpwned-downloader)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[derive(clap::Args, Debug)]
struct IngestOptions {
    /// Number of merge workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Lines per batch
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Bounded queue capacity, in batches
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Retries per batch for transient store failures
    #[arg(long)]
    max_retries: Option<u32>,

    /// Skip VACUUM ANALYZE after the load
    #[arg(long)]
    no_finalize: bool,

    /// Merge into an in-memory table instead of PostgreSQL
    #[arg(long)]
    dry_run: bool,

    /// Print the run summary as JSON on stdout
    #[arg(long)]
    json_summary: bool,
}

impl IngestOptions {
    fn apply(&self, config: &mut IngestConfig) {
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if self.queue_capacity.is_some() {
            config.queue_capacity = self.queue_capacity;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if self.no_finalize {
            config.finalize = false;
        }
    }
}

impl Input {
    fn into_source(self) -> LineSource {
        match self {
            Input::File { path } => LineSource::File(path),
            Input::Generate { command } => {
                let mut parts = command.into_iter();
                match parts.next() {
                    Some(program) => LineSource::Command {
                        program,
                        args: parts.collect(),
                    },
                    None => LineSource::default_generator(),
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load .env before anything reads the environment
    let dotenv = IngestConfig::load_dotenv();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("hashvault-ingest")
        .build()
        .with_env_overrides()?;

    let _guard = init_logging(&log_config)?;
    if let Some(path) = dotenv {
        debug!(path = %path.display(), "Loaded environment file");
    }

    let mut config = IngestConfig::from_env().context("Failed to load configuration")?;

    match cli.command {
        Command::Ingest { options, input } => {
            options.apply(&mut config);
            config.validate().context("Invalid configuration")?;

            let source = match input {
                Some(input) => input.into_source(),
                None => LineSource::from_env().unwrap_or_else(LineSource::default_generator),
            };

            let store: Arc<dyn HashStore> = if options.dry_run {
                info!("Dry run: merging into an in-memory table");
                Arc::new(MemoryHashStore::new())
            } else {
                Arc::new(pg_store(&config)?)
            };

            let summary = IngestPipeline::new(config, store)
                .run(source)
                .await
                .context("Ingest failed")?;

            if options.json_summary {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        }

        Command::InitSchema => {
            config.validate().context("Invalid configuration")?;
            pg_store(&config)?
                .prepare()
                .await
                .context("Failed to create canonical table")?;
        }

        Command::Lookup { hash } => {
            config.validate().context("Invalid configuration")?;
            let key = normalize_hash(&hash, config.hash_length).context("Invalid hash")?;
            let count = pg_store(&config)?
                .lookup(&key)
                .await
                .context("Lookup failed")?;

            println!(
                "{}",
                serde_json::json!({
                    "hash": key,
                    "found": count.is_some(),
                    "count": count.unwrap_or(0),
                })
            );
        }

        Command::Vacuum => {
            config.validate().context("Invalid configuration")?;
            pg_store(&config)?
                .finalize()
                .await
                .context("VACUUM ANALYZE failed")?;
        }
    }

    Ok(())
}

fn pg_store(config: &IngestConfig) -> Result<PgHashStore> {
    PgHashStore::from_config(&config.database, config.tuning.clone(), config.hash_length)
        .context("Invalid database configuration")
}
