//! Configuration management
//!
//! Values come from the environment (optionally seeded from a `.env` file),
//! fall back to the defaults below, and can be overridden by CLI flags before
//! [`IngestConfig::validate`] runs.

use hashvault_common::{types::DEFAULT_HASH_LENGTH, HashvaultError};
use serde::Serialize;
use sqlx::postgres::PgConnectOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::store::session::SessionTuning;

// ============================================================================
// Defaults
// ============================================================================

/// Default database name.
pub const DEFAULT_DB_NAME: &str = "pwned";

/// Default database user.
pub const DEFAULT_DB_USER: &str = "pwned_user";

/// Default database host.
pub const DEFAULT_DB_HOST: &str = "localhost";

/// Default database port.
pub const DEFAULT_DB_PORT: u16 = 5432;

/// Default connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default number of lines per batch.
pub const DEFAULT_BATCH_SIZE: usize = 1_000_000;

/// Queue capacity per worker when no explicit capacity is configured.
pub const QUEUE_SLOTS_PER_WORKER: usize = 2;

/// Default retries per batch for retryable store failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay between batch retries, in milliseconds.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// Default interval of the progress monitor, in seconds.
pub const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 30;

/// One worker per core, leaving one core for the producer.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Connection parameters of the canonical store
#[derive(Clone, Serialize)]
pub struct DatabaseConfig {
    /// Full connection URL; takes precedence over the discrete fields
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip)]
    pub password: String,
    pub database: String,
    pub connect_timeout_secs: u64,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: DEFAULT_DB_HOST.to_string(),
            port: DEFAULT_DB_PORT,
            user: DEFAULT_DB_USER.to_string(),
            password: String::new(),
            database: DEFAULT_DB_NAME.to_string(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl DatabaseConfig {
    /// Load from `DATABASE_URL` or `DB_NAME`, `DB_USER`, `DB_PASS`, `DB_HOST`, `DB_PORT`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            host: std::env::var("DB_HOST").unwrap_or(defaults.host),
            port: env_or("DB_PORT", defaults.port),
            user: std::env::var("DB_USER").unwrap_or(defaults.user),
            password: std::env::var("DB_PASS").unwrap_or(defaults.password),
            database: std::env::var("DB_NAME").unwrap_or(defaults.database),
            connect_timeout_secs: env_or("DB_CONNECT_TIMEOUT", defaults.connect_timeout_secs),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Build sqlx connect options for a fresh session
    pub fn connect_options(&self) -> hashvault_common::Result<PgConnectOptions> {
        let options = match self.url {
            Some(ref url) => PgConnectOptions::from_str(url)
                .map_err(|e| HashvaultError::config(format!("invalid DATABASE_URL: {}", e)))?,
            None => PgConnectOptions::new()
                .host(&self.host)
                .port(self.port)
                .username(&self.user)
                .password(&self.password)
                .database(&self.database),
        };
        Ok(options.application_name("hashvault-ingest"))
    }

    pub fn validate(&self) -> hashvault_common::Result<()> {
        if self.url.is_none() {
            if self.host.trim().is_empty() {
                return Err(HashvaultError::config("database host cannot be empty"));
            }
            if self.database.trim().is_empty() {
                return Err(HashvaultError::config("database name cannot be empty"));
            }
            if self.port == 0 {
                return Err(HashvaultError::config("database port must be greater than 0"));
            }
        }
        Ok(())
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize)]
pub struct IngestConfig {
    pub database: DatabaseConfig,
    pub workers: usize,
    pub batch_size: usize,
    /// Bounded queue capacity; `None` means `QUEUE_SLOTS_PER_WORKER * workers`
    pub queue_capacity: Option<usize>,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Required hash width; `None` accepts any non-empty hex hash
    pub hash_length: Option<usize>,
    /// Period of the progress monitor; `None` disables it
    pub progress_interval: Option<Duration>,
    /// Run `VACUUM ANALYZE` once all workers have exited
    pub finalize: bool,
    pub tuning: SessionTuning,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            workers: default_workers(),
            batch_size: DEFAULT_BATCH_SIZE,
            queue_capacity: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            hash_length: Some(DEFAULT_HASH_LENGTH),
            progress_interval: Some(Duration::from_secs(DEFAULT_PROGRESS_INTERVAL_SECS)),
            finalize: true,
            tuning: SessionTuning::default(),
        }
    }
}

impl IngestConfig {
    /// Seed the environment from the first `.env` in the working directory or
    /// one of its parents. Variables that are already set are kept.
    pub fn load_dotenv() -> Option<PathBuf> {
        dotenvy::dotenv().ok()
    }

    /// Read every setting from the environment without validating
    pub fn from_env() -> hashvault_common::Result<Self> {
        let defaults = Self::default();

        let hash_length = match env_or("INGEST_HASH_LENGTH", DEFAULT_HASH_LENGTH) {
            0 => None,
            n => Some(n),
        };

        let progress_interval =
            match env_or("INGEST_PROGRESS_INTERVAL_SECS", DEFAULT_PROGRESS_INTERVAL_SECS) {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            };

        Ok(Self {
            database: DatabaseConfig::from_env(),
            workers: env_or("INGEST_WORKERS", defaults.workers),
            batch_size: env_or("INGEST_BATCH_SIZE", defaults.batch_size),
            queue_capacity: std::env::var("INGEST_QUEUE_CAPACITY")
                .ok()
                .and_then(|s| s.trim().parse().ok()),
            max_retries: env_or("INGEST_MAX_RETRIES", defaults.max_retries),
            retry_backoff: Duration::from_millis(env_or(
                "INGEST_RETRY_BACKOFF_MS",
                DEFAULT_RETRY_BACKOFF_MS,
            )),
            hash_length,
            progress_interval,
            finalize: env_or("INGEST_FINALIZE", true),
            tuning: SessionTuning::from_env()?,
        })
    }

    /// Effective capacity of the bounded work queue
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
            .unwrap_or(self.workers.saturating_mul(QUEUE_SLOTS_PER_WORKER))
    }

    /// Upper bound on records buffered in the queue: capacity × batch size
    pub fn max_buffered_lines(&self) -> usize {
        self.queue_capacity().saturating_mul(self.batch_size)
    }

    pub fn validate(&self) -> hashvault_common::Result<()> {
        self.database.validate()?;

        if self.workers == 0 {
            return Err(HashvaultError::config("workers must be greater than 0"));
        }
        if self.batch_size == 0 {
            return Err(HashvaultError::config("batch size must be greater than 0"));
        }
        if self.queue_capacity() == 0 {
            return Err(HashvaultError::config("queue capacity must be greater than 0"));
        }
        self.tuning.validate()?;

        Ok(())
    }
}
