//! Session tuning for bulk loads
//!
//! Every session the pipeline opens (schema preparation, each batch, the
//! finalizer) is tuned before it does any work. The settings only trade
//! durability and memory for throughput; merge results do not depend on them.
//! Relaxed commit durability is acceptable because the source can always be
//! re-ingested.

use hashvault_common::HashvaultError;
use serde::Serialize;
use sqlx::PgConnection;
use tracing::debug;

pub const DEFAULT_WORK_MEM: &str = "128MB";
pub const DEFAULT_MAINTENANCE_WORK_MEM: &str = "2GB";
pub const DEFAULT_MAX_PARALLEL_WORKERS_PER_GATHER: u32 = 4;

/// Session-scoped settings applied to each new connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionTuning {
    /// Keep `synchronous_commit` on; bulk loads turn it off
    pub synchronous_commit: bool,
    pub work_mem: String,
    pub maintenance_work_mem: String,
    pub max_parallel_workers_per_gather: u32,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            synchronous_commit: false,
            work_mem: DEFAULT_WORK_MEM.to_string(),
            maintenance_work_mem: DEFAULT_MAINTENANCE_WORK_MEM.to_string(),
            max_parallel_workers_per_gather: DEFAULT_MAX_PARALLEL_WORKERS_PER_GATHER,
        }
    }
}

impl SessionTuning {
    /// Load from `PG_SYNCHRONOUS_COMMIT`, `PG_WORK_MEM`, `PG_MAINTENANCE_WORK_MEM`
    /// and `PG_MAX_PARALLEL_WORKERS_PER_GATHER`
    pub fn from_env() -> hashvault_common::Result<Self> {
        let defaults = Self::default();

        let synchronous_commit = match std::env::var("PG_SYNCHRONOUS_COMMIT") {
            Ok(value) => parse_switch(&value).ok_or_else(|| {
                HashvaultError::config(format!("PG_SYNCHRONOUS_COMMIT: expected on/off, got '{}'", value))
            })?,
            Err(_) => defaults.synchronous_commit,
        };

        let max_parallel_workers_per_gather = match std::env::var("PG_MAX_PARALLEL_WORKERS_PER_GATHER") {
            Ok(value) => value.trim().parse().map_err(|_| {
                HashvaultError::config(format!(
                    "PG_MAX_PARALLEL_WORKERS_PER_GATHER: expected an integer, got '{}'",
                    value
                ))
            })?,
            Err(_) => defaults.max_parallel_workers_per_gather,
        };

        let tuning = Self {
            synchronous_commit,
            work_mem: std::env::var("PG_WORK_MEM").unwrap_or(defaults.work_mem),
            maintenance_work_mem: std::env::var("PG_MAINTENANCE_WORK_MEM")
                .unwrap_or(defaults.maintenance_work_mem),
            max_parallel_workers_per_gather,
        };
        tuning.validate()?;
        Ok(tuning)
    }

    /// Memory values are interpolated into `SET`, so only `<digits><unit>` is accepted.
    pub fn validate(&self) -> hashvault_common::Result<()> {
        for (name, value) in [
            ("work_mem", &self.work_mem),
            ("maintenance_work_mem", &self.maintenance_work_mem),
        ] {
            if !is_memory_setting(value) {
                return Err(HashvaultError::config(format!(
                    "{} must look like 128MB or 2GB, got '{}'",
                    name, value
                )));
            }
        }
        Ok(())
    }

    /// The `SET` statements, in the order they are applied
    pub fn statements(&self) -> Vec<String> {
        vec![
            format!(
                "SET synchronous_commit = {}",
                if self.synchronous_commit { "on" } else { "off" }
            ),
            format!("SET work_mem = '{}'", self.work_mem),
            format!("SET maintenance_work_mem = '{}'", self.maintenance_work_mem),
            format!(
                "SET max_parallel_workers_per_gather = {}",
                self.max_parallel_workers_per_gather
            ),
        ]
    }

    /// Apply every setting to `conn` in one round trip. An unbound `&str`
    /// goes over the simple-query protocol, which accepts several statements.
    pub async fn apply(&self, conn: &mut PgConnection) -> Result<(), sqlx::Error> {
        let script = self.statements().join(";\n");
        sqlx::Executor::execute(&mut *conn, script.as_str()).await?;
        debug!(
            synchronous_commit = self.synchronous_commit,
            work_mem = %self.work_mem,
            maintenance_work_mem = %self.maintenance_work_mem,
            max_parallel_workers_per_gather = self.max_parallel_workers_per_gather,
            "Session tuned for bulk load"
        );
        Ok(())
    }
}

fn parse_switch(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => Some(true),
        "off" | "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn is_memory_setting(value: &str) -> bool {
    let digits = value.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return false;
    }
    matches!(&value[digits..], "kB" | "MB" | "GB" | "TB")
}
