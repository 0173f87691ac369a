//! Configuration management for the trading core.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Persistence settings
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Worker pool and queue settings
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Recurring pass intervals
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_database_path")]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent worker tasks
    #[serde(default = "default_worker_count")]
    pub count: usize,
    /// Bounded work queue depth
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Seconds between open-order reconciliation passes
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Seconds between market/balance sync passes
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
}

fn default_database_path() -> String {
    "reflex-trader.db".to_string()
}

fn default_worker_count() -> usize {
    4
}

fn default_queue_depth() -> usize {
    256
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_sync_interval_secs() -> u64 {
    600
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("REFLEX"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.database.path.is_empty(), "database path must be set");
        anyhow::ensure!(self.worker.count >= 1, "worker count must be at least 1");
        anyhow::ensure!(self.worker.queue_depth >= 1, "queue depth must be at least 1");
        anyhow::ensure!(
            self.schedule.reconcile_interval_secs >= 1,
            "reconcile interval must be at least 1 second"
        );
        anyhow::ensure!(
            self.schedule.sync_interval_secs >= 1,
            "sync interval must be at least 1 second"
        );
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            worker: WorkerConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval_secs(),
            sync_interval_secs: default_sync_interval_secs(),
        }
    }
}
