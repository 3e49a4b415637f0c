//! Application configuration loaded from environment variables.

use crate::error::{AppError, Result};
use std::env;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level used when `RUST_LOG` is not set
    pub log_level: String,

    /// Root of the filesystem artifact repository
    pub repository_path: String,

    /// Identity of this process when holding schedule leases
    pub node_id: String,

    /// How long a refresh lease stays valid before it is treated as abandoned
    pub lease_window: Duration,

    /// Hard timeout for a single artifact handler call
    pub handler_timeout: Duration,

    /// Maximum processing attempts per notification
    pub max_attempts: u32,

    /// Base delay for retry backoff (doubled per failed attempt, capped at 300s)
    pub retry_backoff_base: Duration,

    /// Delay before an event deferred on lock contention is offered again
    pub defer_delay: Duration,

    /// Number of notifications processed concurrently
    pub worker_concurrency: usize,

    /// Tick interval of the background refresh worker
    pub worker_interval: Duration,

    /// Retention window for release versions
    pub version_ttl_days: i64,

    /// Retention window for snapshot versions
    pub snapshot_ttl_days: i64,

    /// Maximum snapshot versions kept per artifact
    pub max_snapshots_allowed: usize,

    /// Versions not queried within this many days are retired
    pub lru_days: i64,

    /// Number of newest release versions kept per artifact
    pub keep_versions: usize,

    /// Archived notifications older than this are purged
    pub notification_ttl_days: i64,

    /// Version id of the mutable head revision of every project
    pub head_snapshot_version: String,

    /// Artifact types requested from the repository for each version
    pub artifact_types: Vec<String>,

    /// Cron expression for the reconciliation sweep
    pub reconcile_schedule: String,

    /// Cron expression for the retention policies
    pub retention_schedule: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            repository_path: "./repository".into(),
            node_id: uuid::Uuid::new_v4().to_string(),
            lease_window: Duration::from_secs(600),
            handler_timeout: Duration::from_secs(300),
            max_attempts: 3,
            retry_backoff_base: Duration::from_secs(10),
            defer_delay: Duration::from_secs(5),
            worker_concurrency: 4,
            worker_interval: Duration::from_secs(10),
            version_ttl_days: 365,
            snapshot_ttl_days: 30,
            max_snapshots_allowed: 3,
            lru_days: 180,
            keep_versions: 10,
            notification_ttl_days: 30,
            head_snapshot_version: "master-SNAPSHOT".into(),
            artifact_types: vec![
                "entities".into(),
                "versioned-entities".into(),
                "file-generation".into(),
            ],
            reconcile_schedule: "0 0 * * * *".into(),
            retention_schedule: "0 30 2 * * *".into(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            repository_path: env::var("DEPOT_REPOSITORY_PATH")
                .unwrap_or(defaults.repository_path),
            node_id: env::var("DEPOT_NODE_ID").unwrap_or(defaults.node_id),
            lease_window: secs_var("DEPOT_LEASE_SECS", defaults.lease_window),
            handler_timeout: secs_var("DEPOT_HANDLER_TIMEOUT_SECS", defaults.handler_timeout),
            max_attempts: parsed_var("DEPOT_MAX_ATTEMPTS", defaults.max_attempts),
            retry_backoff_base: secs_var("DEPOT_RETRY_BACKOFF_SECS", defaults.retry_backoff_base),
            defer_delay: secs_var("DEPOT_DEFER_SECS", defaults.defer_delay),
            worker_concurrency: parsed_var("DEPOT_WORKER_CONCURRENCY", defaults.worker_concurrency),
            worker_interval: secs_var("DEPOT_WORKER_INTERVAL_SECS", defaults.worker_interval),
            version_ttl_days: parsed_var("DEPOT_VERSION_TTL_DAYS", defaults.version_ttl_days),
            snapshot_ttl_days: parsed_var("DEPOT_SNAPSHOT_TTL_DAYS", defaults.snapshot_ttl_days),
            max_snapshots_allowed: parsed_var("DEPOT_MAX_SNAPSHOTS", defaults.max_snapshots_allowed),
            lru_days: parsed_var("DEPOT_LRU_DAYS", defaults.lru_days),
            keep_versions: parsed_var("DEPOT_KEEP_VERSIONS", defaults.keep_versions),
            notification_ttl_days: parsed_var(
                "DEPOT_NOTIFICATION_TTL_DAYS",
                defaults.notification_ttl_days,
            ),
            head_snapshot_version: env::var("DEPOT_HEAD_SNAPSHOT")
                .unwrap_or(defaults.head_snapshot_version),
            artifact_types: env::var("DEPOT_ARTIFACT_TYPES")
                .map(|v| parse_list(&v))
                .unwrap_or(defaults.artifact_types),
            reconcile_schedule: env::var("DEPOT_RECONCILE_CRON")
                .unwrap_or(defaults.reconcile_schedule),
            retention_schedule: env::var("DEPOT_RETENTION_CRON")
                .unwrap_or(defaults.retention_schedule),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall the engine.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(AppError::Config("DEPOT_MAX_ATTEMPTS must be at least 1".into()));
        }
        if self.worker_concurrency == 0 {
            return Err(AppError::Config(
                "DEPOT_WORKER_CONCURRENCY must be at least 1".into(),
            ));
        }
        if self.artifact_types.is_empty() {
            return Err(AppError::Config("DEPOT_ARTIFACT_TYPES must not be empty".into()));
        }
        if self.lease_window.is_zero() {
            return Err(AppError::Config("DEPOT_LEASE_SECS must be at least 1".into()));
        }
        if self.handler_timeout >= self.run_timeout() {
            return Err(AppError::Config(format!(
                "DEPOT_HANDLER_TIMEOUT_SECS ({}s) must be shorter than the {}s lease window",
                self.handler_timeout.as_secs_f64(),
                self.lease_window.as_secs_f64()
            )));
        }
        Ok(())
    }

    /// Budget for one leased unit of work. Ends before the lease does, so no
    /// other worker can take the key over while the work is still running.
    pub fn run_timeout(&self) -> Duration {
        self.lease_window.saturating_sub(self.lease_window / 10)
    }

    /// Lease window as a chrono duration, for timestamp arithmetic.
    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease_window).unwrap_or(chrono::Duration::minutes(10))
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn secs_var(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
