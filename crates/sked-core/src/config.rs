use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_BATCH_SIZE: u32 = 30;
pub const DEFAULT_WORKER_THREADS: usize = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_DEAD_EXECUTION_MULTIPLIER: u32 = 4;
pub const DEFAULT_SHUTDOWN_GRACE_PERIOD_MS: u64 = 30 * 60 * 1000;
pub const DEFAULT_TABLE: &str = "scheduled_tasks";

/// Top-level config (sked.toml + SKED_* env overrides, nested keys split on `__`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkedConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Written to `picked_by`; must be unique per running instance.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    /// Max executions fetched per poll cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// An execution is presumed dead once its heartbeat is older than
    /// `heartbeat_interval * dead_execution_multiplier`.
    #[serde(default = "default_dead_execution_multiplier")]
    pub dead_execution_multiplier: u32,
    /// Defaults to twice the heartbeat interval.
    #[serde(default)]
    pub dead_execution_check_interval_ms: Option<u64>,
    #[serde(default = "default_shutdown_grace_period_ms")]
    pub shutdown_grace_period_ms: u64,
    /// Trigger a poll right after a local `schedule()` that is already due.
    #[serde(default)]
    pub immediate_execution: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            polling_interval_ms: DEFAULT_POLLING_INTERVAL_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            worker_threads: DEFAULT_WORKER_THREADS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            dead_execution_multiplier: DEFAULT_DEAD_EXECUTION_MULTIPLIER,
            dead_execution_check_interval_ms: None,
            shutdown_grace_period_ms: DEFAULT_SHUTDOWN_GRACE_PERIOD_MS,
            immediate_execution: false,
        }
    }
}

impl SchedulerConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat age after which an execution is presumed abandoned.
    /// Saturates at [`Duration::MAX`]; [`validate`](Self::validate) rejects
    /// configurations where that would happen.
    pub fn dead_execution_threshold(&self) -> Duration {
        self.checked_dead_execution_threshold()
            .unwrap_or(Duration::MAX)
    }

    fn checked_dead_execution_threshold(&self) -> Option<Duration> {
        self.heartbeat_interval()
            .checked_mul(self.dead_execution_multiplier)
    }

    pub fn dead_execution_check_interval(&self) -> Duration {
        self.dead_execution_check_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.heartbeat_interval().saturating_mul(2))
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::Config("scheduler.name must not be empty".into()));
        }
        if self.worker_threads == 0 {
            return Err(CoreError::Config("scheduler.worker_threads must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(CoreError::Config("scheduler.batch_size must be > 0".into()));
        }
        if self.polling_interval_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(CoreError::Config(
                "polling and heartbeat intervals must be > 0".into(),
            ));
        }
        if self.dead_execution_multiplier < 2 {
            return Err(CoreError::Config(format!(
                "scheduler.dead_execution_multiplier must be >= 2 (got {})",
                self.dead_execution_multiplier
            )));
        }
        if self.checked_dead_execution_threshold().is_none() {
            return Err(CoreError::Config(format!(
                "scheduler.heartbeat_interval_ms * scheduler.dead_execution_multiplier overflows ({} * {})",
                self.heartbeat_interval_ms, self.dead_execution_multiplier
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_table")]
    pub table: String,
    /// Append `for update skip locked` to the due-executions query.
    /// Leave off for SQLite, which has no row locks.
    #[serde(default)]
    pub row_locking: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            table: default_table(),
            row_locking: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_kind")]
    pub kind: BackoffKind,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Step factor: added per failure for `linear`, multiplied for `exponential`.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            kind: default_backoff_kind(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("sked-{}", &id[..8])
    })
}
fn default_polling_interval_ms() -> u64 {
    DEFAULT_POLLING_INTERVAL_MS
}
fn default_batch_size() -> u32 {
    DEFAULT_BATCH_SIZE
}
fn default_worker_threads() -> usize {
    DEFAULT_WORKER_THREADS
}
fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}
fn default_dead_execution_multiplier() -> u32 {
    DEFAULT_DEAD_EXECUTION_MULTIPLIER
}
fn default_shutdown_grace_period_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_PERIOD_MS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.sked/sked.db", home)
}
fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}
fn default_backoff_kind() -> BackoffKind {
    BackoffKind::Exponential
}
fn default_base_delay_ms() -> u64 {
    10_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    60 * 60 * 1000
}

impl SkedConfig {
    /// Load config from a TOML file with SKED_* env var overrides.
    ///
    /// A missing file is not an error; defaults fill every field.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: SkedConfig = Figment::from(Serialized::defaults(SkedConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SKED_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.scheduler.validate()?;
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.sked/sked.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let cfg = SkedConfig::default();
        cfg.scheduler.validate().unwrap();
        assert_eq!(cfg.scheduler.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(cfg.database.table, "scheduled_tasks");
        assert_eq!(cfg.backoff.kind, BackoffKind::Exponential);
    }

    #[test]
    fn dead_threshold_is_heartbeat_times_multiplier() {
        let cfg = SchedulerConfig {
            heartbeat_interval_ms: 1_000,
            dead_execution_multiplier: 4,
            ..SchedulerConfig::default()
        };
        assert_eq!(cfg.dead_execution_threshold(), Duration::from_secs(4));
        assert_eq!(cfg.dead_execution_check_interval(), Duration::from_secs(2));
    }

    #[test]
    fn rejects_zero_workers() {
        let cfg = SchedulerConfig {
            worker_threads: 0,
            ..SchedulerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn rejects_aggressive_dead_multiplier() {
        let cfg = SchedulerConfig {
            dead_execution_multiplier: 1,
            ..SchedulerConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("dead_execution_multiplier"));
    }

    #[test]
    fn rejects_overflowing_dead_threshold() {
        let cfg = SchedulerConfig {
            heartbeat_interval_ms: u64::MAX,
            dead_execution_multiplier: u32::MAX,
            ..SchedulerConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("overflows"), "got {err}");
        assert_eq!(cfg.dead_execution_threshold(), Duration::MAX);

        // large but representable passes here; the scheduler builder still
        // refuses thresholds that do not fit a timestamp offset
        let cfg = SchedulerConfig {
            heartbeat_interval_ms: u64::MAX,
            dead_execution_multiplier: 4,
            ..SchedulerConfig::default()
        };
        cfg.validate().unwrap();
    }

    #[test]
    fn load_merges_toml_over_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[scheduler]
name = "node-a"
polling_interval_ms = 500
immediate_execution = true

[database]
path = "/tmp/sked-test.db"

[backoff]
kind = "linear"
base_delay_ms = 1000
"#
        )
        .unwrap();

        let cfg = SkedConfig::load(file.path().to_str()).unwrap();
        assert_eq!(cfg.scheduler.name, "node-a");
        assert_eq!(cfg.scheduler.polling_interval(), Duration::from_millis(500));
        assert!(cfg.scheduler.immediate_execution);
        assert_eq!(cfg.scheduler.worker_threads, DEFAULT_WORKER_THREADS);
        assert_eq!(cfg.database.path, "/tmp/sked-test.db");
        assert_eq!(cfg.database.table, DEFAULT_TABLE);
        assert_eq!(cfg.backoff.kind, BackoffKind::Linear);
        assert_eq!(cfg.backoff.base_delay_ms, 1000);
    }
}
