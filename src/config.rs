use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TaskError};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://./subkeeper_data/database/tasks.db?mode=rwc";
pub const DEFAULT_LOG_DIR: &str = "./logs";
pub const DEFAULT_BIND: &str = "127.0.0.1:7200";
pub const DEFAULT_BACKUP_DIR: &str = "./subkeeper_data/backups";
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Environment first, then `.env`. Blank values count as unset.
pub fn lookup(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .or_else(|| dotenv::var(key).ok())
        .filter(|value| !value.trim().is_empty())
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| TaskError::Config(format!("{}={}: {}", key, raw, e))),
        None => Ok(default),
    }
}

fn secs_or(key: &str, default: u64) -> Result<Duration> {
    parse_or(key, default).map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum executions in flight.
    pub workers: usize,
    pub dispatch_interval: Duration,
    pub stuck_threshold: Duration,
    pub stuck_sweep_interval: Duration,
    pub stuck_sweep_initial_delay: Duration,
    pub retention: Duration,
    pub retention_sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            dispatch_interval: Duration::from_secs(5),
            stuck_threshold: Duration::from_secs(30 * 60),
            stuck_sweep_interval: Duration::from_secs(30),
            stuck_sweep_initial_delay: Duration::from_secs(60),
            retention: Duration::from_secs(7 * 24 * 3600),
            retention_sweep_interval: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub heartbeat_interval: Duration,
    pub execution_timeout: Duration,
    pub cancel_grace: Duration,
    pub progress_events_per_sec: u32,
    pub default_max_retries: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            execution_timeout: Duration::from_secs(24 * 3600),
            cancel_grace: Duration::from_secs(30),
            progress_events_per_sec: 4,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Programs the execution bodies shell out to.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub ffmpeg: String,
    pub ffsubsync: String,
    pub whisper: String,
    pub translator: String,
    pub timeout: Duration,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffsubsync: "ffsubsync".to_string(),
            whisper: "whisper".to_string(),
            translator: "subtitle-translator".to_string(),
            timeout: Duration::from_secs(6 * 3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: String,
    pub bind: SocketAddr,
    pub backup_dir: PathBuf,
    pub webhook_url: Option<String>,
    pub broadcast_capacity: usize,
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorConfig,
    pub tools: ToolPaths,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let scheduler_defaults = SchedulerConfig::default();
        let executor_defaults = ExecutorConfig::default();
        let tool_defaults = ToolPaths::default();

        let retention_days: u64 = parse_or("SUBKEEPER_RETENTION_DAYS", 7)?;

        let config = Self {
            database_url: crate::DATABASE_URL.clone(),
            log_dir: lookup("SUBKEEPER_LOG_DIR").unwrap_or_else(|| DEFAULT_LOG_DIR.to_string()),
            bind: parse_or("SUBKEEPER_BIND", SocketAddr::from(([127, 0, 0, 1], 7200)))?,
            backup_dir: PathBuf::from(crate::BACKUP_DIR.as_str()),
            webhook_url: lookup("SUBKEEPER_WEBHOOK_URL"),
            broadcast_capacity: parse_or("SUBKEEPER_BROADCAST_CAPACITY", 256)?,
            scheduler: SchedulerConfig {
                workers: parse_or("SUBKEEPER_WORKERS", scheduler_defaults.workers)?,
                dispatch_interval: secs_or("SUBKEEPER_DISPATCH_SECS", 5)?,
                stuck_threshold: secs_or("SUBKEEPER_STUCK_THRESHOLD_SECS", 1800)?,
                stuck_sweep_interval: secs_or("SUBKEEPER_STUCK_SWEEP_SECS", 30)?,
                stuck_sweep_initial_delay: secs_or("SUBKEEPER_STUCK_SWEEP_DELAY_SECS", 60)?,
                retention: Duration::from_secs(retention_days * 24 * 3600),
                retention_sweep_interval: secs_or("SUBKEEPER_RETENTION_SWEEP_SECS", 86400)?,
            },
            executor: ExecutorConfig {
                heartbeat_interval: secs_or("SUBKEEPER_HEARTBEAT_SECS", 60)?,
                execution_timeout: secs_or("SUBKEEPER_EXECUTION_TIMEOUT_SECS", 86400)?,
                cancel_grace: secs_or("SUBKEEPER_CANCEL_GRACE_SECS", 30)?,
                progress_events_per_sec: parse_or(
                    "SUBKEEPER_PROGRESS_EVENTS_PER_SEC",
                    executor_defaults.progress_events_per_sec,
                )?,
                default_max_retries: executor_defaults.default_max_retries,
            },
            tools: ToolPaths {
                ffmpeg: lookup("SUBKEEPER_FFMPEG").unwrap_or(tool_defaults.ffmpeg),
                ffsubsync: lookup("SUBKEEPER_FFSUBSYNC").unwrap_or(tool_defaults.ffsubsync),
                whisper: lookup("SUBKEEPER_WHISPER").unwrap_or(tool_defaults.whisper),
                translator: lookup("SUBKEEPER_TRANSLATOR").unwrap_or(tool_defaults.translator),
                timeout: secs_or("SUBKEEPER_TOOL_TIMEOUT_SECS", 6 * 3600)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.workers == 0 {
            return Err(TaskError::Config("SUBKEEPER_WORKERS must be at least 1".into()));
        }
        if self.broadcast_capacity == 0 {
            return Err(TaskError::Config(
                "SUBKEEPER_BROADCAST_CAPACITY must be at least 1".into(),
            ));
        }
        if self.executor.heartbeat_interval.is_zero() {
            return Err(TaskError::Config("SUBKEEPER_HEARTBEAT_SECS must be positive".into()));
        }
        // a healthy task must beat at least three times per threshold window
        if self.executor.heartbeat_interval * 3 > self.scheduler.stuck_threshold {
            return Err(TaskError::Config(format!(
                "heartbeat interval {:?} exceeds a third of the stuck threshold {:?}",
                self.executor.heartbeat_interval, self.scheduler.stuck_threshold
            )));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            log_dir: DEFAULT_LOG_DIR.to_string(),
            bind: SocketAddr::from(([127, 0, 0, 1], 7200)),
            backup_dir: PathBuf::from(DEFAULT_BACKUP_DIR),
            webhook_url: None,
            broadcast_capacity: 256,
            scheduler: SchedulerConfig::default(),
            executor: ExecutorConfig::default(),
            tools: ToolPaths::default(),
        }
    }
}
