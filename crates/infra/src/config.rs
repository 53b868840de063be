//! Server configuration loaded from `JOBGATE_*` environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use jobgate_auth::resolver::DEFAULT_CACHE_TTL;
use jobgate_observability::LogFormat;

use crate::jobs::{IdStrategy, JobSpawner, RandomIds, SequentialIds, SpawnError, ThreadSpawner, WorkerPool};

pub const DEFAULT_BIND: &str = "0.0.0.0:8069";
pub const DEFAULT_ADMIN_PASSWD: &str = "admin";
pub const DEFAULT_MAX_JOBS: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &'static str, value: &str, reason: impl ToString) -> Self {
        ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// How job ids are drawn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobIdMode {
    #[default]
    Sequential,
    Random,
}

impl FromStr for JobIdMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(JobIdMode::Sequential),
            "random" => Ok(JobIdMode::Random),
            _ => Err("expected \"sequential\" or \"random\"".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub admin_passwd: String,
    /// `admin_passwd` was not configured and fell back to the default.
    pub admin_passwd_defaulted: bool,
    pub report_gz: bool,
    pub list_db: bool,
    /// Store names `db.list` may show; empty means no filter.
    pub db_filter: Vec<String>,
    pub drop_guard: bool,
    /// Worker-pool size; `0` starts one thread per job.
    pub max_jobs: usize,
    pub job_ids: JobIdMode,
    pub log_format: LogFormat,
    /// How long a successful login is cached; zero disables the cache.
    pub login_cache_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8069)),
            admin_passwd: DEFAULT_ADMIN_PASSWD.to_string(),
            admin_passwd_defaulted: true,
            report_gz: false,
            list_db: true,
            db_filter: Vec::new(),
            drop_guard: false,
            max_jobs: DEFAULT_MAX_JOBS,
            job_ids: JobIdMode::Sequential,
            log_format: LogFormat::Json,
            login_cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let mut config = ServerConfig::default();

        if let Some(v) = get("JOBGATE_BIND") {
            config.bind = v
                .trim()
                .parse()
                .map_err(|e| ConfigError::invalid("JOBGATE_BIND", &v, e))?;
        }
        if let Some(v) = get("JOBGATE_ADMIN_PASSWD") {
            config.admin_passwd = v;
            config.admin_passwd_defaulted = false;
        }
        if let Some(v) = get("JOBGATE_REPORT_GZ") {
            config.report_gz = parse_bool("JOBGATE_REPORT_GZ", &v)?;
        }
        if let Some(v) = get("JOBGATE_LIST_DB") {
            config.list_db = parse_bool("JOBGATE_LIST_DB", &v)?;
        }
        if let Some(v) = get("JOBGATE_DB_FILTER") {
            config.db_filter = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = get("JOBGATE_DROP_GUARD") {
            config.drop_guard = parse_bool("JOBGATE_DROP_GUARD", &v)?;
        }
        if let Some(v) = get("JOBGATE_MAX_JOBS") {
            config.max_jobs = v
                .trim()
                .parse()
                .map_err(|e| ConfigError::invalid("JOBGATE_MAX_JOBS", &v, e))?;
        }
        if let Some(v) = get("JOBGATE_JOB_IDS") {
            config.job_ids = v.parse().map_err(|e| ConfigError::invalid("JOBGATE_JOB_IDS", &v, e))?;
        }
        if let Some(v) = get("JOBGATE_LOG_FORMAT") {
            config.log_format = v
                .parse()
                .map_err(|e| ConfigError::invalid("JOBGATE_LOG_FORMAT", &v, e))?;
        }
        if let Some(v) = get("JOBGATE_LOGIN_CACHE_TTL") {
            let secs: u64 = v
                .trim()
                .parse()
                .map_err(|e| ConfigError::invalid("JOBGATE_LOGIN_CACHE_TTL", &v, e))?;
            config.login_cache_ttl = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Log warnings about insecure settings.
    pub fn warn_insecure(&self) {
        if self.admin_passwd_defaulted {
            warn!("JOBGATE_ADMIN_PASSWD not set; using insecure default super secret");
        }
    }

    pub fn id_strategy(&self) -> Box<dyn IdStrategy> {
        match self.job_ids {
            JobIdMode::Sequential => Box::new(SequentialIds::new()),
            JobIdMode::Random => Box::new(RandomIds),
        }
    }

    /// Execution context for background jobs.
    pub fn spawner(&self) -> Result<Arc<dyn JobSpawner>, SpawnError> {
        if self.max_jobs == 0 {
            return Ok(Arc::new(ThreadSpawner));
        }
        Ok(Arc::new(WorkerPool::new("jobgate-worker", self.max_jobs)?))
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(var, value, "expected a boolean")),
    }
}
