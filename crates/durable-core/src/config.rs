use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "durable.toml";
pub const DEFAULT_DB_PATH: &str = "durable.db";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_JOB_TIMEOUT_MINUTES: u64 = 30;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_SCHEDULING_RETRIES: u32 = 5;
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
/// Timeout applied when `job_timeout_minutes` is 0 (test deployments).
pub const TEST_JOB_TIMEOUT_MS: u64 = 2_500;

/// Top-level config (durable.toml + DURABLE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DurableConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub jobs: DurableJobsConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl DatabaseConfig {
    /// Create the directory holding the database file, if any.
    pub fn ensure_parent_dir(&self) -> crate::error::Result<()> {
        if let Some(parent) = Path::new(&self.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

/// Durable job runner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableJobsConfig {
    /// How often the worker loop invokes the scheduler and runner.
    /// Not enforced by `run_jobs` itself.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Deadline for a single job execution. 0 selects a 2.5 s test timeout.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_minutes: u64,
    /// Blocking worker threads reserved for job bodies.
    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: usize,
    /// `remaining_attempts` given to every new occurrence.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Conflict retries per job in a single scheduling pass.
    #[serde(default = "default_scheduling_retries")]
    pub scheduling_retries: u32,
    /// Succeeded rows older than this are purged by the housekeeping job.
    #[serde(default = "default_retention_days")]
    pub succeeded_retention_days: u32,
}

impl Default for DurableJobsConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECS,
            job_timeout_minutes: DEFAULT_JOB_TIMEOUT_MINUTES,
            thread_pool_size: default_thread_pool_size(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduling_retries: DEFAULT_SCHEDULING_RETRIES,
            succeeded_retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

impl DurableJobsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(1))
    }

    pub fn job_timeout(&self) -> Duration {
        if self.job_timeout_minutes == 0 {
            Duration::from_millis(TEST_JOB_TIMEOUT_MS)
        } else {
            Duration::from_secs(self.job_timeout_minutes.saturating_mul(60))
        }
    }
}

/// Where final-failure alerts go and how the deployment names itself in them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub it_email_address: String,
    #[serde(default)]
    pub support_email_address: String,
    /// HTTP mail relay endpoint. Empty means alerts are only logged.
    #[serde(default)]
    pub relay_url: String,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            it_email_address: String::new(),
            support_email_address: String::new(),
            relay_url: String::new(),
        }
    }
}

impl AlertsConfig {
    /// IT address, or the support address when no IT address is configured.
    pub fn recipient(&self) -> &str {
        if self.it_email_address.trim().is_empty() {
            &self.support_email_address
        } else {
            &self.it_email_address
        }
    }

    /// `base_url` without its scheme, e.g. `forms.example.gov`.
    pub fn host_name(&self) -> &str {
        let url = self.base_url.trim();
        url.split_once("://").map(|(_, rest)| rest).unwrap_or(url)
    }

    pub fn relay_url(&self) -> Option<&str> {
        let url = self.relay_url.trim();
        (!url.is_empty()).then_some(url)
    }
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.to_string()
}
fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_job_timeout() -> u64 {
    DEFAULT_JOB_TIMEOUT_MINUTES
}
fn default_thread_pool_size() -> usize {
    1
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_scheduling_retries() -> u32 {
    DEFAULT_SCHEDULING_RETRIES
}
fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}
fn default_base_url() -> String {
    "http://localhost:9000".to_string()
}

impl DurableConfig {
    /// Load config from a TOML file with DURABLE_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `DURABLE_JOBS__JOB_TIMEOUT_MINUTES=10`. A missing file is not an
    /// error; every key has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or(DEFAULT_CONFIG_PATH);

        let config: DurableConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("DURABLE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        tracing::debug!(path, "configuration loaded");
        Ok(config)
    }
}
