use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GmailError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// How often the UI and `watch` poll job status
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Upper bound on any requested count, including "all"
    #[serde(default = "default_max_count")]
    pub max_count: u64,
    #[serde(default = "default_mark_read_count")]
    pub default_mark_read_count: u64,
    #[serde(default = "default_scan_limit")]
    pub default_scan_limit: u64,
    #[serde(default = "default_max_scan_limit")]
    pub max_scan_limit: u64,
    /// Top senders whose sample body is searched for a link
    #[serde(default = "default_body_lookup_limit")]
    pub body_lookup_limit: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            page_size: default_page_size(),
            max_count: default_max_count(),
            default_mark_read_count: default_mark_read_count(),
            default_scan_limit: default_scan_limit(),
            max_scan_limit: default_max_scan_limit(),
            body_lookup_limit: default_body_lookup_limit(),
        }
    }
}

impl JobsConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Parallel metadata fetches during a scan
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_units_per_second")]
    pub units_per_second: f64,
    #[serde(default = "default_burst_units")]
    pub burst_units: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            units_per_second: default_units_per_second(),
            burst_units: default_burst_units(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
    #[serde(default = "default_token_cache_path")]
    pub token_cache_path: PathBuf,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credentials_path: default_credentials_path(),
            token_cache_path: default_token_cache_path(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8766
}

fn default_poll_interval_ms() -> u64 {
    300
}

fn default_batch_size() -> usize {
    100
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_page_size() -> u32 {
    500
}

fn default_max_count() -> u64 {
    100_000
}

fn default_mark_read_count() -> u64 {
    100
}

fn default_scan_limit() -> u64 {
    500
}

fn default_max_scan_limit() -> u64 {
    5000
}

fn default_body_lookup_limit() -> usize {
    25
}

fn default_concurrency() -> usize {
    10
}

fn default_units_per_second() -> f64 {
    250.0
}

fn default_burst_units() -> f64 {
    500.0
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_token_cache_path() -> PathBuf {
    PathBuf::from(".gmail-bulk/token.json")
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GmailError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| GmailError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                GmailError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| GmailError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| GmailError::ConfigError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(GmailError::ConfigError(
                "server.host cannot be empty".to_string(),
            ));
        }
        if self.server.poll_interval_ms == 0 {
            return Err(GmailError::ConfigError(
                "server.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        // Gmail's batchModify accepts at most 1000 ids
        if !(1..=1000).contains(&self.jobs.batch_size) {
            return Err(GmailError::ConfigError(format!(
                "jobs.batch_size must be between 1 and 1000, got {}",
                self.jobs.batch_size
            )));
        }
        if self.jobs.max_attempts == 0 {
            return Err(GmailError::ConfigError(
                "jobs.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.jobs.retry_base_delay_ms > self.jobs.retry_max_delay_ms {
            return Err(GmailError::ConfigError(
                "jobs.retry_base_delay_ms cannot exceed jobs.retry_max_delay_ms".to_string(),
            ));
        }
        if !(1..=500).contains(&self.jobs.page_size) {
            return Err(GmailError::ConfigError(format!(
                "jobs.page_size must be between 1 and 500, got {}",
                self.jobs.page_size
            )));
        }
        if self.jobs.max_count == 0 {
            return Err(GmailError::ConfigError(
                "jobs.max_count must be greater than 0".to_string(),
            ));
        }
        if self.jobs.default_mark_read_count == 0
            || self.jobs.default_mark_read_count > self.jobs.max_count
        {
            return Err(GmailError::ConfigError(
                "jobs.default_mark_read_count must be between 1 and jobs.max_count".to_string(),
            ));
        }
        if self.jobs.default_scan_limit == 0
            || self.jobs.default_scan_limit > self.jobs.max_scan_limit
        {
            return Err(GmailError::ConfigError(
                "jobs.default_scan_limit must be between 1 and jobs.max_scan_limit".to_string(),
            ));
        }

        if !(1..=50).contains(&self.scan.concurrency) {
            return Err(GmailError::ConfigError(
                "scan.concurrency must be between 1 and 50 (to stay under Gmail API rate limits)"
                    .to_string(),
            ));
        }

        if self.rate_limit.units_per_second <= 0.0 {
            return Err(GmailError::ConfigError(
                "rate_limit.units_per_second must be positive".to_string(),
            ));
        }
        // A batchModify costs 50 units; a smaller bucket could never admit one
        if self.rate_limit.burst_units < 50.0 {
            return Err(GmailError::ConfigError(
                "rate_limit.burst_units must be at least 50".to_string(),
            ));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        Self::default().save(path).await
    }
}
