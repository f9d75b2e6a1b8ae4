use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use tracing::trace;

use crate::store::StatusThresholds;

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub circuit_breaker: BreakerConfig,

    #[serde(default)]
    pub retry_budget: BudgetConfig,

    /// Agents the hub polls for reports
    pub agents: Option<Vec<AgentConfig>>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct StoreConfig {
    /// Maximum history entries (and completed commands) kept per machine
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Silence after which a machine is reported as `warning`
    #[serde(default = "default_warning_after_secs")]
    pub warning_after_secs: u64,

    /// Silence after which a machine is reported as `offline`
    #[serde(default = "default_offline_after_secs")]
    pub offline_after_secs: u64,

    /// Give up on a resource lock after this long (blocks forever if unset)
    pub lock_timeout_ms: Option<u64>,

    /// Drop history and completed commands older than this (keeps all if unset)
    pub retention_secs: Option<u64>,

    /// How often the retention cleanup runs
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            warning_after_secs: default_warning_after_secs(),
            offline_after_secs: default_offline_after_secs(),
            lock_timeout_ms: None,
            retention_secs: None,
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl StoreConfig {
    pub fn thresholds(&self) -> StatusThresholds {
        StatusThresholds {
            warning_after: Duration::from_secs(self.warning_after_secs),
            offline_after: Duration::from_secs(self.offline_after_secs),
        }
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.history_limit == 0 {
            return Err("store.history_limit must be at least 1".to_string());
        }
        if self.warning_after_secs >= self.offline_after_secs {
            return Err(
                "store.warning_after_secs must be below store.offline_after_secs".to_string(),
            );
        }
        Ok(())
    }
}

fn default_history_limit() -> usize {
    1000
}

fn default_warning_after_secs() -> u64 {
    60
}

fn default_offline_after_secs() -> u64 {
    180
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Relative jitter applied to every delay (0.25 = ±25%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err("retry.base_delay_ms must not exceed retry.max_delay_ms".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("retry.jitter must be within [0, 1]".to_string());
        }
        Ok(())
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter() -> f64 {
    0.25
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close the breaker again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// How long an open breaker rejects calls before allowing trial calls
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,

    /// Concurrent trial calls allowed while half-open
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout_secs: default_open_timeout_secs(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl BreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("circuit_breaker.failure_threshold must be at least 1".to_string());
        }
        if self.success_threshold == 0 {
            return Err("circuit_breaker.success_threshold must be at least 1".to_string());
        }
        if self.half_open_max_calls == 0 {
            return Err("circuit_breaker.half_open_max_calls must be at least 1".to_string());
        }
        Ok(())
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_timeout_secs() -> u64 {
    60
}

fn default_half_open_max_calls() -> u32 {
    3
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Highest share of calls in the window that may be retries
    #[serde(default = "default_max_retry_ratio")]
    pub max_retry_ratio: f64,

    /// Below this many calls in the window the ratio is not enforced
    #[serde(default = "default_min_calls")]
    pub min_calls: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_retry_ratio: default_max_retry_ratio(),
            min_calls: default_min_calls(),
        }
    }
}

impl BudgetConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.window_secs == 0 {
            return Err("retry_budget.window_secs must be at least 1".to_string());
        }
        if !(self.max_retry_ratio > 0.0 && self.max_retry_ratio <= 1.0) {
            return Err("retry_budget.max_retry_ratio must be within (0, 1]".to_string());
        }
        Ok(())
    }
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_retry_ratio() -> f64 {
    0.3
}

fn default_min_calls() -> usize {
    10
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AgentConfig {
    /// Stable machine id; defaults to `ip:port`
    pub id: Option<String>,
    pub ip: IpAddr,
    #[serde(default = "default_agent_port")]
    pub port: u16,
    /// Polling interval in seconds
    #[serde(default = "default_interval")]
    pub interval: u64,
    pub token: Option<String>,
}

impl AgentConfig {
    pub fn machine_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.ip, self.port))
    }

    pub fn metrics_url(&self) -> String {
        format!("http://{}:{}/metrics", self.ip, self.port)
    }
}

fn default_agent_port() -> u16 {
    51243
}

fn default_interval() -> u64 {
    15
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.store
            .validate()
            .and_then(|_| self.retry.validate())
            .and_then(|_| self.circuit_breaker.validate())
            .and_then(|_| self.retry_budget.validate())
            .map_err(|message| anyhow::anyhow!("invalid configuration: {message}"))
    }
}

pub fn read_config_file(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))?;
    config.validate()?;
    trace!("loaded config: {config:?}");
    Ok(config)
}
