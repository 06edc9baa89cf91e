use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Monitoring {
    /// How often the pool-discovery scan runs.
    #[serde(default = "default_pool_scan_interval_seconds")]
    pub pool_scan_interval_seconds: u64,
    /// How often the position scan runs.
    #[serde(default = "default_position_scan_interval_seconds")]
    pub position_scan_interval_seconds: u64,
    /// APY shift (percentage points) that triggers a notification.
    #[serde(default = "default_apy_minor_threshold")]
    pub apy_minor_threshold: f64,
    /// APY shift (percentage points) flagged as major.
    #[serde(default = "default_apy_major_threshold")]
    pub apy_major_threshold: f64,
    /// Share balances at or below this raw-unit amount count as zero.
    #[serde(default = "default_dust_threshold")]
    pub dust_threshold: u64,
    /// APY samples older than this are pruned by the daily maintenance task.
    #[serde(default = "default_apy_retention_days")]
    pub apy_retention_days: u32,
}

fn default_pool_scan_interval_seconds() -> u64 {
    900 // 15 minutes
}
fn default_position_scan_interval_seconds() -> u64 {
    900
}
fn default_apy_minor_threshold() -> f64 {
    0.5
}
fn default_apy_major_threshold() -> f64 {
    2.0
}
fn default_dust_threshold() -> u64 {
    100
}
fn default_apy_retention_days() -> u32 {
    30
}

impl Default for Monitoring {
    fn default() -> Self {
        Self {
            pool_scan_interval_seconds: default_pool_scan_interval_seconds(),
            position_scan_interval_seconds: default_position_scan_interval_seconds(),
            apy_minor_threshold: default_apy_minor_threshold(),
            apy_major_threshold: default_apy_major_threshold(),
            dust_threshold: default_dust_threshold(),
            apy_retention_days: default_apy_retention_days(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Rpc {
    /// Per-chain endpoint overrides keyed by chain config key ("ethereum",
    /// "arbitrum", ...). `RPC_URL_<CHAIN>` env vars win over these.
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Outbound request quota per chain per second.
    #[serde(default = "default_max_qps_per_chain")]
    pub max_qps_per_chain: u32,
    /// Soft wall-clock budget for one chain's work within a single tick.
    #[serde(default = "default_chain_tick_budget_seconds")]
    pub chain_tick_budget_seconds: u64,
    /// Bounded concurrency for balance reads within one chain.
    #[serde(default = "default_max_concurrent_reads_per_chain")]
    pub max_concurrent_reads_per_chain: usize,
}

fn default_request_timeout_seconds() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_max_qps_per_chain() -> u32 {
    10
}
fn default_chain_tick_budget_seconds() -> u64 {
    300
}
fn default_max_concurrent_reads_per_chain() -> usize {
    4
}

impl Default for Rpc {
    fn default() -> Self {
        Self {
            endpoints: HashMap::new(),
            request_timeout_seconds: default_request_timeout_seconds(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_qps_per_chain: default_max_qps_per_chain(),
            chain_tick_budget_seconds: default_chain_tick_budget_seconds(),
            max_concurrent_reads_per_chain: default_max_concurrent_reads_per_chain(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Database {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,
}

fn default_db_path() -> String {
    "lendwatch.db".to_string()
}
fn default_db_max_connections() -> u32 {
    5
}

impl Default for Database {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_db_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Notifier {
    /// Outbound chat credential. Required at startup; only the env var
    /// `TELEGRAM_BOT_TOKEN` is consulted, never the config file.
    #[serde(skip)]
    pub telegram_bot_token: Option<String>,
    #[serde(default = "default_alert_match_cooldown_hours")]
    pub alert_match_cooldown_hours: u32,
    #[serde(default = "default_apy_change_cooldown_hours")]
    pub apy_change_cooldown_hours: u32,
    #[serde(default = "default_delivery_max_retries")]
    pub delivery_max_retries: u32,
    #[serde(default = "default_delivery_base_delay_ms")]
    pub delivery_base_delay_ms: u64,
    /// Base URL for deep-link actions attached to messages.
    #[serde(default = "default_deep_link_base")]
    pub deep_link_base: String,
}

fn default_alert_match_cooldown_hours() -> u32 {
    24
}
fn default_apy_change_cooldown_hours() -> u32 {
    6
}
fn default_delivery_max_retries() -> u32 {
    3
}
fn default_delivery_base_delay_ms() -> u64 {
    1000
}
fn default_deep_link_base() -> String {
    "https://app.lendwatch.xyz".to_string()
}

impl Default for Notifier {
    fn default() -> Self {
        Self {
            telegram_bot_token: None,
            alert_match_cooldown_hours: default_alert_match_cooldown_hours(),
            apy_change_cooldown_hours: default_apy_change_cooldown_hours(),
            delivery_max_retries: default_delivery_max_retries(),
            delivery_base_delay_ms: default_delivery_base_delay_ms(),
            deep_link_base: default_deep_link_base(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub monitoring: Monitoring,
    #[serde(default)]
    pub rpc: Rpc,
    #[serde(default)]
    pub database: Database,
    #[serde(default)]
    pub notifier: Notifier,
    #[serde(default)]
    pub log: LogSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name("Config.toml").required(false))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;

        // Environment variable overrides
        settings.notifier.telegram_bot_token = env::var("TELEGRAM_BOT_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());

        if let Ok(path) = env::var("LENDWATCH_DB_PATH") {
            if !path.trim().is_empty() {
                settings.database.path = path;
            }
        }
        if let Some(v) = parse_env_number("POOL_SCAN_INTERVAL_SECONDS") {
            settings.monitoring.pool_scan_interval_seconds = v;
        }
        if let Some(v) = parse_env_number("POSITION_SCAN_INTERVAL_SECONDS") {
            settings.monitoring.position_scan_interval_seconds = v;
        }
        if let Some(v) = parse_env_float("APY_MINOR_THRESHOLD") {
            settings.monitoring.apy_minor_threshold = v;
        }
        if let Some(v) = parse_env_float("APY_MAJOR_THRESHOLD") {
            settings.monitoring.apy_major_threshold = v;
        }
        if let Some(v) = parse_env_number("DUST_THRESHOLD") {
            settings.monitoring.dust_threshold = v;
        }

        // NOTE: per-chain RPC_URL_<CHAIN> vars are resolved lazily by the
        // chain-access layer so that endpoint selection and client
        // construction live in one place.

        Ok(settings)
    }
}

impl Settings {
    /// Startup sanity checks. Violations terminate the process before any
    /// scheduler runs.
    pub fn validate(&self) -> Result<(), String> {
        if self.monitoring.pool_scan_interval_seconds < 60
            || self.monitoring.position_scan_interval_seconds < 60
        {
            return Err("scan intervals below 60 s are not supported".into());
        }
        if self.monitoring.apy_minor_threshold <= 0.0 {
            return Err("apy_minor_threshold must be positive".into());
        }
        if self.monitoring.apy_major_threshold < self.monitoring.apy_minor_threshold {
            return Err("apy_major_threshold must be >= apy_minor_threshold".into());
        }
        if self.database.path.trim().is_empty() {
            return Err("database path is empty".into());
        }
        if self.database.max_connections == 0 {
            return Err("database.max_connections must be at least 1".into());
        }
        if self.rpc.request_timeout_seconds == 0 {
            return Err("rpc.request_timeout_seconds must be at least 1".into());
        }
        Ok(())
    }
}

fn parse_env_number(key: &str) -> Option<u64> {
    env::var(key).ok()?.trim().parse().ok()
}

fn parse_env_float(key: &str) -> Option<f64> {
    env::var(key).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rejects_inverted_thresholds() {
        let mut s = Settings::default();
        assert!(s.validate().is_ok());

        s.monitoring.apy_major_threshold = 0.1;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.monitoring.pool_scan_interval_seconds = 5;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.database.path = " ".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.monitoring.pool_scan_interval_seconds, 900);
        assert_eq!(s.monitoring.apy_minor_threshold, 0.5);
        assert_eq!(s.monitoring.apy_major_threshold, 2.0);
        assert_eq!(s.notifier.alert_match_cooldown_hours, 24);
        assert_eq!(s.notifier.apy_change_cooldown_hours, 6);
        assert_eq!(s.rpc.max_retries, 3);
        assert_eq!(s.rpc.request_timeout_seconds, 10);
    }
}
