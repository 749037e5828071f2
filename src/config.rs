//! WolfGate Configuration
//!
//! This module provides configuration structures for the WolfGate
//! proxy control plane.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::pool::{PoolLimits, DEFAULT_MAX_IDLE, DEFAULT_MID_IDLE, DEFAULT_MIN_IDLE};
use crate::retry::RetryPolicy;

/// Main WolfGate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfGateConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Credentials and timeouts of health probe connections
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Health monitor configuration
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Backends known at startup
    #[serde(default)]
    pub backends: BackendsConfig,

    /// Sharding configuration
    #[serde(default)]
    pub sharding: ShardingSettings,

    /// Where persisted objects live
    #[serde(default)]
    pub store: StoreConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Backoff for writes to the object store
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Probe connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Probe user
    #[serde(default)]
    pub user: String,

    /// Probe password
    #[serde(default)]
    pub password: String,

    /// Connect timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub connect_timeout_secs: u64,

    /// Query timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub query_timeout_secs: u64,
}

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Run the health monitor
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Liveness check interval in milliseconds
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Follow MySQL group replication primary/secondary changes
    #[serde(default)]
    pub group_replication: bool,

    /// Measure slave lag through the heartbeat table
    #[serde(default)]
    pub check_slave_delay: bool,

    /// Lag measurement interval in milliseconds
    #[serde(default = "default_delay_interval_ms")]
    pub delay_interval_ms: u64,

    /// Lag (seconds) above which a slave is taken down
    #[serde(default = "default_slave_delay_down")]
    pub slave_delay_down_secs: f64,

    /// Lag (seconds) at or below which a slave is brought back up
    #[serde(default = "default_slave_delay_recover")]
    pub slave_delay_recover_secs: f64,

    /// Re-resolve hostnames of unreachable backends
    #[serde(default)]
    pub dns_recheck: bool,

    /// Fully qualified heartbeat table
    #[serde(default = "default_heartbeat_table")]
    pub heartbeat_table: String,
}

/// Backends known at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    /// Read-write backends, "addr[#weight][@group]"
    #[serde(default)]
    pub rw: Vec<String>,

    /// Read-only backends, "addr[#weight][@group]"
    #[serde(default)]
    pub ro: Vec<String>,

    /// Put every backend into one partition group
    #[serde(default)]
    pub partition_mode: bool,

    /// Idle connections kept per backend
    #[serde(default = "default_max_idle")]
    pub max_idle_connections: usize,

    /// Idle level above which the pool shrinks
    #[serde(default = "default_mid_idle")]
    pub mid_idle_connections: usize,

    /// Idle connections a user keeps before others may take them
    #[serde(default = "default_min_idle")]
    pub min_idle_connections: usize,
}

/// Sharding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardingSettings {
    /// Load sharding metadata at startup
    #[serde(default)]
    pub enabled: bool,

    /// Name of the persisted sharding object
    #[serde(default = "default_sharding_object")]
    pub object: String,
}

/// Object store backing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    File,
    Sqlite,
}

/// Object store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backing (file, sqlite)
    #[serde(default = "default_store_kind")]
    pub kind: StoreKind,

    /// Directory (file) or database file (sqlite)
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_probe_timeout() -> u64 {
    2
}

fn default_check_interval_ms() -> u64 {
    1000
}

fn default_delay_interval_ms() -> u64 {
    300
}

fn default_slave_delay_down() -> f64 {
    10.0
}

fn default_slave_delay_recover() -> f64 {
    1.0
}

fn default_heartbeat_table() -> String {
    "proxy_heart_beat.tb_heartbeat".to_string()
}

fn default_max_idle() -> usize {
    DEFAULT_MAX_IDLE
}

fn default_mid_idle() -> usize {
    DEFAULT_MID_IDLE
}

fn default_min_idle() -> usize {
    DEFAULT_MIN_IDLE
}

fn default_sharding_object() -> String {
    crate::sharding::SHARDING_OBJECT.to_string()
}

fn default_store_kind() -> StoreKind {
    StoreKind::File
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/wolfgate/objects")
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfgate")
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            password: String::new(),
            connect_timeout_secs: default_probe_timeout(),
            query_timeout_secs: default_probe_timeout(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: default_check_interval_ms(),
            group_replication: false,
            check_slave_delay: false,
            delay_interval_ms: default_delay_interval_ms(),
            slave_delay_down_secs: default_slave_delay_down(),
            slave_delay_recover_secs: default_slave_delay_recover(),
            dns_recheck: false,
            heartbeat_table: default_heartbeat_table(),
        }
    }
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            rw: Vec::new(),
            ro: Vec::new(),
            partition_mode: false,
            max_idle_connections: DEFAULT_MAX_IDLE,
            mid_idle_connections: DEFAULT_MID_IDLE,
            min_idle_connections: DEFAULT_MIN_IDLE,
        }
    }
}

impl Default for ShardingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            object: default_sharding_object(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: default_store_kind(),
            path: default_store_path(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfGateConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfGateConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfGateConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.monitor.enabled && self.probe.user.is_empty() {
            return Err(crate::Error::Config("probe.user cannot be empty while the monitor is enabled".into()));
        }

        if self.monitor.check_interval_ms == 0 || self.monitor.delay_interval_ms == 0 {
            return Err(crate::Error::Config("monitor intervals must be positive".into()));
        }

        // Recovering above the down threshold would flap
        if self.monitor.slave_delay_recover_secs > self.monitor.slave_delay_down_secs {
            return Err(crate::Error::Config(format!(
                "monitor.slave_delay_recover_secs ({}) must not exceed slave_delay_down_secs ({})",
                self.monitor.slave_delay_recover_secs, self.monitor.slave_delay_down_secs
            )));
        }

        let b = &self.backends;
        if b.min_idle_connections > b.mid_idle_connections || b.mid_idle_connections > b.max_idle_connections {
            return Err(crate::Error::Config(
                "backends: expected min_idle <= mid_idle <= max_idle connections".into(),
            ));
        }

        if self.sharding.object.is_empty() {
            return Err(crate::Error::Config("sharding.object cannot be empty".into()));
        }

        Ok(())
    }

    /// Pool bounds for every backend
    pub fn pool_limits(&self) -> PoolLimits {
        PoolLimits {
            max_idle: self.backends.max_idle_connections,
            mid_idle: self.backends.mid_idle_connections,
            min_idle: self.backends.min_idle_connections,
        }
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get liveness check interval as Duration
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.check_interval_ms)
    }

    /// Get lag measurement interval as Duration
    pub fn delay_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.delay_interval_ms)
    }

    /// Get probe connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.probe.connect_timeout_secs)
    }

    /// Sample configuration written by `wolfgate init`
    pub fn sample(node_id: &str) -> String {
        format!(
            r#"[node]
id = "{node_id}"
data_dir = "/var/lib/wolfgate"

[probe]
user = "monitor"
password = "secret"
connect_timeout_secs = 2

[monitor]
enabled = true
check_interval_ms = 1000
group_replication = false
check_slave_delay = false
slave_delay_down_secs = 10.0
slave_delay_recover_secs = 1.0

[backends]
rw = ["10.0.0.1:3306@g1"]
ro = ["10.0.0.2:3306@g1"]
partition_mode = false

[sharding]
enabled = false

[store]
kind = "file"
path = "/var/lib/wolfgate/objects"

[api]
enabled = true
bind_address = "0.0.0.0:8080"

[logging]
level = "info"
format = "pretty"
"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "gate-1"

[probe]
user = "monitor"
password = "secret"

[monitor]
check_slave_delay = true
slave_delay_down_secs = 10.0
slave_delay_recover_secs = 2.0

[backends]
rw = ["10.0.0.1:3306@g1"]
ro = ["10.0.0.2:3306#5@g1", "10.0.0.3:3306@g1"]

[store]
kind = "sqlite"
path = "/tmp/wolfgate.db"
"#;

        let config = WolfGateConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "gate-1");
        assert_eq!(config.backends.ro.len(), 2);
        assert_eq!(config.store.kind, StoreKind::Sqlite);
        assert_eq!(config.delay_interval(), Duration::from_millis(300));
        assert_eq!(config.pool_limits(), PoolLimits::default());
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_recover_above_down_rejected() {
        let toml = r#"
[node]
id = "gate-1"

[probe]
user = "monitor"

[monitor]
slave_delay_down_secs = 2.0
slave_delay_recover_secs = 5.0
"#;
        assert!(WolfGateConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_probe_user_required_with_monitor() {
        let toml = r#"
[node]
id = "gate-1"
"#;
        assert!(WolfGateConfig::from_str(toml).is_err());

        let toml = r#"
[node]
id = "gate-1"

[monitor]
enabled = false
"#;
        assert!(WolfGateConfig::from_str(toml).is_ok());
    }

    #[test]
    fn test_sample_is_valid() {
        let config = WolfGateConfig::from_str(&WolfGateConfig::sample("gate-7")).unwrap();
        assert_eq!(config.node.id, "gate-7");
        assert_eq!(config.backends.rw, vec!["10.0.0.1:3306@g1".to_string()]);
    }
}
