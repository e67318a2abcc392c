//! Dotmesh Configuration
//!
//! This module provides configuration structures for a dotmesh
//! replication node.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main dotmesh node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DotmeshConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Native snapshot engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Transfer and proxy configuration
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Secret store configuration
    #[serde(default)]
    pub secrets: SecretsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Data directory for snapshot metadata
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
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

    /// Port assumed for peer addresses that do not carry one
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,

    /// Connect timeout for outbound calls, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Native snapshot engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine binary
    #[serde(default = "default_engine_binary")]
    pub binary: String,

    /// Pool holding the volumes
    #[serde(default = "default_pool")]
    pub pool: String,

    /// Dataset prefix below the pool
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cache refresh interval in milliseconds
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    /// How a master address is picked from a node's address list
    #[serde(default)]
    pub address_selection: AddressSelection,

    /// Known nodes and their addresses (seed for the coordination store)
    #[serde(default)]
    pub nodes: Vec<NodeSeed>,

    /// Known volumes and their masters (seed for the coordination store)
    #[serde(default)]
    pub volumes: Vec<VolumeSeed>,
}

/// A node known at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSeed {
    pub id: String,
    pub addresses: Vec<String>,
}

/// A volume known at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSeed {
    pub id: String,
    pub master: String,
}

/// Address selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AddressSelection {
    /// Always the first address in the list
    #[default]
    First,
    /// Rotate through the list
    RoundRobin,
}

/// Transfer and proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Service identity used when proxying to a master
    #[serde(default = "default_service_user")]
    pub service_user: String,

    /// What to do when a peer answers "not master / wrong state"
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Progress channel depth for relays
    #[serde(default = "default_progress_depth")]
    pub progress_depth: usize,

    /// Completed transfer results kept for polling
    #[serde(default = "default_retained_results")]
    pub retained_results: usize,
}

/// Retry policy for 404 (not master / wrong state) answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Surface the first failure to the caller
    #[default]
    FailFast,
    /// Retry with exponential backoff
    Backoff {
        max_attempts: u32,
        initial_backoff_ms: u64,
        max_backoff_ms: u64,
    },
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), or None when exhausted
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match *self {
            RetryPolicy::FailFast => None,
            RetryPolicy::Backoff {
                max_attempts,
                initial_backoff_ms,
                max_backoff_ms,
            } => {
                if attempt >= max_attempts {
                    return None;
                }
                let shift = attempt.saturating_sub(1).min(20);
                let delay = initial_backoff_ms.saturating_mul(1u64 << shift);
                Some(Duration::from_millis(delay.min(max_backoff_ms)))
            }
        }
    }
}

/// Secret store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// JSON file mapping user names to API keys
    #[serde(default = "default_secrets_file")]
    pub file: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:32607".to_string()
}

fn default_peer_port() -> u16 {
    32607
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_engine_binary() -> String {
    "zfs".to_string()
}

fn default_pool() -> String {
    "pool".to_string()
}

fn default_prefix() -> String {
    "dmfs".to_string()
}

fn default_refresh_interval_ms() -> u64 {
    1000
}

fn default_service_user() -> String {
    "admin".to_string()
}

fn default_progress_depth() -> usize {
    16
}

fn default_retained_results() -> usize {
    256
}

fn default_secrets_file() -> PathBuf {
    PathBuf::from("/var/lib/dotmesh/passwords.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/dotmesh")
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            peer_port: default_peer_port(),
            connect_timeout_secs: default_connect_timeout(),
            cors_enabled: false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: default_engine_binary(),
            pool: default_pool(),
            prefix: default_prefix(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: default_refresh_interval_ms(),
            address_selection: AddressSelection::default(),
            nodes: Vec::new(),
            volumes: Vec::new(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            service_user: default_service_user(),
            retry: RetryPolicy::default(),
            progress_depth: default_progress_depth(),
            retained_results: default_retained_results(),
        }
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            file: default_secrets_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl DotmeshConfig {
    /// Minimal configuration for a node, everything else defaulted
    pub fn for_node(node_id: impl Into<String>, data_dir: PathBuf) -> Self {
        Self {
            node: NodeConfig {
                id: node_id.into(),
                data_dir,
            },
            api: ApiConfig::default(),
            engine: EngineConfig::default(),
            cluster: ClusterConfig::default(),
            transfer: TransferConfig::default(),
            secrets: SecretsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DotmeshConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: DotmeshConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.api.enabled && self.api.bind_address.is_empty() {
            return Err(crate::Error::Config("api.bind_address cannot be empty".into()));
        }

        if self.engine.binary.is_empty() || self.engine.pool.is_empty() {
            return Err(crate::Error::Config("engine.binary and engine.pool are required".into()));
        }

        if self.cluster.refresh_interval_ms == 0 {
            return Err(crate::Error::Config("cluster.refresh_interval_ms must be positive".into()));
        }

        if self.transfer.progress_depth == 0 {
            return Err(crate::Error::Config("transfer.progress_depth must be positive".into()));
        }

        if self.transfer.retained_results == 0 {
            return Err(crate::Error::Config("transfer.retained_results must be positive".into()));
        }

        if let RetryPolicy::Backoff { max_attempts, .. } = self.transfer.retry {
            if max_attempts == 0 {
                return Err(crate::Error::Config("transfer.retry.max_attempts must be positive".into()));
            }
        }

        for node in &self.cluster.nodes {
            if node.addresses.is_empty() {
                return Err(crate::Error::Config(format!("cluster node {} has no addresses", node.id)));
            }
        }

        Ok(())
    }

    /// Get the metadata directory path
    pub fn metadata_dir(&self) -> PathBuf {
        self.node.data_dir.join("metadata")
    }

    /// Get cache refresh interval as Duration
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.refresh_interval_ms)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.api.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "node-1"
data_dir = "/var/lib/dotmesh"

[engine]
pool = "tank"

[cluster]
refresh_interval_ms = 500
address_selection = "round_robin"

[[cluster.nodes]]
id = "node-2"
addresses = ["10.0.0.2", "fd00::2"]

[[cluster.volumes]]
id = "v1"
master = "node-2"

[transfer.retry]
policy = "backoff"
max_attempts = 3
initial_backoff_ms = 100
max_backoff_ms = 1000
"#;

        let config = DotmeshConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "node-1");
        assert_eq!(config.engine.pool, "tank");
        assert_eq!(config.engine.prefix, "dmfs");
        assert_eq!(config.cluster.address_selection, AddressSelection::RoundRobin);
        assert_eq!(config.cluster.nodes[0].addresses.len(), 2);
        assert_eq!(config.transfer.service_user, "admin");
        assert_eq!(config.refresh_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_empty_node_id_rejected() {
        let toml = r#"
[node]
id = ""
"#;
        assert!(matches!(DotmeshConfig::from_str(toml), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_retry_policy_delays() {
        assert_eq!(RetryPolicy::FailFast.delay_for(1), None);

        let backoff = RetryPolicy::Backoff {
            max_attempts: 4,
            initial_backoff_ms: 100,
            max_backoff_ms: 250,
        };
        assert_eq!(backoff.delay_for(1), Some(Duration::from_millis(100)));
        assert_eq!(backoff.delay_for(2), Some(Duration::from_millis(200)));
        assert_eq!(backoff.delay_for(3), Some(Duration::from_millis(250)));
        assert_eq!(backoff.delay_for(4), None);
    }
}
