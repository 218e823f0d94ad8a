// Configuration module for the Swarm node
//
// This module handles loading and managing the node configuration. Every
// policy value of the accounting and forwarding protocols is configurable.

use crate::error::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment variables overriding file values, e.g.
/// `SWARM_ACCOUNTING__PAYMENT_THRESHOLD=5000`
pub const ENV_PREFIX: &str = "SWARM";

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Node identity configuration
    #[serde(default)]
    pub node: NodeConfig,
    /// Accounting and settlement configuration
    #[serde(default)]
    pub accounting: AccountingConfig,
    /// Pricing configuration
    #[serde(default)]
    pub pricing: PricingConfig,
    /// Pushsync protocol configuration
    #[serde(default)]
    pub pushsync: PushSyncConfig,
    /// Retrieval protocol configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Pusher configuration
    #[serde(default)]
    pub pusher: PusherConfig,
    /// Stream layer configuration
    #[serde(default)]
    pub p2p: P2pConfig,
    /// Devnet simulation configuration
    #[serde(default)]
    pub devnet: DevnetConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node identity configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// Network the node participates in
    pub network_id: u64,
    /// Whether the node stores and forwards chunks
    #[serde(default = "default_true")]
    pub full_node: bool,
    /// Message sent to peers in the handshake
    #[serde(default)]
    pub welcome_message: String,
    /// Path of the hex-encoded secp256k1 key
    pub key_file: PathBuf,
}

/// Accounting and settlement configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountingConfig {
    /// Debt at which settlement is due
    pub payment_threshold: u64,
    /// Slack over the payment threshold before a debtor is blocklisted, in percent
    pub payment_tolerance_percent: u64,
    /// Divisor applied to thresholds of light peers
    pub light_factor: u64,
    /// Multiplier of the payment threshold at which a debtor is disconnected
    pub disconnect_factor: u64,
    /// How long a peer crossing the threshold stays blocklisted
    pub block_duration_secs: u64,
    /// Refreshment allowance granted to full peers per second
    pub refresh_rate: u64,
    /// Refreshment allowance granted to light peers per second
    pub light_refresh_rate: u64,
    /// Capacity of the settlement worker queue
    pub settlement_queue_size: usize,
    /// Consecutive settlement failures before the peer is blocklisted
    pub max_settlement_failures: u32,
}

/// Pricing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PricingConfig {
    /// Price of one proximity order step
    pub base_price: u64,
}

/// Pushsync configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushSyncConfig {
    /// Distinct forwarding hops tried per push
    pub max_peers: usize,
    /// Deadline for the receipt of one hop
    pub receipt_timeout_ms: u64,
    /// Blocklist duration after a timed-out hop
    pub blocklist_duration_secs: u64,
    /// Neighbourhood peers a storer replicates to
    pub replication_factor: usize,
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalConfig {
    /// Probes allowed in flight at once
    pub parallel_requests: usize,
    /// Delay before the next probe starts
    pub forward_stagger_ms: u64,
    /// Deadline for a delivery
    pub read_timeout_ms: u64,
    /// Total probes per retrieval
    pub max_attempts: usize,
    /// Blocklist duration after a timed-out or invalid delivery
    pub blocklist_duration_secs: u64,
}

/// Pusher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PusherConfig {
    /// Pushes in flight at once
    pub concurrent_pushes: usize,
    /// Push calls per chunk before it is abandoned
    pub retry_count: usize,
    /// Time allowed to drain in-flight pushes on shutdown
    pub shutdown_grace_ms: u64,
}

/// Stream layer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct P2pConfig {
    /// Deadline for reading one frame
    pub read_timeout_ms: u64,
    /// Deadline for writing one frame
    pub write_deadline_ms: u64,
    /// Largest accepted frame
    pub max_frame_size: usize,
}

/// Devnet simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DevnetConfig {
    /// Number of in-process nodes
    pub nodes: usize,
    /// Number of chunks uploaded
    pub chunks: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (json, text)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default values
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network_id: 1,
            full_node: default_true(),
            welcome_message: String::new(),
            key_file: PathBuf::from("data/node.key"),
        }
    }
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            payment_threshold: 13_500_000,
            payment_tolerance_percent: 25,
            light_factor: 10,
            disconnect_factor: 2,
            block_duration_secs: 300,
            refresh_rate: 4_500_000,
            light_refresh_rate: 450_000,
            settlement_queue_size: 64,
            max_settlement_failures: 3,
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self { base_price: 10_000 }
    }
}

impl Default for PushSyncConfig {
    fn default() -> Self {
        Self {
            max_peers: 5,
            receipt_timeout_ms: 3_000,
            blocklist_duration_secs: 60,
            replication_factor: 2,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            parallel_requests: 3,
            forward_stagger_ms: 600,
            read_timeout_ms: 4_000,
            max_attempts: 8,
            blocklist_duration_secs: 60,
        }
    }
}

impl Default for PusherConfig {
    fn default() -> Self {
        Self {
            concurrent_pushes: 10,
            retry_count: 6,
            shutdown_grace_ms: 6_000,
        }
    }
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 4_000,
            write_deadline_ms: 4_000,
            max_frame_size: 128 * 1024,
        }
    }
}

impl Default for DevnetConfig {
    fn default() -> Self {
        Self { nodes: 8, chunks: 32 }
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

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            accounting: AccountingConfig::default(),
            pricing: PricingConfig::default(),
            pushsync: PushSyncConfig::default(),
            retrieval: RetrievalConfig::default(),
            pusher: PusherConfig::default(),
            p2p: P2pConfig::default(),
            devnet: DevnetConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AccountingConfig {
    /// Duration a threshold-crossing peer stays blocklisted
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }
}

impl PushSyncConfig {
    /// Receipt deadline as a duration
    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_millis(self.receipt_timeout_ms)
    }

    /// Blocklist duration as a duration
    pub fn blocklist_duration(&self) -> Duration {
        Duration::from_secs(self.blocklist_duration_secs)
    }
}

impl RetrievalConfig {
    /// Stagger delay as a duration
    pub fn forward_stagger(&self) -> Duration {
        Duration::from_millis(self.forward_stagger_ms)
    }

    /// Delivery deadline as a duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Blocklist duration as a duration
    pub fn blocklist_duration(&self) -> Duration {
        Duration::from_secs(self.blocklist_duration_secs)
    }
}

impl PusherConfig {
    /// Shutdown grace as a duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl P2pConfig {
    /// Frame read deadline as a duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Frame write deadline as a duration
    pub fn write_deadline(&self) -> Duration {
        Duration::from_millis(self.write_deadline_ms)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&config_str)
            .map_err(|e| NodeError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file layered with `SWARM_` environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref().to_path_buf()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let config_str = toml::to_string_pretty(self)
            .map_err(|e| NodeError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, config_str)
            .map_err(|e| NodeError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Reject values the protocols cannot run with
    pub fn validate(&self) -> Result<()> {
        let acc = &self.accounting;
        if acc.payment_threshold == 0 {
            return Err(NodeError::Config("payment_threshold must be positive".into()));
        }
        if acc.light_factor == 0 {
            return Err(NodeError::Config("light_factor must be positive".into()));
        }
        if acc.disconnect_factor == 0 {
            return Err(NodeError::Config("disconnect_factor must be positive".into()));
        }
        if acc.settlement_queue_size == 0 {
            return Err(NodeError::Config("settlement_queue_size must be positive".into()));
        }
        if self.pushsync.max_peers == 0 {
            return Err(NodeError::Config("pushsync.max_peers must be positive".into()));
        }
        if self.retrieval.parallel_requests == 0 || self.retrieval.max_attempts == 0 {
            return Err(NodeError::Config(
                "retrieval.parallel_requests and max_attempts must be positive".into(),
            ));
        }
        if self.pusher.concurrent_pushes == 0 || self.pusher.retry_count == 0 {
            return Err(NodeError::Config(
                "pusher.concurrent_pushes and retry_count must be positive".into(),
            ));
        }
        if self.node.welcome_message.chars().count() > crate::p2p::handshake::MAX_WELCOME_MESSAGE_LENGTH {
            return Err(NodeError::Config("welcome_message is too long".into()));
        }
        Ok(())
    }
}

/// Generate a default configuration file at the given path if it doesn't exist
pub fn ensure_default_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    if !path.as_ref().exists() {
        let default_config = Config::default();

        if let Some(dir) = path.as_ref().parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).map_err(|e| {
                    NodeError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        default_config.to_file(&path)?;
        return Ok(default_config);
    }

    Config::from_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pushsync.max_peers, 5);
        assert_eq!(config.pusher.retry_count, 6);
        assert_eq!(config.pusher.concurrent_pushes, 10);
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.accounting.payment_threshold = 1_000;
        config.to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(
            &path,
            "[node]\nnetwork_id = 7\nkey_file = \"k.key\"\n\n[pricing]\nbase_price = 3\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.node.network_id, 7);
        assert_eq!(config.pricing.base_price, 3);
        assert_eq!(config.pushsync, PushSyncConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = Config::default();
        config.accounting.payment_threshold = 0;
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));
    }

    #[test]
    fn test_ensure_default_config_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let created = ensure_default_config(&path).unwrap();
        assert!(path.exists());
        assert_eq!(ensure_default_config(&path).unwrap(), created);
    }
}
