//! Node configuration
//!
//! One `NodeConfig` drives both binaries. Values come from serde defaults,
//! then an optional YAML file, then `SHARING__`-prefixed environment
//! variables (`SHARING__BRIDGE__MAX_RETRIES=5`).

use ethers::types::{Address, U256};
use ethers::utils::parse_ether;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::bridges::RetryPolicy;

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Failed to parse YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub ledger: LedgerConfig,
    pub bridge: BridgeConfig,
    pub middleware: MiddlewareConfig,
    pub agent: AgentConfig,
    pub storage: StorageConfig,
}

/// A bearer credential and the ledger identity it authenticates
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialEntry {
    pub token: String,
    pub address: Address,
}

/// Escrow ledger settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Listen address of the ledger node HTTP surface
    pub listen_addr: String,
    /// Address the ledger is deployed at; creation requests must name it
    pub address: Address,
    /// The only identity allowed to confirm or cancel
    pub owner: Address,
    /// Price per user-minute, in ether
    pub rate_per_minute: String,
    /// Credentials accepted by the write surface
    pub credentials: Vec<CredentialEntry>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let owner: Address = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
            .parse()
            .unwrap_or_default();
        Self {
            listen_addr: "0.0.0.0:3020".to_string(),
            address: "0x5fbdb2315678afecb367f032d93f642f64180aa3"
                .parse()
                .unwrap_or_default(),
            owner,
            rate_per_minute: "0.00012".to_string(),
            credentials: vec![CredentialEntry {
                token: "owner-dev-token".to_string(),
                address: owner,
            }],
        }
    }
}

impl LedgerConfig {
    /// Rate per user-minute in wei
    pub fn rate_per_minute_wei(&self) -> Result<U256, ConfigError> {
        parse_ether(&self.rate_per_minute).map_err(|e| ConfigError::Invalid {
            field: "ledger.rate_per_minute",
            reason: e.to_string(),
        })
    }
}

/// Sync bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Base URL of the middleware receiving state updates
    pub middleware_url: String,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles on every retry
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay
    pub max_delay_ms: u64,
    /// Per-attempt HTTP timeout
    pub request_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            middleware_url: "http://localhost:25000".to_string(),
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            request_timeout_secs: 10,
        }
    }
}

impl BridgeConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Middleware settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    pub listen_addr: String,
    /// Base URL of the ledger node API (`.../api`)
    pub node_server_url: String,
    pub request_timeout_secs: u64,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:25000".to_string(),
            node_server_url: "http://localhost:3020/api".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Network control agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub url: String,
    /// Network element (gNodeB) resource id on the agent
    pub gnb_id: String,
    pub feature_name: String,
    /// PLMN used for restrictions when the order names none
    pub default_plmn: String,
    /// Restore the original configuration once the tenant duration elapses
    pub restore_after_duration: bool,
    pub request_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: "http://172.16.100.209:28080".to_string(),
            gnb_id: "1".to_string(),
            feature_name: "gNodeB_service".to_string(),
            default_plmn: "00101".to_string(),
            restore_after_duration: true,
            request_timeout_secs: 30,
        }
    }
}

impl AgentConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Request store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sled,
            data_dir: "data/requests".to_string(),
        }
    }
}

impl NodeConfig {
    /// Layer defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SHARING")
                .separator("__")
                .try_parsing(true),
        );

        let config: NodeConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Read a YAML file without environment overrides
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.ledger.rate_per_minute_wei()?;
        if self.ledger.owner.is_zero() {
            return Err(ConfigError::Invalid {
                field: "ledger.owner",
                reason: "owner must not be the zero address".to_string(),
            });
        }
        if self.bridge.base_delay_ms == 0 && self.bridge.max_retries > 0 {
            return Err(ConfigError::Invalid {
                field: "bridge.base_delay_ms",
                reason: "retries need a non-zero base delay".to_string(),
            });
        }
        Ok(())
    }
}
