//! Node configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::gateway::ConfirmationConfig;
use crate::ledger::LedgerConfig;
use crate::models::HouseholdContext;
use crate::pricing::VolatilitySource;
use crate::transport::TransportConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    #[serde(default)]
    pub api: ApiConfig,
    /// Households registered at startup
    #[serde(default)]
    pub households: Vec<HouseholdContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier, also used as the NATS client name
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Data directory holding `pulse.db`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingConfig {
    /// `"clock"` or `{ fixed = <seed> }`
    #[serde(default)]
    pub volatility: VolatilitySource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
        }
    }
}

// Defaults
fn default_node_id() -> String { "pulse-node-1".to_string() }
fn default_data_dir() -> PathBuf { PathBuf::from("data") }
fn default_http_port() -> u16 { 8080 }

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    /// Load from a TOML file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = &self.transport.subject_prefix;
        if prefix.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "transport.subject_prefix must not be empty".to_string(),
            ));
        }
        if prefix.contains('*') || prefix.contains('>') {
            return Err(ConfigError::Invalid(format!(
                "transport.subject_prefix must not contain wildcards: {}",
                prefix
            )));
        }
        if self.confirmation.max_in_flight == Some(0) {
            return Err(ConfigError::Invalid(
                "confirmation.max_in_flight must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
