//! Configuration management for ForgeChain

use crate::error::ChainError;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.toml";
pub const NODE_ID_ENV: &str = "NODE_ID";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub forger: ForgerConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Doubles as the listening port.
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_known_peers")]
    pub known_peers: Vec<String>,
    /// Defaults to the first known peer.
    #[serde(default)]
    pub seed_peer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForgerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_forge_interval")]
    pub forge_interval_secs: u64,
    /// Zero disables the coinbase in forged blocks.
    #[serde(default)]
    pub block_reward: u64,
    /// Initial stake registry, address to weight.
    #[serde(default)]
    pub validators: HashMap<String, u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    #[serde(default = "default_wallet_path")]
    pub path: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            listen_host: default_listen_host(),
            known_peers: default_known_peers(),
            seed_peer: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for ForgerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            forge_interval_secs: default_forge_interval(),
            block_reward: 0,
            validators: HashMap::new(),
        }
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            path: default_wallet_path(),
        }
    }
}

impl NetworkConfig {
    pub fn node_address(&self) -> String {
        format!("{}:{}", self.listen_host, self.node_id)
    }

    pub fn seed(&self) -> Option<&str> {
        self.seed_peer
            .as_deref()
            .or_else(|| self.known_peers.first().map(String::as_str))
    }

    pub fn is_seed(&self) -> bool {
        self.seed() == Some(self.node_address().as_str())
    }
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ChainError> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .map_err(|e| ChainError::ConfigError(format!("Reading {:?}: {}", path, e)))?;
        Self::from_toml(&config_str)
    }

    pub fn from_toml(config_str: &str) -> Result<Self, ChainError> {
        let config: Config = toml::from_str(config_str)
            .map_err(|e| ChainError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ChainError> {
        if self.database.path.is_empty() {
            return Err(ChainError::ConfigError(
                "database.path must be set in config.toml".to_string(),
            ));
        }
        if self.forger.forge_interval_secs == 0 {
            return Err(ChainError::ConfigError(
                "forger.forge_interval_secs must be greater than zero".to_string(),
            ));
        }
        if let Some((address, _)) = self.forger.validators.iter().find(|(_, w)| **w == 0) {
            return Err(ChainError::ConfigError(format!(
                "forger.validators: weight for {} must be positive",
                address
            )));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(self.substitute_node_id(&self.database.path))
    }

    pub fn wallet_path(&self) -> PathBuf {
        PathBuf::from(self.substitute_node_id(&self.wallet.path))
    }

    fn substitute_node_id(&self, template: &str) -> String {
        template.replace("{node_id}", &self.network.node_id)
    }
}

/// Loads `config.toml` from the working directory, falling back to defaults
/// when it is absent. `NODE_ID` in the environment overrides the node id.
pub fn load_config() -> Result<Config, ChainError> {
    load_config_from(None)
}

/// Like [`load_config`], reading `path` instead of `config.toml` when given.
pub fn load_config_from(path: Option<&Path>) -> Result<Config, ChainError> {
    let mut config = match path {
        Some(path) => Config::from_path(path)?,
        None if Path::new(CONFIG_FILE).exists() => Config::from_path(CONFIG_FILE)?,
        None => Config::default(),
    };

    if let Ok(node_id) = std::env::var(NODE_ID_ENV) {
        if !node_id.is_empty() {
            config.network.node_id = node_id;
        }
    }

    Ok(config)
}

fn default_node_id() -> String {
    "10111".to_string()
}

fn default_listen_host() -> String {
    "localhost".to_string()
}

fn default_known_peers() -> Vec<String> {
    (10111..=10114).map(|port| format!("localhost:{}", port)).collect()
}

fn default_database_path() -> String {
    "./tmp/blocks_{node_id}.db".to_string()
}

fn default_wallet_path() -> String {
    "./tmp/wallets_{node_id}.json".to_string()
}

fn default_forge_interval() -> u64 {
    30
}
