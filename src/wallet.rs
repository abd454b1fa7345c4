//! Wallet key files.
//!
//! A [`Wallet`] is a secp256k1 key pair plus its address, stored as JSON.
//! [`Wallets`] keeps every wallet of a node in one file keyed by address.

use crate::crypto::{self, KeyPair};
use crate::error::ChainError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub name: Option<String>,
    pub address: String,
    pub public_key_hex: String,
    pub secret_key_hex: String,
    /// RFC 3339 creation time.
    pub created: String,
}

impl Wallet {
    pub fn new(name: Option<String>) -> Result<Self, ChainError> {
        let keypair = KeyPair::generate()?;
        Ok(Self::from_keypair(&keypair, name))
    }

    pub fn from_keypair(keypair: &KeyPair, name: Option<String>) -> Self {
        Wallet {
            name,
            address: keypair.address(),
            public_key_hex: hex::encode(keypair.public_key_bytes()),
            secret_key_hex: hex::encode(keypair.secret_key.secret_bytes()),
            created: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn get_keypair(&self) -> Result<KeyPair, ChainError> {
        let bytes = hex::decode(&self.secret_key_hex)
            .map_err(|e| ChainError::WalletError(format!("Invalid secret key hex: {}", e)))?;
        let keypair = KeyPair::from_secret_bytes(&bytes)?;
        if keypair.address() != self.address {
            return Err(ChainError::WalletError(format!(
                "Secret key does not belong to {}",
                self.address
            )));
        }
        Ok(keypair)
    }

    pub fn public_key_hash(&self) -> Result<Vec<u8>, ChainError> {
        crypto::pub_key_hash_from_address(&self.address)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ChainError> {
        write_json(path.as_ref(), self)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ChainError> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallets {
    wallets: BTreeMap<String, Wallet>,
}

impl Wallets {
    /// Reads the wallet file, or starts empty if it does not exist yet.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ChainError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Wallets::default());
        }
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ChainError> {
        write_json(path.as_ref(), self)
    }

    /// Creates a wallet and returns its address.
    pub fn add_new_wallet(&mut self, name: Option<String>) -> Result<String, ChainError> {
        let wallet = Wallet::new(name)?;
        let address = wallet.address.clone();
        self.wallets.insert(address.clone(), wallet);
        Ok(address)
    }

    pub fn get(&self, address: &str) -> Result<&Wallet, ChainError> {
        self.wallets
            .get(address)
            .ok_or_else(|| ChainError::WalletError(format!("No wallet for {}", address)))
    }

    pub fn addresses(&self) -> Vec<String> {
        self.wallets.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ChainError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let data = serde_json::to_string_pretty(value)?;
    fs::write(path, data)?;
    Ok(())
}
