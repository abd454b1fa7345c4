//! Error types for ForgeChain

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    InvalidTransaction(String),
    InsufficientFunds { needed: u64, available: u64 },
    UnknownPreviousTransaction(String),
    InvalidAddress(String),
    InvalidBlock(String),
    DoubleSpendDetected(String),
    CryptoError(String),
    NotFound(String),
    DatabaseError(String),
    DatabaseLocked(String),
    IoError(String),
    BincodeError(String),
    NetworkError(String),
    PeerUnavailable(String),
    ConfigError(String),
    WalletError(String),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChainError::InvalidTransaction(msg) => write!(f, "Invalid transaction: {}", msg),
            ChainError::InsufficientFunds { needed, available } => write!(
                f,
                "Insufficient funds: needed {}, available {}",
                needed, available
            ),
            ChainError::UnknownPreviousTransaction(id) => {
                write!(f, "Unknown previous transaction: {}", id)
            }
            ChainError::InvalidAddress(msg) => write!(f, "Invalid address: {}", msg),
            ChainError::InvalidBlock(msg) => write!(f, "Invalid block: {}", msg),
            ChainError::DoubleSpendDetected(msg) => write!(f, "Double spend detected: {}", msg),
            ChainError::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            ChainError::NotFound(msg) => write!(f, "Not found: {}", msg),
            ChainError::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            ChainError::DatabaseLocked(msg) => write!(f, "Database locked: {}", msg),
            ChainError::IoError(msg) => write!(f, "IO error: {}", msg),
            ChainError::BincodeError(msg) => write!(f, "Bincode error: {}", msg),
            ChainError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            ChainError::PeerUnavailable(msg) => write!(f, "Peer not available: {}", msg),
            ChainError::ConfigError(msg) => write!(f, "Config error: {}", msg),
            ChainError::WalletError(msg) => write!(f, "Wallet error: {}", msg),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::BincodeError(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::WalletError(err.to_string())
    }
}
