//! ForgeChain - a minimal proof-of-stake UTXO ledger
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Ledger
//! - [`merkle`] - Merkle commitment over a block's transactions
//! - [`transaction`] - Transaction types, coinbase issuance, signing and verification
//! - [`blockchain`] - Block store, tip pointer, backward iteration and the UTXO index
//!
//! ## Consensus
//! - [`stake`] - Stake registry and candidate pool
//! - [`forger`] - Lottery-based forging rounds
//!
//! ## Cryptography
//! - [`crypto`] - secp256k1 keys, signatures, public-key hashing and addresses
//!
//! ## State Management
//! - [`persistence`] - Key-value store contract (SQLite and in-memory)
//! - [`mempool`] - Pending transactions and blocks in transit
//! - [`wallet`] - Wallet key files
//!
//! ## Networking
//! - [`network`] - Peer messages, framing and handlers
//! - [`node`] - Shared node context and task startup
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Ledger
// ============================================================================
pub mod blockchain;
pub mod merkle;
pub mod transaction;

// ============================================================================
// Consensus
// ============================================================================
pub mod forger;
pub mod stake;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// State Management
// ============================================================================
pub mod mempool;
pub mod persistence;
pub mod wallet;

// ============================================================================
// Networking
// ============================================================================
pub mod network;
pub mod node;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
