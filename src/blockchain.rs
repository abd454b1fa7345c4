// Thin re-export module: implementation is in `blockchain/core.rs`, split into
// chain storage, the UTXO index and ledger-level validation.

pub mod core;
pub use core::*;
