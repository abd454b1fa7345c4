//! Stake registry and candidate pool shared between ingestion and forging.
//!
//! Both maps live behind one mutex so a forging round can snapshot the
//! registry and take the candidates in a single critical section. Signature
//! checks happen before the lock is taken.

use crate::blockchain::Blockchain;
use crate::crypto;
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Default)]
struct StakeState {
    registry: HashMap<String, u64>,
    candidates: BTreeMap<String, Transaction>,
}

/// What a forging round works from.
#[derive(Debug, Clone, Default)]
pub struct RoundSnapshot {
    pub registry: HashMap<String, u64>,
    /// Stake proposals keyed by hex txid.
    pub candidates: BTreeMap<String, Transaction>,
}

#[derive(Default)]
pub struct StakePool {
    state: Mutex<StakeState>,
}

impl StakePool {
    pub fn new(registry: HashMap<String, u64>) -> Self {
        StakePool {
            state: Mutex::new(StakeState {
                registry,
                candidates: BTreeMap::new(),
            }),
        }
    }

    pub fn register_validator(&self, address: &str, weight: u64) {
        self.state.lock().registry.insert(address.to_string(), weight);
    }

    /// Registered weight, zero when unknown.
    pub fn weight_of(&self, address: &str) -> u64 {
        self.state.lock().registry.get(address).copied().unwrap_or(0)
    }

    pub fn validators(&self) -> HashMap<String, u64> {
        self.state.lock().registry.clone()
    }

    /// Adds an already verified proposal.
    pub fn insert_candidate(&self, tx: Transaction) {
        let id = tx.id_hex();
        self.state.lock().candidates.insert(id, tx);
    }

    /// Verifies `tx` against the ledger and admits it. Invalid proposals are
    /// dropped and `false` returned.
    pub fn admit_candidate(&self, chain: &Blockchain, tx: Transaction) -> bool {
        if !verify_candidate(chain, &tx) {
            return false;
        }
        self.insert_candidate(tx);
        true
    }

    pub fn candidate_count(&self) -> usize {
        self.state.lock().candidates.len()
    }

    /// Copies the registry and takes every candidate, leaving the pool empty.
    pub fn snapshot_and_clear(&self) -> RoundSnapshot {
        let mut state = self.state.lock();
        RoundSnapshot {
            registry: state.registry.clone(),
            candidates: std::mem::take(&mut state.candidates),
        }
    }
}

/// A stake proposal must be an ordinary signed spend that verifies against
/// the outputs it references, with every sender address derived from the
/// key that signed its input.
pub fn verify_candidate(chain: &Blockchain, tx: &Transaction) -> bool {
    if tx.is_coinbase() {
        debug!("Dropping stake proposal {}: coinbase", tx.id_hex());
        return false;
    }
    let senders_bound = tx.inputs.iter().all(|input| {
        crypto::address_from_pub_key_hash(&crypto::public_key_hash(&input.public_key))
            == input.sender_address
    });
    if !senders_bound {
        debug!("Dropping stake proposal {}: sender not bound to key", tx.id_hex());
        return false;
    }
    match chain.verify_transaction(tx) {
        Ok(true) => true,
        Ok(false) => {
            debug!("Dropping stake proposal {}: bad signature", tx.id_hex());
            false
        }
        Err(e) => {
            debug!("Dropping stake proposal {}: {}", tx.id_hex(), e);
            false
        }
    }
}
