//! UTXO index: spendable outputs persisted under `utxo-` keys, derived from
//! the canonical chain.

use crate::blockchain::core::chain::{AppendOutcome, Block, Blockchain};
use crate::error::ChainError;
use crate::transaction::{Transaction, TxOutput};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

pub const UTXO_PREFIX: &[u8] = b"utxo-";

/// An output still unspent, with its position in the creating transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub index: i64,
    pub output: TxOutput,
}

/// Spendable outputs keyed by hex transaction id.
pub type UtxoMap = BTreeMap<String, Vec<UnspentOutput>>;

fn entry_key(tx_id: &[u8]) -> Vec<u8> {
    let mut key = UTXO_PREFIX.to_vec();
    key.extend_from_slice(tx_id);
    key
}

fn decode_entry(key: &[u8], value: &[u8]) -> Result<(String, Vec<UnspentOutput>), ChainError> {
    let id = hex::encode(&key[UTXO_PREFIX.len()..]);
    let outputs: Vec<UnspentOutput> = bincode::deserialize(value)?;
    Ok((id, outputs))
}

pub struct UtxoSet {
    chain: Arc<Blockchain>,
    /// Held by `reindex` across scan and write, and by `update`.
    refresh: Mutex<()>,
}

impl UtxoSet {
    pub fn new(chain: Arc<Blockchain>) -> Self {
        UtxoSet {
            chain,
            refresh: Mutex::new(()),
        }
    }

    pub fn blockchain(&self) -> &Blockchain {
        &self.chain
    }

    pub fn chain(&self) -> &Arc<Blockchain> {
        &self.chain
    }

    /// Walks the canonical chain newest to oldest and reports every output
    /// that no later input consumes. A block's inputs are recorded before its
    /// outputs are considered, so spends within the same block are excluded.
    fn walk_unspent(
        &self,
        mut visit: impl FnMut(&Transaction, i64, &TxOutput),
    ) -> Result<(), ChainError> {
        let mut spent: HashMap<Vec<u8>, HashSet<i64>> = HashMap::new();

        for block in self.chain.iter() {
            let block = block?;

            for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
                for input in &tx.inputs {
                    spent
                        .entry(input.prev_tx_id.clone())
                        .or_default()
                        .insert(input.out_index);
                }
            }

            for tx in &block.transactions {
                let consumed = spent.get(&tx.id);
                for (index, output) in tx.outputs.iter().enumerate() {
                    let index = index as i64;
                    if consumed.is_some_and(|s| s.contains(&index)) {
                        continue;
                    }
                    visit(tx, index, output);
                }
            }
        }
        Ok(())
    }

    /// Full-chain scan of every unspent output.
    pub fn scan_chain(&self) -> Result<UtxoMap, ChainError> {
        let mut unspent = UtxoMap::new();
        self.walk_unspent(|tx, index, output| {
            unspent.entry(tx.id_hex()).or_default().push(UnspentOutput {
                index,
                output: output.clone(),
            });
        })?;
        Ok(unspent)
    }

    /// Rebuilds the persisted index from scratch.
    pub fn reindex(&self) -> Result<(), ChainError> {
        let _refresh = self.refresh.lock();
        let unspent = self.scan_chain()?;

        let mut entries = Vec::with_capacity(unspent.len());
        for (id, outputs) in &unspent {
            let tx_id = hex::decode(id)
                .map_err(|e| ChainError::DatabaseError(format!("Bad txid {}: {}", id, e)))?;
            entries.push((entry_key(&tx_id), bincode::serialize(outputs)?));
        }

        self.chain.store().write(|txn| {
            for (key, _) in txn.scan_prefix(UTXO_PREFIX)? {
                txn.delete(&key)?;
            }
            for (key, value) in &entries {
                txn.set(key, value)?;
            }
            Ok(())
        })?;

        info!("UTXO index rebuilt with {} transactions", unspent.len());
        Ok(())
    }

    /// Applies one block that extends the indexed chain.
    pub fn update(&self, block: &Block) -> Result<(), ChainError> {
        let _refresh = self.refresh.lock();
        self.chain.store().write(|txn| {
            for tx in &block.transactions {
                if !tx.is_coinbase() {
                    for input in &tx.inputs {
                        let key = entry_key(&input.prev_tx_id);
                        let Some(data) = txn.get(&key)? else {
                            continue;
                        };
                        let mut outputs: Vec<UnspentOutput> = bincode::deserialize(&data)?;
                        outputs.retain(|o| o.index != input.out_index);

                        if outputs.is_empty() {
                            txn.delete(&key)?;
                        } else {
                            txn.set(&key, &bincode::serialize(&outputs)?)?;
                        }
                    }
                }

                let created: Vec<UnspentOutput> = tx
                    .outputs
                    .iter()
                    .enumerate()
                    .map(|(index, output)| UnspentOutput {
                        index: index as i64,
                        output: output.clone(),
                    })
                    .collect();
                if !created.is_empty() {
                    txn.set(&entry_key(&tx.id), &bincode::serialize(&created)?)?;
                }
            }
            Ok(())
        })?;

        debug!("UTXO index updated with block {}", block.hash_hex());
        Ok(())
    }

    /// Refreshes the index after `Blockchain::append`.
    pub fn apply_append(&self, block: &Block, outcome: AppendOutcome) -> Result<(), ChainError> {
        match outcome {
            AppendOutcome::Extended => self.update(block),
            AppendOutcome::Reorganized => self.reindex(),
            AppendOutcome::Duplicate | AppendOutcome::SideBlock => Ok(()),
        }
    }

    /// The whole persisted index.
    pub fn entries(&self) -> Result<UtxoMap, ChainError> {
        let pairs = self
            .chain
            .store()
            .read(|txn| txn.scan_prefix(UTXO_PREFIX))?;
        pairs
            .iter()
            .map(|(key, value)| decode_entry(key, value))
            .collect()
    }

    /// Greedily picks outputs locked to `pub_key_hash` until `amount` is
    /// covered. Returns the accumulated value and the chosen indices per txid.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, BTreeMap<String, Vec<i64>>), ChainError> {
        let mut accumulated = 0u64;
        let mut chosen: BTreeMap<String, Vec<i64>> = BTreeMap::new();

        for (id, outputs) in self.entries()? {
            for unspent in outputs {
                if accumulated >= amount {
                    break;
                }
                if unspent.output.is_locked_with_key(pub_key_hash) {
                    accumulated = accumulated.saturating_add(unspent.output.value);
                    chosen.entry(id.clone()).or_default().push(unspent.index);
                }
            }
        }

        Ok((accumulated, chosen))
    }

    /// Transactions that still hold an unspent output for `pub_key_hash`,
    /// newest first.
    pub fn find_unspent_transactions(
        &self,
        pub_key_hash: &[u8],
    ) -> Result<Vec<Transaction>, ChainError> {
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        self.walk_unspent(|tx, _, output| {
            if output.is_locked_with_key(pub_key_hash) && seen.insert(tx.id.clone()) {
                found.push(tx.clone());
            }
        })?;
        Ok(found)
    }

    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TxOutput>, ChainError> {
        Ok(self
            .entries()?
            .into_values()
            .flatten()
            .map(|u| u.output)
            .filter(|o| o.is_locked_with_key(pub_key_hash))
            .collect())
    }

    /// Looks up one indexed output. `None` if it is spent or never existed.
    pub fn find_output(&self, tx_id: &[u8], out_index: i64) -> Result<Option<TxOutput>, ChainError> {
        let key = entry_key(tx_id);
        let Some(data) = self.chain.store().read(|txn| txn.get(&key))? else {
            return Ok(None);
        };
        let outputs: Vec<UnspentOutput> = bincode::deserialize(&data)?;
        Ok(outputs
            .into_iter()
            .find(|u| u.index == out_index)
            .map(|u| u.output))
    }

    pub fn balance(&self, pub_key_hash: &[u8]) -> Result<u64, ChainError> {
        self.find_utxo(pub_key_hash)?
            .iter()
            .try_fold(0u64, |total, o| total.checked_add(o.value))
            .ok_or_else(|| {
                ChainError::InvalidTransaction(format!(
                    "Balance of {} overflows",
                    hex::encode(pub_key_hash)
                ))
            })
    }

    pub fn count_transactions(&self) -> Result<usize, ChainError> {
        Ok(self
            .chain
            .store()
            .read(|txn| txn.scan_prefix(UTXO_PREFIX))?
            .len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::persistence::{InMemoryStore, KvStore};

    fn setup() -> (UtxoSet, KeyPair) {
        let alice = KeyPair::generate().unwrap();
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let chain = Arc::new(Blockchain::init(store, &alice.address()).unwrap());
        let utxo = UtxoSet::new(chain);
        utxo.reindex().unwrap();
        (utxo, alice)
    }

    fn commit(utxo: &UtxoSet, txs: Vec<Transaction>, validator: &str) -> Block {
        let (block, outcome) = utxo.blockchain().forge_block(txs, validator).unwrap();
        utxo.apply_append(&block, outcome).unwrap();
        block
    }

    #[test]
    fn test_genesis_output_covers_fifteen() {
        let (utxo, alice) = setup();
        let genesis = utxo.blockchain().tip_block().unwrap();

        let (accumulated, chosen) = utxo
            .find_spendable_outputs(&alice.public_key_hash(), 15)
            .unwrap();
        assert_eq!(accumulated, 20);
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[&genesis.transactions[0].id_hex()], vec![0]);
    }

    #[test]
    fn test_spendable_reports_true_total_when_short() {
        let (utxo, alice) = setup();
        let (accumulated, _) = utxo
            .find_spendable_outputs(&alice.public_key_hash(), 50)
            .unwrap();
        assert_eq!(accumulated, 20);
    }

    #[test]
    fn test_transfer_moves_value() {
        let (utxo, alice) = setup();
        let bob = KeyPair::generate().unwrap();

        let tx = Transaction::new_transfer(&alice, &alice.address(), &bob.address(), 15, &utxo)
            .unwrap();
        assert_eq!(tx.outputs.len(), 2);
        assert!(utxo.blockchain().verify_transaction(&tx).unwrap());

        commit(&utxo, vec![tx], &alice.address());
        assert_eq!(utxo.balance(&alice.public_key_hash()).unwrap(), 5);
        assert_eq!(utxo.balance(&bob.public_key_hash()).unwrap(), 15);

        let before = utxo.entries().unwrap();
        utxo.reindex().unwrap();
        assert_eq!(utxo.entries().unwrap(), before);
    }

    #[test]
    fn test_exact_amount_has_no_change_output() {
        let (utxo, alice) = setup();
        let bob = KeyPair::generate().unwrap();
        let tx = Transaction::new_transfer(&alice, &alice.address(), &bob.address(), 20, &utxo)
            .unwrap();
        assert_eq!(tx.outputs.len(), 1);
    }

    #[test]
    fn test_insufficient_funds() {
        let (utxo, alice) = setup();
        let bob = KeyPair::generate().unwrap();
        let result = Transaction::new_transfer(&alice, &alice.address(), &bob.address(), 21, &utxo);
        assert_eq!(
            result,
            Err(ChainError::InsufficientFunds {
                needed: 21,
                available: 20
            })
        );
    }

    #[test]
    fn test_reindex_is_idempotent() {
        let (utxo, alice) = setup();
        let bob = KeyPair::generate().unwrap();
        let tx = Transaction::new_transfer(&alice, &alice.address(), &bob.address(), 7, &utxo)
            .unwrap();
        commit(&utxo, vec![tx], &alice.address());

        utxo.reindex().unwrap();
        let first = utxo.entries().unwrap();
        utxo.reindex().unwrap();
        assert_eq!(utxo.entries().unwrap(), first);
        assert_eq!(utxo.count_transactions().unwrap(), first.len());
    }

    #[test]
    fn test_spend_within_same_block_is_excluded() {
        let (utxo, alice) = setup();
        let bob = KeyPair::generate().unwrap();
        let carol = KeyPair::generate().unwrap();

        let pay_bob = Transaction::new_transfer(&alice, &alice.address(), &bob.address(), 20, &utxo)
            .unwrap();
        // Bob spends his new output in the same block.
        let mut pay_carol = Transaction {
            id: Vec::new(),
            inputs: vec![crate::transaction::TxInput {
                prev_tx_id: pay_bob.id.clone(),
                sender_address: bob.address(),
                out_index: 0,
                signature: Vec::new(),
                public_key: bob.public_key_bytes().to_vec(),
            }],
            outputs: vec![TxOutput::new(20, &carol.address()).unwrap()],
        };
        pay_carol.id = pay_carol.hash().unwrap();
        let prev: HashMap<String, Transaction> =
            [(pay_bob.id_hex(), pay_bob.clone())].into_iter().collect();
        pay_carol.sign(&bob, &prev).unwrap();

        commit(&utxo, vec![pay_bob, pay_carol], &alice.address());
        let incremental = utxo.entries().unwrap();
        assert_eq!(utxo.balance(&bob.public_key_hash()).unwrap(), 0);
        assert_eq!(utxo.balance(&carol.public_key_hash()).unwrap(), 20);

        utxo.reindex().unwrap();
        assert_eq!(utxo.entries().unwrap(), incremental);
    }

    #[test]
    fn test_find_unspent_transactions_and_output() {
        let (utxo, alice) = setup();
        let genesis = utxo.blockchain().tip_block().unwrap();
        let coinbase = &genesis.transactions[0];

        let txs = utxo
            .find_unspent_transactions(&alice.public_key_hash())
            .unwrap();
        assert_eq!(txs, vec![coinbase.clone()]);
        assert_eq!(
            utxo.find_output(&coinbase.id, 0).unwrap(),
            Some(coinbase.outputs[0].clone())
        );
        assert_eq!(utxo.find_output(&coinbase.id, 1).unwrap(), None);
    }

    #[test]
    fn test_reindex_concurrent_with_updates() {
        let (utxo, alice) = setup();
        let bob = KeyPair::generate().unwrap();

        std::thread::scope(|scope| {
            let rebuilder = scope.spawn(|| {
                for _ in 0..50 {
                    utxo.reindex().unwrap();
                }
            });
            for _ in 0..10 {
                let tx = Transaction::new_transfer(&alice, &alice.address(), &bob.address(), 1, &utxo)
                    .unwrap();
                commit(&utxo, vec![tx], &alice.address());
            }
            rebuilder.join().unwrap();
        });

        assert_eq!(utxo.entries().unwrap(), utxo.scan_chain().unwrap());
        assert_eq!(utxo.balance(&bob.public_key_hash()).unwrap(), 10);
        assert_eq!(utxo.balance(&alice.public_key_hash()).unwrap(), 10);
    }

    #[test]
    fn test_balance_overflow_is_an_error() {
        let (utxo, alice) = setup();
        let bob = KeyPair::generate().unwrap();
        let huge = Transaction::coinbase(&bob.address(), "", u64::MAX).unwrap();
        let one = Transaction::coinbase(&bob.address(), "", 1).unwrap();
        commit(&utxo, vec![huge, one], &alice.address());

        assert!(matches!(
            utxo.balance(&bob.public_key_hash()),
            Err(ChainError::InvalidTransaction(_))
        ));
    }
}
