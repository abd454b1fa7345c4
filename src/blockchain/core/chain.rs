use crate::crypto::{self, KeyPair, Sha256Hash};
use crate::error::ChainError;
use crate::merkle::merkle_root;
use crate::persistence::KvStore;
use crate::transaction::Transaction;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use super::state::UTXO_PREFIX;

/// Store key holding the hash of the current tip block.
pub const TIP_KEY: &[u8] = b"lh";

pub const GENESIS_REWARD: u64 = 20;
pub const GENESIS_DATA: &str = "First Transaction from Genesis";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub hash: Vec<u8>,
    pub transactions: Vec<Transaction>,
    /// Empty for the genesis block.
    pub prev_hash: Vec<u8>,
    pub height: u64,
    pub validator: String,
    pub timestamp: i64,
}

impl Block {
    pub fn new(
        transactions: Vec<Transaction>,
        prev_hash: Vec<u8>,
        height: u64,
        validator: &str,
    ) -> Result<Self, ChainError> {
        let mut block = Block {
            hash: Vec::new(),
            transactions,
            prev_hash,
            height,
            validator: validator.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        block.hash = block.compute_hash()?;
        Ok(block)
    }

    pub fn genesis(coinbase: Transaction, validator: &str) -> Result<Self, ChainError> {
        Block::new(vec![coinbase], Vec::new(), 0, validator)
    }

    pub fn merkle_root(&self) -> Result<Sha256Hash, ChainError> {
        let leaves = self
            .transactions
            .iter()
            .map(|tx| tx.serialize())
            .collect::<Result<Vec<_>, _>>()?;
        merkle_root(&leaves)
    }

    /// `H(prev_hash ‖ merkle_root(transactions))`
    pub fn compute_hash(&self) -> Result<Vec<u8>, ChainError> {
        let mut data = self.prev_hash.clone();
        data.extend_from_slice(&self.merkle_root()?);
        Ok(crypto::sha256(&data).to_vec())
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_empty()
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(&self.hash)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ChainError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, ChainError> {
        Ok(bincode::deserialize(data)?)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "============ Block {} ============", self.hash_hex())?;
        writeln!(f, "Height: {}", self.height)?;
        writeln!(f, "Prev. block: {}", hex::encode(&self.prev_hash))?;
        writeln!(f, "Validator: {}", self.validator)?;
        writeln!(f, "Timestamp: {}", self.timestamp)?;
        for tx in &self.transactions {
            writeln!(f, "{}", tx)?;
        }
        Ok(())
    }
}

/// What `Blockchain::append` did with a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Already stored; nothing changed.
    Duplicate,
    /// Stored, tip unchanged.
    SideBlock,
    /// Stored and became the tip on top of the previous tip.
    Extended,
    /// Stored and became the tip on a different branch.
    Reorganized,
}

impl AppendOutcome {
    pub fn moved_tip(self) -> bool {
        matches!(self, AppendOutcome::Extended | AppendOutcome::Reorganized)
    }
}

/// Append-only, hash-addressed block store with a tip pointer.
///
/// The tip only moves to a block whose height is strictly greater than the
/// current tip's. No lottery legitimacy or cumulative stake is checked.
pub struct Blockchain {
    store: Arc<dyn KvStore>,
    tip: RwLock<Vec<u8>>,
}

impl Blockchain {
    /// Creates the genesis block paying the genesis reward to `address`.
    pub fn init(store: Arc<dyn KvStore>, address: &str) -> Result<Self, ChainError> {
        if store.read(|txn| txn.get(TIP_KEY))?.is_some() {
            return Err(ChainError::InvalidBlock("Blockchain already exists".to_string()));
        }

        let coinbase = Transaction::coinbase(address, GENESIS_DATA, GENESIS_REWARD)?;
        let genesis = Block::genesis(coinbase, address)?;
        let data = genesis.serialize()?;

        store.write(|txn| {
            txn.set(&genesis.hash, &data)?;
            txn.set(TIP_KEY, &genesis.hash)
        })?;
        info!("Genesis block {} created", genesis.hash_hex());

        Ok(Blockchain {
            store,
            tip: RwLock::new(genesis.hash),
        })
    }

    /// Opens an existing chain.
    pub fn open(store: Arc<dyn KvStore>) -> Result<Self, ChainError> {
        let tip = store.read(|txn| txn.get(TIP_KEY))?.ok_or_else(|| {
            ChainError::NotFound("No existing blockchain found, create one first".to_string())
        })?;
        debug!("Opened chain at tip {}", hex::encode(&tip));

        Ok(Blockchain {
            store,
            tip: RwLock::new(tip),
        })
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn tip_hash(&self) -> Vec<u8> {
        self.tip.read().clone()
    }

    pub fn tip_block(&self) -> Result<Block, ChainError> {
        self.get_block(&self.tip_hash())
    }

    pub fn get_tip_height(&self) -> Result<u64, ChainError> {
        Ok(self.tip_block()?.height)
    }

    /// Persists `block` and moves the tip if it is higher than the current
    /// one. Block write and tip update commit in one store transaction.
    pub fn append(&self, block: &Block) -> Result<AppendOutcome, ChainError> {
        if block.compute_hash()? != block.hash {
            return Err(ChainError::InvalidBlock(format!(
                "Block {} does not match its contents",
                block.hash_hex()
            )));
        }

        let data = block.serialize()?;
        let mut tip = self.tip.write();

        let outcome = self.store.write(|txn| {
            if txn.get(&block.hash)?.is_some() {
                return Ok(AppendOutcome::Duplicate);
            }
            txn.set(&block.hash, &data)?;

            let current = match txn.get(TIP_KEY)? {
                Some(hash) => hash,
                None => {
                    txn.set(TIP_KEY, &block.hash)?;
                    return Ok(AppendOutcome::Reorganized);
                }
            };
            let current_data = txn.get(&current)?.ok_or_else(|| {
                ChainError::NotFound(format!("Tip block {}", hex::encode(&current)))
            })?;
            let current = Block::deserialize(&current_data)?;

            if block.height > current.height {
                txn.set(TIP_KEY, &block.hash)?;
                if block.prev_hash == current.hash {
                    Ok(AppendOutcome::Extended)
                } else {
                    Ok(AppendOutcome::Reorganized)
                }
            } else {
                Ok(AppendOutcome::SideBlock)
            }
        })?;

        if outcome.moved_tip() {
            *tip = block.hash.clone();
        }
        info!(
            "Appended block {} at height {}: {:?}",
            block.hash_hex(),
            block.height,
            outcome
        );
        Ok(outcome)
    }

    /// Builds a block on the current tip and appends it.
    pub fn forge_block(
        &self,
        transactions: Vec<Transaction>,
        validator: &str,
    ) -> Result<(Block, AppendOutcome), ChainError> {
        let tip = self.tip_block()?;
        let height = tip.height.checked_add(1).ok_or_else(|| {
            ChainError::InvalidBlock(format!("Tip {} is at the maximum height", tip.hash_hex()))
        })?;
        let block = Block::new(transactions, tip.hash, height, validator)?;
        let outcome = self.append(&block)?;
        Ok((block, outcome))
    }

    pub fn get_block(&self, hash: &[u8]) -> Result<Block, ChainError> {
        let data = self
            .store
            .read(|txn| txn.get(hash))?
            .ok_or_else(|| ChainError::NotFound(format!("Block {}", hex::encode(hash))))?;
        Block::deserialize(&data)
    }

    pub fn has_block(&self, hash: &[u8]) -> Result<bool, ChainError> {
        Ok(self.store.read(|txn| txn.get(hash))?.is_some())
    }

    /// Number of blocks stored, including side blocks.
    pub fn stored_block_count(&self) -> Result<usize, ChainError> {
        let pairs = self.store.read(|txn| txn.scan_prefix(b""))?;
        Ok(pairs
            .iter()
            .filter(|(key, _)| key.as_slice() != TIP_KEY && !key.starts_with(UTXO_PREFIX))
            .count())
    }

    /// Walks from the tip back to genesis.
    pub fn iter(&self) -> ChainIterator<'_> {
        ChainIterator {
            chain: self,
            next: Some(self.tip_hash()),
        }
    }

    /// Hashes along the canonical chain, newest first.
    pub fn get_block_hashes(&self) -> Result<Vec<Vec<u8>>, ChainError> {
        self.iter().map(|block| block.map(|b| b.hash)).collect()
    }

    pub fn find_transaction(&self, id: &[u8]) -> Result<Transaction, ChainError> {
        for block in self.iter() {
            if let Some(tx) = block?.transactions.into_iter().find(|tx| tx.id == id) {
                return Ok(tx);
            }
        }
        Err(ChainError::NotFound(format!("Transaction {}", hex::encode(id))))
    }

    pub fn sign_transaction(&self, tx: &mut Transaction, key: &KeyPair) -> Result<(), ChainError> {
        let prev_txs = self.referenced_transactions(tx)?;
        tx.sign(key, &prev_txs)
    }

    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool, ChainError> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        let prev_txs = self.referenced_transactions(tx)?;
        tx.verify(&prev_txs)
    }

    fn referenced_transactions(
        &self,
        tx: &Transaction,
    ) -> Result<HashMap<String, Transaction>, ChainError> {
        let mut prev_txs = HashMap::new();
        if tx.is_coinbase() {
            return Ok(prev_txs);
        }
        for input in &tx.inputs {
            let id = input.prev_tx_id_hex();
            if prev_txs.contains_key(&id) {
                continue;
            }
            let prev = self.find_transaction(&input.prev_tx_id).map_err(|e| match e {
                ChainError::NotFound(_) => ChainError::UnknownPreviousTransaction(id.clone()),
                other => other,
            })?;
            prev_txs.insert(id, prev);
        }
        Ok(prev_txs)
    }
}

/// Backward iterator over the canonical chain. A missing parent ends the walk
/// with a `NotFound` error.
pub struct ChainIterator<'a> {
    chain: &'a Blockchain,
    next: Option<Vec<u8>>,
}

impl Iterator for ChainIterator<'_> {
    type Item = Result<Block, ChainError>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.next.take()?;
        match self.chain.get_block(&hash) {
            Ok(block) => {
                if !block.is_genesis() {
                    self.next = Some(block.prev_hash.clone());
                }
                Some(Ok(block))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;

    fn new_chain() -> (Blockchain, KeyPair) {
        let keypair = KeyPair::generate().unwrap();
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        (Blockchain::init(store, &keypair.address()).unwrap(), keypair)
    }

    fn reward_block(chain: &Blockchain, prev: &Block, height: u64, to: &str) -> Block {
        let coinbase = Transaction::coinbase(to, "", 1).unwrap();
        let block = Block::new(vec![coinbase], prev.hash.clone(), height, to).unwrap();
        chain.append(&block).unwrap();
        block
    }

    #[test]
    fn test_genesis_block() {
        let (chain, keypair) = new_chain();
        let genesis = chain.tip_block().unwrap();

        assert!(genesis.is_genesis());
        assert_eq!(genesis.height, 0);
        assert_eq!(genesis.transactions.len(), 1);
        assert!(genesis.transactions[0].is_coinbase());
        assert_eq!(genesis.transactions[0].outputs[0].value, GENESIS_REWARD);
        assert_eq!(genesis.validator, keypair.address());
        assert_eq!(genesis.compute_hash().unwrap(), genesis.hash);
    }

    #[test]
    fn test_init_twice_fails_and_open_resumes() {
        let keypair = KeyPair::generate().unwrap();
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let chain = Blockchain::init(store.clone(), &keypair.address()).unwrap();

        assert!(matches!(
            Blockchain::init(store.clone(), &keypair.address()),
            Err(ChainError::InvalidBlock(_))
        ));
        let reopened = Blockchain::open(store).unwrap();
        assert_eq!(reopened.tip_hash(), chain.tip_hash());
    }

    #[test]
    fn test_open_without_chain() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        assert!(matches!(Blockchain::open(store), Err(ChainError::NotFound(_))));
    }

    #[test]
    fn test_append_same_block_twice() {
        let (chain, keypair) = new_chain();
        let genesis = chain.tip_block().unwrap();
        let block = reward_block(&chain, &genesis, 1, &keypair.address());

        let tip = chain.tip_hash();
        let count = chain.stored_block_count().unwrap();
        assert_eq!(chain.append(&block).unwrap(), AppendOutcome::Duplicate);
        assert_eq!(chain.tip_hash(), tip);
        assert_eq!(chain.stored_block_count().unwrap(), count);
    }

    #[test]
    fn test_lower_block_is_stored_without_moving_tip() {
        let (chain, keypair) = new_chain();
        let genesis = chain.tip_block().unwrap();
        let mut prev = genesis.clone();
        for height in 1..=7 {
            prev = reward_block(&chain, &prev, height, &keypair.address());
        }
        assert_eq!(chain.get_tip_height().unwrap(), 7);

        let coinbase = Transaction::coinbase(&keypair.address(), "", 1).unwrap();
        let side = Block::new(vec![coinbase], genesis.hash.clone(), 5, "peer").unwrap();
        assert_eq!(chain.append(&side).unwrap(), AppendOutcome::SideBlock);
        assert_eq!(chain.get_tip_height().unwrap(), 7);
        assert_eq!(chain.get_block(&side.hash).unwrap(), side);
    }

    #[test]
    fn test_higher_block_on_other_branch_reorganizes() {
        let (chain, keypair) = new_chain();
        let genesis = chain.tip_block().unwrap();
        let a1 = reward_block(&chain, &genesis, 1, &keypair.address());

        let coinbase = Transaction::coinbase(&keypair.address(), "", 1).unwrap();
        let b2 = Block::new(vec![coinbase], genesis.hash.clone(), 2, "peer").unwrap();
        assert_eq!(chain.append(&b2).unwrap(), AppendOutcome::Reorganized);
        assert_eq!(chain.tip_hash(), b2.hash);
        assert!(chain.has_block(&a1.hash).unwrap());
    }

    #[test]
    fn test_tampered_block_rejected() {
        let (chain, keypair) = new_chain();
        let genesis = chain.tip_block().unwrap();
        let coinbase = Transaction::coinbase(&keypair.address(), "", 1).unwrap();
        let mut block = Block::new(vec![coinbase], genesis.hash, 1, "peer").unwrap();
        block.transactions[0].outputs[0].value = 1_000;

        assert!(matches!(chain.append(&block), Err(ChainError::InvalidBlock(_))));
    }

    #[test]
    fn test_forging_on_maximum_height_fails() {
        let (chain, keypair) = new_chain();
        let genesis = chain.tip_block().unwrap();
        let top = reward_block(&chain, &genesis, u64::MAX, &keypair.address());
        assert_eq!(chain.tip_hash(), top.hash);

        let coinbase = Transaction::coinbase(&keypair.address(), "", 1).unwrap();
        assert!(matches!(
            chain.forge_block(vec![coinbase], &keypair.address()),
            Err(ChainError::InvalidBlock(_))
        ));
        assert_eq!(chain.tip_hash(), top.hash);
    }

    #[test]
    fn test_iterate_back_to_genesis() {
        let (chain, keypair) = new_chain();
        let genesis = chain.tip_block().unwrap();
        let b1 = reward_block(&chain, &genesis, 1, &keypair.address());
        let b2 = reward_block(&chain, &b1, 2, &keypair.address());

        let heights: Vec<u64> = chain.iter().map(|b| b.unwrap().height).collect();
        assert_eq!(heights, vec![2, 1, 0]);
        assert_eq!(
            chain.get_block_hashes().unwrap(),
            vec![b2.hash, b1.hash, genesis.hash]
        );
        // Restartable
        assert_eq!(chain.iter().count(), 3);
    }

    #[test]
    fn test_orphan_tip_stops_iteration_with_error() {
        let (chain, keypair) = new_chain();
        let coinbase = Transaction::coinbase(&keypair.address(), "", 1).unwrap();
        let orphan = Block::new(vec![coinbase], vec![7u8; 32], 3, "peer").unwrap();
        assert_eq!(chain.append(&orphan).unwrap(), AppendOutcome::Reorganized);

        let items: Vec<_> = chain.iter().collect();
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(ChainError::NotFound(_))));
    }

    #[test]
    fn test_get_block_and_find_transaction() {
        let (chain, _) = new_chain();
        let genesis = chain.tip_block().unwrap();
        let coinbase = &genesis.transactions[0];

        assert_eq!(chain.find_transaction(&coinbase.id).unwrap(), *coinbase);
        assert!(matches!(
            chain.find_transaction(&[1, 2, 3]),
            Err(ChainError::NotFound(_))
        ));
        assert!(matches!(chain.get_block(&[9u8; 32]), Err(ChainError::NotFound(_))));
    }

    #[test]
    fn test_block_round_trip() {
        let (chain, _) = new_chain();
        let genesis = chain.tip_block().unwrap();
        let decoded = Block::deserialize(&genesis.serialize().unwrap()).unwrap();
        assert_eq!(decoded, genesis);
    }
}
