//! Proof-of-stake forging engine.
//!
//! Each round takes the candidate pool, builds a lottery from the registered
//! weights of the distinct proposers, draws a winner and commits a block on
//! the current tip. A round with an empty lottery forges nothing.

use crate::blockchain::{select_includable, Block};
use crate::error::ChainError;
use crate::node::NodeContext;
use crate::transaction::Transaction;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Announces freshly forged blocks to the rest of the network.
pub trait Broadcaster: Send + Sync {
    fn announce_block(&self, block: &Block);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    Idle,
    Forged { winner: String, block: Block },
}

/// One entry per unit of registered weight for every distinct proposer.
/// Proposers without weight contribute nothing.
pub fn build_lottery(
    registry: &HashMap<String, u64>,
    candidates: &BTreeMap<String, Transaction>,
) -> Vec<String> {
    let proposers: BTreeSet<&str> = candidates.values().filter_map(|tx| tx.proposer()).collect();

    let mut lottery = Vec::new();
    for proposer in proposers {
        let weight = registry.get(proposer).copied().unwrap_or(0);
        for _ in 0..weight {
            lottery.push(proposer.to_string());
        }
    }
    lottery
}

/// Uniform draw over the lottery entries.
pub fn pick_winner<'a, R: Rng + ?Sized>(lottery: &'a [String], rng: &mut R) -> Option<&'a str> {
    lottery.choose(rng).map(String::as_str)
}

pub struct Forger {
    ctx: Arc<NodeContext>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl Forger {
    pub fn new(ctx: Arc<NodeContext>, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Forger { ctx, broadcaster }
    }

    pub fn run_round<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<RoundOutcome, ChainError> {
        let snapshot = self.ctx.begin_round();
        let lottery = build_lottery(&snapshot.registry, &snapshot.candidates);

        let Some(winner) = pick_winner(&lottery, rng).map(str::to_string) else {
            debug!(
                "Forging round idle: {} proposals, empty lottery",
                snapshot.candidates.len()
            );
            return Ok(RoundOutcome::Idle);
        };

        let mut candidates: Vec<Transaction> = snapshot
            .candidates
            .values()
            .find(|tx| tx.proposer() == Some(winner.as_str()))
            .cloned()
            .into_iter()
            .collect();
        let pending = self.ctx.mempool.take_pending();
        candidates.extend(pending.iter().cloned());

        let block = match self.commit(&winner, candidates) {
            Ok(block) => block,
            Err(e) => {
                self.ctx.mempool.requeue(&pending);
                return Err(e);
            }
        };
        self.broadcaster.announce_block(&block);

        info!(
            "Forged block {} at height {} for {} ({} of {} lottery entries)",
            block.hash_hex(),
            block.height,
            winner,
            lottery.iter().filter(|e| **e == winner).count(),
            lottery.len()
        );
        Ok(RoundOutcome::Forged { winner, block })
    }

    fn commit(&self, winner: &str, candidates: Vec<Transaction>) -> Result<Block, ChainError> {
        let mut transactions = select_includable(&self.ctx.utxo, candidates);
        let reward = self.ctx.config.forger.block_reward;
        if reward > 0 || transactions.is_empty() {
            transactions.insert(0, Transaction::coinbase(winner, "", reward)?);
        }

        let (block, outcome) = self.ctx.chain.forge_block(transactions, winner)?;
        self.ctx.after_append(&block, outcome)?;
        Ok(block)
    }

    /// Runs a round every `interval` until the task is aborted.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            let mut rng = StdRng::from_entropy();

            loop {
                ticker.tick().await;
                if let Err(e) = self.run_round(&mut rng) {
                    error!("Forging round failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Blockchain;
    use crate::config::Config;
    use crate::crypto::KeyPair;
    use crate::persistence::{InMemoryStore, KvStore};
    use crate::transaction::{TxInput, TxOutput};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        blocks: Mutex<Vec<Vec<u8>>>,
    }

    impl Broadcaster for Recorder {
        fn announce_block(&self, block: &Block) {
            self.blocks.lock().push(block.hash.clone());
        }
    }

    fn proposal(sender: &str, memo: u8) -> Transaction {
        let mut tx = Transaction {
            id: Vec::new(),
            inputs: vec![TxInput {
                prev_tx_id: vec![memo; 32],
                sender_address: sender.to_string(),
                out_index: 0,
                signature: Vec::new(),
                public_key: Vec::new(),
            }],
            outputs: Vec::new(),
        };
        tx.id = tx.hash().unwrap();
        tx
    }

    fn pool(txs: Vec<Transaction>) -> BTreeMap<String, Transaction> {
        txs.into_iter().map(|tx| (tx.id_hex(), tx)).collect()
    }

    fn context(reward: u64) -> (Arc<NodeContext>, KeyPair) {
        let alice = KeyPair::generate().unwrap();
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let chain = Arc::new(Blockchain::init(store, &alice.address()).unwrap());
        let mut config = Config::default();
        config.forger.block_reward = reward;
        config.forger.validators.insert(alice.address(), 1);
        let ctx = NodeContext::new(config, chain);
        ctx.utxo.reindex().unwrap();
        (Arc::new(ctx), alice)
    }

    #[test]
    fn test_lottery_dedups_proposers() {
        let registry = HashMap::from([("alice".to_string(), 3), ("bob".to_string(), 1)]);
        let candidates = pool(vec![
            proposal("alice", 1),
            proposal("alice", 2),
            proposal("alice", 3),
            proposal("bob", 4),
            proposal("carol", 5),
        ]);

        let lottery = build_lottery(&registry, &candidates);
        assert_eq!(lottery.len(), 4);
        assert_eq!(lottery.iter().filter(|e| *e == "alice").count(), 3);
        assert!(!lottery.iter().any(|e| e == "carol"));
    }

    #[test]
    fn test_zero_weight_never_wins() {
        let registry = HashMap::from([("alice".to_string(), 2), ("zero".to_string(), 0)]);
        let candidates = pool(vec![proposal("alice", 1), proposal("zero", 2)]);
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..1000 {
            let lottery = build_lottery(&registry, &candidates);
            assert_eq!(pick_winner(&lottery, &mut rng), Some("alice"));
        }
    }

    #[test]
    fn test_weights_shape_the_draw() {
        let registry = HashMap::from([("alice".to_string(), 9), ("bob".to_string(), 1)]);
        let candidates = pool(vec![proposal("alice", 1), proposal("bob", 2)]);
        let lottery = build_lottery(&registry, &candidates);
        let mut rng = StdRng::seed_from_u64(7);

        let alice_wins = (0..1000)
            .filter(|_| pick_winner(&lottery, &mut rng) == Some("alice"))
            .count();
        assert!(alice_wins > 800, "alice won {} of 1000", alice_wins);
        assert!(alice_wins < 1000);
    }

    #[test]
    fn test_empty_lottery_has_no_winner() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(pick_winner(&[], &mut rng), None);
    }

    #[test]
    fn test_round_forges_winner_block() {
        let (ctx, alice) = context(0);
        let bob = KeyPair::generate().unwrap();
        let recorder = Arc::new(Recorder::default());
        let forger = Forger::new(ctx.clone(), recorder.clone());

        let stake = Transaction::new_transfer(&alice, &alice.address(), &bob.address(), 5, &ctx.utxo)
            .unwrap();
        assert!(ctx.stake.admit_candidate(&ctx.chain, stake.clone()));

        let mut rng = StdRng::seed_from_u64(3);
        let RoundOutcome::Forged { winner, block } = forger.run_round(&mut rng).unwrap() else {
            panic!("expected a forged block");
        };

        assert_eq!(winner, alice.address());
        assert_eq!(block.height, 1);
        assert_eq!(block.validator, alice.address());
        assert_eq!(block.transactions, vec![stake]);
        assert_eq!(ctx.chain.tip_hash(), block.hash);
        assert_eq!(ctx.utxo.balance(&bob.public_key_hash()).unwrap(), 5);
        assert_eq!(*recorder.blocks.lock(), vec![block.hash.clone()]);
        assert_eq!(ctx.stake.candidate_count(), 0);

        assert_eq!(forger.run_round(&mut rng).unwrap(), RoundOutcome::Idle);
        assert_eq!(ctx.chain.get_tip_height().unwrap(), 1);
    }

    #[test]
    fn test_round_with_reward_and_pending() {
        let (ctx, alice) = context(3);
        let bob = KeyPair::generate().unwrap();
        let carol = KeyPair::generate().unwrap();
        let forger = Forger::new(ctx.clone(), Arc::new(Recorder::default()));

        // The stake proposal and the pending payment spend the same output;
        // only the stake proposal survives.
        let stake = Transaction::new_transfer(&alice, &alice.address(), &bob.address(), 5, &ctx.utxo)
            .unwrap();
        let payment =
            Transaction::new_transfer(&alice, &alice.address(), &carol.address(), 5, &ctx.utxo)
                .unwrap();
        ctx.stake.insert_candidate(stake.clone());
        ctx.mempool.insert(payment);

        let mut rng = StdRng::seed_from_u64(9);
        let RoundOutcome::Forged { block, .. } = forger.run_round(&mut rng).unwrap() else {
            panic!("expected a forged block");
        };

        assert_eq!(block.transactions.len(), 2);
        assert!(block.transactions[0].is_coinbase());
        assert_eq!(block.transactions[1], stake);
        assert_eq!(ctx.utxo.balance(&alice.public_key_hash()).unwrap(), 15 + 3);
        assert_eq!(ctx.utxo.balance(&carol.public_key_hash()).unwrap(), 0);
        assert_eq!(ctx.mempool.pending_count(), 0);
    }

    #[test]
    fn test_unweighted_proposer_leaves_pool_cleared() {
        let (ctx, alice) = context(0);
        let bob = KeyPair::generate().unwrap();
        let forger = Forger::new(ctx.clone(), Arc::new(Recorder::default()));

        let stake = Transaction::new_transfer(&alice, &alice.address(), &bob.address(), 5, &ctx.utxo)
            .unwrap();
        ctx.stake.insert_candidate(stake);
        ctx.stake.register_validator(&alice.address(), 0);

        let mut rng = StdRng::seed_from_u64(5);
        assert_eq!(forger.run_round(&mut rng).unwrap(), RoundOutcome::Idle);
        assert_eq!(ctx.stake.candidate_count(), 0);
        assert_eq!(ctx.chain.get_tip_height().unwrap(), 0);
    }

    #[test]
    fn test_failed_commit_keeps_pending_queued() {
        let (ctx, alice) = context(0);
        let bob = KeyPair::generate().unwrap();
        let forger = Forger::new(ctx.clone(), Arc::new(Recorder::default()));

        let payment =
            Transaction::new_transfer(&alice, &alice.address(), &bob.address(), 2, &ctx.utxo)
                .unwrap();
        ctx.mempool.insert(payment.clone());

        // A tip at the maximum height leaves no room for another block.
        let genesis = ctx.chain.tip_block().unwrap();
        let coinbase = Transaction::coinbase(&alice.address(), "", 1).unwrap();
        let top = Block::new(vec![coinbase], genesis.hash, u64::MAX, "peer").unwrap();
        ctx.chain.append(&top).unwrap();

        ctx.stake.insert_candidate(proposal(&alice.address(), 1));
        let mut rng = StdRng::seed_from_u64(2);
        assert!(matches!(
            forger.run_round(&mut rng),
            Err(ChainError::InvalidBlock(_))
        ));

        assert_eq!(ctx.mempool.pending_count(), 1);
        assert_eq!(ctx.mempool.take_pending(), vec![payment]);
    }
}
