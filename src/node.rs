use crate::blockchain::{AppendOutcome, Block, Blockchain, UtxoSet};
use crate::config::Config;
use crate::error::ChainError;
use crate::forger::Forger;
use crate::mempool::{BlocksInTransit, Mempool};
use crate::network::NetworkNode;
use crate::persistence::{KvStore, SqliteStore};
use crate::stake::{RoundSnapshot, StakePool};
use crate::transaction::Transaction;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Capacity of the verified-proposal channel feeding the candidate pool.
pub const CANDIDATE_CHANNEL_CAPACITY: usize = 256;

/// Everything a node shares between its connection handlers, the candidate
/// drain and the forging task.
pub struct NodeContext {
    pub config: Config,
    pub chain: Arc<Blockchain>,
    pub utxo: UtxoSet,
    pub stake: StakePool,
    pub mempool: Mempool,
    pub in_transit: BlocksInTransit,
}

impl NodeContext {
    pub fn new(config: Config, chain: Arc<Blockchain>) -> Self {
        let stake = StakePool::new(config.forger.validators.clone());
        NodeContext {
            config,
            utxo: UtxoSet::new(chain.clone()),
            chain,
            stake,
            mempool: Mempool::new(),
            in_transit: BlocksInTransit::new(),
        }
    }

    /// Opens the node's on-disk chain.
    pub fn open(config: Config) -> Result<Self, ChainError> {
        let path = config.database_path();
        if !SqliteStore::exists(&path) {
            return Err(ChainError::NotFound(format!(
                "No blockchain at {:?}, create one first",
                path
            )));
        }
        let store: Arc<dyn KvStore> = Arc::new(SqliteStore::open(&path)?);
        let chain = Arc::new(Blockchain::open(store)?);
        Ok(Self::new(config, chain))
    }

    /// Takes the candidate pool for a forging round. The proposals it held
    /// are no longer served to peers, so a proposer may submit them again.
    pub fn begin_round(&self) -> RoundSnapshot {
        let snapshot = self.stake.snapshot_and_clear();
        self.mempool.forget(snapshot.candidates.keys());
        snapshot
    }

    /// Refreshes derived state after a block went through `Blockchain::append`.
    pub fn after_append(&self, block: &Block, outcome: AppendOutcome) -> Result<(), ChainError> {
        self.utxo.apply_append(block, outcome)?;
        if outcome != AppendOutcome::Duplicate {
            self.mempool.remove_all(&block.transactions);
        }
        Ok(())
    }
}

/// Moves verified stake proposals from the network into the candidate pool.
pub fn spawn_candidate_drain(
    ctx: Arc<NodeContext>,
    mut candidates: mpsc::Receiver<Transaction>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(tx) = candidates.recv().await {
            ctx.stake.insert_candidate(tx);
        }
    })
}

pub struct Node {
    ctx: Arc<NodeContext>,
    network: Arc<NetworkNode>,
    candidates: Option<mpsc::Receiver<Transaction>>,
}

impl Node {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        let (sender, receiver) = mpsc::channel(CANDIDATE_CHANNEL_CAPACITY);
        let network = Arc::new(NetworkNode::new(ctx.clone(), sender));
        Node {
            ctx,
            network,
            candidates: Some(receiver),
        }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// Runs the node until ctrl-c.
    pub async fn start(mut self, forge: bool) -> Result<(), ChainError> {
        let network_config = &self.ctx.config.network;
        info!(
            "Starting ForgeChain node {} (seed {})",
            network_config.node_address(),
            network_config.seed().unwrap_or("none")
        );

        if let Err(e) = self.ctx.utxo.reindex() {
            warn!("UTXO index not rebuilt at startup: {}", e);
        }

        let listener = self.network.bind().await?;
        let mut tasks = Vec::new();

        let server = self.network.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                error!("P2P server failed: {}", e);
            }
        }));

        if let Some(receiver) = self.candidates.take() {
            tasks.push(spawn_candidate_drain(self.ctx.clone(), receiver));
        }

        if !network_config.is_seed() {
            if let Some(seed) = network_config.seed() {
                if let Err(e) = self.network.send_version(seed).await {
                    warn!("Handshake with seed {} failed: {}", seed, e);
                }
            }
        }

        if forge || self.ctx.config.forger.enabled {
            let interval = Duration::from_secs(self.ctx.config.forger.forge_interval_secs);
            info!("Forging every {:?}", interval);
            let forger = Forger::new(self.ctx.clone(), self.network.clone());
            tasks.push(forger.spawn(interval));
        }

        tokio::signal::ctrl_c().await?;
        info!("Shutting down");
        for task in tasks {
            task.abort();
        }
        Ok(())
    }
}
