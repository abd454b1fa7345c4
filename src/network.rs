//! Peer-to-peer transport.
//!
//! Every message travels on its own TCP connection as a 4-byte big-endian
//! length followed by the bincode-encoded [`Message`]. Peers come from the
//! static known-peer list in the configuration.

use crate::blockchain::{AppendOutcome, Block};
use crate::error::ChainError;
use crate::forger::Broadcaster;
use crate::node::NodeContext;
use crate::stake::verify_candidate;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on an encoded message.
pub const MAX_FRAME_LEN: u32 = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvKind {
    Block,
    Tx,
    StakeTx,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Version {
        version: u32,
        best_height: u64,
        addr_from: String,
    },
    GetBlocks {
        addr_from: String,
    },
    Inv {
        addr_from: String,
        kind: InvKind,
        items: Vec<Vec<u8>>,
    },
    GetData {
        addr_from: String,
        kind: InvKind,
        id: Vec<u8>,
    },
    Block {
        addr_from: String,
        block: Block,
    },
    Tx {
        addr_from: String,
        transaction: Transaction,
    },
    StakeTx {
        addr_from: String,
        transaction: Transaction,
    },
    Addr {
        addr_list: Vec<String>,
    },
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version { .. } => "version",
            Message::GetBlocks { .. } => "getblocks",
            Message::Inv { .. } => "inv",
            Message::GetData { .. } => "getdata",
            Message::Block { .. } => "block",
            Message::Tx { .. } => "tx",
            Message::StakeTx { .. } => "staketx",
            Message::Addr { .. } => "addr",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ChainError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ChainError> {
        Ok(bincode::deserialize(data)?)
    }
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), ChainError> {
    let body = message.encode()?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| ChainError::NetworkError(format!("Message too large: {} bytes", body.len())))?;

    writer.write_u32(len).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, ChainError> {
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(ChainError::NetworkError(format!(
            "Frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Message::decode(&body)
}

/// Delivers one message to `addr`. Unknown peers are refused and an
/// unreachable one is reported as `PeerUnavailable`.
pub async fn deliver(
    known_peers: &[String],
    addr: &str,
    message: &Message,
) -> Result<(), ChainError> {
    if !known_peers.iter().any(|p| p == addr) {
        return Err(ChainError::NetworkError(format!(
            "{} is not in the list of known nodes",
            addr
        )));
    }

    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ChainError::PeerUnavailable(format!("{}: {}", addr, e)))?;
    write_message(&mut stream, message).await?;
    stream.shutdown().await?;
    debug!("Sent {} to {}", message.command(), addr);
    Ok(())
}

/// Like [`deliver`], but an unreachable peer is logged and skipped.
pub async fn send_message(
    known_peers: &[String],
    addr: &str,
    message: &Message,
) -> Result<(), ChainError> {
    match deliver(known_peers, addr, message).await {
        Err(ChainError::PeerUnavailable(reason)) => {
            warn!("Peer not available: {}", reason);
            Ok(())
        }
        result => result,
    }
}

pub struct NetworkNode {
    ctx: Arc<NodeContext>,
    candidates: mpsc::Sender<Transaction>,
}

impl NetworkNode {
    pub fn new(ctx: Arc<NodeContext>, candidates: mpsc::Sender<Transaction>) -> Self {
        NetworkNode { ctx, candidates }
    }

    pub fn node_address(&self) -> String {
        self.ctx.config.network.node_address()
    }

    fn known_peers(&self) -> &[String] {
        &self.ctx.config.network.known_peers
    }

    pub async fn bind(&self) -> Result<TcpListener, ChainError> {
        let addr = self.node_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ChainError::NetworkError(format!("Cannot listen on {}: {}", addr, e)))?;
        info!("Listening on {}", addr);
        Ok(listener)
    }

    /// Accept loop. Each connection is handled on its own task and its
    /// failures stay there.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ChainError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let node = self.clone();
            tokio::spawn(async move {
                if let Err(e) = node.handle_connection(stream).await {
                    warn!("Connection from {} failed: {}", peer, e);
                }
            });
        }
    }

    pub async fn start_server(self: Arc<Self>) -> Result<(), ChainError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<(), ChainError> {
        let message = read_message(&mut stream).await?;
        self.handle_message(message).await
    }

    pub async fn handle_message(&self, message: Message) -> Result<(), ChainError> {
        info!("Received {} command", message.command());
        match message {
            Message::Version {
                best_height,
                addr_from,
                ..
            } => self.handle_version(best_height, &addr_from).await,
            Message::GetBlocks { addr_from } => {
                let hashes = self.ctx.chain.get_block_hashes()?;
                self.send_inv(&addr_from, InvKind::Block, hashes).await
            }
            Message::Inv {
                addr_from,
                kind,
                items,
            } => self.handle_inv(&addr_from, kind, items).await,
            Message::GetData {
                addr_from,
                kind,
                id,
            } => self.handle_get_data(&addr_from, kind, &id).await,
            Message::Block { addr_from, block } => self.handle_block(&addr_from, block).await,
            Message::Tx {
                addr_from,
                transaction,
            } => self.handle_tx(&addr_from, transaction).await,
            Message::StakeTx {
                addr_from,
                transaction,
            } => self.handle_stake_tx(&addr_from, transaction).await,
            Message::Addr { addr_list } => {
                debug!("Peer advertised {} addresses", addr_list.len());
                self.request_blocks().await;
                Ok(())
            }
        }
    }

    async fn handle_version(&self, their_height: u64, addr_from: &str) -> Result<(), ChainError> {
        let our_height = self.ctx.chain.get_tip_height()?;
        if our_height < their_height {
            self.send(addr_from, &Message::GetBlocks {
                addr_from: self.node_address(),
            })
            .await
        } else if our_height > their_height {
            self.send_version(addr_from).await
        } else {
            Ok(())
        }
    }

    async fn handle_inv(
        &self,
        addr_from: &str,
        kind: InvKind,
        items: Vec<Vec<u8>>,
    ) -> Result<(), ChainError> {
        info!("Received inventory with {} {:?}", items.len(), kind);
        match kind {
            InvKind::Block => {
                let mut missing = Vec::with_capacity(items.len());
                for hash in items {
                    if !self.ctx.chain.has_block(&hash)? {
                        missing.push(hash);
                    }
                }
                self.ctx.in_transit.replace(missing);
                match self.ctx.in_transit.pop_front() {
                    Some(hash) => self.send_get_data(addr_from, InvKind::Block, hash).await,
                    None => Ok(()),
                }
            }
            InvKind::Tx | InvKind::StakeTx => {
                let Some(id) = items.into_iter().next() else {
                    return Ok(());
                };
                if self.ctx.mempool.contains(&hex::encode(&id)) {
                    return Ok(());
                }
                self.send_get_data(addr_from, kind, id).await
            }
        }
    }

    async fn handle_get_data(
        &self,
        addr_from: &str,
        kind: InvKind,
        id: &[u8],
    ) -> Result<(), ChainError> {
        let addr = self.node_address();
        let reply = match kind {
            InvKind::Block => match self.ctx.chain.get_block(id) {
                Ok(block) => Message::Block {
                    addr_from: addr,
                    block,
                },
                Err(ChainError::NotFound(_)) => return Ok(()),
                Err(e) => return Err(e),
            },
            InvKind::Tx | InvKind::StakeTx => {
                let Some(transaction) = self.ctx.mempool.get(&hex::encode(id)) else {
                    return Ok(());
                };
                if kind == InvKind::Tx {
                    Message::Tx {
                        addr_from: addr,
                        transaction,
                    }
                } else {
                    Message::StakeTx {
                        addr_from: addr,
                        transaction,
                    }
                }
            }
        };
        self.send(addr_from, &reply).await
    }

    async fn handle_block(&self, addr_from: &str, block: Block) -> Result<(), ChainError> {
        let outcome = self.ctx.chain.append(&block)?;
        if outcome != AppendOutcome::Duplicate {
            self.ctx.mempool.remove_all(&block.transactions);
        }

        match self.ctx.in_transit.pop_front() {
            Some(next) => self.send_get_data(addr_from, InvKind::Block, next).await,
            None => self.ctx.utxo.reindex(),
        }
    }

    async fn handle_tx(&self, addr_from: &str, tx: Transaction) -> Result<(), ChainError> {
        let id = tx.id.clone();
        if !self.ctx.mempool.insert(tx) {
            return Ok(());
        }
        debug!("{} mempool holds {} transactions", self.node_address(), self.ctx.mempool.len());
        self.relay_inv(addr_from, InvKind::Tx, id).await;
        Ok(())
    }

    async fn handle_stake_tx(&self, addr_from: &str, tx: Transaction) -> Result<(), ChainError> {
        if self.ctx.mempool.contains(&tx.id_hex()) || !verify_candidate(&self.ctx.chain, &tx) {
            return Ok(());
        }

        let id = tx.id.clone();
        self.ctx.mempool.remember(tx.clone());
        self.candidates
            .send(tx)
            .await
            .map_err(|_| ChainError::NetworkError("Candidate channel closed".to_string()))?;
        self.relay_inv(addr_from, InvKind::StakeTx, id).await;
        Ok(())
    }

    /// The seed node announces new transactions to every other peer.
    async fn relay_inv(&self, addr_from: &str, kind: InvKind, id: Vec<u8>) {
        if !self.ctx.config.network.is_seed() {
            return;
        }
        let own = self.node_address();
        for peer in self.known_peers() {
            if *peer == own || peer == addr_from {
                continue;
            }
            if let Err(e) = self.send_inv(peer, kind, vec![id.clone()]).await {
                warn!("Relaying inventory to {} failed: {}", peer, e);
            }
        }
    }

    pub async fn send(&self, addr: &str, message: &Message) -> Result<(), ChainError> {
        send_message(self.known_peers(), addr, message).await
    }

    pub async fn send_version(&self, addr: &str) -> Result<(), ChainError> {
        let message = Message::Version {
            version: PROTOCOL_VERSION,
            best_height: self.ctx.chain.get_tip_height()?,
            addr_from: self.node_address(),
        };
        self.send(addr, &message).await
    }

    pub async fn send_inv(
        &self,
        addr: &str,
        kind: InvKind,
        items: Vec<Vec<u8>>,
    ) -> Result<(), ChainError> {
        let message = Message::Inv {
            addr_from: self.node_address(),
            kind,
            items,
        };
        self.send(addr, &message).await
    }

    pub async fn send_get_data(
        &self,
        addr: &str,
        kind: InvKind,
        id: Vec<u8>,
    ) -> Result<(), ChainError> {
        let message = Message::GetData {
            addr_from: self.node_address(),
            kind,
            id,
        };
        self.send(addr, &message).await
    }

    /// Asks every known peer for its block inventory.
    pub async fn request_blocks(&self) {
        let own = self.node_address();
        let message = Message::GetBlocks {
            addr_from: own.clone(),
        };
        for peer in self.known_peers().iter().filter(|p| **p != own) {
            if let Err(e) = self.send(peer, &message).await {
                warn!("Requesting blocks from {} failed: {}", peer, e);
            }
        }
    }
}

impl Broadcaster for NetworkNode {
    fn announce_block(&self, block: &Block) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("No runtime to announce block {}", block.hash_hex());
            return;
        };

        let own = self.node_address();
        let message = Message::Block {
            addr_from: own.clone(),
            block: block.clone(),
        };
        for peer in self.known_peers().iter().filter(|p| **p != own) {
            let peers = self.known_peers().to_vec();
            let peer = peer.clone();
            let message = message.clone();
            runtime.spawn(async move {
                if let Err(e) = send_message(&peers, &peer, &message).await {
                    warn!("Announcing block to {} failed: {}", peer, e);
                }
            });
        }
    }
}
