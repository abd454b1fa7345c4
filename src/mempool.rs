//! Pending ordinary transactions and the queue of announced blocks still to fetch.

use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

#[derive(Default)]
struct MempoolInner {
    transactions: HashMap<String, Transaction>,
    /// Arrival order of ids awaiting forging.
    pending: Vec<String>,
}

/// Transactions received from peers, keyed by hex id.
#[derive(Default)]
pub struct Mempool {
    inner: Mutex<MempoolInner>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `tx` and queues it for forging. Returns false if it was already known.
    pub fn insert(&self, tx: Transaction) -> bool {
        let id = tx.id_hex();
        let mut inner = self.inner.lock();
        if inner.transactions.contains_key(&id) {
            return false;
        }
        inner.pending.push(id.clone());
        inner.transactions.insert(id, tx);
        true
    }

    /// Stores `tx` so it can be served to peers without queueing it for forging.
    pub fn remember(&self, tx: Transaction) {
        self.inner.lock().transactions.insert(tx.id_hex(), tx);
    }

    pub fn contains(&self, id_hex: &str) -> bool {
        self.inner.lock().transactions.contains_key(id_hex)
    }

    pub fn get(&self, id_hex: &str) -> Option<Transaction> {
        self.inner.lock().transactions.get(id_hex).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().transactions.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Drains the forging queue in arrival order.
    pub fn take_pending(&self) -> Vec<Transaction> {
        let mut inner = self.inner.lock();
        let ids = std::mem::take(&mut inner.pending);
        ids.iter()
            .filter_map(|id| inner.transactions.get(id).cloned())
            .collect()
    }

    /// Puts transactions taken with `take_pending` back at the front of the
    /// queue, skipping any that were forgotten or queued again since.
    pub fn requeue(&self, txs: &[Transaction]) {
        let mut inner = self.inner.lock();
        let mut ids: Vec<String> = txs
            .iter()
            .map(Transaction::id_hex)
            .filter(|id| inner.transactions.contains_key(id) && !inner.pending.contains(id))
            .collect();
        ids.append(&mut inner.pending);
        inner.pending = ids;
    }

    /// Drops remembered transactions that are not queued for forging.
    pub fn forget<'a>(&self, ids: impl IntoIterator<Item = &'a String>) {
        let mut inner = self.inner.lock();
        for id in ids {
            if !inner.pending.contains(id) {
                inner.transactions.remove(id);
            }
        }
    }

    /// Forgets transactions that made it into a block.
    pub fn remove_all<'a>(&self, txs: impl IntoIterator<Item = &'a Transaction>) {
        let mut inner = self.inner.lock();
        for tx in txs {
            let id = tx.id_hex();
            inner.transactions.remove(&id);
            inner.pending.retain(|p| *p != id);
        }
    }
}

/// Block hashes a peer advertised that have not been fetched yet.
#[derive(Default)]
pub struct BlocksInTransit {
    queue: Mutex<VecDeque<Vec<u8>>>,
}

impl BlocksInTransit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, hashes: impl IntoIterator<Item = Vec<u8>>) {
        *self.queue.lock() = hashes.into_iter().collect();
    }

    pub fn pop_front(&self) -> Option<Vec<u8>> {
        self.queue.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}
