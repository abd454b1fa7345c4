//! Merkle commitment over the serialized transactions of a block.
//!
//! The tree is stored as one flat arena of hashes, level after level, starting
//! with the hashed leaves. Odd-width levels are padded by duplicating their
//! last node before pairing, so `parent(i) = H(level[2i] ‖ level[2i + 1])`.

use crate::crypto::{sha256, Sha256Hash};
use crate::error::ChainError;
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    nodes: Vec<Sha256Hash>,
    levels: Vec<Range<usize>>,
}

impl MerkleTree {
    /// Builds the tree from ordered leaf data. At least one leaf is required.
    pub fn new<T: AsRef<[u8]>>(leaves: &[T]) -> Result<Self, ChainError> {
        if leaves.is_empty() {
            return Err(ChainError::InvalidBlock(
                "Cannot build a Merkle tree without transactions".to_string(),
            ));
        }

        let mut nodes: Vec<Sha256Hash> = leaves.iter().map(|l| sha256(l.as_ref())).collect();
        let mut levels = Vec::new();
        let mut start = 0;

        loop {
            if (nodes.len() - start) % 2 != 0 {
                let last = nodes[nodes.len() - 1];
                nodes.push(last);
            }
            let end = nodes.len();
            levels.push(start..end);

            let mut i = start;
            while i < end {
                let mut pair = Vec::with_capacity(64);
                pair.extend_from_slice(&nodes[i]);
                pair.extend_from_slice(&nodes[i + 1]);
                nodes.push(sha256(&pair));
                i += 2;
            }
            start = end;

            if nodes.len() - start == 1 {
                levels.push(start..nodes.len());
                break;
            }
        }

        Ok(MerkleTree { nodes, levels })
    }

    pub fn root(&self) -> Sha256Hash {
        // The last level always holds exactly one node.
        self.nodes[self.nodes.len() - 1]
    }

    /// Number of levels including the (padded) leaf level and the root.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Hashes at the given level, 0 being the padded leaf level.
    pub fn level(&self, index: usize) -> Option<&[Sha256Hash]> {
        self.levels.get(index).map(|r| &self.nodes[r.clone()])
    }
}

/// Root of the Merkle tree over `leaves`.
pub fn merkle_root<T: AsRef<[u8]>>(leaves: &[T]) -> Result<Sha256Hash, ChainError> {
    Ok(MerkleTree::new(leaves)?.root())
}
