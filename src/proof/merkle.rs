//! Merkle Move Log
//!
//! Append-only binary Merkle tree over committed moves. Leaves are ordered by
//! sequence and never removed or reordered; the root is rebuilt lazily and
//! exposed once per heartbeat batch for anchoring.
//!
//! Leaves are `sha256(78-byte move preimage)`. Internal nodes are
//! domain-separated so a leaf can never be confused with a node.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::hash::Hash32;
use crate::proof::moves::Move;

/// Domain separator for Merkle tree internal nodes.
const MERKLE_NODE_DOMAIN: &[u8] = b"KAS_RUNNER_MERKLE_NODE_V1";

/// Empty hash for padding (hash of empty domain).
fn empty_hash() -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(b"KAS_RUNNER_MERKLE_EMPTY_V1");
    hasher.finalize().into()
}

/// Errors raised by the accumulator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MerkleError {
    /// Sequence did not increase.
    #[error("move sequence {got} does not follow {last}")]
    NonMonotonicSequence {
        /// Last appended sequence.
        last: u32,
        /// Rejected sequence.
        got: u32,
    },
}

/// Incremental Merkle accumulator over ordered moves.
#[derive(Clone, Debug, Default)]
pub struct MerkleAccumulator {
    /// Leaf hashes in append order.
    leaves: Vec<Hash32>,
    /// Sequence of each leaf (parallel to `leaves`).
    sequences: Vec<u32>,
    /// Cached tree levels (leaves at index 0, root at last index).
    levels: Vec<Vec<Hash32>>,
}

impl MerkleAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a move, returning its leaf hash.
    ///
    /// Fails if the sequence is not strictly greater than the last one.
    pub fn append(&mut self, mv: &Move) -> Result<Hash32, MerkleError> {
        if let Some(&last) = self.sequences.last() {
            if mv.sequence <= last {
                return Err(MerkleError::NonMonotonicSequence { last, got: mv.sequence });
            }
        }

        let leaf = mv.leaf_hash();
        self.leaves.push(leaf);
        self.sequences.push(mv.sequence);
        self.levels.clear();
        Ok(leaf)
    }

    /// Number of leaves.
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Whether no move has been appended.
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Leaf hashes in order.
    pub fn leaves(&self) -> &[Hash32] {
        &self.leaves
    }

    /// Current root. Returns the empty hash for an empty log.
    pub fn root(&mut self) -> Hash32 {
        if self.leaves.is_empty() {
            return empty_hash();
        }
        if self.levels.is_empty() {
            self.levels = build_levels(&self.leaves);
        }
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or_else(empty_hash)
    }

    /// Root over the first `count` leaves.
    pub fn root_at(&self, count: usize) -> Hash32 {
        root_of(&self.leaves[..count.min(self.leaves.len())])
    }

    /// Inclusion proof for the leaf with the given sequence.
    pub fn proof(&mut self, sequence: u32) -> Option<MerkleProof> {
        let index = self.sequences.binary_search(&sequence).ok()?;
        if self.levels.is_empty() {
            self.levels = build_levels(&self.leaves);
        }

        let mut siblings = Vec::new();
        let mut current_index = index;

        for level in &self.levels[..self.levels.len().saturating_sub(1)] {
            let sibling_index = current_index ^ 1;
            if sibling_index < level.len() {
                let is_right = current_index % 2 == 0;
                siblings.push((level[sibling_index], is_right));
            }
            current_index /= 2;
        }

        Some(MerkleProof {
            sequence,
            leaf_index: index,
            leaf: self.leaves[index],
            siblings,
        })
    }
}

/// Merkle inclusion proof.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleProof {
    /// Sequence of the proven move.
    pub sequence: u32,
    /// Position of the leaf in the log.
    pub leaf_index: usize,
    /// Leaf hash.
    pub leaf: Hash32,
    /// Sibling hashes along the path (hash, is_right_sibling).
    pub siblings: Vec<(Hash32, bool)>,
}

impl MerkleProof {
    /// Verify this proof for a move against a root.
    pub fn verify(&self, root: &Hash32, mv: &Move) -> bool {
        mv.sequence == self.sequence && mv.leaf_hash() == self.leaf && self.verify_leaf(root)
    }

    /// Verify the stored leaf hash against a root.
    pub fn verify_leaf(&self, root: &Hash32) -> bool {
        let mut current = self.leaf;
        for (sibling, is_right) in &self.siblings {
            current = if *is_right {
                hash_nodes(&current, sibling)
            } else {
                hash_nodes(sibling, &current)
            };
        }
        current == *root
    }
}

/// Root of an ordered leaf slice. Pure function of its input.
pub fn root_of(leaves: &[Hash32]) -> Hash32 {
    if leaves.is_empty() {
        return empty_hash();
    }
    build_levels(leaves)
        .last()
        .and_then(|level| level.first())
        .copied()
        .unwrap_or_else(empty_hash)
}

/// Build all levels, padding the leaf level to a power of two.
fn build_levels(leaves: &[Hash32]) -> Vec<Vec<Hash32>> {
    let mut levels = Vec::new();
    let mut current_level = leaves.to_vec();

    let target_size = current_level.len().next_power_of_two();
    current_level.resize(target_size, empty_hash());
    levels.push(current_level.clone());

    while current_level.len() > 1 {
        let next_level: Vec<Hash32> = current_level
            .chunks(2)
            .map(|chunk| hash_nodes(&chunk[0], chunk.get(1).unwrap_or(&chunk[0])))
            .collect();
        levels.push(next_level.clone());
        current_level = next_level;
    }

    levels
}

/// Hash two child nodes with domain separation.
fn hash_nodes(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(MERKLE_NODE_DOMAIN);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}
