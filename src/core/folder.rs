//! Recursive Entropy Folding
//!
//! Whitens raw ledger entropy (block hash + nonce + optional secondary block
//! hashes) into a fixed 32-byte digest.
//!
//! Each round:
//! 1. XOR-folds symmetric byte positions (`out[j] = buf[j] ^ buf[len-1-j]`)
//! 2. Rotates the folded buffer left by `round * rotation_step`
//! 3. Hashes the rotated buffer (SHA-256, domain separated, round-tagged)
//!
//! The fold is a pure function. An auditor re-running it over the anchored raw
//! material reproduces the exact value used during play.

use serde::{Deserialize, Serialize};

use super::hash::{sha256, Hash32, HashBuilder, ZERO_HASH};

/// Domain separator for fold rounds.
const FOLD_DOMAIN: &[u8] = b"KAS_RUNNER_FOLD_V1";

/// Default number of folding rounds.
pub const DEFAULT_FOLD_ROUNDS: usize = 4;

/// Default rotation step (bytes per round index).
pub const DEFAULT_ROTATION_STEP: usize = 7;

/// Deterministic entropy whitener.
///
/// # Example
///
/// ```
/// use kas_runner::core::folder::RecursiveFolder;
///
/// let folder = RecursiveFolder::default();
/// let a = folder.fold(b"block-hash-and-nonce");
/// let b = folder.fold(b"block-hash-and-nonce");
/// assert_eq!(a, b);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecursiveFolder {
    rounds: usize,
    rotation_step: usize,
}

impl Default for RecursiveFolder {
    fn default() -> Self {
        Self::new(DEFAULT_FOLD_ROUNDS, DEFAULT_ROTATION_STEP)
    }
}

impl RecursiveFolder {
    /// Create a folder. At least one round is always run.
    pub fn new(rounds: usize, rotation_step: usize) -> Self {
        Self {
            rounds: rounds.max(1),
            rotation_step,
        }
    }

    /// Number of rounds.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Fold arbitrary raw material into a whitened digest.
    pub fn fold(&self, material: &[u8]) -> Hash32 {
        let mut out = ZERO_HASH;
        let mut buf = material.to_vec();

        for round in 0..self.rounds {
            let mut folded = fold_symmetric(&buf);
            if !folded.is_empty() {
                let shift = round.wrapping_mul(self.rotation_step) % folded.len();
                folded.rotate_left(shift);
            }

            let mut hasher = HashBuilder::with_domain(FOLD_DOMAIN);
            hasher.update_u32(round as u32).update_bytes(&folded);
            out = hasher.finalize();
            buf = out.to_vec();
        }

        out
    }

    /// Whiten a primary block hash, a nonce and optional secondary hashes.
    ///
    /// Material layout: `primary(32) || nonce(u64 LE) || secondary(32)*`.
    pub fn whiten(&self, primary: &Hash32, nonce: u64, secondary: &[Hash32]) -> Hash32 {
        let mut material = Vec::with_capacity(40 + secondary.len() * 32);
        material.extend_from_slice(primary);
        material.extend_from_slice(&nonce.to_le_bytes());
        for hash in secondary {
            material.extend_from_slice(hash);
        }
        self.fold(&material)
    }

    /// Reproduce the output a prover returns for a `seed:counter` input.
    ///
    /// This is the replay path: the seed input is hashed to form the primary
    /// material, the secondary hashes are mixed in, nonce is zero.
    pub fn derive(&self, seed_input: &str, secondary: &[Hash32]) -> Hash32 {
        self.whiten(&sha256(seed_input.as_bytes()), 0, secondary)
    }
}

/// XOR symmetric positions; the middle byte of an odd-length buffer is kept.
fn fold_symmetric(buf: &[u8]) -> Vec<u8> {
    let len = buf.len();
    let half = len / 2;
    let mut out = Vec::with_capacity(half + 1);
    for j in 0..half {
        out.push(buf[j] ^ buf[len - 1 - j]);
    }
    if len % 2 == 1 {
        out.push(buf[half]);
    }
    out
}

/// Map a digest to `[0, 1)`.
///
/// XOR-folds the first and last four bytes into a `u32` and divides by 2^32.
pub fn unit_interval(digest: &Hash32) -> f64 {
    let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let tail = u32::from_be_bytes([digest[28], digest[29], digest[30], digest[31]]);
    f64::from(head ^ tail) / 4_294_967_296.0
}
