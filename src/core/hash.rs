//! Hashing Primitives
//!
//! Fixed-width hash types and SHA-256 helpers shared by the entropy pipeline,
//! the Merkle move log and the anchor codec.
//! - Leaf and node hashing for the move log
//! - Game id / seed commitments written into Genesis
//! - Deterministic transaction ids in the in-memory ledger

use sha2::{Digest, Sha256};

/// 256-bit hash output.
pub type Hash32 = [u8; 32];

/// Ledger transaction identifier (32 bytes on the wire).
pub type TxId = [u8; 32];

/// Session identifier.
pub type GameId = uuid::Uuid;

/// All-zero hash, used where an anchor field is absent (e.g. no prev tx yet).
pub const ZERO_HASH: Hash32 = [0u8; 32];

/// Incremental hasher with little-endian integer helpers.
///
/// Order of updates is significant.
pub struct HashBuilder {
    hasher: Sha256,
}

impl Default for HashBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HashBuilder {
    /// Create a hasher with no domain prefix.
    pub fn new() -> Self {
        Self { hasher: Sha256::new() }
    }

    /// Create a hasher prefixed with a domain separator.
    pub fn with_domain(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update(bytes);
        self
    }

    /// Update with a u8 value.
    #[inline]
    pub fn update_u8(&mut self, value: u8) -> &mut Self {
        self.hasher.update([value]);
        self
    }

    /// Update with a u32 value (little-endian).
    #[inline]
    pub fn update_u32(&mut self, value: u32) -> &mut Self {
        self.hasher.update(value.to_le_bytes());
        self
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) -> &mut Self {
        self.hasher.update(value.to_le_bytes());
        self
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> Hash32 {
        self.hasher.finalize().into()
    }
}

/// SHA-256 of arbitrary data.
pub fn sha256(data: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 with a domain separator prefix.
pub fn hash_with_domain(domain: &[u8], data: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(data);
    hasher.finalize().into()
}

/// Short hex prefix for log lines.
pub fn short_hex(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(6)])
}

/// Parse a 64-character hex string into a 32-byte hash.
pub fn hash_from_hex(s: &str) -> Option<Hash32> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hash_order_matters() {
        let hash1 = {
            let mut h = HashBuilder::with_domain(b"test");
            h.update_u32(1).update_u32(2);
            h.finalize()
        };
        let hash2 = {
            let mut h = HashBuilder::with_domain(b"test");
            h.update_u32(2).update_u32(1);
            h.finalize()
        };
        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_domain_separation() {
        let data = [1u8, 2, 3, 4];
        assert_ne!(hash_with_domain(b"DOMAIN_A", &data), hash_with_domain(b"DOMAIN_B", &data));
    }

    #[test]
    fn test_hex_parse() {
        let h = sha256(b"x");
        assert_eq!(hash_from_hex(&hex::encode(h)), Some(h));
        assert_eq!(hash_from_hex("abcd"), None);
        assert_eq!(hash_from_hex("zz"), None);
        assert_eq!(short_hex(&h).len(), 12);
    }
}
