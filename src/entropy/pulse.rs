//! Entropy pulses from the three public sources.

use serde::{Deserialize, Serialize};

use crate::core::hash::{sha256, Hash32};
use crate::ledger::client::{BlockHeader, QrngPulse};
use crate::proof::anchor::QrngTuple;

/// Where a pulse came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntropySourceKind {
    /// Primary ledger block.
    Kaspa,
    /// Secondary-source block.
    Bitcoin,
    /// Signed NIST beacon pulse.
    NistQrng,
}

/// One raw entropy observation.
///
/// Block pulses carry only a hash; NIST pulses carry a signature for
/// non-repudiation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntropyPulse {
    /// Source.
    pub source: EntropySourceKind,
    /// DAA score, block height or beacon pulse index.
    pub index: u64,
    /// Raw hash (blocks) or beacon output value (NIST).
    pub output: Vec<u8>,
    /// Beacon signature, NIST only.
    pub signature: Option<Vec<u8>>,
}

impl EntropyPulse {
    /// Pulse from a primary ledger block.
    pub fn from_block(header: &BlockHeader) -> Self {
        Self {
            source: EntropySourceKind::Kaspa,
            index: header.daa_score,
            output: header.hash.to_vec(),
            signature: None,
        }
    }

    /// Pulse from a secondary-source block.
    pub fn from_secondary(height: u64, hash: Hash32) -> Self {
        Self { source: EntropySourceKind::Bitcoin, index: height, output: hash.to_vec(), signature: None }
    }

    /// Pulse from a signed beacon reading.
    pub fn from_qrng(pulse: &QrngPulse) -> Self {
        Self {
            source: EntropySourceKind::NistQrng,
            index: pulse.pulse_index,
            output: pulse.output.clone(),
            signature: Some(pulse.signature.clone()),
        }
    }

    /// Whether the pulse carries a signature.
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// 32-byte digest of the pulse output.
    ///
    /// Block hashes are returned as-is; beacon outputs are hashed down.
    pub fn output_hash(&self) -> Hash32 {
        match <[u8; 32]>::try_from(self.output.as_slice()) {
            Ok(hash) if self.source != EntropySourceKind::NistQrng => hash,
            _ => sha256(&self.output),
        }
    }

    /// Fixed-width anchor tuple; `None` unless this is a well-formed NIST pulse.
    pub fn to_qrng_tuple(&self) -> Option<QrngTuple> {
        if self.source != EntropySourceKind::NistQrng {
            return None;
        }
        let signature = self.signature.as_ref()?;
        Some(QrngTuple {
            pulse_index: self.index,
            output: self.output.as_slice().try_into().ok()?,
            signature: signature.as_slice().try_into().ok()?,
        })
    }
}
