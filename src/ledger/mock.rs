//! In-Memory Ledger
//!
//! Deterministic [`LedgerClient`] used by the test suite and the demo binary.
//!
//! ```text
//!   push_block() ──► blocks (broadcast) ──► subscribers
//!   push_peer_anchor() ──► peers (broadcast) ──► integrity monitor
//!   submit_anchor() ──► fee from largest UTXO ──► captured payloads
//!   prove() ──► RecursiveFolder::derive (same path an auditor replays)
//! ```
//!
//! Failures are scripted per capability: queued errors are returned in order
//! before the capability starts succeeding again.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use crate::core::folder::RecursiveFolder;
use crate::core::hash::{hash_with_domain, GameId, Hash32, HashBuilder, TxId};
use crate::ledger::client::{
    BlockHeader, Capability, LedgerClient, LedgerError, LobbyNotice, Outpoint, PeerAnchor, ProveRequest,
    QrngPulse, QrngSource, Utxo, VrfProof,
};
use crate::proof::anchor::{NIST_OUTPUT_SIZE, NIST_SIGNATURE_SIZE};

/// Fee charged per submitted transaction (sompi).
pub const MOCK_TX_FEE_SOMPI: u64 = 20_000;

/// Starting balance: 10 KAS.
pub const MOCK_DEFAULT_BALANCE_SOMPI: u64 = 1_000_000_000;

const STREAM_CAPACITY: usize = 256;

#[derive(Default)]
struct MockState {
    daa_score: u64,
    daa_failures: VecDeque<LedgerError>,
    balance: u64,
    utxos: Vec<Utxo>,
    tx_counter: u64,
    submissions: Vec<Vec<u8>>,
    submit_failures: VecDeque<LedgerError>,
    submit_delay: Option<Duration>,
    prove_available: bool,
    prove_failures: VecDeque<LedgerError>,
    prove_calls: u64,
    qrng_failures: VecDeque<LedgerError>,
    split_failures: VecDeque<LedgerError>,
    qrng_pulse_index: u64,
    secondary_tip: u64,
    events: Vec<(String, serde_json::Value)>,
    lobby: Vec<(String, LobbyNotice)>,
}

impl MockState {
    fn next_tx_id(&mut self, payload: &[u8]) -> TxId {
        self.tx_counter += 1;
        let mut h = HashBuilder::with_domain(b"MOCK_TX");
        h.update_u64(self.tx_counter).update_bytes(payload);
        h.finalize()
    }
}

/// Deterministic in-memory ledger.
pub struct MockLedger {
    blocks: broadcast::Sender<BlockHeader>,
    peers: broadcast::Sender<PeerAnchor>,
    folder: RecursiveFolder,
    state: Mutex<MockState>,
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLedger {
    /// Ledger with the default balance and no UTXOs split yet.
    pub fn new() -> Self {
        Self::with_balance(MOCK_DEFAULT_BALANCE_SOMPI)
    }

    /// Ledger holding `balance` sompi in a single output.
    pub fn with_balance(balance: u64) -> Self {
        let (blocks, _) = broadcast::channel(STREAM_CAPACITY);
        let (peers, _) = broadcast::channel(STREAM_CAPACITY);
        let mut state = MockState {
            balance,
            prove_available: true,
            qrng_pulse_index: 1,
            secondary_tip: 800_000,
            ..MockState::default()
        };
        if balance > 0 {
            let tx_id = state.next_tx_id(b"coinbase");
            state.utxos.push(Utxo { outpoint: Outpoint { tx_id, index: 0 }, amount_sompi: balance });
        }
        Self {
            blocks,
            peers,
            folder: RecursiveFolder::default(),
            state: Mutex::new(state),
        }
    }

    // =========================================================================
    // Injection
    // =========================================================================

    /// Deliver a block with the given DAA score to every subscriber.
    ///
    /// The virtual DAA score only moves forward; stale deliveries are still
    /// broadcast so consumers can exercise their own filters.
    pub async fn push_block(&self, daa_score: u64) -> BlockHeader {
        let header = BlockHeader { hash: hash_with_domain(b"MOCK_BLOCK", &daa_score.to_le_bytes()), daa_score };
        {
            let mut state = self.state.lock().await;
            state.daa_score = state.daa_score.max(daa_score);
        }
        let _ = self.blocks.send(header);
        header
    }

    /// Set the virtual DAA score without delivering a block.
    pub async fn set_daa_score(&self, daa_score: u64) {
        self.state.lock().await.daa_score = daa_score;
    }

    /// Deliver an anchor as if another lobby participant had submitted it.
    pub async fn push_peer_anchor(&self, player_id: &str, game_id: GameId, payload: Vec<u8>) -> TxId {
        let tx_id = self.state.lock().await.next_tx_id(&payload);
        let _ = self.peers.send(PeerAnchor { player_id: player_id.to_string(), game_id, tx_id, payload });
        tx_id
    }

    /// Queue errors returned by the next `current_daa_score` calls.
    pub async fn fail_daa_queries(&self, errors: impl IntoIterator<Item = LedgerError>) {
        self.state.lock().await.daa_failures.extend(errors);
    }

    /// Queue errors returned by the next `submit_anchor` calls.
    pub async fn fail_submits(&self, errors: impl IntoIterator<Item = LedgerError>) {
        self.state.lock().await.submit_failures.extend(errors);
    }

    /// Queue errors returned by the next `prove` calls.
    pub async fn fail_proves(&self, errors: impl IntoIterator<Item = LedgerError>) {
        self.state.lock().await.prove_failures.extend(errors);
    }

    /// Queue errors returned by the next `get_qrng` calls.
    pub async fn fail_qrng(&self, errors: impl IntoIterator<Item = LedgerError>) {
        self.state.lock().await.qrng_failures.extend(errors);
    }

    /// Queue errors returned by the next `split_utxos` calls.
    pub async fn fail_splits(&self, errors: impl IntoIterator<Item = LedgerError>) {
        self.state.lock().await.split_failures.extend(errors);
    }

    /// Toggle the proof capability.
    pub async fn set_prove_available(&self, available: bool) {
        self.state.lock().await.prove_available = available;
    }

    /// Delay every submission by `delay`.
    pub async fn set_submit_delay(&self, delay: Option<Duration>) {
        self.state.lock().await.submit_delay = delay;
    }

    /// Publish a new beacon pulse.
    pub async fn set_qrng_pulse(&self, pulse_index: u64) {
        self.state.lock().await.qrng_pulse_index = pulse_index;
    }

    /// Mine one block on the secondary chain.
    pub async fn advance_secondary_tip(&self) {
        self.state.lock().await.secondary_tip += 1;
    }

    /// Replace the wallet outputs; the balance follows their sum.
    pub async fn set_utxos(&self, utxos: Vec<Utxo>) {
        let mut state = self.state.lock().await;
        state.balance = utxos.iter().map(|u| u.amount_sompi).sum();
        state.utxos = utxos;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Payloads submitted so far, in order.
    pub async fn submissions(&self) -> Vec<Vec<u8>> {
        self.state.lock().await.submissions.clone()
    }

    /// Telemetry events recorded so far.
    pub async fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.state.lock().await.events.clone()
    }

    /// Lobby notices broadcast so far.
    pub async fn lobby_notices(&self) -> Vec<(String, LobbyNotice)> {
        self.state.lock().await.lobby.clone()
    }

    /// Number of `prove` calls that reached the prover.
    pub async fn prove_calls(&self) -> u64 {
        self.state.lock().await.prove_calls
    }

    fn pulse_bytes(pulse_index: u64, domain: &[u8], len: usize) -> Vec<u8> {
        (0u64..)
            .flat_map(|block| {
                let mut h = HashBuilder::with_domain(domain);
                h.update_u64(pulse_index).update_u64(block);
                h.finalize()
            })
            .take(len)
            .collect()
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    fn subscribe_blocks(&self) -> broadcast::Receiver<BlockHeader> {
        self.blocks.subscribe()
    }

    async fn current_daa_score(&self) -> Result<u64, LedgerError> {
        let mut state = self.state.lock().await;
        match state.daa_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(state.daa_score),
        }
    }

    async fn submit_anchor(&self, payload: &[u8]) -> Result<TxId, LedgerError> {
        let delay = {
            let mut state = self.state.lock().await;
            if let Some(err) = state.submit_failures.pop_front() {
                return Err(err);
            }
            state.submit_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if state.balance < MOCK_TX_FEE_SOMPI {
            return Err(LedgerError::InsufficientFunds { needed: MOCK_TX_FEE_SOMPI, available: state.balance });
        }
        state.balance -= MOCK_TX_FEE_SOMPI;
        if let Some(utxo) = state.utxos.iter_mut().max_by_key(|u| u.amount_sompi) {
            utxo.amount_sompi = utxo.amount_sompi.saturating_sub(MOCK_TX_FEE_SOMPI);
        }
        state.utxos.retain(|u| u.amount_sompi > 0);

        let tx_id = state.next_tx_id(payload);
        state.submissions.push(payload.to_vec());
        Ok(tx_id)
    }

    async fn balance(&self) -> Result<u64, LedgerError> {
        Ok(self.state.lock().await.balance)
    }

    async fn utxos(&self) -> Result<Vec<Utxo>, LedgerError> {
        Ok(self.state.lock().await.utxos.clone())
    }

    async fn split_utxos(&self, count: usize, amount_each: u64) -> Result<TxId, LedgerError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.split_failures.pop_front() {
            return Err(err);
        }
        let needed = (count as u64)
            .checked_mul(amount_each)
            .ok_or_else(|| LedgerError::Malformed("split amount overflows".into()))?;
        if needed > state.balance {
            return Err(LedgerError::InsufficientFunds { needed, available: state.balance });
        }

        let tx_id = state.next_tx_id(&needed.to_le_bytes());
        let change = state.balance - needed;
        let mut outputs: Vec<Utxo> = (0..count as u32)
            .map(|index| Utxo { outpoint: Outpoint { tx_id, index }, amount_sompi: amount_each })
            .collect();
        if change > 0 {
            outputs.push(Utxo { outpoint: Outpoint { tx_id, index: count as u32 }, amount_sompi: change });
        }
        state.utxos = outputs;
        Ok(tx_id)
    }

    async fn get_random(&self, seed: &str) -> Result<Hash32, LedgerError> {
        Ok(hash_with_domain(b"MOCK_RANDOM", seed.as_bytes()))
    }

    async fn prove(&self, request: ProveRequest) -> Result<VrfProof, LedgerError> {
        {
            let mut state = self.state.lock().await;
            if !state.prove_available {
                return Err(LedgerError::Unavailable(Capability::Prove));
            }
            if let Some(err) = state.prove_failures.pop_front() {
                return Err(err);
            }
            state.prove_calls += 1;
        }

        let output = self.folder.derive(&request.seed_input, &request.secondary_hashes);
        let mut h = HashBuilder::with_domain(b"MOCK_VRF_PROOF");
        h.update_bytes(&output).update_bytes(request.seed_input.as_bytes());
        Ok(VrfProof { proof: h.finalize().to_vec(), output })
    }

    async fn get_qrng(&self, _source: QrngSource, _bytes: usize) -> Result<QrngPulse, LedgerError> {
        let pulse_index = {
            let mut state = self.state.lock().await;
            if let Some(err) = state.qrng_failures.pop_front() {
                return Err(err);
            }
            state.qrng_pulse_index
        };
        Ok(QrngPulse {
            pulse_index,
            output: Self::pulse_bytes(pulse_index, b"MOCK_QRNG_OUT", NIST_OUTPUT_SIZE),
            signature: Self::pulse_bytes(pulse_index, b"MOCK_QRNG_SIG", NIST_SIGNATURE_SIZE),
        })
    }

    async fn secondary_block_hashes(&self, count: usize) -> Result<Vec<Hash32>, LedgerError> {
        let tip = self.state.lock().await.secondary_tip;
        Ok((0..count as u64)
            .rev()
            .map(|back| hash_with_domain(b"MOCK_BTC_BLOCK", &tip.saturating_sub(back).to_le_bytes()))
            .collect())
    }

    async fn record_event(&self, kind: &str, meta: serde_json::Value) -> Result<(), LedgerError> {
        self.state.lock().await.events.push((kind.to_string(), meta));
        Ok(())
    }

    fn subscribe_peer_anchors(&self) -> Option<broadcast::Receiver<PeerAnchor>> {
        Some(self.peers.subscribe())
    }

    async fn broadcast_lobby(&self, lobby_id: &str, notice: LobbyNotice) -> Result<(), LedgerError> {
        self.state.lock().await.lobby.push((lobby_id.to_string(), notice));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_submissions_get_distinct_ids() {
        let ledger = MockLedger::new();
        let a = ledger.submit_anchor(b"same").await.unwrap();
        let b = ledger.submit_anchor(b"same").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(ledger.submissions().await.len(), 2);
        assert_eq!(ledger.balance().await.unwrap(), MOCK_DEFAULT_BALANCE_SOMPI - 2 * MOCK_TX_FEE_SOMPI);
    }

    #[tokio::test]
    async fn test_scripted_failures_drain_in_order() {
        let ledger = MockLedger::new();
        ledger.fail_submits([LedgerError::Timeout, LedgerError::Server(503)]).await;
        assert_eq!(ledger.submit_anchor(b"x").await, Err(LedgerError::Timeout));
        assert_eq!(ledger.submit_anchor(b"x").await, Err(LedgerError::Server(503)));
        assert!(ledger.submit_anchor(b"x").await.is_ok());
        assert_eq!(ledger.submissions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_split_preserves_balance() {
        let ledger = MockLedger::with_balance(150_000_000);
        ledger.split_utxos(10, 12_000_000).await.unwrap();
        let utxos = ledger.utxos().await.unwrap();
        assert_eq!(utxos.len(), 11);
        assert_eq!(utxos.iter().map(|u| u.amount_sompi).sum::<u64>(), 150_000_000);

        let err = ledger.split_utxos(10, 20_000_000).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn test_prove_matches_local_replay() {
        let ledger = MockLedger::new();
        let secondary = ledger.secondary_block_hashes(6).await.unwrap();
        let proof = ledger
            .prove(ProveRequest { seed_input: "seed:3".into(), secondary_hashes: secondary.clone() })
            .await
            .unwrap();
        assert_eq!(proof.output, RecursiveFolder::default().derive("seed:3", &secondary));

        ledger.set_prove_available(false).await;
        let err = ledger
            .prove(ProveRequest { seed_input: "seed:4".into(), secondary_hashes: secondary })
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::Unavailable(Capability::Prove));
        assert_eq!(ledger.prove_calls().await, 1);
    }

    #[tokio::test]
    async fn test_block_stream_and_daa() {
        let ledger = MockLedger::new();
        let mut rx = ledger.subscribe_blocks();
        ledger.push_block(120).await;
        ledger.push_block(110).await;
        assert_eq!(rx.recv().await.unwrap().daa_score, 120);
        assert_eq!(rx.recv().await.unwrap().daa_score, 110);
        assert_eq!(ledger.current_daa_score().await.unwrap(), 120);

        ledger.fail_daa_queries([LedgerError::Timeout]).await;
        assert_eq!(ledger.current_daa_score().await, Err(LedgerError::Timeout));
        assert_eq!(ledger.current_daa_score().await, Ok(120));
    }

    #[tokio::test]
    async fn test_qrng_pulse_shape() {
        let ledger = MockLedger::new();
        ledger.set_qrng_pulse(42).await;
        let pulse = ledger.get_qrng(QrngSource::Nist, NIST_OUTPUT_SIZE).await.unwrap();
        let tuple = pulse.to_tuple().unwrap();
        assert_eq!(tuple.pulse_index, 42);
    }
}
