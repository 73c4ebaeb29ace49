//! VRF Prefetch Queue
//!
//! Keeps a queue of whitened VRF outputs ahead of the game loop so that
//! drawing a random number never waits on the ledger.
//!
//! ```text
//!   next_random() ──pop──► queue ◄──results (mpsc)── refill task ──prove()──► ledger
//!        │                                              ▲
//!        └── depth < min_queue_depth ──requests (mpsc)──┘
//! ```
//!
//! Each output is requested for a strictly increasing counter as the input
//! string `seed:counter`, mixed with the secondary-source hashes captured at
//! session start. Anyone holding the seed and the Genesis anchor can replay
//! every draw with [`EntropySource::replay`].
//!
//! There is no local PRNG fallback: if the proof capability fails, draws fail
//! with [`EntropyError::Unavailable`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::EntropyConfig;
use crate::core::folder::{unit_interval, RecursiveFolder};
use crate::core::hash::Hash32;
use crate::ledger::client::{LedgerClient, LedgerError, ProveRequest};

/// Entropy errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntropyError {
    /// The proof capability failed.
    #[error("entropy unavailable: {0}")]
    Unavailable(LedgerError),

    /// Queue is empty and a refill is still in flight.
    #[error("entropy queue empty, refill in flight")]
    Starved,

    /// Source was cancelled.
    #[error("entropy source cancelled")]
    Cancelled,
}

/// One whitened output and the counter it was requested for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntropyDraw {
    /// Request counter.
    pub counter: u64,
    /// Whitened VRF output.
    pub output: Hash32,
}

impl EntropyDraw {
    /// Output mapped to `[0, 1)`.
    pub fn unit(&self) -> f64 {
        unit_interval(&self.output)
    }
}

enum Refill {
    Output(EntropyDraw),
    Failed { error: LedgerError, abandoned: usize },
}

/// Prover input for a counter.
pub fn seed_input(seed: &str, counter: u64) -> String {
    format!("{seed}:{counter}")
}

/// Prefetching VRF entropy source.
pub struct EntropySource {
    seed: String,
    config: EntropyConfig,
    queue: VecDeque<EntropyDraw>,
    pending: usize,
    failure: Option<LedgerError>,
    requests: mpsc::UnboundedSender<usize>,
    results: mpsc::UnboundedReceiver<Refill>,
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl EntropySource {
    /// Start the refill task. Must be called inside a tokio runtime.
    pub fn spawn(
        ledger: Arc<dyn LedgerClient>,
        seed: impl Into<String>,
        secondary: Vec<Hash32>,
        config: EntropyConfig,
    ) -> Self {
        let seed = seed.into();
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (result_tx, results) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(refill_loop(
            ledger,
            seed.clone(),
            secondary,
            Arc::clone(&cancelled),
            request_rx,
            result_tx,
        ));

        let mut source = Self {
            seed,
            config,
            queue: VecDeque::new(),
            pending: 0,
            failure: None,
            requests,
            results,
            cancelled,
            task,
        };
        source.request_refill();
        source
    }

    /// Reproduce the output drawn for `counter`.
    pub fn replay(folder: &RecursiveFolder, seed: &str, counter: u64, secondary: &[Hash32]) -> Hash32 {
        folder.derive(&seed_input(seed, counter), secondary)
    }

    /// Session seed.
    pub fn seed(&self) -> &str {
        &self.seed
    }

    /// Outputs ready to draw.
    pub fn queued(&mut self) -> usize {
        self.drain_results();
        self.queue.len()
    }

    /// Draw a number in `[0, 1)`. Never waits.
    pub fn next_random(&mut self) -> Result<f64, EntropyError> {
        self.next_draw().map(|draw| draw.unit())
    }

    /// Draw the next whitened output. Never waits.
    pub fn next_draw(&mut self) -> Result<EntropyDraw, EntropyError> {
        if self.is_cancelled() {
            return Err(EntropyError::Cancelled);
        }
        self.drain_results();

        let draw = self.queue.pop_front();
        self.request_refill();
        match draw {
            Some(draw) => Ok(draw),
            None => match &self.failure {
                Some(err) => Err(EntropyError::Unavailable(err.clone())),
                None => Err(EntropyError::Starved),
            },
        }
    }

    /// Wait until the queue holds `min_queue_depth` outputs.
    ///
    /// Fails if the prover fails before a single output is available.
    pub async fn prime(&mut self) -> Result<(), EntropyError> {
        self.drain_results();
        self.request_refill();
        let target = self.config.min_queue_depth.max(1);

        while self.queue.len() < target {
            if self.is_cancelled() {
                return Err(EntropyError::Cancelled);
            }
            match self.results.recv().await {
                Some(refill) => self.absorb(refill),
                None => return Err(EntropyError::Cancelled),
            }
            if let Some(err) = &self.failure {
                if self.queue.is_empty() {
                    return Err(EntropyError::Unavailable(err.clone()));
                }
                break;
            }
            self.request_refill();
        }
        Ok(())
    }

    /// Stop refilling. In-flight proofs are allowed to finish and are dropped.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn drain_results(&mut self) {
        while let Ok(refill) = self.results.try_recv() {
            self.absorb(refill);
        }
    }

    fn absorb(&mut self, refill: Refill) {
        match refill {
            Refill::Output(draw) => {
                self.pending = self.pending.saturating_sub(1);
                self.failure = None;
                self.queue.push_back(draw);
            }
            Refill::Failed { error, abandoned } => {
                self.pending = self.pending.saturating_sub(abandoned);
                self.failure = Some(error);
            }
        }
    }

    fn request_refill(&mut self) {
        if self.is_cancelled() {
            return;
        }
        let min_depth = self.config.min_queue_depth.max(1);
        let depth = self.queue.len() + self.pending;
        if depth >= min_depth {
            return;
        }
        let wanted = self.config.batch_size.max(min_depth) - depth;
        if self.requests.send(wanted).is_ok() {
            self.pending += wanted;
            debug!(wanted, queued = self.queue.len(), "Entropy refill requested");
        }
    }
}

impl Drop for EntropySource {
    fn drop(&mut self) {
        self.cancel();
        self.task.abort();
    }
}

async fn refill_loop(
    ledger: Arc<dyn LedgerClient>,
    seed: String,
    secondary: Vec<Hash32>,
    cancelled: Arc<AtomicBool>,
    mut requests: mpsc::UnboundedReceiver<usize>,
    results: mpsc::UnboundedSender<Refill>,
) {
    let mut counter = 0u64;

    while let Some(wanted) = requests.recv().await {
        for done in 0..wanted {
            if cancelled.load(Ordering::SeqCst) {
                return;
            }
            let request = ProveRequest { seed_input: seed_input(&seed, counter), secondary_hashes: secondary.clone() };
            let refill = match ledger.prove(request).await {
                Ok(proof) => {
                    let draw = EntropyDraw { counter, output: proof.output };
                    counter += 1;
                    Refill::Output(draw)
                }
                Err(error) => {
                    warn!(%error, counter, "VRF proof failed");
                    Refill::Failed { error, abandoned: wanted - done }
                }
            };
            let failed = matches!(refill, Refill::Failed { .. });
            if cancelled.load(Ordering::SeqCst) || results.send(refill).is_err() {
                return;
            }
            if failed {
                break;
            }
        }
        debug!(next_counter = counter, "Entropy batch done");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::mock::MockLedger;

    fn config() -> EntropyConfig {
        EntropyConfig { batch_size: 8, min_queue_depth: 3, ..EntropyConfig::default() }
    }

    async fn primed(ledger: Arc<MockLedger>, seed: &str) -> EntropySource {
        let secondary = ledger.secondary_block_hashes(6).await.unwrap();
        let mut source = EntropySource::spawn(ledger, seed, secondary, config());
        source.prime().await.unwrap();
        source
    }

    #[tokio::test]
    async fn test_draws_replay_locally() {
        let ledger = Arc::new(MockLedger::new());
        let secondary = ledger.secondary_block_hashes(6).await.unwrap();
        let mut source = primed(ledger, "game-seed").await;

        let folder = RecursiveFolder::default();
        for expected_counter in 0..3 {
            let draw = source.next_draw().unwrap();
            assert_eq!(draw.counter, expected_counter);
            assert_eq!(draw.output, EntropySource::replay(&folder, "game-seed", draw.counter, &secondary));
        }
    }

    #[tokio::test]
    async fn test_independent_sources_agree() {
        let a = primed(Arc::new(MockLedger::new()), "same-seed").await;
        let b = primed(Arc::new(MockLedger::new()), "same-seed").await;
        let (mut a, mut b) = (a, b);
        for _ in 0..3 {
            let x = a.next_random().unwrap();
            let y = b.next_random().unwrap();
            assert_eq!(x, y);
            assert!((0.0..1.0).contains(&x));
        }
    }

    #[tokio::test]
    async fn test_starved_before_first_refill() {
        let ledger = Arc::new(MockLedger::new());
        let mut source = EntropySource::spawn(ledger, "s", Vec::new(), config());
        // Refill task has not been polled yet on the current-thread runtime
        assert_eq!(source.next_random(), Err(EntropyError::Starved));
    }

    #[tokio::test]
    async fn test_unavailable_prover_fails_closed() {
        let ledger = Arc::new(MockLedger::new());
        ledger.set_prove_available(false).await;
        let mut source = EntropySource::spawn(ledger, "s", Vec::new(), config());
        assert!(matches!(source.prime().await, Err(EntropyError::Unavailable(_))));
        assert!(matches!(source.next_random(), Err(EntropyError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_refill_keeps_queue_topped_up() {
        let ledger = Arc::new(MockLedger::new());
        let mut source = primed(Arc::clone(&ledger), "s").await;
        for _ in 0..20 {
            source.prime().await.unwrap();
            source.next_draw().unwrap();
        }
        // Counters handed out are strictly increasing and never reused
        let next = source.next_draw().unwrap();
        assert_eq!(next.counter, 20);
        assert!(ledger.prove_calls().await >= 21);
    }

    #[tokio::test]
    async fn test_cancel_stops_draws() {
        let mut source = primed(Arc::new(MockLedger::new()), "s").await;
        source.cancel();
        assert_eq!(source.next_random(), Err(EntropyError::Cancelled));
    }
}
