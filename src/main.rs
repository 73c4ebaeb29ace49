//! Kas Runner Demo
//!
//! Plays one single-player session against the in-memory ledger, then audits
//! the anchored chain the way a third-party verifier would.
//!
//! `cargo run --features test-utils`

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use kas_runner::{
    core::RecursiveFolder,
    entropy::EntropySource,
    proof::{verify_chain, verify_prefix_roots},
    session::{Phase, SessionResults},
    ActionCode, Anchor, CoreConfig, LedgerClient, MockLedger, Outcome, SessionController, VERSION,
};

/// DAA units the demo block producer adds per block.
const DAA_PER_BLOCK: u64 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to set tracing subscriber")?;

    info!("Kas Runner Core v{}", VERSION);
    let config = CoreConfig::from_env();
    info!(
        "DAA window: {} | batch: {} moves / {} ms",
        config.session.daa_duration, config.anchor.batch_max, config.anchor.batch_ms
    );

    demo_session(config).await
}

/// Run one session and audit it.
async fn demo_session(config: CoreConfig) -> Result<()> {
    info!("=== Starting Demo Session ===");
    let ledger = Arc::new(MockLedger::new());
    let mut ctrl = SessionController::new(Arc::clone(&ledger) as Arc<dyn LedgerClient>, config);

    // 100 ms blocks
    let producer = {
        let ledger = Arc::clone(&ledger);
        tokio::spawn(async move {
            let mut daa = 1_000;
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            loop {
                ticker.tick().await;
                ledger.push_block(daa).await;
                daa += DAA_PER_BLOCK;
            }
        })
    };

    let game_id = ctrl.start_single_player("demo-player").await?;
    info!("Game ID: {}", game_id);
    ctrl.begin_game().await?;

    let actions = [ActionCode::Left, ActionCode::Jump, ActionCode::Right, ActionCode::Slide, ActionCode::Coin];
    let mut steps = 0u64;
    let mut moves = 0u32;
    let mut coins = 0u32;
    while ctrl.phase() == Phase::Running {
        ctrl.step().await?;
        steps += 1;
        if steps % 3 == 0 && ctrl.is_input_enabled() {
            let action = actions[(moves as usize) % actions.len()];
            ctrl.handle_action(action, (moves % 3) as u8).await?;
            moves += 1;
            if action == ActionCode::Coin {
                coins += 1;
            }
            ctrl.update_score(moves * 10, coins);
        }
        if steps % 50 == 0 {
            info!("Progress {:.0}% - {} moves", ctrl.progress() * 100.0, moves);
        }
    }
    producer.abort();

    ctrl.end_session(SessionResults { score: moves * 10, coins, outcome: Outcome::Complete }).await?;
    let status = ctrl.cleanup().await;
    info!("Final: {:?}", status);

    // Audit
    info!("=== Auditing Anchor Chain ===");
    let receipt = ctrl.final_receipt().context("session was not anchored")?;
    let summary = verify_chain(&receipt.records)?;
    verify_prefix_roots(&receipt.moves, &receipt.records)?;
    info!(
        "Chain OK: {} heartbeats, {} moves, outcome {:?}",
        summary.heartbeats, summary.total_moves, summary.outcome
    );

    let genesis = match Anchor::decode(&receipt.records[0].payload)? {
        Anchor::Genesis(genesis) => genesis,
        other => bail!("chain starts with {:?}", other.kind()),
    };
    let seed = hex::encode(ledger.get_random(&game_id.to_string()).await?);
    let folder = RecursiveFolder::default();
    let replayed = receipt.moves.iter().all(|mv| {
        EntropySource::replay(&folder, &seed, u64::from(mv.sequence) + 1, &genesis.secondary_hashes) == mv.vrf_output
    });
    if replayed {
        info!("ENTROPY VERIFIED: all {} VRF outputs replay from the seed", receipt.moves.len());
    } else {
        bail!("VRF replay mismatch");
    }
    Ok(())
}
