//! # Witness Simulator
//!
//! Runs a complete witness set in one process on the in-memory adapters and
//! feeds it random transactions.
//!
//! ```text
//! witness-sim [config.json]
//! RUST_LOG=witness_engine=debug witness-sim
//! ```

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use rand::Rng;
use serde::Deserialize;
use shared_buffer::SharedBuffer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use witness_engine::adapters::{
    encode_reference_tx, ChainSink, Ed25519BlockCodec, InMemoryCandidateQueue, InMemoryLedger,
    SystemClock,
};
use witness_engine::domain::wire::encode_tx_object;
use witness_engine::domain::TxInput;
use witness_engine::ports::Clock;
use witness_engine::{
    BlockchainParams, EngineDependencies, WitnessConfig, WitnessEngine, WitnessIdentity,
    WitnessProducer, WorkBroadcast,
};

/// Simulation settings wrapped around the engine configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
struct SimConfig {
    engine: WitnessConfig,
    nwitnesses: u16,
    maxmal: u16,
    finality_depth: Option<u64>,
    duration_secs: u64,
    tx_interval_ms: u64,
    inputs_per_tx: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        let engine = WitnessConfig {
            block_time_ms: 500,
            block_min_work_ms: 100,
            block_max_time_ms: 1_000,
            identities: (0..3)
                .map(|index| WitnessIdentity {
                    index,
                    test_mal: false,
                })
                .collect(),
            ..WitnessConfig::default()
        };
        Self {
            engine,
            nwitnesses: 3,
            maxmal: 0,
            finality_depth: Some(3),
            duration_secs: 10,
            tx_interval_ms: 50,
            inputs_per_tx: 2,
        }
    }
}

fn load_config() -> Result<SimConfig> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(SimConfig::default());
    };
    let text =
        std::fs::read_to_string(&path).with_context(|| format!("reading config {}", path))?;
    serde_json::from_str(&text).with_context(|| format!("parsing config {}", path))
}

fn random_transaction<R: Rng>(rng: &mut R, inputs: usize) -> Result<SharedBuffer> {
    let inputs: Vec<TxInput> = (0..inputs)
        .map(|_| {
            // Leave some inputs without a serial to exercise pseudo serials
            if rng.gen_range(0..4) == 0 {
                TxInput {
                    serial: None,
                    commitment: rng.gen(),
                }
            } else {
                TxInput {
                    serial: Some(rng.gen()),
                    commitment: [0u8; 32],
                }
            }
        })
        .collect();
    let mut payload = vec![0u8; rng.gen_range(16..256)];
    rng.fill(payload.as_mut_slice());

    let body = encode_reference_tx(&inputs, &payload);
    Ok(SharedBuffer::from_slice(&encode_tx_object(&body))?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let config = load_config()?;
    if config.nwitnesses == 0 || config.maxmal >= config.nwitnesses {
        bail!(
            "invalid witness set: nwitnesses {} maxmal {}",
            config.nwitnesses,
            config.maxmal
        );
    }
    let params = BlockchainParams {
        nwitnesses: config.nwitnesses,
        maxmal: config.maxmal,
    };

    let codec = Arc::new(Ed25519BlockCodec::generate(config.nwitnesses));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let root = codec.root_block(params, clock.unix_time(), clock.now_ms())?;
    info!(
        "[witness-sim] root block {} for {} witnesses, maxmal {}",
        root.short_oid(),
        params.nwitnesses,
        params.maxmal
    );

    let work = WorkBroadcast::new();
    let ledger = Arc::new(InMemoryLedger::with_root(&root));
    let queue = Arc::new(InMemoryCandidateQueue::new(work.clone()));
    queue.push_block(&root);
    let sink = Arc::new(ChainSink::new(
        queue.clone(),
        ledger.clone(),
        clock.clone(),
        config.finality_depth,
    ));

    let deps = EngineDependencies {
        ledger,
        queue: queue.clone(),
        codec,
        sink: sink.clone(),
        clock,
        work,
    };
    let engine = WitnessEngine::new(deps, config.engine)?;
    engine.start()?;

    let mut rng = rand::thread_rng();
    let start = Instant::now();
    let duration = Duration::from_secs(config.duration_secs);
    let mut pushed = 0u64;
    while start.elapsed() < duration {
        queue.push_transaction(random_transaction(&mut rng, config.inputs_per_tx)?);
        pushed += 1;
        thread::sleep(Duration::from_millis(config.tx_interval_ms));
    }

    engine.shutdown();

    let metrics = engine.metrics();
    let valid = sink.valid_blocks();
    let height = valid.iter().map(|block| block.level()).max().unwrap_or(0);
    info!(
        "[witness-sim] {} transactions pushed, {} still queued, {} blocks produced, {} valid, height {}",
        pushed,
        queue.tx_count(),
        metrics.get_blocks_produced(),
        sink.valid_count(),
        height
    );
    info!(
        "[witness-sim] avg {:.1} txs per block, avg size {:.0} bytes, {} failed attempts",
        metrics.get_avg_transactions_per_block(),
        metrics.get_avg_block_size(),
        metrics.get_attempts_failed()
    );
    for status in engine.status() {
        info!(
            "[witness-sim] witness {:?}: {:?}, {} blocks, last level {:?}",
            status.index, status.state, status.blocks_produced, status.last_level
        );
        if status.consecutive_failures > 0 {
            warn!(
                "[witness-sim] witness {:?} ended with {} consecutive failures",
                status.index, status.consecutive_failures
            );
        }
    }
    Ok(())
}
