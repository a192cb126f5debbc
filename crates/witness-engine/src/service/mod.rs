//! Witness Engine service
//!
//! Owns one production thread per configured identity and the handles used
//! to signal, observe and stop them.

mod building;
mod finalize;
mod producer;
mod selection;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use tracing::{error, info};

use crate::config::{WitnessConfig, WitnessIdentity};
use crate::error::{Result, WitnessError};
use crate::metrics::WitnessMetrics;
use crate::ports::{
    BlockCodec, BlockSink, CandidateQueue, Clock, Ledger, WitnessProducer, WitnessStatus,
};
use crate::work::{ShutdownToken, WorkBroadcast, WorkKind, WorkNotifier};

use producer::{Producer, ProducerContext};

/// Dependencies for WitnessEngine
#[derive(Clone)]
pub struct EngineDependencies {
    /// Chain state
    pub ledger: Arc<dyn Ledger>,
    /// Candidate blocks and ready transactions
    pub queue: Arc<dyn CandidateQueue>,
    /// Block format and signatures
    pub codec: Arc<dyn BlockCodec>,
    /// Downstream block insertion
    pub sink: Arc<dyn BlockSink>,
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// New-work fan-out; the engine registers its threads here
    pub work: WorkBroadcast,
}

struct ProducerSlot {
    identity: WitnessIdentity,
    notifier: Arc<WorkNotifier>,
    status: Arc<RwLock<WitnessStatus>>,
}

/// Witness Engine
pub struct WitnessEngine {
    deps: EngineDependencies,
    config: Arc<WitnessConfig>,
    shutdown: ShutdownToken,
    metrics: Arc<WitnessMetrics>,
    slots: Vec<ProducerSlot>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl WitnessEngine {
    /// Create an engine for the configured identities
    pub fn new(deps: EngineDependencies, config: WitnessConfig) -> Result<Self> {
        config.validate()?;

        let slots: Vec<ProducerSlot> = config
            .identities
            .iter()
            .map(|identity| ProducerSlot {
                identity: *identity,
                notifier: Arc::new(WorkNotifier::new()),
                status: Arc::new(RwLock::new(WitnessStatus {
                    index: Some(identity.index),
                    ..WitnessStatus::default()
                })),
            })
            .collect();
        for slot in &slots {
            deps.work.register(slot.notifier.clone());
        }

        Ok(Self {
            deps,
            config: Arc::new(config),
            shutdown: ShutdownToken::new(),
            metrics: Arc::new(WitnessMetrics::new()),
            slots,
            threads: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Shared metrics
    pub fn metrics(&self) -> Arc<WitnessMetrics> {
        self.metrics.clone()
    }

    /// Token that stops every production thread when cancelled
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Whether any production thread is still running
    pub fn is_running(&self) -> bool {
        self.threads.lock().iter().any(|handle| !handle.is_finished())
    }
}

impl WitnessProducer for WitnessEngine {
    fn start(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(WitnessError::Shutdown);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(WitnessError::AlreadyRunning);
        }

        let mut threads = self.threads.lock();
        for (position, slot) in self.slots.iter().enumerate() {
            let producer = Producer::new(ProducerContext {
                deps: self.deps.clone(),
                config: self.config.clone(),
                shutdown: self.shutdown.clone(),
                notifier: slot.notifier.clone(),
                status: slot.status.clone(),
                metrics: self.metrics.clone(),
                identity: slot.identity,
                rng_seed: self.config.rng_seed.map(|seed| seed.wrapping_add(position as u64)),
            })?;

            let handle = thread::Builder::new()
                .name(format!("witness-{}", slot.identity.index))
                .spawn(move || producer.run())
                .map_err(|e| WitnessError::Thread(e.to_string()))?;
            threads.push(handle);
        }

        info!(
            "[witness-engine] started {} production thread(s)",
            threads.len()
        );
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown.cancel();
        for slot in &self.slots {
            slot.notifier.wake();
        }

        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            if handle.join().is_err() {
                error!("[witness-engine] production thread panicked");
            }
        }
        info!("[witness-engine] all production threads stopped");
    }

    fn notify_new_work(&self, kind: WorkKind) {
        for slot in &self.slots {
            slot.notifier.notify(kind);
        }
    }

    fn status(&self) -> Vec<WitnessStatus> {
        self.slots
            .iter()
            .map(|slot| slot.status.read().clone())
            .collect()
    }
}

impl Drop for WitnessEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
