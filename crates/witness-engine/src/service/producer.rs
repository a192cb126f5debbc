//! Production thread: one per local witness identity

use std::sync::Arc;

use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, instrument, warn};

use super::selection::{self, SelectionCriteria};
use super::EngineDependencies;
use crate::config::{WitnessConfig, WitnessIdentity};
use crate::domain::{
    Block, BlockAssembler, BlockchainParams, ProductionWindow, TimingParams, WindowInputs,
    WitnessIndex, WitnessState,
};
use crate::error::{Result, WitnessError};
use crate::metrics::WitnessMetrics;
use crate::ports::{ProducerState, WitnessStatus};
use crate::work::{Interest, ShutdownToken, WaitOutcome, WorkNotifier};

/// Everything a production thread is started with
pub(crate) struct ProducerContext {
    pub deps: EngineDependencies,
    pub config: Arc<WitnessConfig>,
    pub shutdown: ShutdownToken,
    pub notifier: Arc<WorkNotifier>,
    pub status: Arc<RwLock<WitnessStatus>>,
    pub metrics: Arc<WitnessMetrics>,
    pub identity: WitnessIdentity,
    pub rng_seed: Option<u64>,
}

pub(crate) struct Producer {
    pub(super) deps: EngineDependencies,
    pub(super) config: Arc<WitnessConfig>,
    pub(super) timing: TimingParams,
    pub(super) shutdown: ShutdownToken,
    pub(super) notifier: Arc<WorkNotifier>,
    pub(super) status: Arc<RwLock<WitnessStatus>>,
    pub(super) metrics: Arc<WitnessMetrics>,
    pub(super) state: WitnessState,
    pub(super) assembler: BlockAssembler,
    pub(super) rng: StdRng,
    pub(super) tx_batch: usize,
}

impl Producer {
    pub(crate) fn new(ctx: ProducerContext) -> Result<Self> {
        let assembler = BlockAssembler::new(ctx.config.scratch_capacity())?;
        let rng = match ctx.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            timing: ctx.config.timing(),
            tx_batch: ctx.config.tx_batch_size(),
            state: WitnessState::new(
                ctx.identity.index,
                ctx.identity.test_mal,
                ctx.config.test.simulate_all_witnesses,
            ),
            deps: ctx.deps,
            config: ctx.config,
            shutdown: ctx.shutdown,
            notifier: ctx.notifier,
            status: ctx.status,
            metrics: ctx.metrics,
            assembler,
            rng,
        })
    }

    /// Witness index for log lines, -1 once inactive
    pub(super) fn wid(&self) -> i32 {
        self.state.index().map_or(-1, i32::from)
    }

    pub(super) fn set_phase(&self, phase: ProducerState) {
        let mut status = self.status.write();
        status.state = phase;
        status.index = self.state.index();
    }

    /// Thread body: produce blocks until shutdown, a fatal ledger error or
    /// deactivation
    pub(crate) fn run(mut self) {
        info!("[witness {}] production thread started", self.wid());

        if self.wait_for_indelible().is_ok() {
            let last_indelible = self.deps.ledger.last_indelible_block();
            let level = self.deps.ledger.last_indelible_level();
            self.state.seed(&last_indelible, level);
            self.production_loop();
        }

        self.set_phase(ProducerState::Stopped);
        info!("[witness {}] production thread stopped", self.wid());
    }

    fn production_loop(&mut self) {
        let mut honest_attempts = 0u64;
        let mut malicious_attempts = 0u64;
        let mut failures = 0u32;

        while self.state.is_active() {
            if self.shutdown.is_cancelled() {
                break;
            }

            if self.state.simulates_all() {
                self.rotate_simulated_identity(honest_attempts, malicious_attempts, failures);
            }
            let maltest = self.state.is_maltest();

            match self.attempt_new_block().and_then(|block| self.hand_off(block)) {
                Ok(()) => failures = 0,
                Err(WitnessError::Shutdown) => break,
                Err(e) if e.is_critical() => {
                    error!("[witness {}] stopping: {}", self.wid(), e);
                    break;
                }
                Err(e) => {
                    failures += 1;
                    self.metrics.record_failed_attempt();
                    debug!("[witness {}] block attempt failed: {}", self.wid(), e);
                    if failures > self.config.stuck_failure_threshold {
                        error!(
                            "[witness {}] witness appears stuck after {} consecutive failures",
                            self.wid(),
                            failures
                        );
                    }
                    self.back_off();
                }
            }

            if maltest {
                malicious_attempts += 1;
            } else {
                honest_attempts += 1;
            }
            self.status.write().consecutive_failures = failures;
        }
    }

    /// Stop the attempt on shutdown or a fatal ledger error
    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(WitnessError::Shutdown);
        }
        if self.deps.ledger.has_fatal_error() {
            return Err(WitnessError::LedgerFatal);
        }
        Ok(())
    }

    fn wait_for_indelible(&self) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(WitnessError::Shutdown);
            }
            if !self.deps.ledger.last_indelible_block().is_null() {
                return Ok(());
            }
            debug!("[witness {}] waiting for last indelible block", self.wid());
            let deadline = self.deps.clock.now_ms() + crate::INDELIBLE_POLL_MS;
            let outcome = self.notifier.wait_for(
                Interest::NONE,
                Some(deadline),
                self.deps.clock.as_ref(),
                &self.shutdown,
            );
            if outcome == WaitOutcome::Shutdown {
                return Err(WitnessError::Shutdown);
            }
        }
    }

    fn back_off(&self) {
        let deadline = self.deps.clock.now_ms() + crate::FAILURE_BACKOFF_MS;
        self.notifier.wait_for(
            Interest::BLOCK,
            Some(deadline),
            self.deps.clock.as_ref(),
            &self.shutdown,
        );
    }

    /// Pick the next simulated witness. With a malicious test identity,
    /// honest identities are passed over until malicious attempts outnumber
    /// honest ones by more than `malicious_test_ratio` to one.
    pub(super) fn rotate_simulated_identity(&mut self, honest: u64, malicious: u64, failures: u32) {
        let Ok(reference) = self.reference_block() else {
            return;
        };
        let Some(params) = reference.params() else {
            return;
        };
        if params.nwitnesses == 0 {
            return;
        }

        let ratio = self.config.test.malicious_test_ratio as u64;
        for _ in 0..=params.nwitnesses {
            let next = if self.config.test.random_witness_order {
                self.rng.gen_range(0..params.nwitnesses)
            } else {
                self.state
                    .index()
                    .map_or(0, |index| (index + 1) % params.nwitnesses)
            };
            self.state.set_index(next);

            let skip_honest = self.state.test_mal()
                && ratio > 0
                && params.maxmal > 0
                && !self.state.is_maltest()
                && honest.saturating_mul(ratio) >= malicious
                && failures <= params.nwitnesses as u32;
            if !skip_honest {
                break;
            }
        }
    }

    /// Block to score against: the ledger's last indelible block, or the
    /// identity's cached one under `delay_last_indelible`
    pub(super) fn reference_block(&self) -> Result<Block> {
        let mut buffer = self.deps.ledger.last_indelible_block();
        if self.config.test.delay_last_indelible {
            let cached = self.state.identity_last_indelible();
            if !cached.is_null() {
                buffer = cached.clone();
            }
        }
        if buffer.is_null() {
            return Err(WitnessError::MissingIndelibleBlock);
        }
        Ok(Block::from_buffer(buffer)?)
    }

    fn select_building_block(&mut self, index: WitnessIndex, reference: &Block) -> Option<Block> {
        let ignore_order = self.state.misbehavior.ignore_order;
        let generation = self
            .state
            .refresh_generation(reference.buffer(), ignore_order);

        let best_own_score = selection::find_best_own_score(
            self.deps.queue.as_ref(),
            self.deps.codec.as_ref(),
            index,
            reference,
            generation,
            ignore_order,
        );
        let criteria = SelectionCriteria {
            index,
            highest_witnessed: self.state.highest_witnessed_level(),
            best_own_score,
            ignore_order,
            build_on_random: self.config.test.build_on_random,
        };
        selection::find_best_building_block(
            self.deps.queue.as_ref(),
            self.deps.codec.as_ref(),
            reference,
            generation,
            &criteria,
        )
        .map(|(block, _)| block)
    }

    /// Build one block: select a prior, collect transactions until the
    /// production window closes, then finalize
    #[instrument(level = "debug", skip(self), fields(witness = self.wid()))]
    pub(super) fn attempt_new_block(&mut self) -> Result<Block> {
        let mut current: Option<Block> = None;
        let mut best: Option<Block> = None;
        let mut window = ProductionWindow::default();
        let mut floor_level = 0;

        let prior = loop {
            self.ensure_running()?;
            let index = self.state.index().ok_or(WitnessError::Inactive)?;

            if best.is_none() || self.notifier.has_block_work() {
                self.notifier.reset_block_work();
                self.set_phase(ProducerState::ScoringPrior);
                let reference = self.reference_block()?;
                floor_level = reference.level();
                best = self.select_building_block(index, &reference);
            }

            let Some(candidate) = best.clone() else {
                debug!("[witness {}] no building block", index);
                if self.config.test.delay_last_indelible {
                    let latest = self.deps.ledger.last_indelible_block();
                    self.state.set_identity_last_indelible(latest);
                }
                self.set_phase(ProducerState::WaitingForWork);
                let outcome = self.notifier.wait_for(
                    Interest::BLOCK,
                    None,
                    self.deps.clock.as_ref(),
                    &self.shutdown,
                );
                if outcome == WaitOutcome::Shutdown {
                    return Err(WitnessError::Shutdown);
                }
                continue;
            };

            if current.as_ref() != Some(&candidate) {
                window = self.start_new_block(index, &candidate, floor_level);
                current = Some(candidate.clone());
            }

            self.set_phase(ProducerState::Building);
            self.build_new_block(&candidate, &mut window)?;

            self.set_phase(ProducerState::WaitingForWork);
            let has_body = !self.assembler.is_empty();
            let outcome = self.notifier.wait_for(
                Interest::ALL,
                Some(window.deadline(has_body)),
                self.deps.clock.as_ref(),
                &self.shutdown,
            );
            match outcome {
                WaitOutcome::Shutdown => return Err(WitnessError::Shutdown),
                WaitOutcome::DeadlineReached => break candidate,
                WaitOutcome::BlockWork => continue,
                WaitOutcome::TxWork => {
                    let now = self.deps.clock.now_ms();
                    if window.reached(now, !self.assembler.is_empty()) {
                        break candidate;
                    }
                }
            }
        };

        self.ensure_running()?;
        self.set_phase(ProducerState::Finalizing);
        self.finish_new_block(&prior)
    }

    /// Reset per-block state for a new prior and compute its window
    fn start_new_block(
        &mut self,
        index: WitnessIndex,
        prior: &Block,
        floor_level: u64,
    ) -> ProductionWindow {
        let now = self.deps.clock.now_ms();
        let params = prior.params().unwrap_or(BlockchainParams {
            nwitnesses: 1,
            maxmal: 0,
        });
        let allow_ignore_order = params.maxmal > 0 || self.config.test.ignore_signature_order;

        self.state
            .start_new_block(now, &mut self.rng, allow_ignore_order);
        self.assembler.reset();

        let random_offset = match self.timing.random_ms {
            Some(r) => self.rng.gen_range(0..r.saturating_mul(2).max(1)),
            None => 0,
        };
        let inputs = WindowInputs {
            now,
            announce_time: prior.aux().map_or(0, |aux| aux.announce_time()),
            skip: self
                .deps
                .codec
                .rotation_skip(prior.witness(), index, params.nwitnesses),
            block_start: now,
            chain_has_pending: self.deps.ledger.chain_has_pending_txs(prior, floor_level),
            random_offset,
        };
        let window = ProductionWindow::compute(&self.timing, &inputs);

        debug!(
            "[witness {}] building on level {} witness {} skip {} window {}..{} now {}",
            index,
            prior.level(),
            prior.witness(),
            inputs.skip,
            window.min_time,
            window.max_time,
            now
        );
        if self.state.misbehavior.ignore_order || self.state.misbehavior.attempt.is_some() {
            warn!(
                "[witness {}] test block misbehavior {:?}",
                index, self.state.misbehavior
            );
        }
        window
    }
}
