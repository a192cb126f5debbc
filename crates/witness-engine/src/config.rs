//! Configuration types for the witness engine

use std::collections::HashSet;

use serde::Deserialize;

use crate::domain::timing::TimingParams;
use crate::domain::WitnessIndex;
use crate::error::{Result, WitnessError};

/// Runtime configuration for block production
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct WitnessConfig {
    /// Rotation slot: spacing between consecutive witnesses (default: 10000)
    pub block_time_ms: u64,

    /// Minimum time spent collecting work before a block may close (default: 1000)
    pub block_min_work_ms: u64,

    /// Block spacing when the chain has nothing pending (default: 20000)
    pub block_max_time_ms: u64,

    /// Replace rotation spacing by a random delay in `[0, 2r)` (test only)
    pub test_block_random_ms: Option<u64>,

    /// Local witness identities, one production thread each
    pub identities: Vec<WitnessIdentity>,

    /// Ask the codec for a fresh signing key on every block
    pub rotate_signing_keys: bool,

    /// Seed for the engine's test-mode randomness
    pub rng_seed: Option<u64>,

    /// Consecutive failures after which a witness is reported stuck (default: 200)
    pub stuck_failure_threshold: u32,

    /// Runtime test toggles
    pub test: TestModes,
}

impl Default for WitnessConfig {
    fn default() -> Self {
        Self {
            block_time_ms: crate::DEFAULT_BLOCK_TIME_MS,
            block_min_work_ms: crate::DEFAULT_BLOCK_MIN_WORK_MS,
            block_max_time_ms: crate::DEFAULT_BLOCK_MAX_TIME_MS,
            test_block_random_ms: None,
            identities: Vec::new(),
            rotate_signing_keys: false,
            rng_seed: None,
            stuck_failure_threshold: crate::STUCK_FAILURE_THRESHOLD,
            test: TestModes::default(),
        }
    }
}

/// A local witness identity
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WitnessIdentity {
    /// Position in the witness set
    pub index: WitnessIndex,

    /// Produce deliberately invalid blocks for network testing
    pub test_mal: bool,
}

/// Test toggles that change production behavior
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestModes {
    /// One thread acts as every witness in turn
    pub simulate_all_witnesses: bool,

    /// Rotate simulated witnesses in random order
    pub random_witness_order: bool,

    /// Build on the first candidate with a nonzero score
    pub build_on_random: bool,

    /// Score against a per-identity cached indelible block
    pub delay_last_indelible: bool,

    /// Allow ignoring signature order even when maxmal is 0
    pub ignore_signature_order: bool,

    /// Under simulate-all, malicious attempts per honest attempt to exceed
    /// before an honest identity is used again (0 = off)
    pub malicious_test_ratio: u32,

    /// Shrink scratch buffers and tx batches
    pub small_buffers: bool,
}

impl WitnessConfig {
    /// Config with a single honest identity and default timings
    pub fn single(index: WitnessIndex) -> Self {
        Self {
            identities: vec![WitnessIdentity {
                index,
                test_mal: false,
            }],
            ..Self::default()
        }
    }

    /// Timing inputs for the production window
    pub fn timing(&self) -> TimingParams {
        TimingParams {
            slot_ms: self.block_time_ms,
            min_work_ms: self.block_min_work_ms,
            no_work_spacing_ms: self.block_max_time_ms,
            random_ms: self.test_block_random_ms,
        }
    }

    /// Capacity of each production thread's scratch body buffer
    pub fn scratch_capacity(&self) -> usize {
        if self.test.small_buffers {
            crate::SMALL_SCRATCH_CAPACITY
        } else {
            crate::BLOCK_MAX_SIZE - crate::domain::wire::BLOCK_BODY_OFFSET
        }
    }

    /// Transactions fetched from the queue per batch
    pub fn tx_batch_size(&self) -> usize {
        if self.test.small_buffers {
            crate::SMALL_TX_BATCH_SIZE
        } else {
            crate::TX_BATCH_SIZE
        }
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.block_time_ms == 0 {
            return Err(WitnessError::InvalidConfig(
                "block_time_ms must be positive".into(),
            ));
        }
        if self.block_max_time_ms < self.block_time_ms {
            return Err(WitnessError::InvalidConfig(format!(
                "block_max_time_ms {} is below block_time_ms {}",
                self.block_max_time_ms, self.block_time_ms
            )));
        }
        if self.test_block_random_ms == Some(0) {
            return Err(WitnessError::InvalidConfig(
                "test_block_random_ms must be positive when set".into(),
            ));
        }
        if self.identities.is_empty() {
            return Err(WitnessError::InvalidConfig(
                "no witness identities configured".into(),
            ));
        }
        if self.test.simulate_all_witnesses && self.identities.len() != 1 {
            return Err(WitnessError::InvalidConfig(
                "simulate_all_witnesses needs exactly one identity".into(),
            ));
        }

        let mut seen = HashSet::new();
        for identity in &self.identities {
            if identity.index as usize >= crate::MAX_WITNESSES {
                return Err(WitnessError::InvalidConfig(format!(
                    "witness index {} exceeds maximum {}",
                    identity.index,
                    crate::MAX_WITNESSES - 1
                )));
            }
            if !seen.insert(identity.index) {
                return Err(WitnessError::InvalidConfig(format!(
                    "duplicate witness index {}",
                    identity.index
                )));
            }
        }

        Ok(())
    }
}
