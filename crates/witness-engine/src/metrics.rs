//! Metrics collection for the witness engine

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics collector shared by all production threads
#[derive(Debug, Default)]
pub struct WitnessMetrics {
    /// Total blocks produced and handed to the sink
    pub blocks_produced: AtomicU64,

    /// Total transactions included in produced blocks
    pub transactions_included: AtomicU64,

    /// Total transactions left out while assembling
    pub transactions_rejected: AtomicU64,

    /// Total serialized block bytes produced
    pub bytes_produced: AtomicU64,

    /// Total block attempts that ended in an error
    pub attempts_failed: AtomicU64,

    /// Test blocks carrying a deliberate double-spend
    pub double_spend_blocks: AtomicU64,

    /// Test blocks signed out of order
    pub bad_order_blocks: AtomicU64,
}

impl WitnessMetrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a produced block
    pub fn record_block_produced(&self, tx_count: u32, size: usize) {
        self.blocks_produced.fetch_add(1, Ordering::Relaxed);
        self.transactions_included
            .fetch_add(tx_count as u64, Ordering::Relaxed);
        self.bytes_produced.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Record a transaction left out of a block
    pub fn record_tx_rejected(&self) {
        self.transactions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed block attempt
    pub fn record_failed_attempt(&self) {
        self.attempts_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a deliberately invalid test block
    pub fn record_test_block(&self, double_spend: bool, bad_order: bool) {
        if double_spend {
            self.double_spend_blocks.fetch_add(1, Ordering::Relaxed);
        }
        if bad_order {
            self.bad_order_blocks.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get blocks produced
    pub fn get_blocks_produced(&self) -> u64 {
        self.blocks_produced.load(Ordering::Relaxed)
    }

    /// Get failed attempts
    pub fn get_attempts_failed(&self) -> u64 {
        self.attempts_failed.load(Ordering::Relaxed)
    }

    /// Get average transactions per block
    pub fn get_avg_transactions_per_block(&self) -> f64 {
        let blocks = self.blocks_produced.load(Ordering::Relaxed);
        if blocks == 0 {
            return 0.0;
        }
        let txs = self.transactions_included.load(Ordering::Relaxed);
        txs as f64 / blocks as f64
    }

    /// Get average block size in bytes
    pub fn get_avg_block_size(&self) -> f64 {
        let blocks = self.blocks_produced.load(Ordering::Relaxed);
        if blocks == 0 {
            return 0.0;
        }
        let bytes = self.bytes_produced.load(Ordering::Relaxed);
        bytes as f64 / blocks as f64
    }
}
