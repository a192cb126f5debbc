//! Block sink that feeds finished blocks back into the in-memory queue and
//! advances the ledger's indelible point.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use shared_buffer::SharedBuffer;
use tracing::{debug, info};

use super::codec::parse_reference_tx;
use super::{InMemoryCandidateQueue, InMemoryLedger};
use crate::domain::wire::TxObject;
use crate::domain::{Block, TempSerials};
use crate::error::{Result, WitnessError};
use crate::ports::{BlockSink, Clock, Ledger};

/// Number of recent submissions kept for inspection
pub const SUBMITTED_HISTORY: usize = 1024;

/// A block handed to the sink
#[derive(Clone, Debug)]
pub struct SubmittedBlock {
    /// The block
    pub block: Block,
    /// Serial numbers it spends
    pub serial_count: usize,
    /// Whether it may be built on
    pub is_valid: bool,
    /// Whether it may be relayed
    pub is_deliverable: bool,
}

#[derive(Default)]
struct History {
    recent: VecDeque<SubmittedBlock>,
    submitted: u64,
    valid: u64,
}

/// Closes the loop between production threads in a single process
pub struct ChainSink {
    queue: Arc<InMemoryCandidateQueue>,
    ledger: Arc<InMemoryLedger>,
    clock: Arc<dyn Clock>,
    finality_depth: Option<u64>,
    history_limit: usize,
    history: Mutex<History>,
}

impl ChainSink {
    /// Sink feeding `queue`; with `finality_depth`, a block that many levels
    /// below each new valid block becomes indelible
    pub fn new(
        queue: Arc<InMemoryCandidateQueue>,
        ledger: Arc<InMemoryLedger>,
        clock: Arc<dyn Clock>,
        finality_depth: Option<u64>,
    ) -> Self {
        Self {
            queue,
            ledger,
            clock,
            finality_depth,
            history_limit: SUBMITTED_HISTORY,
            history: Mutex::new(History::default()),
        }
    }

    /// Keep at most `limit` recent submissions
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Most recent submissions, oldest first
    pub fn submitted(&self) -> Vec<SubmittedBlock> {
        self.history.lock().recent.iter().cloned().collect()
    }

    /// Valid blocks among the recent submissions
    pub fn valid_blocks(&self) -> Vec<Block> {
        self.history
            .lock()
            .recent
            .iter()
            .filter(|entry| entry.is_valid)
            .map(|entry| entry.block.clone())
            .collect()
    }

    /// Blocks submitted since the sink was created
    pub fn submitted_count(&self) -> u64 {
        self.history.lock().submitted
    }

    /// Valid blocks submitted since the sink was created
    pub fn valid_count(&self) -> u64 {
        self.history.lock().valid
    }

    fn record(&self, entry: SubmittedBlock) {
        let mut history = self.history.lock();
        history.submitted += 1;
        if entry.is_valid {
            history.valid += 1;
        }
        history.recent.push_back(entry);
        while history.recent.len() > self.history_limit {
            history.recent.pop_front();
        }
    }

    fn advance_finality(&self, block: &Block, depth: u64) {
        let Some(target) = block.level().checked_sub(depth) else {
            return;
        };
        if target <= self.ledger.last_indelible_level() {
            return;
        }

        let mut cursor = Some(block.clone());
        while let Some(current) = cursor {
            if current.level() == target {
                info!("[sink] level {} is now indelible", target);
                self.ledger.advance_indelible(&current);
                self.queue.prune_blocks_below(target);
                self.prune_committed_transactions();
                return;
            }
            cursor = current.prior();
        }
    }

    fn prune_committed_transactions(&self) {
        let dropped = self
            .queue
            .retain_transactions(|tx| !self.spends_committed_serial(tx));
        if dropped > 0 {
            debug!(
                "[sink] dropped {} queued transactions with committed serial numbers",
                dropped
            );
        }
    }

    fn spends_committed_serial(&self, tx: &SharedBuffer) -> bool {
        let Ok(object) = TxObject::decode(tx.as_slice()) else {
            return false;
        };
        let Ok(mut parsed) = parse_reference_tx(object.body) else {
            return false;
        };
        self.ledger.derive_pseudo_serials(&mut parsed);
        let spends = parsed
            .serials()
            .any(|serial| self.ledger.is_committed(serial));
        spends
    }
}

impl BlockSink for ChainSink {
    fn submit_finished_block(
        &self,
        block: &Block,
        serials: &TempSerials,
        is_valid: bool,
        is_deliverable: bool,
    ) -> Result<()> {
        if is_valid && block.oid().is_none() {
            return Err(WitnessError::Sink(format!(
                "valid block at level {} has no object id",
                block.level()
            )));
        }
        if let Some(aux) = block.aux() {
            if aux.announce_time() == 0 {
                aux.set_announce_time(self.clock.now_ms());
            }
        }

        self.record(SubmittedBlock {
            block: block.clone(),
            serial_count: serials.len(),
            is_valid,
            is_deliverable,
        });

        if !is_valid {
            debug!(
                "[sink] withholding invalid block level {} witness {}",
                block.level(),
                block.witness()
            );
            return Ok(());
        }

        self.queue.push_block(block);
        if let Some(depth) = self.finality_depth {
            self.advance_finality(block, depth);
        }
        Ok(())
    }
}
