//! In-memory candidate queue for blocks and ready transactions

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use shared_buffer::SharedBuffer;
use tracing::trace;

use crate::domain::{Block, ObjectId};
use crate::ports::{CandidateQueue, ObjectKind, QueueStatus, RelayStatus};
use crate::work::{WorkBroadcast, WorkKind};

struct BlockEntry {
    buffer: SharedBuffer,
    oid: ObjectId,
    status: QueueStatus,
    score: u64,
}

struct TxEntry {
    seqnum: u64,
    buffer: SharedBuffer,
}

#[derive(Default)]
struct TxQueue {
    entries: Vec<TxEntry>,
    next_seqnum: u64,
}

/// Candidate queue kept entirely in memory.
///
/// Pushing a block or transaction signals new work to every registered
/// production thread.
pub struct InMemoryCandidateQueue {
    blocks: Mutex<Vec<BlockEntry>>,
    txs: Mutex<TxQueue>,
    relay: Mutex<HashMap<ObjectId, RelayStatus>>,
    work: WorkBroadcast,
}

impl InMemoryCandidateQueue {
    /// Empty queue signalling through `work`
    pub fn new(work: WorkBroadcast) -> Self {
        Self {
            blocks: Mutex::new(Vec::new()),
            txs: Mutex::new(TxQueue::default()),
            relay: Mutex::new(HashMap::new()),
            work,
        }
    }

    /// Add a validated block; blocks without an object id are ignored
    pub fn push_block(&self, block: &Block) -> bool {
        let Some(oid) = block.oid() else {
            return false;
        };
        {
            let mut blocks = self.blocks.lock();
            if blocks.iter().any(|entry| entry.oid == oid) {
                return false;
            }
            blocks.push(BlockEntry {
                buffer: block.buffer().clone(),
                oid,
                status: QueueStatus::Valid,
                score: 0,
            });
        }
        trace!("[queue] block level {} oid {}", block.level(), block.short_oid());
        self.work.notify(WorkKind::Block);
        true
    }

    /// Add a ready transaction object; returns its sequence number
    pub fn push_transaction(&self, tx: SharedBuffer) -> u64 {
        let seqnum = {
            let mut txs = self.txs.lock();
            txs.next_seqnum += 1;
            let seqnum = txs.next_seqnum;
            txs.entries.push(TxEntry { seqnum, buffer: tx });
            seqnum
        };
        self.work.notify(WorkKind::Tx);
        seqnum
    }

    /// Drop every block below `level`
    pub fn prune_blocks_below(&self, level: u64) {
        self.blocks.lock().retain(|entry| {
            Block::from_buffer(entry.buffer.clone()).is_ok_and(|block| block.level() >= level)
        });
    }

    /// Keep only the transactions `keep` accepts; returns how many were dropped.
    ///
    /// Sequence numbers are not reused, so fetch cursors stay valid.
    pub fn retain_transactions(&self, mut keep: impl FnMut(&SharedBuffer) -> bool) -> usize {
        let mut txs = self.txs.lock();
        let before = txs.entries.len();
        txs.entries.retain(|entry| keep(&entry.buffer));
        before - txs.entries.len()
    }

    /// Number of queued blocks in any status
    pub fn block_count(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Number of queued transactions
    pub fn tx_count(&self) -> usize {
        self.txs.lock().entries.len()
    }

    /// Stored score of a queued block
    pub fn block_score(&self, oid: &ObjectId) -> Option<u64> {
        self.blocks
            .lock()
            .iter()
            .find(|entry| entry.oid == *oid)
            .map(|entry| entry.score)
    }

    /// Relay status recorded for `oid`
    pub fn relay_status(&self, oid: &ObjectId) -> Option<RelayStatus> {
        self.relay.lock().get(oid).copied()
    }
}

impl CandidateQueue for InMemoryCandidateQueue {
    fn next_valid(&self, kind: ObjectKind, offset: usize) -> Option<SharedBuffer> {
        match kind {
            ObjectKind::Block => self
                .blocks
                .lock()
                .iter()
                .filter(|entry| entry.status == QueueStatus::Valid)
                .nth(offset)
                .map(|entry| entry.buffer.clone()),
            ObjectKind::Tx => self
                .txs
                .lock()
                .entries
                .get(offset)
                .map(|entry| entry.buffer.clone()),
        }
    }

    fn update_valid(&self, kind: ObjectKind, oid: &ObjectId, status: QueueStatus, score: u64) {
        if kind != ObjectKind::Block {
            return;
        }
        if let Some(entry) = self.blocks.lock().iter_mut().find(|entry| entry.oid == *oid) {
            entry.status = status;
            entry.score = score;
        }
    }

    fn count_valid_at_score(&self, kind: ObjectKind, score: u64) -> usize {
        if kind != ObjectKind::Block {
            return 0;
        }
        self.blocks
            .lock()
            .iter()
            .filter(|entry| entry.status == QueueStatus::Valid && entry.score == score)
            .count()
    }

    fn randomize_valid(&self, kind: ObjectKind) {
        if kind == ObjectKind::Block {
            self.blocks.lock().shuffle(&mut rand::thread_rng());
        }
    }

    fn clear_valid_scores(&self, kind: ObjectKind) {
        if kind == ObjectKind::Block {
            for entry in self.blocks.lock().iter_mut() {
                entry.score = 0;
            }
        }
    }

    fn fetch_ready_transactions(
        &self,
        after_seqnum: &mut u64,
        out: &mut Vec<SharedBuffer>,
        capacity: usize,
    ) -> usize {
        let after = *after_seqnum;
        let txs = self.txs.lock();
        let mut fetched = 0;
        for entry in txs.entries.iter().filter(|entry| entry.seqnum > after) {
            if fetched >= capacity {
                break;
            }
            out.push(entry.buffer.clone());
            *after_seqnum = entry.seqnum;
            fetched += 1;
        }
        fetched
    }

    fn insert_relay_record(&self, oid: &ObjectId, status: RelayStatus) {
        self.relay.lock().insert(*oid, status);
    }
}
