//! In-memory ledger: indelible serial numbers plus serial numbers spent by
//! blocks that are not yet indelible.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use shared_buffer::SharedBuffer;
use tracing::{debug, error};

use crate::domain::{Block, ConflictKind, ObjectId, ParsedTx, SerialNumber, TempSerials};
use crate::error::{Result, WitnessError};
use crate::ports::Ledger;

struct PendingSerials {
    level: u64,
    serials: HashSet<SerialNumber>,
}

#[derive(Default)]
struct LedgerState {
    last_indelible: SharedBuffer,
    last_indelible_level: u64,
    /// Committed serial number -> transaction that spent it (may be null)
    persistent: HashMap<SerialNumber, SharedBuffer>,
    /// Serial numbers spent by each non-indelible block
    pending: HashMap<ObjectId, PendingSerials>,
}

/// Ledger kept entirely in memory
#[derive(Default)]
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
    fatal: AtomicBool,
}

impl InMemoryLedger {
    /// Empty ledger without an indelible block
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger whose last indelible block is `root`
    pub fn with_root(root: &Block) -> Self {
        let ledger = Self::new();
        {
            let mut state = ledger.state.write();
            state.last_indelible = root.buffer().clone();
            state.last_indelible_level = root.level();
        }
        ledger
    }

    /// Make `block` the last indelible block, committing the serial numbers
    /// of every block between the old indelible point and `block`.
    ///
    /// Serial numbers of other blocks at or below the new level are dropped,
    /// and `block`'s link to its prior is cut so older ancestors can be freed.
    pub fn advance_indelible(&self, block: &Block) {
        let mut state = self.state.write();
        if block.level() <= state.last_indelible_level && !state.last_indelible.is_null() {
            return;
        }

        let floor = state.last_indelible_level;
        let mut cursor = Some(block.clone());
        while let Some(current) = cursor {
            if current.level() <= floor {
                break;
            }
            if let Some(pending) = current.oid().and_then(|oid| state.pending.remove(&oid)) {
                for serial in pending.serials {
                    state.persistent.entry(serial).or_default();
                }
            }
            cursor = current.prior();
        }

        let level = block.level();
        let before = state.pending.len();
        state.pending.retain(|_, pending| pending.level > level);
        if let Some(aux) = block.aux() {
            aux.take_prior();
        }

        debug!(
            "[ledger] indelible level {} -> {}, {} orphaned pending blocks dropped",
            state.last_indelible_level,
            level,
            before - state.pending.len()
        );
        state.last_indelible = block.buffer().clone();
        state.last_indelible_level = level;
    }

    /// Number of non-indelible blocks with recorded serial numbers
    pub fn pending_block_count(&self) -> usize {
        self.state.read().pending.len()
    }

    /// Commit a serial number directly, as spent by `tx`
    pub fn commit_serial(&self, serial: SerialNumber, tx: SharedBuffer) {
        self.state.write().persistent.insert(serial, tx);
    }

    /// Whether `serial` is committed
    pub fn is_committed(&self, serial: &SerialNumber) -> bool {
        self.state.read().persistent.contains_key(serial)
    }

    /// Raise the fatal error flag
    pub fn set_fatal_error(&self, reason: &str) {
        error!("[ledger] fatal error: {}", reason);
        self.fatal.store(true, Ordering::Release);
    }
}

impl Ledger for InMemoryLedger {
    fn last_indelible_block(&self) -> SharedBuffer {
        self.state.read().last_indelible.clone()
    }

    fn last_indelible_level(&self) -> u64 {
        self.state.read().last_indelible_level
    }

    fn has_fatal_error(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    fn check_serial_number(
        &self,
        prior: &Block,
        scratch: &TempSerials,
        excluded: Option<&SharedBuffer>,
        serial: &SerialNumber,
    ) -> ConflictKind {
        let state = self.state.read();

        if let Some(spender) = state.persistent.get(serial) {
            let is_excluded = excluded.is_some_and(|tx| !spender.is_null() && tx == spender);
            if !is_excluded {
                return ConflictKind::Persistent;
            }
        }

        let mut cursor = Some(prior.clone());
        while let Some(current) = cursor {
            if current.level() <= state.last_indelible_level {
                break;
            }
            let spent = current
                .oid()
                .and_then(|oid| state.pending.get(&oid))
                .is_some_and(|pending| pending.serials.contains(serial));
            if spent {
                return ConflictKind::Inter;
            }
            cursor = current.prior();
        }

        if scratch.contains(serial) {
            return ConflictKind::Intra;
        }

        ConflictKind::None
    }

    fn derive_pseudo_serials(&self, tx: &mut ParsedTx) {
        for input in tx.inputs.iter_mut().filter(|input| input.serial.is_none()) {
            let mut hasher = Sha256::new();
            hasher.update(b"pseudo-serial");
            hasher.update(input.commitment);
            input.serial = Some(hasher.finalize().into());
        }
    }

    fn chain_has_pending_txs(&self, prior: &Block, floor_level: u64) -> bool {
        let mut cursor = Some(prior.clone());
        while let Some(current) = cursor {
            if current.level() <= floor_level {
                break;
            }
            if !current.body().is_empty() {
                return true;
            }
            cursor = current.prior();
        }
        false
    }

    fn persist_block_serials(&self, block: &Block, level: u64, serials: &TempSerials) -> Result<()> {
        let oid = block
            .oid()
            .ok_or_else(|| {
                WitnessError::SerialPersistence(format!("block at level {level} has no object id"))
            })?;
        self.state.write().pending.insert(
            oid,
            PendingSerials {
                level,
                serials: serials.iter().copied().collect(),
            },
        );
        Ok(())
    }
}
