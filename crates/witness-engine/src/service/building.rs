//! Filling the scratch body with ready transactions

use shared_buffer::SharedBuffer;
use tracing::{error, trace};

use super::producer::Producer;
use crate::domain::wire::{TxObject, TAG_TX_BLOCK, TAG_TX_WIRE};
use crate::domain::{AppendOutcome, Block, ConflictKind, ProductionWindow};
use crate::error::{Result, TxRejection, WitnessError};

impl Producer {
    /// Pull ready transactions into the scratch body until new block work
    /// arrives, the queue runs dry or the window is reached
    pub(super) fn build_new_block(
        &mut self,
        prior: &Block,
        window: &mut ProductionWindow,
    ) -> Result<()> {
        let capacity = self.assembler.capacity();
        let mut batch = Vec::with_capacity(self.tx_batch);

        while !self.shutdown.is_cancelled() {
            self.notifier.set_tx_work(false);

            batch.clear();
            let fetched = self.deps.queue.fetch_ready_transactions(
                &mut self.state.next_tx_seqnum,
                &mut batch,
                self.tx_batch,
            );
            trace!("[witness {}] fetched {} ready transactions", self.wid(), fetched);
            if fetched >= self.tx_batch {
                self.notifier.set_tx_work(true);
            }

            for object in batch.drain(..) {
                let body = match self.admit_transaction(prior, &object) {
                    Ok(body) => body,
                    Err(rejection) => {
                        trace!("[witness {}] skipping transaction: {}", self.wid(), rejection);
                        self.metrics.record_tx_rejected();
                        continue;
                    }
                };

                if self.assembler.is_empty() {
                    window.push_for_first_tx(&self.timing, self.deps.clock.now_ms());
                }

                match self.assembler.append(TAG_TX_BLOCK, body) {
                    Some(AppendOutcome::Appended { entry_size }) => {
                        trace!(
                            "[witness {}] added transaction of {} bytes, offset {}",
                            self.wid(),
                            entry_size,
                            self.assembler.offset()
                        );
                    }
                    Some(AppendOutcome::DoesNotFit { .. }) => {
                        self.metrics.record_tx_rejected();
                    }
                    None => return Err(WitnessError::ScratchUnavailable),
                }
            }

            if self.notifier.has_block_work() || !self.notifier.has_tx_work() {
                break;
            }
            let now = self.deps.clock.now_ms();
            if window.reached(now, !self.assembler.is_empty()) {
                break;
            }
        }

        if self.assembler.offset() > capacity {
            error!(
                "[witness {}] scratch overflow offset {} capacity {}",
                self.wid(),
                self.assembler.offset(),
                capacity
            );
            return Err(WitnessError::BuildOverflow {
                offset: self.assembler.offset(),
                capacity,
            });
        }
        Ok(())
    }

    /// Check one queued transaction and record its serial numbers.
    ///
    /// Returns the body to append. A rejected transaction leaves the scratch
    /// serial set unchanged.
    pub(super) fn admit_transaction<'a>(
        &mut self,
        prior: &Block,
        object: &'a SharedBuffer,
    ) -> std::result::Result<&'a [u8], TxRejection> {
        let tx = TxObject::decode(object.as_slice()).map_err(TxRejection::Malformed)?;
        if tx.tag != TAG_TX_WIRE {
            error!("[witness {}] unexpected object tag {:#010x}", self.wid(), tx.tag);
            return Err(TxRejection::WrongTag { found: tx.tag });
        }

        if !self.assembler.fits(tx.body.len()) {
            return Err(TxRejection::DoesNotFit {
                entry_size: tx.body.len() + crate::domain::wire::ENTRY_HEADER_SIZE,
                remaining: self.assembler.remaining(),
            });
        }

        let mut parsed = self
            .deps
            .codec
            .parse_transaction(tx.body)
            .map_err(TxRejection::Parse)?;
        self.deps.ledger.derive_pseudo_serials(&mut parsed);

        // Test identities do not exempt the transaction's own record
        let excluded = if self.state.is_maltest() {
            None
        } else {
            Some(object)
        };

        let conflict = parsed
            .serials()
            .map(|serial| {
                self.deps.ledger.check_serial_number(
                    prior,
                    &self.state.temp_serials,
                    excluded,
                    serial,
                )
            })
            .find(|kind| kind.is_conflict());
        let accepted = match conflict {
            Some(kind) if self.state.misbehavior.accept_conflict(kind) => {
                trace!("[witness {}] accepting {:?} double-spend", self.wid(), kind);
                true
            }
            Some(kind) => return Err(TxRejection::SerialConflict(kind)),
            None => false,
        };

        if self.state.temp_serials.insert_all(parsed.serials()).is_err() {
            if !accepted && !self.state.misbehavior.accept_conflict(ConflictKind::Intra) {
                return Err(TxRejection::SerialConflict(ConflictKind::Intra));
            }
            trace!("[witness {}] accepting intra-block double-spend", self.wid());
            for serial in parsed.serials() {
                self.state.temp_serials.insert(*serial);
            }
        }

        Ok(tx.body)
    }
}
