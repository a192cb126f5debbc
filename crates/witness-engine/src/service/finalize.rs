//! Turning the scratch body into a signed block and handing it downstream

use shared_buffer::SharedBuffer;
use tracing::{debug, error, info};

use super::producer::Producer;
use crate::domain::wire::{self, BlockHeader, ObjectHeader, BLOCK_BODY_OFFSET, TAG_BLOCK};
use crate::domain::Block;
use crate::error::{Result, WitnessError};
use crate::ports::RelayStatus;

impl Producer {
    /// Encode, sign and self-verify a block on top of `prior`.
    ///
    /// A block that fails its own verification deactivates this identity.
    pub(super) fn finish_new_block(&mut self, prior: &Block) -> Result<Block> {
        let index = self.state.index().ok_or(WitnessError::Inactive)?;
        let params = prior
            .params()
            .ok_or(WitnessError::MissingAuxiliary("prior blockchain params"))?;
        if index >= params.nwitnesses {
            info!(
                "[witness {}] skipping block, prior witness set has {} members",
                index, params.nwitnesses
            );
            return Err(WitnessError::WitnessSetShrunk {
                index,
                nwitnesses: params.nwitnesses,
            });
        }
        let prior_oid = prior
            .oid()
            .ok_or(WitnessError::MissingAuxiliary("prior object id"))?;

        let body = self.assembler.body();
        let size = BLOCK_BODY_OFFSET + body.len();
        if size > crate::BLOCK_MAX_SIZE {
            return Err(WitnessError::BuildOverflow {
                offset: size,
                capacity: crate::BLOCK_MAX_SIZE,
            });
        }

        let next_signing_key = if self.config.rotate_signing_keys {
            self.deps.codec.rotate_signing_key(index).unwrap_or_default()
        } else {
            [0u8; 32]
        };

        let mut buffer = SharedBuffer::allocate(size)?;
        {
            let bytes = buffer.get_mut().ok_or(WitnessError::ScratchUnavailable)?;
            ObjectHeader {
                size: size as u32,
                tag: TAG_BLOCK,
            }
            .encode_into(bytes)?;
            BlockHeader {
                prior_oid,
                timestamp: self.deps.clock.unix_time().max(prior.timestamp()),
                level: prior.level() + 1,
                witness: index,
                next_signing_key,
                signature: [0u8; 64],
            }
            .encode_into(bytes)?;
            bytes[BLOCK_BODY_OFFSET..].copy_from_slice(body);
        }

        let hash = self.deps.codec.hash(buffer.as_slice());
        let signature = self.deps.codec.sign(index, &hash)?;
        let bytes = buffer.get_mut().ok_or(WitnessError::ScratchUnavailable)?;
        wire::write_signature(bytes, &signature)?;

        let block = Block::from_buffer(buffer)?;
        let aux = self
            .deps
            .codec
            .attach_auxiliary(block.buffer())
            .ok_or(WitnessError::MissingAuxiliary("block auxiliary record"))?;
        aux.set_hash(hash);
        self.deps.codec.link_to_prior(&block, prior);

        if !self.deps.codec.verify(&block) {
            error!(
                "[witness {}] verify own signature failed, this identity stops acting as a witness",
                index
            );
            self.state.deactivate();
            return Err(WitnessError::SelfVerificationFailed { index });
        }

        aux.set_oid(self.deps.codec.object_id(&hash, block.buffer().as_slice()));
        aux.set_announce_time(self.deps.clock.now_ms());

        self.deps
            .ledger
            .persist_block_serials(&block, block.level(), &self.state.temp_serials)?;

        info!(
            "[witness {}] built block level {} skip {} size {} txs {} oid {} prior {}",
            index,
            block.level(),
            aux.skip(),
            block.size(),
            self.assembler.tx_count(),
            block.short_oid(),
            prior.short_oid()
        );
        if self.state.misbehavior.is_double_spend {
            info!(
                "[witness {}] built double-spend test block level {} oid {}",
                index,
                block.level(),
                block.short_oid()
            );
        }
        Ok(block)
    }

    /// Record a finished block and pass it to the sink
    pub(super) fn hand_off(&mut self, block: Block) -> Result<()> {
        if self.state.misbehavior.ignore_order {
            self.state.misbehavior.ignore_order =
                self.deps.codec.bad_signature_order(&block, None);
        }

        let misbehavior = self.state.misbehavior;
        let is_valid = !misbehavior.produces_invalid_block();
        if is_valid {
            self.state.record_witnessed_level(block.level());
        } else {
            debug!(
                "[witness {}] test block level {} double-spend {} bad order {} is withheld",
                self.wid(),
                block.level(),
                misbehavior.is_double_spend,
                misbehavior.ignore_order
            );
        }

        if let Some(oid) = block.oid() {
            self.deps
                .queue
                .insert_relay_record(&oid, RelayStatus::Downloaded);
        }
        self.deps
            .sink
            .submit_finished_block(&block, &self.state.temp_serials, is_valid, is_valid)?;

        self.metrics
            .record_block_produced(self.assembler.tx_count(), block.size());
        if !is_valid {
            self.metrics
                .record_test_block(misbehavior.is_double_spend, misbehavior.ignore_order);
        }

        let mut status = self.status.write();
        status.blocks_produced += 1;
        status.last_level = Some(block.level());
        Ok(())
    }
}
