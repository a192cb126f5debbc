//! Reference block codec: SHA-256 hashing, Ed25519 witness signatures and a
//! depth-first skip score.
//!
//! ## Skip score
//!
//! ```text
//! score = (depth above reference) << 32 | (u32::MAX - accumulated skips)
//! ```
//!
//! A longer chain always wins; among equal depths, the chain that skipped
//! fewer witnesses wins. Blocks that do not descend from the reference score
//! 0 unless order is being ignored.
//!
//! ## Transaction bodies
//!
//! ```text
//! count u16 | count × { has_serial u8 | serial or commitment [32] } | payload
//! ```

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use sha2::{Digest, Sha256};
use shared_buffer::SharedBuffer;
use tracing::warn;

use crate::domain::wire::{
    self, BlockHeader, ObjectHeader, WireError, BLOCK_BODY_OFFSET, SIGNATURE_OFFSET,
    SIGNATURE_SIZE, TAG_BLOCK,
};
use crate::domain::{
    Block, BlockAux, BlockHash, BlockchainParams, ObjectId, ParsedTx, ScoreGeneration, TxInput,
    WitnessIndex,
};
use crate::error::{Result, WitnessError};
use crate::ports::BlockCodec;

const INPUT_SIZE: usize = 1 + 32;

/// Encode a transaction body in the reference format
pub fn encode_reference_tx(inputs: &[TxInput], payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 + inputs.len() * INPUT_SIZE + payload.len());
    body.extend_from_slice(&(inputs.len() as u16).to_le_bytes());
    for input in inputs {
        match input.serial {
            Some(serial) => {
                body.push(1);
                body.extend_from_slice(&serial);
            }
            None => {
                body.push(0);
                body.extend_from_slice(&input.commitment);
            }
        }
    }
    body.extend_from_slice(payload);
    body
}

/// Parse a transaction body in the reference format
pub fn parse_reference_tx(body: &[u8]) -> std::result::Result<ParsedTx, WireError> {
    if body.len() < 2 {
        return Err(WireError::MalformedTx("missing input count"));
    }
    let count = u16::from_le_bytes([body[0], body[1]]) as usize;
    if count == 0 {
        return Err(WireError::MalformedTx("no inputs"));
    }
    let needed = 2 + count * INPUT_SIZE;
    if body.len() < needed {
        return Err(WireError::Truncated {
            needed,
            available: body.len(),
        });
    }

    let inputs = body[2..needed]
        .chunks_exact(INPUT_SIZE)
        .map(|raw| {
            let mut value = [0u8; 32];
            value.copy_from_slice(&raw[1..]);
            match raw[0] {
                0 => Ok(TxInput {
                    serial: None,
                    commitment: value,
                }),
                1 => Ok(TxInput {
                    serial: Some(value),
                    commitment: [0u8; 32],
                }),
                _ => Err(WireError::MalformedTx("bad input flag")),
            }
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(ParsedTx { inputs })
}

/// Ed25519 codec with one signing key per witness
pub struct Ed25519BlockCodec {
    keys: Vec<SigningKey>,
}

impl Ed25519BlockCodec {
    /// Random keys for `nwitnesses` witnesses
    pub fn generate(nwitnesses: u16) -> Self {
        let keys = (0..nwitnesses)
            .map(|_| SigningKey::generate(&mut rand::thread_rng()))
            .collect();
        Self { keys }
    }

    /// Deterministic keys, one per seed
    pub fn from_seeds(seeds: &[[u8; 32]]) -> Self {
        Self {
            keys: seeds.iter().map(SigningKey::from_bytes).collect(),
        }
    }

    /// Number of witness keys held
    pub fn witness_count(&self) -> usize {
        self.keys.len()
    }

    /// Signed level-0 block that anchors a chain
    pub fn root_block(
        &self,
        params: BlockchainParams,
        timestamp: u64,
        announce_time: u64,
    ) -> Result<Block> {
        let mut buffer = SharedBuffer::allocate(BLOCK_BODY_OFFSET)?;
        {
            let bytes = buffer.get_mut().ok_or(WitnessError::ScratchUnavailable)?;
            ObjectHeader {
                size: BLOCK_BODY_OFFSET as u32,
                tag: TAG_BLOCK,
            }
            .encode_into(bytes)?;
            BlockHeader {
                prior_oid: [0u8; 32],
                timestamp,
                level: 0,
                witness: 0,
                next_signing_key: [0u8; 32],
                signature: [0u8; SIGNATURE_SIZE],
            }
            .encode_into(bytes)?;
        }

        let hash = self.hash(buffer.as_slice());
        let signature = self.sign(0, &hash)?;
        wire::write_signature(
            buffer.get_mut().ok_or(WitnessError::ScratchUnavailable)?,
            &signature,
        )?;

        let block = Block::from_buffer(buffer)?;
        let aux = self
            .attach_auxiliary(block.buffer())
            .ok_or(WitnessError::MissingAuxiliary("root block aux"))?;
        aux.set_params(params);
        aux.set_hash(hash);
        aux.set_oid(self.object_id(&hash, block.buffer().as_slice()));
        aux.set_announce_time(announce_time);
        Ok(block)
    }

    fn key(&self, witness: WitnessIndex) -> Option<&SigningKey> {
        self.keys.get(witness as usize)
    }

    fn compute_score(
        &self,
        block: &Block,
        witness: Option<WitnessIndex>,
        reference: &Block,
        ignore_order: bool,
    ) -> u64 {
        let reference_level = reference.level();
        let mut skips = 0u64;
        let mut descends = false;

        let mut cursor = Some(block.clone());
        while let Some(current) = cursor {
            if current == *reference {
                descends = true;
                break;
            }
            if current.level() <= reference_level {
                break;
            }
            skips += current.aux().map_or(0, |aux| aux.skip() as u64);
            cursor = current.prior();
        }

        if !descends && !ignore_order {
            return 0;
        }

        let mut depth = block.level().saturating_sub(reference_level);
        if let Some(witness) = witness {
            let nwitnesses = block.params().map_or(0, |p| p.nwitnesses);
            depth += 1;
            skips += self.rotation_skip(block.witness(), witness, nwitnesses) as u64;
        }

        (depth << 32) | (u32::MAX as u64 - skips.min(u32::MAX as u64))
    }
}

impl BlockCodec for Ed25519BlockCodec {
    fn parse_transaction(&self, body: &[u8]) -> std::result::Result<ParsedTx, WireError> {
        parse_reference_tx(body)
    }

    fn skip_score(
        &self,
        block: &Block,
        witness: Option<WitnessIndex>,
        reference: &Block,
        generation: ScoreGeneration,
        ignore_order: bool,
    ) -> u64 {
        let Some(aux) = block.aux() else {
            return 0;
        };
        if let Some(score) = aux.cached_score(generation, witness, ignore_order) {
            return score;
        }
        let score = self.compute_score(block, witness, reference, ignore_order);
        aux.store_score(generation, witness, ignore_order, score);
        score
    }

    fn rotation_skip(&self, prior_witness: WitnessIndex, witness: WitnessIndex, nwitnesses: u16) -> u32 {
        if nwitnesses == 0 {
            return 0;
        }
        let n = nwitnesses as u32;
        let prior = prior_witness as u32 % n;
        let this = witness as u32 % n;
        (this + n - prior - 1) % n
    }

    fn bad_signature_order(&self, block: &Block, witness: Option<WitnessIndex>) -> bool {
        let Some(params) = block.params() else {
            return false;
        };
        let window = params
            .nwitnesses
            .saturating_sub(params.maxmal)
            .saturating_sub(1) as usize;

        let (signer, mut cursor) = match witness {
            Some(witness) => (witness, Some(block.clone())),
            None => (block.witness(), block.prior()),
        };
        for _ in 0..window {
            let Some(current) = cursor else {
                break;
            };
            if current.witness() == signer {
                return true;
            }
            cursor = current.prior();
        }
        false
    }

    fn attach_auxiliary<'a>(&self, block: &'a SharedBuffer) -> Option<&'a BlockAux> {
        if block.aux::<BlockAux>().is_some() {
            return block.aux::<BlockAux>();
        }
        block.attach_aux(BlockAux::new()).ok()
    }

    fn link_to_prior(&self, block: &Block, prior: &Block) {
        let Some(aux) = block.aux() else {
            warn!("link_to_prior on block without auxiliary record");
            return;
        };
        let params = prior.params().unwrap_or(BlockchainParams {
            nwitnesses: 1,
            maxmal: 0,
        });
        aux.set_prior(prior.buffer().clone());
        aux.set_params(params);
        aux.set_skip(self.rotation_skip(prior.witness(), block.witness(), params.nwitnesses));
    }

    fn hash(&self, object: &[u8]) -> BlockHash {
        let mut hasher = Sha256::new();
        if object.len() >= BLOCK_BODY_OFFSET {
            hasher.update(&object[..SIGNATURE_OFFSET]);
            hasher.update([0u8; SIGNATURE_SIZE]);
            hasher.update(&object[BLOCK_BODY_OFFSET..]);
        } else {
            hasher.update(object);
        }
        hasher.finalize().into()
    }

    fn sign(&self, witness: WitnessIndex, hash: &BlockHash) -> Result<[u8; 64]> {
        let key = self
            .key(witness)
            .ok_or_else(|| WitnessError::Signing(format!("no signing key for witness {witness}")))?;
        Ok(key.sign(hash).to_bytes())
    }

    fn verify(&self, block: &Block) -> bool {
        let Some(key) = self.key(block.witness()) else {
            return false;
        };
        let hash = self.hash(block.buffer().as_slice());
        let signature = Signature::from_bytes(&block.header().signature);
        key.verifying_key().verify(&hash, &signature).is_ok()
    }

    fn object_id(&self, hash: &BlockHash, object: &[u8]) -> ObjectId {
        let mut hasher = Sha256::new();
        hasher.update(hash);
        if object.len() >= BLOCK_BODY_OFFSET {
            hasher.update(&object[SIGNATURE_OFFSET..BLOCK_BODY_OFFSET]);
        }
        hasher.finalize().into()
    }
}
