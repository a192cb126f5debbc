//! Blocks as seen by the engine: a shared buffer plus its decoded header and
//! the auxiliary record hosted in the buffer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;
use shared_buffer::SharedBuffer;

use super::wire::{self, BlockHeader, WireError};
use super::witness_state::ScoreGeneration;
use super::{BlockHash, ObjectId, WitnessIndex};

/// Chain parameters in force at a block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockchainParams {
    /// Size of the witness set
    pub nwitnesses: u16,
    /// Number of witnesses allowed to misbehave
    pub maxmal: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct ScoreKey {
    witness: Option<WitnessIndex>,
    ignore_order: bool,
}

#[derive(Debug, Default)]
struct ScoreCache {
    generation: ScoreGeneration,
    scores: HashMap<ScoreKey, u64>,
}

/// Derived data kept alongside a block object.
///
/// Hosted inside the block's `SharedBuffer`, so it lives exactly as long as
/// the block does. Immutable fields are write-once. The prior link can be cut
/// once the prior falls below the indelible point.
#[derive(Debug, Default)]
pub struct BlockAux {
    oid: OnceLock<ObjectId>,
    hash: OnceLock<BlockHash>,
    params: OnceLock<BlockchainParams>,
    prior: Mutex<Option<SharedBuffer>>,
    announce_time: AtomicU64,
    skip: AtomicU32,
    scores: Mutex<ScoreCache>,
}

impl BlockAux {
    /// Empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Object id, once assigned
    pub fn oid(&self) -> Option<ObjectId> {
        self.oid.get().copied()
    }

    /// Assign the object id; later assignments are ignored
    pub fn set_oid(&self, oid: ObjectId) {
        let _ = self.oid.set(oid);
    }

    /// Block hash, once computed
    pub fn hash(&self) -> Option<BlockHash> {
        self.hash.get().copied()
    }

    /// Record the block hash; later assignments are ignored
    pub fn set_hash(&self, hash: BlockHash) {
        let _ = self.hash.set(hash);
    }

    /// Chain parameters, once linked
    pub fn params(&self) -> Option<BlockchainParams> {
        self.params.get().copied()
    }

    /// Record the chain parameters; later assignments are ignored
    pub fn set_params(&self, params: BlockchainParams) {
        let _ = self.params.set(params);
    }

    /// Buffer of the prior block, while linked
    pub fn prior(&self) -> Option<SharedBuffer> {
        self.prior.lock().clone()
    }

    /// Link the prior block; ignored while a link is already present
    pub fn set_prior(&self, prior: SharedBuffer) {
        let mut link = self.prior.lock();
        if link.is_none() {
            *link = Some(prior);
        }
    }

    /// Cut the prior link, returning the handle it held
    pub fn take_prior(&self) -> Option<SharedBuffer> {
        self.prior.lock().take()
    }

    /// Local monotonic time (ms) the block was announced or produced
    pub fn announce_time(&self) -> u64 {
        self.announce_time.load(Ordering::Acquire)
    }

    /// Set the announce time
    pub fn set_announce_time(&self, now_ms: u64) {
        self.announce_time.store(now_ms, Ordering::Release);
    }

    /// Rotation skip from the prior block's witness to this block's
    pub fn skip(&self) -> u32 {
        self.skip.load(Ordering::Acquire)
    }

    /// Set the rotation skip
    pub fn set_skip(&self, skip: u32) {
        self.skip.store(skip, Ordering::Release);
    }

    /// Cached score for this generation, if any
    pub fn cached_score(
        &self,
        generation: ScoreGeneration,
        witness: Option<WitnessIndex>,
        ignore_order: bool,
    ) -> Option<u64> {
        let cache = self.scores.lock();
        if cache.generation != generation {
            return None;
        }
        cache
            .scores
            .get(&ScoreKey {
                witness,
                ignore_order,
            })
            .copied()
    }

    /// Cache a score; a new generation discards older entries
    pub fn store_score(
        &self,
        generation: ScoreGeneration,
        witness: Option<WitnessIndex>,
        ignore_order: bool,
        score: u64,
    ) {
        let mut cache = self.scores.lock();
        if cache.generation != generation {
            cache.generation = generation;
            cache.scores.clear();
        }
        cache.scores.insert(
            ScoreKey {
                witness,
                ignore_order,
            },
            score,
        );
    }
}

impl Drop for BlockAux {
    // Unlink the chain one block at a time; dropping it recursively would
    // nest one release per ancestor.
    fn drop(&mut self) {
        let mut next = self.prior.get_mut().take();
        while let Some(buffer) = next {
            if buffer.ref_count() != 1 {
                break;
            }
            next = buffer.aux::<BlockAux>().and_then(BlockAux::take_prior);
        }
    }
}

/// A block object with its header decoded
#[derive(Clone, Debug)]
pub struct Block {
    buffer: SharedBuffer,
    header: BlockHeader,
}

impl Block {
    /// Decode the header of a block held in `buffer`
    pub fn from_buffer(buffer: SharedBuffer) -> Result<Self, WireError> {
        let header = BlockHeader::decode(buffer.as_slice())?;
        Ok(Self { buffer, header })
    }

    /// Underlying shared buffer
    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    /// Decoded header
    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    /// Block level
    pub fn level(&self) -> u64 {
        self.header.level
    }

    /// Block timestamp (unix seconds)
    pub fn timestamp(&self) -> u64 {
        self.header.timestamp
    }

    /// Signing witness
    pub fn witness(&self) -> WitnessIndex {
        self.header.witness
    }

    /// Serialized size
    pub fn size(&self) -> usize {
        self.buffer.size()
    }

    /// Body entries region
    pub fn body(&self) -> &[u8] {
        wire::block_body(self.buffer.as_slice()).unwrap_or(&[])
    }

    /// Auxiliary record, if attached
    pub fn aux(&self) -> Option<&BlockAux> {
        self.buffer.aux::<BlockAux>()
    }

    /// Object id from the auxiliary record
    pub fn oid(&self) -> Option<ObjectId> {
        self.aux().and_then(BlockAux::oid)
    }

    /// Chain parameters from the auxiliary record
    pub fn params(&self) -> Option<BlockchainParams> {
        self.aux().and_then(BlockAux::params)
    }

    /// Prior block, when linked
    pub fn prior(&self) -> Option<Block> {
        let prior = self.aux()?.prior()?;
        Block::from_buffer(prior).ok()
    }

    /// Short hex prefix of the object id for log lines
    pub fn short_oid(&self) -> String {
        match self.oid() {
            Some(oid) => hex::encode(&oid[..8]),
            None => "-".to_string(),
        }
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.buffer == other.buffer
    }
}

impl Eq for Block {}
