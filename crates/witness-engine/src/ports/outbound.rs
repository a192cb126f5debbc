//! Outbound ports (driven side - SPI)
//!
//! Everything the engine needs from the rest of the node. All calls are
//! synchronous; implementations are shared between production threads.

use shared_buffer::SharedBuffer;

use crate::domain::{
    Block, BlockAux, BlockHash, ConflictKind, ObjectId, ParsedTx, ScoreGeneration, SerialNumber,
    TempSerials, WireError, WitnessIndex,
};
use crate::error::Result;

/// Persistent and in-flight chain state
pub trait Ledger: Send + Sync {
    /// Latest block that can no longer be reorganized (null before startup)
    fn last_indelible_block(&self) -> SharedBuffer;

    /// Level of the last indelible block
    fn last_indelible_level(&self) -> u64;

    /// Whether the ledger hit an unrecoverable error
    fn has_fatal_error(&self) -> bool;

    /// Classify `serial` against indelible history, the chain ending at
    /// `prior`, and the block under construction.
    ///
    /// `excluded` is the transaction being placed; its own record does not
    /// count as a persistent conflict.
    fn check_serial_number(
        &self,
        prior: &Block,
        scratch: &TempSerials,
        excluded: Option<&SharedBuffer>,
        serial: &SerialNumber,
    ) -> ConflictKind;

    /// Fill in serial numbers for inputs that carry none
    fn derive_pseudo_serials(&self, tx: &mut ParsedTx);

    /// Whether blocks above `floor_level` on the chain ending at `prior`
    /// carry transactions
    fn chain_has_pending_txs(&self, prior: &Block, floor_level: u64) -> bool;

    /// Record the serial numbers spent by a finished block
    fn persist_block_serials(&self, block: &Block, level: u64, serials: &TempSerials) -> Result<()>;
}

/// Kind of queued object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Candidate blocks
    Block,
    /// Ready transactions
    Tx,
}

/// Validation status of a queued object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueStatus {
    /// Not yet validated
    Pending,
    /// Valid and offered to the engine
    Valid,
    /// Rejected
    Invalid,
}

/// Relay state of an object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayStatus {
    /// Seen announced by a peer
    Announced,
    /// Content is held locally
    Downloaded,
}

/// Validated candidate blocks and ready transactions
pub trait CandidateQueue: Send + Sync {
    /// The `offset`-th valid object of `kind` in queue order
    fn next_valid(&self, kind: ObjectKind, offset: usize) -> Option<SharedBuffer>;

    /// Change status and score of a queued object
    fn update_valid(&self, kind: ObjectKind, oid: &ObjectId, status: QueueStatus, score: u64);

    /// Number of valid objects holding `score`
    fn count_valid_at_score(&self, kind: ObjectKind, score: u64) -> usize;

    /// Shuffle the valid objects of `kind`
    fn randomize_valid(&self, kind: ObjectKind);

    /// Reset the stored scores of `kind`
    fn clear_valid_scores(&self, kind: ObjectKind);

    /// Append up to `capacity` ready transactions queued after `*after_seqnum`
    /// to `out`, advancing the cursor. Returns the number appended.
    fn fetch_ready_transactions(
        &self,
        after_seqnum: &mut u64,
        out: &mut Vec<SharedBuffer>,
        capacity: usize,
    ) -> usize;

    /// Remember that we hold `oid`
    fn insert_relay_record(&self, oid: &ObjectId, status: RelayStatus);
}

/// Block format, scoring rules and signatures
pub trait BlockCodec: Send + Sync {
    /// Extract the inputs of a transaction body
    fn parse_transaction(&self, body: &[u8]) -> std::result::Result<ParsedTx, WireError>;

    /// Strength of `block` as a building point.
    ///
    /// With `witness`, scores a hypothetical child signed by that witness;
    /// otherwise scores the block itself. Higher is better.
    fn skip_score(
        &self,
        block: &Block,
        witness: Option<WitnessIndex>,
        reference: &Block,
        generation: ScoreGeneration,
        ignore_order: bool,
    ) -> u64;

    /// Rotation distance from `prior_witness` to `witness`
    fn rotation_skip(&self, prior_witness: WitnessIndex, witness: WitnessIndex, nwitnesses: u16) -> u32;

    /// Whether signing after `block` (or `block` itself, without `witness`)
    /// breaks the rotation order
    fn bad_signature_order(&self, block: &Block, witness: Option<WitnessIndex>) -> bool;

    /// Attach (or fetch) the auxiliary record hosted by `block`
    fn attach_auxiliary<'a>(&self, block: &'a SharedBuffer) -> Option<&'a BlockAux>;

    /// Fill the auxiliary record from the prior block
    fn link_to_prior(&self, block: &Block, prior: &Block);

    /// Fresh key to announce in the next block, if keys rotate
    fn rotate_signing_key(&self, _witness: WitnessIndex) -> Option<[u8; 32]> {
        None
    }

    /// Hash of an encoded block, signature excluded
    fn hash(&self, object: &[u8]) -> BlockHash;

    /// Sign a block hash as `witness`
    fn sign(&self, witness: WitnessIndex, hash: &BlockHash) -> Result<[u8; 64]>;

    /// Check the block's signature against its witness key
    fn verify(&self, block: &Block) -> bool;

    /// Object id of a signed block
    fn object_id(&self, hash: &BlockHash, object: &[u8]) -> ObjectId;
}

/// Downstream block insertion
pub trait BlockSink: Send + Sync {
    /// Hand over a finished block
    fn submit_finished_block(
        &self,
        block: &Block,
        serials: &TempSerials,
        is_valid: bool,
        is_deliverable: bool,
    ) -> Result<()>;
}

/// Time source
pub trait Clock: Send + Sync {
    /// Monotonic milliseconds
    fn now_ms(&self) -> u64;

    /// Wall-clock unix seconds
    fn unix_time(&self) -> u64;
}
