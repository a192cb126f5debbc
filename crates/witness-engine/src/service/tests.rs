use super::producer::{Producer, ProducerContext};
use super::selection::{find_best_building_block, find_best_own_score, SelectionCriteria};
use super::*;
use crate::adapters::{
    encode_reference_tx, Ed25519BlockCodec, InMemoryCandidateQueue, InMemoryLedger, SystemClock,
};
use crate::domain::wire::{
    self, encode_tx_object, BlockHeader, ObjectHeader, WireError, BLOCK_BODY_OFFSET, TAG_BLOCK,
};
use crate::domain::{
    Block, BlockAux, BlockHash, BlockchainParams, ConflictKind, Misbehavior, ObjectId, ParsedTx,
    ProductionWindow, ScoreGeneration, TempSerials, TxInput, WitnessIndex,
};
use crate::ports::{ProducerState, RelayStatus};
use shared_buffer::SharedBuffer;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::time::{Duration, Instant};

// Mock implementations for testing

/// Ed25519 codec with scripted scores, rotation faults and verification
/// failures, keyed by block timestamp
struct ScriptedCodec {
    inner: Ed25519BlockCodec,
    scores: Mutex<HashMap<u64, u64>>,
    bad_order: Mutex<HashSet<u64>>,
    fail_verify: AtomicBool,
}

impl ScriptedCodec {
    fn new(nwitnesses: u8) -> Self {
        let seeds: Vec<[u8; 32]> = (0..nwitnesses).map(|i| [i + 1; 32]).collect();
        Self {
            inner: Ed25519BlockCodec::from_seeds(&seeds),
            scores: Mutex::new(HashMap::new()),
            bad_order: Mutex::new(HashSet::new()),
            fail_verify: AtomicBool::new(false),
        }
    }

    fn score(&self, timestamp: u64, score: u64) {
        self.scores.lock().insert(timestamp, score);
    }

    fn mark_bad_order(&self, timestamp: u64) {
        self.bad_order.lock().insert(timestamp);
    }
}

impl BlockCodec for ScriptedCodec {
    fn parse_transaction(&self, body: &[u8]) -> std::result::Result<ParsedTx, WireError> {
        self.inner.parse_transaction(body)
    }

    fn skip_score(
        &self,
        block: &Block,
        witness: Option<WitnessIndex>,
        reference: &Block,
        generation: ScoreGeneration,
        ignore_order: bool,
    ) -> u64 {
        match self.scores.lock().get(&block.timestamp()) {
            Some(score) => *score,
            None => self
                .inner
                .skip_score(block, witness, reference, generation, ignore_order),
        }
    }

    fn rotation_skip(&self, prior: WitnessIndex, witness: WitnessIndex, nwitnesses: u16) -> u32 {
        self.inner.rotation_skip(prior, witness, nwitnesses)
    }

    fn bad_signature_order(&self, block: &Block, witness: Option<WitnessIndex>) -> bool {
        self.bad_order.lock().contains(&block.timestamp())
            || self.inner.bad_signature_order(block, witness)
    }

    fn attach_auxiliary<'a>(&self, block: &'a SharedBuffer) -> Option<&'a BlockAux> {
        self.inner.attach_auxiliary(block)
    }

    fn link_to_prior(&self, block: &Block, prior: &Block) {
        self.inner.link_to_prior(block, prior)
    }

    fn hash(&self, object: &[u8]) -> BlockHash {
        self.inner.hash(object)
    }

    fn sign(&self, witness: WitnessIndex, hash: &BlockHash) -> crate::error::Result<[u8; 64]> {
        self.inner.sign(witness, hash)
    }

    fn verify(&self, block: &Block) -> bool {
        !self.fail_verify.load(Ordering::SeqCst) && self.inner.verify(block)
    }

    fn object_id(&self, hash: &BlockHash, object: &[u8]) -> ObjectId {
        self.inner.object_id(hash, object)
    }
}

struct ManualClock {
    now_ms: AtomicU64,
    unix_time: AtomicU64,
}

impl ManualClock {
    fn new(now_ms: u64, unix_time: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
            unix_time: AtomicU64::new(unix_time),
        }
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn unix_time(&self) -> u64 {
        self.unix_time.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct RecordingSink {
    blocks: Mutex<Vec<(Block, usize, bool)>>,
}

impl BlockSink for RecordingSink {
    fn submit_finished_block(
        &self,
        block: &Block,
        serials: &TempSerials,
        is_valid: bool,
        _is_deliverable: bool,
    ) -> crate::error::Result<()> {
        self.blocks
            .lock()
            .push((block.clone(), serials.len(), is_valid));
        Ok(())
    }
}

struct Harness {
    codec: Arc<ScriptedCodec>,
    ledger: Arc<InMemoryLedger>,
    queue: Arc<InMemoryCandidateQueue>,
    sink: Arc<RecordingSink>,
    clock: Arc<dyn Clock>,
    work: WorkBroadcast,
    root: Block,
}

impl Harness {
    fn new(params: BlockchainParams, root_timestamp: u64) -> Self {
        Self::with_clock(params, root_timestamp, Arc::new(ManualClock::new(10_000, 1_000)))
    }

    fn with_clock(params: BlockchainParams, root_timestamp: u64, clock: Arc<dyn Clock>) -> Self {
        let codec = Arc::new(ScriptedCodec::new(params.nwitnesses as u8));
        let root = codec.inner.root_block(params, root_timestamp, 1).unwrap();
        let work = WorkBroadcast::new();
        Self {
            ledger: Arc::new(InMemoryLedger::with_root(&root)),
            queue: Arc::new(InMemoryCandidateQueue::new(work.clone())),
            sink: Arc::new(RecordingSink::default()),
            codec,
            clock,
            work,
            root,
        }
    }

    fn deps(&self) -> EngineDependencies {
        EngineDependencies {
            ledger: self.ledger.clone(),
            queue: self.queue.clone(),
            codec: self.codec.clone(),
            sink: self.sink.clone(),
            clock: self.clock.clone(),
            work: self.work.clone(),
        }
    }

    fn producer(&self, config: WitnessConfig) -> Producer {
        let identity = config.identities[0];
        Producer::new(ProducerContext {
            deps: self.deps(),
            config: Arc::new(config),
            shutdown: ShutdownToken::new(),
            notifier: Arc::new(WorkNotifier::new()),
            status: Arc::new(RwLock::new(WitnessStatus::default())),
            metrics: Arc::new(WitnessMetrics::new()),
            identity,
            rng_seed: Some(7),
        })
        .unwrap()
    }

    /// Signed block on `prior`, queued as a valid candidate
    fn queue_child(&self, prior: &Block, witness: WitnessIndex, timestamp: u64) -> Block {
        let block = signed_child(&self.codec.inner, prior, witness, timestamp);
        assert!(self.queue.push_block(&block));
        block
    }

    fn push_tx(&self, inputs: &[TxInput], payload_len: usize) {
        let body = encode_reference_tx(inputs, &vec![0xAB; payload_len]);
        let object = SharedBuffer::from_slice(&encode_tx_object(&body)).unwrap();
        self.queue.push_transaction(object);
    }
}

fn params(nwitnesses: u16, maxmal: u16) -> BlockchainParams {
    BlockchainParams { nwitnesses, maxmal }
}

fn signed_child(
    codec: &Ed25519BlockCodec,
    prior: &Block,
    witness: WitnessIndex,
    timestamp: u64,
) -> Block {
    let mut buffer = SharedBuffer::allocate(BLOCK_BODY_OFFSET).unwrap();
    {
        let bytes = buffer.get_mut().unwrap();
        ObjectHeader {
            size: BLOCK_BODY_OFFSET as u32,
            tag: TAG_BLOCK,
        }
        .encode_into(bytes)
        .unwrap();
        BlockHeader {
            prior_oid: prior.oid().unwrap(),
            timestamp,
            level: prior.level() + 1,
            witness,
            next_signing_key: [0u8; 32],
            signature: [0u8; 64],
        }
        .encode_into(bytes)
        .unwrap();
    }
    let hash = codec.hash(buffer.as_slice());
    let signature = codec.sign(witness, &hash).unwrap();
    wire::write_signature(buffer.get_mut().unwrap(), &signature).unwrap();

    let block = Block::from_buffer(buffer).unwrap();
    let aux = codec.attach_auxiliary(block.buffer()).unwrap();
    aux.set_hash(hash);
    codec.link_to_prior(&block, prior);
    aux.set_oid(codec.object_id(&hash, block.buffer().as_slice()));
    block
}

fn input(serial: u8) -> TxInput {
    TxInput {
        serial: Some([serial; 32]),
        commitment: [0u8; 32],
    }
}

fn criteria(index: WitnessIndex) -> SelectionCriteria {
    SelectionCriteria {
        index,
        highest_witnessed: 0,
        best_own_score: 0,
        ignore_order: false,
        build_on_random: false,
    }
}

fn generation() -> ScoreGeneration {
    ScoreGeneration::default().next()
}

fn small_config(index: WitnessIndex) -> WitnessConfig {
    let mut config = WitnessConfig::single(index);
    config.test.small_buffers = true;
    config
}

// =============================================================================
// Building block selection
// =============================================================================

#[test]
fn test_selects_highest_scoring_candidate() {
    let h = Harness::new(params(3, 0), 100);
    let weak = h.queue_child(&h.root, 0, 101);
    let strong = h.queue_child(&h.root, 0, 102);
    h.codec.score(101, 5);
    h.codec.score(102, 9);

    let (best, score) = find_best_building_block(
        h.queue.as_ref(),
        h.codec.as_ref(),
        &h.root,
        generation(),
        &criteria(1),
    )
    .unwrap();

    assert_eq!(best, strong);
    assert_ne!(best, weak);
    assert_eq!(score, 9);
}

#[test]
fn test_never_builds_below_highest_witnessed_level() {
    let h = Harness::new(params(3, 0), 100);
    let candidate = h.queue_child(&h.root, 0, 101);
    h.codec.score(101, 9);

    let mut rules = criteria(1);
    rules.highest_witnessed = 2;
    assert!(find_best_building_block(
        h.queue.as_ref(),
        h.codec.as_ref(),
        &h.root,
        generation(),
        &rules
    )
    .is_none());

    rules.ignore_order = true;
    let (best, _) = find_best_building_block(
        h.queue.as_ref(),
        h.codec.as_ref(),
        &h.root,
        generation(),
        &rules,
    )
    .unwrap();
    assert_eq!(best, candidate);
}

#[test]
fn test_bad_signature_order_is_skipped() {
    let h = Harness::new(params(3, 0), 100);
    let fallback = h.queue_child(&h.root, 0, 101);
    h.queue_child(&h.root, 0, 102);
    h.codec.score(101, 5);
    h.codec.score(102, 9);
    h.codec.mark_bad_order(102);

    let (best, score) = find_best_building_block(
        h.queue.as_ref(),
        h.codec.as_ref(),
        &h.root,
        generation(),
        &criteria(1),
    )
    .unwrap();
    assert_eq!(best, fallback);
    assert_eq!(score, 5);
}

#[test]
fn test_ignore_order_takes_bad_order_candidate() {
    let h = Harness::new(params(3, 0), 100);
    let candidate = h.queue_child(&h.root, 0, 102);
    h.codec.score(102, 9);
    h.codec.mark_bad_order(102);

    let mut rules = criteria(1);
    rules.ignore_order = true;
    let (best, _) = find_best_building_block(
        h.queue.as_ref(),
        h.codec.as_ref(),
        &h.root,
        generation(),
        &rules,
    )
    .unwrap();
    assert_eq!(best, candidate);
}

#[test]
fn test_ignore_order_skips_saturated_scores() {
    let h = Harness::new(params(3, 0), 100);
    let own = h.queue_child(&h.root, 1, 101);
    h.codec.score(101, 9);

    // Own score is stored back into the queue and saturates score 9
    let best_own = find_best_own_score(
        h.queue.as_ref(),
        h.codec.as_ref(),
        1,
        &h.root,
        generation(),
        true,
    );
    assert_eq!(best_own, 9);
    assert_eq!(h.queue.block_score(&own.oid().unwrap()), Some(9));

    let mut rules = criteria(1);
    rules.ignore_order = true;
    rules.best_own_score = best_own;
    assert!(find_best_building_block(
        h.queue.as_ref(),
        h.codec.as_ref(),
        &h.root,
        generation(),
        &rules
    )
    .is_none());
}

#[test]
fn test_own_blocks_raise_the_bar() {
    let h = Harness::new(params(3, 0), 100);
    h.queue_child(&h.root, 1, 101);
    h.queue_child(&h.root, 0, 102);
    h.codec.score(101, 7);
    h.codec.score(102, 5);

    let best_own = find_best_own_score(
        h.queue.as_ref(),
        h.codec.as_ref(),
        1,
        &h.root,
        generation(),
        false,
    );
    assert_eq!(best_own, 7);

    let mut rules = criteria(1);
    rules.best_own_score = best_own;
    assert!(find_best_building_block(
        h.queue.as_ref(),
        h.codec.as_ref(),
        &h.root,
        generation(),
        &rules
    )
    .is_none());

    let better = h.queue_child(&h.root, 2, 103);
    h.codec.score(103, 9);
    let (best, _) = find_best_building_block(
        h.queue.as_ref(),
        h.codec.as_ref(),
        &h.root,
        generation(),
        &rules,
    )
    .unwrap();
    assert_eq!(best, better);
}

#[test]
fn test_build_on_random_takes_any_scoring_candidate() {
    let h = Harness::new(params(3, 0), 100);
    h.queue_child(&h.root, 0, 101);
    h.queue_child(&h.root, 0, 102);
    h.queue_child(&h.root, 0, 103);
    h.codec.score(101, 0);
    h.codec.score(102, 5);
    h.codec.score(103, 9);

    let mut rules = criteria(1);
    rules.build_on_random = true;
    for _ in 0..10 {
        let (_, score) = find_best_building_block(
            h.queue.as_ref(),
            h.codec.as_ref(),
            &h.root,
            generation(),
            &rules,
        )
        .unwrap();
        assert!(score == 5 || score == 9);
    }
}

// =============================================================================
// Body assembly
// =============================================================================

#[test]
fn test_oversized_transaction_is_skipped() {
    let h = Harness::new(params(1, 0), 100);
    // 2 + 33 + payload bytes of body
    h.push_tx(&[input(1)], 2100 - 35);
    h.push_tx(&[input(2)], 500 - 35);

    let mut producer = h.producer(small_config(0));
    let mut window = ProductionWindow::default();
    producer.build_new_block(&h.root, &mut window).unwrap();

    assert_eq!(producer.assembler.offset(), 508);
    assert_eq!(producer.assembler.tx_count(), 1);
    assert!(producer.state.temp_serials.contains(&[2u8; 32]));
    assert!(!producer.state.temp_serials.contains(&[1u8; 32]));
    assert_eq!(
        producer.metrics.transactions_rejected.load(Ordering::Relaxed),
        1
    );
}

#[test]
fn test_intra_block_double_spend_is_rejected() {
    let h = Harness::new(params(1, 0), 100);
    h.push_tx(&[input(1)], 10);
    h.push_tx(&[input(1), input(3)], 10);
    h.push_tx(&[input(4), input(4)], 10);

    let mut producer = h.producer(small_config(0));
    let mut window = ProductionWindow::default();
    producer.build_new_block(&h.root, &mut window).unwrap();

    assert_eq!(producer.assembler.tx_count(), 1);
    // Rejected transactions leave no serials behind
    assert_eq!(producer.state.temp_serials.len(), 1);
    assert!(!producer.state.misbehavior.is_double_spend);
}

#[test]
fn test_armed_double_spend_is_accepted_once() {
    let h = Harness::new(params(1, 0), 100);
    h.push_tx(&[input(1)], 10);
    h.push_tx(&[input(1)], 10);
    h.push_tx(&[input(1)], 10);

    let mut producer = h.producer(small_config(0));
    producer.state.misbehavior = Misbehavior {
        ignore_order: false,
        attempt: Some(ConflictKind::Intra),
        is_double_spend: false,
    };
    let mut window = ProductionWindow::default();
    producer.build_new_block(&h.root, &mut window).unwrap();

    assert_eq!(producer.assembler.tx_count(), 2);
    assert!(producer.state.misbehavior.is_double_spend);
    assert!(producer.state.misbehavior.produces_invalid_block());
}

#[test]
fn test_first_transaction_extends_window() {
    let h = Harness::new(params(1, 0), 100);
    h.push_tx(&[input(1)], 10);

    let mut config = small_config(0);
    config.block_min_work_ms = 1_000;
    let mut producer = h.producer(config);
    let mut window = ProductionWindow {
        min_time: 10_100,
        max_time: 30_000,
    };
    producer.build_new_block(&h.root, &mut window).unwrap();

    // Clock reads 10_000
    assert_eq!(window.min_time, 11_000);
    assert_eq!(window.max_time, 30_000);
}

#[test]
fn test_wrong_tag_is_rejected() {
    let h = Harness::new(params(1, 0), 100);
    let mut object = encode_tx_object(&encode_reference_tx(&[input(1)], b"x"));
    object[4..8].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
    h.queue
        .push_transaction(SharedBuffer::from_slice(&object).unwrap());

    let mut producer = h.producer(small_config(0));
    let buffer = SharedBuffer::from_slice(&object).unwrap();
    assert_eq!(
        producer.admit_transaction(&h.root, &buffer),
        Err(crate::error::TxRejection::WrongTag { found: 0xDEAD_BEEF })
    );
}

#[test]
fn test_persistent_conflict_is_rejected() {
    let h = Harness::new(params(1, 0), 100);
    let spender = SharedBuffer::from_slice(b"earlier spend").unwrap();
    h.ledger.commit_serial([9u8; 32], spender);
    h.push_tx(&[input(9)], 10);

    let mut producer = h.producer(small_config(0));
    let mut window = ProductionWindow::default();
    producer.build_new_block(&h.root, &mut window).unwrap();
    assert!(producer.assembler.is_empty());
}

#[test]
fn test_inter_block_conflict_is_rejected() {
    let h = Harness::new(params(1, 0), 100);
    let parent = signed_child(&h.codec.inner, &h.root, 0, 101);
    let mut spent = TempSerials::new();
    spent.insert([5u8; 32]);
    h.ledger.persist_block_serials(&parent, 1, &spent).unwrap();

    let body = encode_reference_tx(&[input(5)], b"respend");
    let tx = SharedBuffer::from_slice(&encode_tx_object(&body)).unwrap();
    let mut producer = h.producer(small_config(0));
    assert_eq!(
        producer.admit_transaction(&parent, &tx),
        Err(crate::error::TxRejection::SerialConflict(ConflictKind::Inter))
    );
    assert!(producer.state.temp_serials.is_empty());

    // The serial is only pending on the chain through `parent`
    assert!(producer.admit_transaction(&h.root, &tx).is_ok());
    assert!(producer.state.temp_serials.contains(&[5u8; 32]));
}

#[test]
fn test_armed_inter_block_conflict_is_accepted_once() {
    let h = Harness::new(params(1, 0), 100);
    let parent = signed_child(&h.codec.inner, &h.root, 0, 101);
    let mut spent = TempSerials::new();
    spent.insert([5u8; 32]);
    h.ledger.persist_block_serials(&parent, 1, &spent).unwrap();
    h.push_tx(&[input(5)], 10);
    h.push_tx(&[input(5)], 11);
    h.push_tx(&[input(6)], 10);

    let mut producer = h.producer(small_config(0));
    producer.state.misbehavior = Misbehavior {
        ignore_order: false,
        attempt: Some(ConflictKind::Inter),
        is_double_spend: false,
    };
    let mut window = ProductionWindow::default();
    producer.build_new_block(&parent, &mut window).unwrap();

    assert_eq!(producer.assembler.tx_count(), 2);
    assert!(producer.state.misbehavior.is_double_spend);
    assert_eq!(producer.state.misbehavior.attempt, None);
    assert!(producer.state.misbehavior.produces_invalid_block());
    assert_eq!(
        producer.metrics.transactions_rejected.load(Ordering::Relaxed),
        1
    );
}

// =============================================================================
// Finalization and hand-off
// =============================================================================

#[test]
fn test_shrunk_witness_set_aborts_block() {
    let h = Harness::new(params(1, 0), 100);
    let mut producer = h.producer(WitnessConfig::single(2));

    let err = producer.finish_new_block(&h.root).unwrap_err();
    assert!(matches!(
        err,
        WitnessError::WitnessSetShrunk {
            index: 2,
            nwitnesses: 1
        }
    ));
    assert!(err.is_recoverable());
    assert!(producer.state.is_active());
}

#[test]
fn test_timestamp_never_precedes_prior() {
    // Prior stamped after the clock's unix time
    let h = Harness::new(params(1, 0), 5_000);
    let mut producer = h.producer(WitnessConfig::single(0));

    let block = producer.finish_new_block(&h.root).unwrap();
    assert_eq!(block.timestamp(), 5_000);
    assert_eq!(block.level(), 1);
    assert_eq!(block.header().prior_oid, h.root.oid().unwrap());
    assert!(h.codec.verify(&block));
    assert!(block.oid().is_some());
    assert_eq!(block.aux().unwrap().announce_time(), 10_000);
}

#[test]
fn test_finished_block_carries_body() {
    let h = Harness::new(params(1, 0), 100);
    h.push_tx(&[input(1)], 40);
    h.push_tx(&[input(2)], 40);

    let mut producer = h.producer(small_config(0));
    let mut window = ProductionWindow::default();
    producer.build_new_block(&h.root, &mut window).unwrap();
    let block = producer.finish_new_block(&h.root).unwrap();

    assert_eq!(block.timestamp(), 1_000);
    assert_eq!(block.body(), producer.assembler.body());
    let entries: Vec<_> = wire::BodyEntries::new(block.body())
        .collect::<std::result::Result<_, _>>()
        .unwrap();
    assert_eq!(entries.len(), 2);
}

#[test]
fn test_self_verification_failure_deactivates_identity() {
    let h = Harness::new(params(1, 0), 100);
    h.codec.fail_verify.store(true, Ordering::SeqCst);
    let mut producer = h.producer(WitnessConfig::single(0));

    let err = producer.finish_new_block(&h.root).unwrap_err();
    assert!(matches!(err, WitnessError::SelfVerificationFailed { index: 0 }));
    assert!(err.is_critical());
    assert!(!producer.state.is_active());
    assert!(matches!(
        producer.finish_new_block(&h.root),
        Err(WitnessError::Inactive)
    ));
}

#[test]
fn test_hand_off_raises_highest_witnessed() {
    let h = Harness::new(params(1, 0), 100);
    let mut producer = h.producer(WitnessConfig::single(0));

    let block = producer.finish_new_block(&h.root).unwrap();
    let oid = block.oid().unwrap();
    producer.hand_off(block.clone()).unwrap();

    assert_eq!(producer.state.highest_witnessed_level(), 1);
    assert_eq!(h.queue.relay_status(&oid), Some(RelayStatus::Downloaded));
    let submitted = h.sink.blocks.lock();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].0, block);
    assert!(submitted[0].2);
    assert_eq!(producer.status.read().blocks_produced, 1);
    assert_eq!(producer.status.read().last_level, Some(1));
}

#[test]
fn test_double_spend_block_is_withheld() {
    let h = Harness::new(params(1, 0), 100);
    let mut producer = h.producer(WitnessConfig::single(0));
    producer.state.misbehavior.is_double_spend = true;

    let block = producer.finish_new_block(&h.root).unwrap();
    producer.hand_off(block).unwrap();

    assert_eq!(producer.state.highest_witnessed_level(), 0);
    assert!(!h.sink.blocks.lock()[0].2);
    assert_eq!(
        producer.metrics.double_spend_blocks.load(Ordering::Relaxed),
        1
    );
}

#[test]
fn test_ignore_order_cleared_when_order_holds() {
    let h = Harness::new(params(1, 0), 100);
    let mut producer = h.producer(WitnessConfig::single(0));
    producer.state.misbehavior.ignore_order = true;

    let block = producer.finish_new_block(&h.root).unwrap();
    producer.hand_off(block).unwrap();

    assert!(!producer.state.misbehavior.ignore_order);
    assert!(h.sink.blocks.lock()[0].2);
    assert_eq!(producer.state.highest_witnessed_level(), 1);
}

// =============================================================================
// Simulated identity rotation
// =============================================================================

fn simulate_all_config(ratio: u32) -> WitnessConfig {
    let mut config = small_config(0);
    config.identities[0].test_mal = true;
    config.test.simulate_all_witnesses = true;
    config.test.malicious_test_ratio = ratio;
    config
}

#[test]
fn test_rotation_favours_malicious_identity() {
    let h = Harness::new(params(3, 1), 100);
    let mut producer = h.producer(simulate_all_config(3));
    assert!(producer.state.is_maltest());

    // One honest attempt needs more than three malicious ones
    producer.rotate_simulated_identity(1, 0, 0);
    assert_eq!(producer.state.index(), Some(0));
    producer.rotate_simulated_identity(1, 3, 0);
    assert_eq!(producer.state.index(), Some(0));

    producer.rotate_simulated_identity(1, 4, 0);
    assert_eq!(producer.state.index(), Some(1));
    assert!(!producer.state.is_maltest());
    producer.rotate_simulated_identity(0, 5, 0);
    assert_eq!(producer.state.index(), Some(2));
}

#[test]
fn test_rotation_ignores_ratio_when_failing() {
    let h = Harness::new(params(3, 1), 100);
    let mut producer = h.producer(simulate_all_config(3));

    producer.rotate_simulated_identity(10, 0, 4);
    assert_eq!(producer.state.index(), Some(1));

    let mut producer = h.producer(simulate_all_config(0));
    producer.rotate_simulated_identity(10, 0, 0);
    assert_eq!(producer.state.index(), Some(1));
}

#[test]
fn test_rotation_without_malicious_budget() {
    // maxmal 0 leaves no room for a malicious witness
    let h = Harness::new(params(3, 0), 100);
    let mut producer = h.producer(simulate_all_config(3));
    producer.rotate_simulated_identity(10, 0, 0);
    assert_eq!(producer.state.index(), Some(1));
}

// =============================================================================
// Engine lifecycle
// =============================================================================

fn fast_config(index: WitnessIndex) -> WitnessConfig {
    let mut config = WitnessConfig::single(index);
    config.block_time_ms = 10;
    config.block_min_work_ms = 2;
    config.block_max_time_ms = 20;
    config.rng_seed = Some(3);
    config
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn test_engine_rejects_invalid_config() {
    let h = Harness::new(params(1, 0), 100);
    let mut config = WitnessConfig::single(0);
    config.identities.clear();
    assert!(matches!(
        WitnessEngine::new(h.deps(), config),
        Err(WitnessError::InvalidConfig(_))
    ));
}

#[test]
fn test_engine_start_twice_fails() {
    let h = Harness::with_clock(params(1, 0), 100, Arc::new(SystemClock::new()));
    let engine = WitnessEngine::new(h.deps(), fast_config(0)).unwrap();
    engine.start().unwrap();
    assert!(matches!(engine.start(), Err(WitnessError::AlreadyRunning)));
    engine.shutdown();
    assert!(!engine.is_running());
    assert!(matches!(engine.start(), Err(WitnessError::Shutdown)));
}

#[test]
fn test_engine_stops_identity_on_self_verification_failure() {
    let h = Harness::with_clock(params(1, 0), 100, Arc::new(SystemClock::new()));
    h.codec.fail_verify.store(true, Ordering::SeqCst);
    h.queue.push_block(&h.root);

    let engine = WitnessEngine::new(h.deps(), fast_config(0)).unwrap();
    engine.start().unwrap();

    let stopped = wait_until(Duration::from_secs(5), || {
        engine.status()[0].state == ProducerState::Stopped
    });
    assert!(stopped);
    assert_eq!(engine.status()[0].index, None);
    assert!(h.sink.blocks.lock().is_empty());
    engine.shutdown();
}

#[test]
fn test_engine_produces_on_root() {
    let h = Harness::with_clock(params(1, 0), 100, Arc::new(SystemClock::new()));
    h.queue.push_block(&h.root);

    let engine = WitnessEngine::new(h.deps(), fast_config(0)).unwrap();
    engine.start().unwrap();

    let produced = wait_until(Duration::from_secs(5), || !h.sink.blocks.lock().is_empty());
    engine.shutdown();

    assert!(produced);
    let blocks = h.sink.blocks.lock();
    assert_eq!(blocks[0].0.level(), 1);
    assert!(blocks[0].0.timestamp() >= h.root.timestamp());
    assert!(engine.metrics().get_blocks_produced() >= 1);
    assert_eq!(engine.status()[0].state, ProducerState::Stopped);
}

#[test]
fn test_attempt_stops_on_ledger_fatal_error() {
    let h = Harness::new(params(1, 0), 100);
    h.queue.push_block(&h.root);
    h.ledger.set_fatal_error("store unavailable");

    let mut producer = h.producer(small_config(0));
    let err = producer.attempt_new_block().unwrap_err();
    assert!(matches!(err, WitnessError::LedgerFatal));
    assert!(err.is_critical());
}

#[test]
fn test_engine_stops_on_ledger_fatal_error() {
    let h = Harness::with_clock(params(1, 0), 100, Arc::new(SystemClock::new()));
    h.queue.push_block(&h.root);
    h.ledger.set_fatal_error("store unavailable");

    let engine = WitnessEngine::new(h.deps(), fast_config(0)).unwrap();
    engine.start().unwrap();

    let stopped = wait_until(Duration::from_secs(5), || {
        engine.status()[0].state == ProducerState::Stopped
    });
    assert!(stopped);
    // The identity itself stays active
    assert_eq!(engine.status()[0].index, Some(0));
    assert!(h.sink.blocks.lock().is_empty());
    assert_eq!(engine.metrics().get_attempts_failed(), 0);
    engine.shutdown();
}
