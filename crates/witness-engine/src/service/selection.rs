//! Choosing the block to build on

use tracing::{info, trace};

use crate::domain::{Block, ScoreGeneration, WitnessIndex};
use crate::ports::{BlockCodec, CandidateQueue, ObjectKind, QueueStatus};

/// Per-attempt inputs to building-block selection
#[derive(Clone, Copy, Debug)]
pub(crate) struct SelectionCriteria {
    pub index: WitnessIndex,
    pub highest_witnessed: u64,
    pub best_own_score: u64,
    pub ignore_order: bool,
    pub build_on_random: bool,
}

/// Valid queued blocks in queue order; undecodable entries are skipped
fn queued_blocks(queue: &dyn CandidateQueue) -> impl Iterator<Item = Block> + '_ {
    (0..)
        .map_while(move |offset| queue.next_valid(ObjectKind::Block, offset))
        .filter_map(|buffer| match Block::from_buffer(buffer) {
            Ok(block) => Some(block),
            Err(e) => {
                trace!("[witness-engine] skipping undecodable queued block: {}", e);
                None
            }
        })
}

/// Best score among queued blocks this witness signed itself.
///
/// With `ignore_order` the queue's scores are reset and every computed
/// score is stored back, so selection can count duplicates.
pub(crate) fn find_best_own_score(
    queue: &dyn CandidateQueue,
    codec: &dyn BlockCodec,
    index: WitnessIndex,
    reference: &Block,
    generation: ScoreGeneration,
    ignore_order: bool,
) -> u64 {
    if ignore_order {
        queue.clear_valid_scores(ObjectKind::Block);
    }

    let mut best = 0;
    for block in queued_blocks(queue).filter(|block| block.witness() == index) {
        let score = codec.skip_score(&block, None, reference, generation, ignore_order);
        best = best.max(score);
        trace!(
            "[witness {}] own block level {} score {:#x} best {:#x}",
            index,
            block.level(),
            score,
            best
        );

        if ignore_order {
            if let Some(oid) = block.oid() {
                queue.update_valid(ObjectKind::Block, &oid, QueueStatus::Valid, score);
            }
        }
    }
    best
}

/// Strongest queued block this witness may sign after, with its score
pub(crate) fn find_best_building_block(
    queue: &dyn CandidateQueue,
    codec: &dyn BlockCodec,
    reference: &Block,
    generation: ScoreGeneration,
    criteria: &SelectionCriteria,
) -> Option<(Block, u64)> {
    let index = criteria.index;
    let ignore_order = criteria.ignore_order;

    if ignore_order || criteria.build_on_random {
        queue.randomize_valid(ObjectKind::Block);
    }

    let mut best: Option<(Block, u64)> = None;
    let mut best_score = criteria.best_own_score;

    for block in queued_blocks(queue) {
        if block.level() < criteria.highest_witnessed && !ignore_order {
            trace!(
                "[witness {}] highest witnessed level {} above candidate level {} {}",
                index,
                criteria.highest_witnessed,
                block.level(),
                block.short_oid()
            );
            continue;
        }

        if codec.bad_signature_order(&block, Some(index)) {
            if !ignore_order {
                trace!(
                    "[witness {}] bad signature order after level {} {}",
                    index,
                    block.level(),
                    block.short_oid()
                );
                continue;
            }
            info!(
                "[witness {}] ignoring bad signature order after level {} {}",
                index,
                block.level(),
                block.short_oid()
            );
        }

        let score = codec.skip_score(&block, Some(index), reference, generation, ignore_order);

        if best_score >= score && !ignore_order {
            trace!(
                "[witness {}] best score {:#x} >= {:#x} for level {} {}",
                index,
                best_score,
                score,
                block.level(),
                block.short_oid()
            );
            continue;
        }

        if ignore_order {
            let maxmal = block.params().map_or(0, |params| params.maxmal) as usize;
            let count = queue.count_valid_at_score(ObjectKind::Block, score);
            if count > maxmal {
                trace!(
                    "[witness {}] {} queued blocks already hold score {:#x}",
                    index,
                    count,
                    score
                );
                continue;
            }
        }

        best_score = score;
        best = Some((block, score));

        if ignore_order || (score != 0 && criteria.build_on_random) {
            break;
        }
    }

    match &best {
        Some((block, score)) => trace!(
            "[witness {}] building on level {} {} score {:#x}",
            index,
            block.level(),
            block.short_oid(),
            score
        ),
        None => trace!("[witness {}] found no building block", index),
    }
    best
}
