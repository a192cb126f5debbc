//! State owned by one production thread

use rand::Rng;
use shared_buffer::SharedBuffer;

use super::serials::{ConflictKind, TempSerials};
use super::WitnessIndex;

/// Stamp that invalidates cached block scores.
///
/// Zero is reserved for "never scored"; advancing wraps past it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ScoreGeneration(u32);

impl ScoreGeneration {
    /// Following stamp, skipping the unset value
    pub fn next(self) -> Self {
        match self.0.wrapping_add(1) {
            0 => Self(1),
            n => Self(n),
        }
    }

    /// Whether this stamp has never been assigned
    pub fn is_unset(self) -> bool {
        self.0 == 0
    }
}

/// Misbehavior chosen for the block under construction (test identities only)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Misbehavior {
    /// Sign regardless of rotation order
    pub ignore_order: bool,
    /// Serial conflict this block will try to include
    pub attempt: Option<ConflictKind>,
    /// A conflicting transaction was actually included
    pub is_double_spend: bool,
}

impl Misbehavior {
    /// Draw the misbehavior for a new block.
    ///
    /// 1/8 ignore order when `allow_ignore_order`; independently 1/8
    /// persistent, else 1/8 inter, else 1/4 intra double-spend.
    pub fn roll<R: Rng + ?Sized>(rng: &mut R, allow_ignore_order: bool) -> Self {
        let ignore_order = allow_ignore_order && rng.gen_range(0..8) == 0;
        let attempt = if rng.gen_range(0..8) == 0 {
            Some(ConflictKind::Persistent)
        } else if rng.gen_range(0..8) == 0 {
            Some(ConflictKind::Inter)
        } else if rng.gen_range(0..4) == 0 {
            Some(ConflictKind::Intra)
        } else {
            None
        };
        Self {
            ignore_order,
            attempt,
            is_double_spend: false,
        }
    }

    /// Accept `conflict` if it is the armed attempt; an attempt fires once
    pub fn accept_conflict(&mut self, conflict: ConflictKind) -> bool {
        if conflict.is_conflict() && self.attempt == Some(conflict) {
            self.attempt = None;
            self.is_double_spend = true;
            return true;
        }
        false
    }

    /// Whether the finished block must be withheld from relay
    pub fn produces_invalid_block(&self) -> bool {
        self.is_double_spend || self.ignore_order
    }
}

#[derive(Clone, Debug, Default)]
struct IdentityState {
    highest_witnessed_level: u64,
    last_indelible: SharedBuffer,
}

/// Per-thread witness state
#[derive(Debug)]
pub struct WitnessState {
    index: Option<WitnessIndex>,
    test_mal: bool,
    simulate_all: bool,
    identities: Vec<IdentityState>,
    generation: ScoreGeneration,
    reference: SharedBuffer,
    reference_maltest: bool,
    /// Misbehavior for the block under construction
    pub misbehavior: Misbehavior,
    /// When the current block was started
    pub block_start_time: u64,
    /// Queue cursor for ready transactions
    pub next_tx_seqnum: u64,
    /// Serial numbers spent by the block under construction
    pub temp_serials: TempSerials,
}

impl WitnessState {
    /// State for a thread acting as `index`, or as every index when
    /// `simulate_all` is set
    pub fn new(index: WitnessIndex, test_mal: bool, simulate_all: bool) -> Self {
        let slots = if simulate_all { crate::MAX_WITNESSES } else { 1 };
        Self {
            index: Some(index),
            test_mal,
            simulate_all,
            identities: vec![IdentityState::default(); slots],
            generation: ScoreGeneration::default(),
            reference: SharedBuffer::null(),
            reference_maltest: false,
            misbehavior: Misbehavior::default(),
            block_start_time: 0,
            next_tx_seqnum: 0,
            temp_serials: TempSerials::new(),
        }
    }

    /// Current witness index, `None` once deactivated
    pub fn index(&self) -> Option<WitnessIndex> {
        self.index
    }

    /// Whether this thread still produces blocks
    pub fn is_active(&self) -> bool {
        self.index.is_some()
    }

    /// Stop acting as a witness for the rest of the process
    pub fn deactivate(&mut self) {
        self.index = None;
    }

    /// Switch to another simulated witness
    pub fn set_index(&mut self, index: WitnessIndex) {
        if self.index.is_some() {
            self.index = Some(index);
        }
    }

    /// Whether this thread was configured as a malicious test identity
    pub fn test_mal(&self) -> bool {
        self.test_mal
    }

    /// Whether this thread rotates through every witness
    pub fn simulates_all(&self) -> bool {
        self.simulate_all
    }

    /// Whether the current identity produces deliberately invalid blocks
    pub fn is_maltest(&self) -> bool {
        match self.index {
            Some(index) => self.test_mal && !(self.simulate_all && index > 0),
            None => false,
        }
    }

    fn slot(&self) -> usize {
        match (self.simulate_all, self.index) {
            (true, Some(index)) => (index as usize).min(self.identities.len() - 1),
            _ => 0,
        }
    }

    /// Seed every identity from the ledger's last indelible block
    pub fn seed(&mut self, last_indelible: &SharedBuffer, level: u64) {
        for identity in &mut self.identities {
            identity.highest_witnessed_level = level;
            identity.last_indelible = last_indelible.clone();
        }
    }

    /// Highest level the current identity has signed or started from
    pub fn highest_witnessed_level(&self) -> u64 {
        self.identities[self.slot()].highest_witnessed_level
    }

    /// Raise the highest witnessed level; never lowers it
    pub fn record_witnessed_level(&mut self, level: u64) {
        let slot = self.slot();
        let identity = &mut self.identities[slot];
        identity.highest_witnessed_level = identity.highest_witnessed_level.max(level);
    }

    /// Last indelible block as cached for the current identity
    pub fn identity_last_indelible(&self) -> &SharedBuffer {
        &self.identities[self.slot()].last_indelible
    }

    /// Refresh the cached last indelible block of the current identity
    pub fn set_identity_last_indelible(&mut self, block: SharedBuffer) {
        let slot = self.slot();
        self.identities[slot].last_indelible = block;
    }

    /// Current score generation
    pub fn generation(&self) -> ScoreGeneration {
        self.generation
    }

    /// Advance the generation if the reference block or the malicious mode
    /// changed since the last call
    pub fn refresh_generation(&mut self, reference: &SharedBuffer, maltest: bool) -> ScoreGeneration {
        if self.generation.is_unset()
            || self.reference != *reference
            || self.reference_maltest != maltest
        {
            self.generation = self.generation.next();
            self.reference = reference.clone();
            self.reference_maltest = maltest;
        }
        self.generation
    }

    /// Reset per-block state for a new attempt on a new prior block
    pub fn start_new_block<R: Rng + ?Sized>(
        &mut self,
        now: u64,
        rng: &mut R,
        allow_ignore_order: bool,
    ) {
        self.block_start_time = now;
        self.next_tx_seqnum = 0;
        self.temp_serials.clear();
        self.misbehavior = if self.is_maltest() {
            Misbehavior::roll(rng, allow_ignore_order)
        } else {
            Misbehavior::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_generation_skips_zero() {
        let last = ScoreGeneration(u32::MAX);
        assert_eq!(last.next(), ScoreGeneration(1));
        assert!(ScoreGeneration::default().is_unset());
        assert!(!ScoreGeneration::default().next().is_unset());
    }

    #[test]
    fn test_refresh_generation_only_on_change() {
        let mut state = WitnessState::new(0, false, false);
        let a = SharedBuffer::allocate(8).unwrap();
        let b = SharedBuffer::allocate(8).unwrap();

        let first = state.refresh_generation(&a, false);
        assert!(!first.is_unset());
        assert_eq!(state.refresh_generation(&a, false), first);

        let second = state.refresh_generation(&b, false);
        assert_ne!(second, first);
        let third = state.refresh_generation(&b, true);
        assert_ne!(third, second);
    }

    #[test]
    fn test_highest_witnessed_is_monotonic() {
        let mut state = WitnessState::new(1, false, false);
        state.seed(&SharedBuffer::null(), 10);
        state.record_witnessed_level(12);
        state.record_witnessed_level(11);
        assert_eq!(state.highest_witnessed_level(), 12);
    }

    #[test]
    fn test_simulated_identities_are_separate() {
        let mut state = WitnessState::new(0, false, true);
        state.seed(&SharedBuffer::null(), 3);

        state.record_witnessed_level(7);
        state.set_index(2);
        assert_eq!(state.highest_witnessed_level(), 3);
        state.set_index(0);
        assert_eq!(state.highest_witnessed_level(), 7);
    }

    #[test]
    fn test_maltest_identity() {
        assert!(!WitnessState::new(0, false, false).is_maltest());
        assert!(WitnessState::new(3, true, false).is_maltest());

        let mut sim = WitnessState::new(0, true, true);
        assert!(sim.is_maltest());
        sim.set_index(1);
        assert!(!sim.is_maltest());

        sim.deactivate();
        assert!(!sim.is_maltest());
        sim.set_index(0);
        assert!(!sim.is_active());
    }

    #[test]
    fn test_conflict_accepted_once() {
        let mut misbehavior = Misbehavior {
            ignore_order: false,
            attempt: Some(ConflictKind::Intra),
            is_double_spend: false,
        };
        assert!(!misbehavior.accept_conflict(ConflictKind::Inter));
        assert!(misbehavior.accept_conflict(ConflictKind::Intra));
        assert!(!misbehavior.accept_conflict(ConflictKind::Intra));
        assert!(misbehavior.produces_invalid_block());
    }

    #[test]
    fn test_honest_identity_never_misbehaves() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut state = WitnessState::new(0, false, false);
        for _ in 0..100 {
            state.start_new_block(5, &mut rng, true);
            assert_eq!(state.misbehavior, Misbehavior::default());
        }
    }

    #[test]
    fn test_roll_distribution_covers_all_kinds() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut seen_ignore = false;
        let mut kinds = std::collections::HashSet::new();
        for _ in 0..2_000 {
            let roll = Misbehavior::roll(&mut rng, true);
            seen_ignore |= roll.ignore_order;
            if let Some(kind) = roll.attempt {
                kinds.insert(kind);
            }
            assert!(!Misbehavior::roll(&mut rng, false).ignore_order);
        }
        assert!(seen_ignore);
        assert_eq!(kinds.len(), 3);
    }
}
