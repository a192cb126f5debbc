//! Production window: the earliest and latest time a witness may close the
//! block it is building.
//!
//! All times are local monotonic milliseconds.

/// An announce time further than this from now is not trusted
pub const STALE_ANNOUNCE_MS: u64 = 60 * 60 * 1000;

/// Timing settings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimingParams {
    /// Spacing between consecutive witnesses
    pub slot_ms: u64,
    /// Minimum time collecting work before closing a block
    pub min_work_ms: u64,
    /// Block spacing when nothing is pending
    pub no_work_spacing_ms: u64,
    /// Random spacing in `[0, 2r)` instead of rotation spacing
    pub random_ms: Option<u64>,
}

/// Inputs sampled when a new prior block is selected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowInputs {
    /// Current time
    pub now: u64,
    /// When the prior block was announced
    pub announce_time: u64,
    /// Rotation skip from the prior's witness to ours
    pub skip: u32,
    /// When we started building this block
    pub block_start: u64,
    /// Whether the chain under the prior still carries transactions
    pub chain_has_pending: bool,
    /// Random delay drawn for the random-time test mode
    pub random_offset: u64,
}

/// Earliest and latest finalization times
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProductionWindow {
    /// Do not finalize before this
    pub min_time: u64,
    /// Absent new work, finalize by this
    pub max_time: u64,
}

impl ProductionWindow {
    /// Compute the window for a freshly selected prior block
    pub fn compute(params: &TimingParams, inputs: &WindowInputs) -> Self {
        let now = inputs.now;
        let mut min_time = now;

        let stale = inputs.announce_time > now
            || now - inputs.announce_time > STALE_ANNOUNCE_MS;
        if !stale {
            let spacing = match params.random_ms {
                Some(_) => inputs.random_offset,
                None => (inputs.skip as u64 + 1).saturating_mul(params.slot_ms),
            };
            min_time = inputs.announce_time.saturating_add(spacing);
            if min_time > now.saturating_add(STALE_ANNOUNCE_MS) {
                min_time = now;
            }
        }

        let mut max_time = min_time;
        if params.random_ms.is_none() {
            if min_time.saturating_sub(inputs.block_start) <= params.min_work_ms {
                min_time = inputs.block_start + params.min_work_ms;
            }
            max_time = min_time;
            if !inputs.chain_has_pending {
                max_time += params.no_work_spacing_ms.saturating_sub(params.slot_ms);
            }
        }

        Self {
            min_time: min_time.max(1),
            max_time: max_time.max(1),
        }
    }

    /// On the first accepted transaction, leave at least `min_work_ms` to
    /// collect more, without passing `max_time`
    pub fn push_for_first_tx(&mut self, params: &TimingParams, now: u64) {
        if params.random_ms.is_some() {
            return;
        }
        if self.min_time.saturating_sub(now) <= params.min_work_ms {
            self.min_time = now + params.min_work_ms;
        }
        if self.min_time >= self.max_time {
            self.min_time = self.max_time;
        }
        self.min_time = self.min_time.max(1);
    }

    /// Time to wait for: `min_time` once the block has content
    pub fn deadline(&self, has_body: bool) -> u64 {
        if has_body {
            self.min_time
        } else {
            self.max_time
        }
    }

    /// Whether the block may be finalized now
    pub fn reached(&self, now: u64, has_body: bool) -> bool {
        now >= self.deadline(has_body)
    }
}
