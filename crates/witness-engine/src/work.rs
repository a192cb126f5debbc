//! New-work signalling between the rest of the node and production threads.
//!
//! Each production thread owns a [`WorkNotifier`]. Producers of blocks and
//! transactions signal through a [`WorkBroadcast`], which fans out to every
//! registered notifier. A signal only wakes a waiter that declared interest
//! in that kind of work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::ports::outbound::Clock;

/// Longest single condvar wait; shutdown is rechecked at least this often
pub const SHUTDOWN_POLL_QUANTUM_MS: u64 = 250;

/// Kind of new work
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkKind {
    /// A new candidate block arrived
    Block,
    /// New transactions are ready
    Tx,
}

/// Why a wait returned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// New block work is pending
    BlockWork,
    /// New transaction work is pending
    TxWork,
    /// The deadline passed
    DeadlineReached,
    /// Shutdown was requested
    Shutdown,
}

/// Kinds of work a waiter wants to be woken for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Interest {
    /// Wake on new blocks
    pub block: bool,
    /// Wake on new transactions
    pub tx: bool,
}

impl Interest {
    /// Only blocks
    pub const BLOCK: Self = Self {
        block: true,
        tx: false,
    };

    /// Blocks and transactions
    pub const ALL: Self = Self {
        block: true,
        tx: true,
    };

    /// Nothing; the wait ends on deadline or shutdown
    pub const NONE: Self = Self {
        block: false,
        tx: false,
    };
}

/// Shared cancellation flag
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
}

impl ShutdownToken {
    /// Fresh, not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether shutdown was requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct WorkFlags {
    have_block: bool,
    have_tx: bool,
    waiting: Interest,
}

/// Work flags and wakeup for one production thread
#[derive(Debug, Default)]
pub struct WorkNotifier {
    flags: Mutex<WorkFlags>,
    condvar: Condvar,
}

impl WorkNotifier {
    /// No work pending
    pub fn new() -> Self {
        Self::default()
    }

    /// Record new work and wake the waiter if it is interested
    pub fn notify(&self, kind: WorkKind) {
        let mut flags = self.flags.lock();
        let wake = match kind {
            WorkKind::Block => {
                flags.have_block = true;
                flags.waiting.block
            }
            WorkKind::Tx => {
                flags.have_tx = true;
                flags.waiting.tx
            }
        };
        drop(flags);
        if wake {
            self.condvar.notify_one();
        }
    }

    /// Wake the waiter unconditionally (used on shutdown)
    pub fn wake(&self) {
        let _flags = self.flags.lock();
        self.condvar.notify_all();
    }

    /// Whether new block work is pending
    pub fn has_block_work(&self) -> bool {
        self.flags.lock().have_block
    }

    /// Consume the block work flag
    pub fn reset_block_work(&self) {
        self.flags.lock().have_block = false;
    }

    /// Whether new transaction work is pending
    pub fn has_tx_work(&self) -> bool {
        self.flags.lock().have_tx
    }

    /// Set or clear the transaction work flag
    pub fn set_tx_work(&self, pending: bool) {
        self.flags.lock().have_tx = pending;
    }

    /// Block until interesting work, the deadline (`clock` milliseconds) or
    /// shutdown, whichever comes first
    pub fn wait_for(
        &self,
        interest: Interest,
        deadline: Option<u64>,
        clock: &dyn Clock,
        shutdown: &ShutdownToken,
    ) -> WaitOutcome {
        let mut flags = self.flags.lock();
        loop {
            if shutdown.is_cancelled() {
                return WaitOutcome::Shutdown;
            }
            if interest.block && flags.have_block {
                return WaitOutcome::BlockWork;
            }
            if interest.tx && flags.have_tx {
                return WaitOutcome::TxWork;
            }

            let mut timeout = SHUTDOWN_POLL_QUANTUM_MS;
            if let Some(deadline) = deadline {
                let now = clock.now_ms();
                if now >= deadline {
                    return WaitOutcome::DeadlineReached;
                }
                timeout = timeout.min(deadline - now);
            }

            flags.waiting = interest;
            self.condvar
                .wait_for(&mut flags, Duration::from_millis(timeout));
            flags.waiting = Interest::NONE;
        }
    }
}

/// Fan-out of work signals to every registered production thread
#[derive(Clone, Debug, Default)]
pub struct WorkBroadcast {
    notifiers: Arc<RwLock<Vec<Arc<WorkNotifier>>>>,
}

impl WorkBroadcast {
    /// No listeners yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener
    pub fn register(&self, notifier: Arc<WorkNotifier>) {
        self.notifiers.write().push(notifier);
    }

    /// Signal new work to every listener
    pub fn notify(&self, kind: WorkKind) {
        for notifier in self.notifiers.read().iter() {
            notifier.notify(kind);
        }
    }

    /// Wake every listener
    pub fn wake_all(&self) {
        for notifier in self.notifiers.read().iter() {
            notifier.wake();
        }
    }

    /// Number of listeners
    pub fn len(&self) -> usize {
        self.notifiers.read().len()
    }

    /// True without listeners
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
