//! # Witness Engine
//!
//! Block production for a permissioned blockchain whose blocks are signed by
//! a fixed set of witnesses taking turns.
//!
//! ## Purpose
//!
//! Each local witness identity runs a dedicated production thread that:
//! - scores the candidate blocks it could extend against the last indelible
//!   block and picks the strongest one it may legally sign after
//! - waits for its turn in the rotation, collecting transactions meanwhile
//! - rejects transactions whose serial numbers are already spent, in history,
//!   on the chain being extended, or in the block itself
//! - finalizes the block (hash, sign, self-verify) and hands it downstream
//!
//! ## Architecture Layers
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │  Adapters (Outer)                                   │
//! │  - InMemoryLedger, InMemoryCandidateQueue           │
//! │  - Ed25519BlockCodec, ChainSink, SystemClock        │
//! └─────────────────────────────────────────────────────┘
//!                         │
//! ┌─────────────────────────────────────────────────────┐
//! │  Ports (Middle)                                     │
//! │  - Inbound: WitnessProducer                         │
//! │  - Outbound: Ledger, CandidateQueue, BlockCodec,    │
//! │    BlockSink, Clock                                 │
//! └─────────────────────────────────────────────────────┘
//!                         │
//! ┌─────────────────────────────────────────────────────┐
//! │  Domain (Inner - Pure Logic)                        │
//! │  - Wire layout, Block + BlockAux                    │
//! │  - ProductionWindow, BlockAssembler, TempSerials    │
//! │  - WitnessState                                     │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Critical Invariants
//!
//! 1. **Level**: block.level = prior.level + 1
//! 2. **Timestamp Monotonicity**: block.timestamp ≥ prior.timestamp
//! 3. **No Equivocation**: a witness never builds below its highest
//!    witnessed level
//! 4. **No Double Spend**: no two transactions in a block share a serial
//!    number
//! 5. **Rotation Timing**: never finalize before the window opens
//! 6. **Self Verification**: a block that fails its own signature check
//!    disables the identity
//!
//! ## Usage Example
//!
//! ```rust,ignore
//! let work = WorkBroadcast::new();
//! let engine = WitnessEngine::new(deps, WitnessConfig::single(0))?;
//! engine.start()?;
//! // ...
//! engine.shutdown();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod ports;
pub mod service;
pub mod work;

pub use config::{TestModes, WitnessConfig, WitnessIdentity};
pub use domain::{Block, BlockAux, BlockchainParams, ConflictKind, WitnessIndex};
pub use error::{Result, TxRejection, WitnessError};
pub use metrics::WitnessMetrics;
pub use ports::{ProducerState, WitnessProducer, WitnessStatus};
pub use service::{EngineDependencies, WitnessEngine};
pub use work::{ShutdownToken, WorkBroadcast, WorkKind};

/// Default rotation slot (10 seconds)
pub const DEFAULT_BLOCK_TIME_MS: u64 = 10_000;

/// Default minimum work time (1 second)
pub const DEFAULT_BLOCK_MIN_WORK_MS: u64 = 1_000;

/// Default spacing when the chain has nothing pending (20 seconds)
pub const DEFAULT_BLOCK_MAX_TIME_MS: u64 = 20_000;

/// Largest serialized block
pub const BLOCK_MAX_SIZE: usize = 256 * 1024;

/// Scratch body capacity in small-buffer test mode
pub const SMALL_SCRATCH_CAPACITY: usize = 2 * 1024;

/// Transactions fetched per batch
pub const TX_BATCH_SIZE: usize = 100;

/// Transactions fetched per batch in small-buffer test mode
pub const SMALL_TX_BATCH_SIZE: usize = 5;

/// Largest supported witness set
pub const MAX_WITNESSES: usize = 64;

/// Consecutive failures before a witness is reported stuck
pub const STUCK_FAILURE_THRESHOLD: u32 = 200;

/// Poll interval while waiting for the first indelible block
pub const INDELIBLE_POLL_MS: u64 = 1_000;

/// Pause after a failed attempt
pub const FAILURE_BACKOFF_MS: u64 = 50;
