//! Adapters layer (Hexagonal Architecture)
//!
//! In-process implementations of the outbound ports, used by the simulator
//! and the integration tests.

mod clock;
mod codec;
mod ledger;
mod queue;
mod sink;

pub use clock::SystemClock;
pub use codec::{encode_reference_tx, parse_reference_tx, Ed25519BlockCodec};
pub use ledger::InMemoryLedger;
pub use queue::InMemoryCandidateQueue;
pub use sink::{ChainSink, SubmittedBlock, SUBMITTED_HISTORY};
