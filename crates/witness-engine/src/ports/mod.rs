//! Hexagonal architecture ports

pub mod inbound;
pub mod outbound;

pub use inbound::{ProducerState, WitnessProducer, WitnessStatus};
pub use outbound::{
    BlockCodec, BlockSink, CandidateQueue, Clock, Ledger, ObjectKind, QueueStatus, RelayStatus,
};
