//! Domain layer: wire objects, production timing, body assembly and the
//! per-thread witness state. No I/O and no threads.

pub mod assembly;
pub mod block;
pub mod serials;
pub mod timing;
pub mod wire;
pub mod witness_state;

pub use assembly::{AppendOutcome, BlockAssembler};
pub use block::{Block, BlockAux, BlockchainParams};
pub use serials::{ConflictKind, ParsedTx, SerialNumber, TempSerials, TxInput};
pub use timing::{ProductionWindow, TimingParams, WindowInputs};
pub use wire::{BlockHeader, ObjectHeader, TxObject, WireError};
pub use witness_state::{Misbehavior, ScoreGeneration, WitnessState};

/// Position of a witness in the witness set
pub type WitnessIndex = u16;

/// 32-byte object identifier
pub type ObjectId = [u8; 32];

/// 32-byte block hash
pub type BlockHash = [u8; 32];
