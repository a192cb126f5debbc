//! Error types for the witness engine

use shared_buffer::BufferError;
use thiserror::Error;

use crate::domain::serials::ConflictKind;
use crate::domain::wire::WireError;
use crate::domain::WitnessIndex;

/// Result type alias for witness engine operations
pub type Result<T> = std::result::Result<T, WitnessError>;

/// Errors that can end a block attempt or a production thread
#[derive(Debug, Error)]
pub enum WitnessError {
    /// Shutdown was requested while the attempt was in flight
    #[error("Shutdown requested")]
    Shutdown,

    /// The ledger reported an unrecoverable error
    #[error("Ledger fatal error")]
    LedgerFatal,

    /// The ledger has no last indelible block to score against
    #[error("No last indelible block available")]
    MissingIndelibleBlock,

    /// The scratch body grew past its capacity
    #[error("Block build overflow: offset {offset} > capacity {capacity}")]
    BuildOverflow {
        /// Bytes written into the scratch buffer
        offset: usize,
        /// Scratch buffer capacity
        capacity: usize,
    },

    /// This identity is no longer inside the prior block's witness set
    #[error("Witness {index} is not in the witness set of size {nwitnesses}")]
    WitnessSetShrunk {
        /// Local witness index
        index: WitnessIndex,
        /// Witness count recorded on the prior block
        nwitnesses: u16,
    },

    /// A block is missing its auxiliary record or one of its fields
    #[error("Missing auxiliary data: {0}")]
    MissingAuxiliary(&'static str),

    /// The scratch buffer is shared and cannot be written
    #[error("Scratch buffer is not uniquely owned")]
    ScratchUnavailable,

    /// Buffer allocation or decoration failed
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Wire encoding or decoding failed
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// Signing the block hash failed
    #[error("Signing error: {0}")]
    Signing(String),

    /// Our own freshly signed block failed verification
    #[error("Self verification failed for witness {index}")]
    SelfVerificationFailed {
        /// Local witness index that was deactivated
        index: WitnessIndex,
    },

    /// The ledger could not record the block's serial numbers
    #[error("Serial persistence error: {0}")]
    SerialPersistence(String),

    /// The downstream sink refused the block
    #[error("Block sink error: {0}")]
    Sink(String),

    /// This identity has been deactivated
    #[error("Witness identity is inactive")]
    Inactive,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Engine threads are already running
    #[error("Witness engine already started")]
    AlreadyRunning,

    /// A production thread could not be spawned
    #[error("Thread error: {0}")]
    Thread(String),
}

impl WitnessError {
    /// Check if error is recoverable (the attempt is retried)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MissingIndelibleBlock
                | Self::BuildOverflow { .. }
                | Self::WitnessSetShrunk { .. }
                | Self::MissingAuxiliary(_)
                | Self::ScratchUnavailable
                | Self::Buffer(_)
                | Self::Wire(_)
                | Self::Signing(_)
                | Self::SerialPersistence(_)
                | Self::Sink(_)
        )
    }

    /// Check if error is critical (the production thread stops)
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::Shutdown
                | Self::LedgerFatal
                | Self::SelfVerificationFailed { .. }
                | Self::Inactive
                | Self::InvalidConfig(_)
        )
    }
}

/// Why a single transaction was left out of the block being assembled
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TxRejection {
    /// The queued object is not a wire transaction
    #[error("Unexpected object tag {found:#010x}")]
    WrongTag {
        /// Tag found in the object header
        found: u32,
    },

    /// The object header is malformed
    #[error("Malformed object: {0}")]
    Malformed(WireError),

    /// The transaction does not fit in the remaining scratch space
    #[error("Transaction of {entry_size} bytes does not fit, {remaining} remaining")]
    DoesNotFit {
        /// Bytes the body entry would occupy
        entry_size: usize,
        /// Bytes left in the scratch buffer
        remaining: usize,
    },

    /// The transaction body could not be parsed
    #[error("Transaction parse error: {0}")]
    Parse(WireError),

    /// One of the transaction's serial numbers conflicts
    #[error("Serial number conflict: {0:?}")]
    SerialConflict(ConflictKind),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(WitnessError::BuildOverflow {
            offset: 10,
            capacity: 5
        }
        .is_recoverable());
        assert!(WitnessError::Sink("refused".into()).is_recoverable());
        assert!(!WitnessError::LedgerFatal.is_recoverable());

        assert!(WitnessError::LedgerFatal.is_critical());
        assert!(WitnessError::SelfVerificationFailed { index: 2 }.is_critical());
        assert!(!WitnessError::WitnessSetShrunk {
            index: 4,
            nwitnesses: 3
        }
        .is_critical());
    }

    #[test]
    fn test_error_display() {
        let err = WitnessError::WitnessSetShrunk {
            index: 4,
            nwitnesses: 3,
        };
        assert_eq!(
            err.to_string(),
            "Witness 4 is not in the witness set of size 3"
        );

        let rejection = TxRejection::DoesNotFit {
            entry_size: 2108,
            remaining: 2048,
        };
        assert!(rejection.to_string().contains("2108"));
    }
}
