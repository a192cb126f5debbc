//! Error types for shared buffers

use thiserror::Error;

/// Result type alias for buffer operations
pub type Result<T> = std::result::Result<T, BufferError>;

/// Errors that can occur when creating or decorating a buffer
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// Requested size cannot be described by a memory layout
    #[error("Buffer size {size} is too large")]
    SizeOverflow {
        /// Requested data size
        size: usize,
    },

    /// The global allocator returned no memory
    #[error("Allocation of {size} bytes failed")]
    AllocationFailed {
        /// Requested data size
        size: usize,
    },

    /// Operation needs storage but the handle is null
    #[error("Buffer handle is null")]
    NullHandle,

    /// An auxiliary record is already hosted by this buffer
    #[error("Auxiliary record already attached")]
    AuxAlreadyAttached,
}
