//! # Shared Buffer
//!
//! Atomically reference-counted, variably-sized byte buffers used as the
//! uniform carrier for every blockchain object kept in memory.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┬───────────────────────┐
//! │ header                                        │ data (size bytes)     │
//! │ lead guard | refcount | aux ptrs | size | aux │                       │
//! │ | trail guard                                 │                       │
//! └──────────────────────────────────────────────┴───────────────────────┘
//! ```
//!
//! A single allocation holds the header and the payload. Handles are plain
//! pointers to the header: cloning bumps the refcount, dropping decrements it,
//! and the last drop releases any hosted auxiliary record and then the
//! storage.
//!
//! ## Guarantees
//!
//! - Clone and drop are lock-free and safe from any number of threads.
//! - Storage is released exactly once, when the refcount reaches zero and the
//!   aux-pointer count is zero.
//! - The guard words are checked on every dereference and before release.
//!   A mismatch means corruption or use-after-free and panics.
//! - Equality is identity of storage, never content.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod buffer;
mod error;

pub use buffer::SharedBuffer;
pub use error::{BufferError, Result};

/// Guard word written around a live header.
pub const BUFFER_GUARD: u32 = 0x8475_8362;

/// Guard word written into a header just before its storage is released.
pub const BUFFER_FREED: u32 = 0x2847_2919;

/// Alignment of the data region.
pub const DATA_ALIGN: usize = 16;
