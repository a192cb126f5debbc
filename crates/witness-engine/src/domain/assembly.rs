//! Scratch buffer a witness assembles its next block body into

use shared_buffer::{BufferError, SharedBuffer};

use super::wire::ENTRY_HEADER_SIZE;

/// Result of offering an entry to the assembler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Entry written; the offset advanced by `entry_size`
    Appended {
        /// Bytes used including the entry header
        entry_size: usize,
    },
    /// Entry skipped; it would overrun the scratch capacity
    DoesNotFit {
        /// Bytes the entry would need
        entry_size: usize,
        /// Bytes still free
        remaining: usize,
    },
}

/// Body entries written so far for the block under construction.
///
/// Owned by a single production thread; the scratch buffer is never shared.
#[derive(Debug)]
pub struct BlockAssembler {
    scratch: SharedBuffer,
    offset: usize,
    tx_count: u32,
}

impl BlockAssembler {
    /// Allocate a scratch buffer of `capacity` bytes
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        Ok(Self {
            scratch: SharedBuffer::allocate(capacity)?,
            offset: 0,
            tx_count: 0,
        })
    }

    /// Discard the body, keeping the allocation
    pub fn reset(&mut self) {
        self.offset = 0;
        self.tx_count = 0;
    }

    /// Scratch capacity
    pub fn capacity(&self) -> usize {
        self.scratch.size()
    }

    /// Bytes written
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes still free
    pub fn remaining(&self) -> usize {
        self.capacity().saturating_sub(self.offset)
    }

    /// Entries written
    pub fn tx_count(&self) -> u32 {
        self.tx_count
    }

    /// True before the first entry
    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    /// Check whether a body of `body_len` bytes would fit
    pub fn fits(&self, body_len: usize) -> bool {
        body_len + ENTRY_HEADER_SIZE <= self.remaining()
    }

    /// Append `size | tag | body`, or report that it does not fit
    pub fn append(&mut self, tag: u32, body: &[u8]) -> Option<AppendOutcome> {
        let entry_size = body.len() + ENTRY_HEADER_SIZE;
        let remaining = self.remaining();
        if entry_size > remaining {
            return Some(AppendOutcome::DoesNotFit {
                entry_size,
                remaining,
            });
        }

        let start = self.offset;
        let bytes = self.scratch.get_mut()?;
        bytes[start..start + 4].copy_from_slice(&(entry_size as u32).to_le_bytes());
        bytes[start + 4..start + 8].copy_from_slice(&tag.to_le_bytes());
        bytes[start + ENTRY_HEADER_SIZE..start + entry_size].copy_from_slice(body);

        self.offset += entry_size;
        self.tx_count += 1;
        Some(AppendOutcome::Appended { entry_size })
    }

    /// The body written so far
    pub fn body(&self) -> &[u8] {
        &self.scratch.as_slice()[..self.offset]
    }
}
