//! Little-endian wire layout of blocks and transactions.
//!
//! ```text
//! object header : size u32 | tag u32
//! block header  : prior_oid [32] | timestamp u64 | level u64 | witness u16 |
//!                 reserved u16 | next_signing_key [32] | signature [64]
//! block body    : repeated { size u32 | tag u32 | body }
//! ```
//!
//! `size` always counts its own 8-byte prefix. Decoding produces owned
//! structs; the buffer stays an opaque byte source.

use thiserror::Error;

use super::{ObjectId, WitnessIndex};

/// Tag of a block object
pub const TAG_BLOCK: u32 = 0x0001_0001;

/// Tag of a transaction as relayed between nodes
pub const TAG_TX_WIRE: u32 = 0x0002_0001;

/// Tag of a transaction entry inside a block body
pub const TAG_TX_BLOCK: u32 = 0x0002_0002;

/// Object header: size + tag
pub const OBJECT_HEADER_SIZE: usize = 8;

/// Per-entry prefix inside a block body
pub const ENTRY_HEADER_SIZE: usize = 8;

/// Block header following the object header
pub const BLOCK_HEADER_SIZE: usize = 32 + 8 + 8 + 2 + 2 + 32 + 64;

/// Offset of the first body entry within a block object
pub const BLOCK_BODY_OFFSET: usize = OBJECT_HEADER_SIZE + BLOCK_HEADER_SIZE;

/// Offset of the signature within a block object
pub const SIGNATURE_OFFSET: usize = BLOCK_BODY_OFFSET - SIGNATURE_SIZE;

/// Ed25519 signature length
pub const SIGNATURE_SIZE: usize = 64;

/// Errors decoding or encoding wire objects
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Not enough bytes
    #[error("Truncated object: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required
        needed: usize,
        /// Bytes present
        available: usize,
    },

    /// Tag is not the one expected here
    #[error("Unexpected tag {found:#010x}, expected {expected:#010x}")]
    UnexpectedTag {
        /// Tag required
        expected: u32,
        /// Tag present
        found: u32,
    },

    /// Declared size is inconsistent with the bytes or the layout
    #[error("Invalid declared size {declared}")]
    InvalidSize {
        /// Size from the header
        declared: usize,
    },

    /// Transaction body does not follow the expected format
    #[error("Malformed transaction: {0}")]
    MalformedTx(&'static str),
}

type WireResult<T> = std::result::Result<T, WireError>;

fn ensure_len(bytes: &[u8], needed: usize) -> WireResult<()> {
    if bytes.len() < needed {
        return Err(WireError::Truncated {
            needed,
            available: bytes.len(),
        });
    }
    Ok(())
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

fn read_array<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[at..at + N]);
    out
}

/// Size and tag prefix shared by every object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Total object size including this header
    pub size: u32,
    /// Object type tag
    pub tag: u32,
}

impl ObjectHeader {
    /// Decode and check the declared size against the available bytes
    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        ensure_len(bytes, OBJECT_HEADER_SIZE)?;
        let header = Self {
            size: read_u32(bytes, 0),
            tag: read_u32(bytes, 4),
        };
        let declared = header.size as usize;
        if declared < OBJECT_HEADER_SIZE || declared > bytes.len() {
            return Err(WireError::InvalidSize { declared });
        }
        Ok(header)
    }

    /// Encode into the first 8 bytes of `out`
    pub fn encode_into(&self, out: &mut [u8]) -> WireResult<()> {
        ensure_len(out, OBJECT_HEADER_SIZE)?;
        out[0..4].copy_from_slice(&self.size.to_le_bytes());
        out[4..8].copy_from_slice(&self.tag.to_le_bytes());
        Ok(())
    }
}

/// Decoded block header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Object id of the block this one extends
    pub prior_oid: ObjectId,
    /// Unix seconds
    pub timestamp: u64,
    /// Height above the root block
    pub level: u64,
    /// Index of the signing witness
    pub witness: WitnessIndex,
    /// Key the witness will sign its next block with (zero = unchanged)
    pub next_signing_key: [u8; 32],
    /// Signature over the block hash
    pub signature: [u8; SIGNATURE_SIZE],
}

impl BlockHeader {
    /// Decode the header of a complete block object
    pub fn decode(object: &[u8]) -> WireResult<Self> {
        let header = ObjectHeader::decode(object)?;
        if header.tag != TAG_BLOCK {
            return Err(WireError::UnexpectedTag {
                expected: TAG_BLOCK,
                found: header.tag,
            });
        }
        if (header.size as usize) < BLOCK_BODY_OFFSET {
            return Err(WireError::InvalidSize {
                declared: header.size as usize,
            });
        }

        let at = OBJECT_HEADER_SIZE;
        Ok(Self {
            prior_oid: read_array(object, at),
            timestamp: read_u64(object, at + 32),
            level: read_u64(object, at + 40),
            witness: read_u16(object, at + 48),
            next_signing_key: read_array(object, at + 52),
            signature: read_array(object, at + 84),
        })
    }

    /// Encode after the object header of `object`
    pub fn encode_into(&self, object: &mut [u8]) -> WireResult<()> {
        ensure_len(object, BLOCK_BODY_OFFSET)?;
        let at = OBJECT_HEADER_SIZE;
        object[at..at + 32].copy_from_slice(&self.prior_oid);
        object[at + 32..at + 40].copy_from_slice(&self.timestamp.to_le_bytes());
        object[at + 40..at + 48].copy_from_slice(&self.level.to_le_bytes());
        object[at + 48..at + 50].copy_from_slice(&self.witness.to_le_bytes());
        object[at + 50..at + 52].fill(0);
        object[at + 52..at + 84].copy_from_slice(&self.next_signing_key);
        object[at + 84..at + 148].copy_from_slice(&self.signature);
        Ok(())
    }
}

/// Overwrite the signature field of an encoded block
pub fn write_signature(object: &mut [u8], signature: &[u8; SIGNATURE_SIZE]) -> WireResult<()> {
    ensure_len(object, BLOCK_BODY_OFFSET)?;
    object[SIGNATURE_OFFSET..BLOCK_BODY_OFFSET].copy_from_slice(signature);
    Ok(())
}

/// Body region of an encoded block
pub fn block_body(object: &[u8]) -> WireResult<&[u8]> {
    let header = ObjectHeader::decode(object)?;
    let size = header.size as usize;
    if size < BLOCK_BODY_OFFSET {
        return Err(WireError::InvalidSize { declared: size });
    }
    Ok(&object[BLOCK_BODY_OFFSET..size])
}

/// A transaction object as offered by the candidate queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxObject<'a> {
    /// Object tag
    pub tag: u32,
    /// Bytes after the object header
    pub body: &'a [u8],
}

impl<'a> TxObject<'a> {
    /// Split a transaction object into tag and body
    pub fn decode(bytes: &'a [u8]) -> WireResult<Self> {
        let header = ObjectHeader::decode(bytes)?;
        Ok(Self {
            tag: header.tag,
            body: &bytes[OBJECT_HEADER_SIZE..header.size as usize],
        })
    }
}

/// Encode a relayable transaction object around `body`
pub fn encode_tx_object(body: &[u8]) -> Vec<u8> {
    let size = (body.len() + OBJECT_HEADER_SIZE) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&TAG_TX_WIRE.to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Iterator over the transaction entries of a block body
#[derive(Clone, Debug)]
pub struct BodyEntries<'a> {
    rest: &'a [u8],
}

impl<'a> BodyEntries<'a> {
    /// Iterate the entries of `body`
    pub fn new(body: &'a [u8]) -> Self {
        Self { rest: body }
    }
}

impl<'a> Iterator for BodyEntries<'a> {
    type Item = WireResult<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let header = match ObjectHeader::decode(self.rest) {
            Ok(header) => header,
            Err(e) => {
                self.rest = &[];
                return Some(Err(e));
            }
        };
        if header.tag != TAG_TX_BLOCK {
            self.rest = &[];
            return Some(Err(WireError::UnexpectedTag {
                expected: TAG_TX_BLOCK,
                found: header.tag,
            }));
        }
        let (entry, rest) = self.rest.split_at(header.size as usize);
        self.rest = rest;
        Some(Ok(&entry[ENTRY_HEADER_SIZE..]))
    }
}
