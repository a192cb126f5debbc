//! Serial numbers and the per-block scratch set used for double-spend checks

use std::collections::HashSet;

/// Spend-once identifier of a transaction input
pub type SerialNumber = [u8; 32];

/// Where an already-spent serial number was found
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    /// Serial number is unspent
    None,
    /// Already used by a transaction in the block being assembled
    Intra,
    /// Already used by a non-indelible block on the chain being extended
    Inter,
    /// Already committed in indelible history
    Persistent,
}

impl ConflictKind {
    /// True for every kind except `None`
    pub fn is_conflict(self) -> bool {
        self != ConflictKind::None
    }
}

/// An input of a parsed transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxInput {
    /// Explicit or derived serial number
    pub serial: Option<SerialNumber>,
    /// Commitment the pseudo serial is derived from when no serial is given
    pub commitment: [u8; 32],
}

/// The parts of a transaction the engine needs to place it in a block
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedTx {
    /// Spent inputs
    pub inputs: Vec<TxInput>,
}

impl ParsedTx {
    /// Serial numbers known for this transaction
    pub fn serials(&self) -> impl Iterator<Item = &SerialNumber> {
        self.inputs.iter().filter_map(|input| input.serial.as_ref())
    }
}

/// Serial numbers spent by the block under construction
#[derive(Clone, Debug, Default)]
pub struct TempSerials {
    set: HashSet<SerialNumber>,
}

impl TempSerials {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every serial number
    pub fn clear(&mut self) {
        self.set.clear();
    }

    /// Whether `serial` is already spent in this block
    pub fn contains(&self, serial: &SerialNumber) -> bool {
        self.set.contains(serial)
    }

    /// Insert one serial number; false if it was already present
    pub fn insert(&mut self, serial: SerialNumber) -> bool {
        self.set.insert(serial)
    }

    /// Insert all of `serials`, or none of them.
    ///
    /// Returns the first duplicate when the batch collides with itself or
    /// with the set.
    pub fn insert_all<'a>(
        &mut self,
        serials: impl IntoIterator<Item = &'a SerialNumber>,
    ) -> Result<(), SerialNumber> {
        let mut added = Vec::new();
        for serial in serials {
            if !self.set.insert(*serial) {
                for undo in &added {
                    self.set.remove(undo);
                }
                return Err(*serial);
            }
            added.push(*serial);
        }
        Ok(())
    }

    /// Number of serial numbers
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// True when no serial number has been recorded
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Iterate the serial numbers
    pub fn iter(&self) -> impl Iterator<Item = &SerialNumber> {
        self.set.iter()
    }
}
