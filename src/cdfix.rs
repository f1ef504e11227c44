//! CD fix tables and their deduplicated side stores.
//!
//! One `u32` entry per sector. Sentinels occupy the top of the value
//! space; everything between 1 and `MODE2_VERBATIM - 1` is a 1-based
//! pointer into the side store of raw anomalous fragments (16 bytes per
//! prefix entry, 288 bytes per suffix entry). Pointers are assigned
//! monotonically the first time a fragment is seen; an identical fragment
//! reuses its slot.

use std::collections::HashMap;

use crate::error::{ImageError, Result};

/// Sector was never written.
pub const NOT_DUMPED: u32 = 0;
/// Content is algorithmically correct and re-derivable; nothing stored.
pub const CORRECT: u32 = u32::MAX;
/// Mode 2 Form 1 verified: 2048-byte payload kept, EDC/parity re-derivable.
pub const MODE2_FORM1_OK: u32 = u32::MAX - 1;
/// Mode 2 Form 2 with matching EDC: 2324-byte payload kept.
pub const MODE2_FORM2_OK: u32 = u32::MAX - 2;
/// Mode 2 Form 2 whose stored EDC field is zero: 2324 bytes kept.
pub const MODE2_FORM2_NO_CRC: u32 = u32::MAX - 3;
/// Mode 2 payload that verified as nothing: full 2328 bytes kept.
pub const MODE2_VERBATIM: u32 = u32::MAX - 4;

const FIRST_SENTINEL: u32 = MODE2_VERBATIM;

/// One fix table plus its fragment side store.
#[derive(Debug)]
pub struct CdFixStore {
    table: Vec<u32>,
    store: Vec<u8>,
    fragment_size: usize,
    seen: HashMap<[u8; 32], u32>,
}

impl CdFixStore {
    pub fn new(sector_count: u64, fragment_size: usize) -> Self {
        Self {
            table: vec![NOT_DUMPED; sector_count as usize],
            store: Vec::new(),
            fragment_size,
            seen: HashMap::new(),
        }
    }

    /// Rebuild a store from its persisted table and fragment bytes,
    /// re-keying the dedup map from the fragments themselves.
    pub fn from_parts(table: Vec<u32>, store: Vec<u8>, fragment_size: usize) -> Result<Self> {
        if store.len() % fragment_size != 0 {
            return Err(ImageError::ChecksumMismatch {
                context: "CD fix side store length",
            });
        }
        let mut seen = HashMap::new();
        for (i, fragment) in store.chunks_exact(fragment_size).enumerate() {
            seen.entry(*blake3::hash(fragment).as_bytes())
                .or_insert(i as u32 + 1);
        }
        Ok(Self {
            table,
            store,
            fragment_size,
            seen,
        })
    }

    pub fn entry(&self, address: u64) -> u32 {
        self.table[address as usize]
    }

    pub fn table_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.table.len() * 4);
        for &entry in &self.table {
            out.extend_from_slice(&entry.to_le_bytes());
        }
        out
    }

    pub fn store_bytes(&self) -> &[u8] {
        &self.store
    }

    pub fn fragment_count(&self) -> u32 {
        (self.store.len() / self.fragment_size) as u32
    }

    /// True once any sector has been classified.
    pub fn is_populated(&self) -> bool {
        self.table.iter().any(|&e| e != NOT_DUMPED)
    }

    /// Record a sentinel (correct / Mode 2 classification) for `address`.
    pub fn set_sentinel(&mut self, address: u64, sentinel: u32) {
        debug_assert!(sentinel >= FIRST_SENTINEL || sentinel == NOT_DUMPED);
        self.table[address as usize] = sentinel;
    }

    /// Store an anomalous fragment verbatim and point the table at it.
    /// Identical fragments share one slot.
    pub fn set_anomaly(&mut self, address: u64, fragment: &[u8]) -> Result<()> {
        if fragment.len() != self.fragment_size {
            return Err(ImageError::WrongSectorSize {
                expected: self.fragment_size,
                got: fragment.len(),
            });
        }
        let key = *blake3::hash(fragment).as_bytes();
        let next = self.fragment_count() + 1;
        let slot = *self.seen.entry(key).or_insert(next);
        if slot == next {
            self.store.extend_from_slice(fragment);
        }
        self.table[address as usize] = slot;
        Ok(())
    }

    /// Fetch a stored fragment by its 1-based table pointer.
    pub fn fragment(&self, pointer: u32) -> Option<&[u8]> {
        if pointer == NOT_DUMPED || pointer >= FIRST_SENTINEL {
            return None;
        }
        let start = (pointer as usize - 1) * self.fragment_size;
        self.store.get(start..start + self.fragment_size)
    }

    pub fn parse_table(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}
