//! Whole-image checksum accumulator.
//!
//! Every sector written in ascending address order is fed to one
//! incremental state per enabled algorithm. Writing a sector at or before
//! a previously fed address (a "rewind", once address 0 has been seen)
//! permanently discards the whole-image state for the session; per-sector
//! deduplication hashing is unaffected.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

use crate::block::CRC64;
use crate::error::{ImageError, Result};

pub const CHECKSUM_MAGIC: u32 = 0x4D53_4B43; // "CKSM"

/// Whole-image digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChecksumAlgorithm {
    Crc64 = 0,
    Md5 = 1,
    Sha1 = 2,
    Sha256 = 3,
}

impl ChecksumAlgorithm {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ChecksumAlgorithm::Crc64),
            1 => Some(ChecksumAlgorithm::Md5),
            2 => Some(ChecksumAlgorithm::Sha1),
            3 => Some(ChecksumAlgorithm::Sha256),
            _ => None,
        }
    }
}

/// One finalized digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumEntry {
    pub algorithm: ChecksumAlgorithm,
    pub digest: Vec<u8>,
}

impl ChecksumEntry {
    pub fn hex(&self) -> String {
        hex::encode(&self.digest)
    }
}

/// Serialize a checksum block: magic, entry count, then
/// (algorithm, digest length, digest bytes) triples.
pub fn write_checksum_block<W: Write>(mut writer: W, entries: &[ChecksumEntry]) -> Result<()> {
    writer.write_u32::<LittleEndian>(CHECKSUM_MAGIC)?;
    writer.write_u8(entries.len() as u8)?;
    for entry in entries {
        writer.write_u8(entry.algorithm as u8)?;
        writer.write_u32::<LittleEndian>(entry.digest.len() as u32)?;
        writer.write_all(&entry.digest)?;
    }
    Ok(())
}

pub fn read_checksum_block<R: Read>(mut reader: R) -> Result<Vec<ChecksumEntry>> {
    let magic = reader.read_u32::<LittleEndian>()?;
    if magic != CHECKSUM_MAGIC {
        return Err(ImageError::ChecksumMismatch {
            context: "checksum block magic",
        });
    }
    let count = reader.read_u8()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let code = reader.read_u8()?;
        let len = reader.read_u32::<LittleEndian>()?;
        let mut digest = vec![0u8; len as usize];
        reader.read_exact(&mut digest)?;
        if let Some(algorithm) = ChecksumAlgorithm::from_code(code) {
            entries.push(ChecksumEntry { algorithm, digest });
        }
        // Unknown algorithm codes are skipped, not fatal.
    }
    Ok(entries)
}

enum AlgoState {
    Crc64(crc::Digest<'static, u64>),
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl std::fmt::Debug for AlgoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AlgoState::Crc64(_) => "Crc64",
            AlgoState::Md5(_) => "Md5",
            AlgoState::Sha1(_) => "Sha1",
            AlgoState::Sha256(_) => "Sha256",
        };
        f.write_str(name)
    }
}

impl AlgoState {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Crc64 => AlgoState::Crc64(CRC64.digest()),
            ChecksumAlgorithm::Md5 => AlgoState::Md5(Md5::new()),
            ChecksumAlgorithm::Sha1 => AlgoState::Sha1(Sha1::new()),
            ChecksumAlgorithm::Sha256 => AlgoState::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            AlgoState::Crc64(d) => d.update(data),
            AlgoState::Md5(d) => d.update(data),
            AlgoState::Sha1(d) => d.update(data),
            AlgoState::Sha256(d) => d.update(data),
        }
    }

    fn finalize(self, algorithm: ChecksumAlgorithm) -> ChecksumEntry {
        let digest = match self {
            AlgoState::Crc64(d) => d.finalize().to_be_bytes().to_vec(),
            AlgoState::Md5(d) => d.finalize().to_vec(),
            AlgoState::Sha1(d) => d.finalize().to_vec(),
            AlgoState::Sha256(d) => d.finalize().to_vec(),
        };
        ChecksumEntry { algorithm, digest }
    }
}

/// Rolling whole-image hash state across the enabled algorithms.
#[derive(Debug)]
pub struct ChecksumAccumulator {
    algorithms: Vec<ChecksumAlgorithm>,
    states: Option<Vec<AlgoState>>,
    last_fed: Option<u64>,
    seen_zero: bool,
}

impl ChecksumAccumulator {
    pub fn new(algorithms: Vec<ChecksumAlgorithm>) -> Self {
        let states = if algorithms.is_empty() {
            None
        } else {
            Some(algorithms.iter().map(|&a| AlgoState::new(a)).collect())
        };
        Self {
            algorithms,
            states,
            last_fed: None,
            seen_zero: false,
        }
    }

    /// An accumulator that never produces digests (append mode).
    pub fn disabled() -> Self {
        Self {
            algorithms: Vec::new(),
            states: None,
            last_fed: None,
            seen_zero: false,
        }
    }

    pub fn is_live(&self) -> bool {
        self.states.is_some()
    }

    /// Feed one sector. Detects rewinds and invalidates permanently.
    pub fn feed(&mut self, address: u64, data: &[u8]) {
        if self.states.is_none() {
            return;
        }
        if address == 0 {
            self.seen_zero = true;
        }
        if let Some(last) = self.last_fed {
            if address <= last && self.seen_zero {
                tracing::debug!(
                    address,
                    last,
                    "sector rewind detected, whole-image hashing disabled"
                );
                self.states = None;
                return;
            }
        }
        self.last_fed = Some(address);
        if let Some(states) = self.states.as_mut() {
            for state in states {
                state.update(data);
            }
        }
    }

    /// Finalize every surviving algorithm. Empty after a rewind.
    pub fn finalize(self) -> Vec<ChecksumEntry> {
        match self.states {
            Some(states) => states
                .into_iter()
                .zip(self.algorithms)
                .map(|(state, algorithm)| state.finalize(algorithm))
                .collect(),
            None => Vec::new(),
        }
    }
}
