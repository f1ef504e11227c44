//! Deduplication table: one locator per logical sector.
//!
//! A locator packs the containing block's file offset (shifted left by the
//! group shift) with the sector's position inside that block; 0 marks a
//! sector that was never written. Small tables live in memory and are
//! compressed into a DDT block at close; above the configured cap the
//! table is a reserved uncompressed region of the image file, accessed
//! randomly through a dedicated read-write handle so very large media do
//! not pin `8 * sector_count` bytes of RAM.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{ImageError, Result};

/// Pack a block file offset and an intra-block position into one locator.
pub fn encode_locator(block_offset: u64, position: u32, shift: u8) -> u64 {
    (block_offset << shift) | u64::from(position)
}

/// Split a locator back into (block file offset, intra-block position).
pub fn decode_locator(locator: u64, shift: u8) -> (u64, u32) {
    (locator >> shift, (locator & ((1 << shift) - 1)) as u32)
}

/// Storage contract shared by the in-memory and file-backed tables.
pub trait DdtStorage {
    fn get(&mut self, address: u64) -> Result<u64>;
    fn set(&mut self, address: u64, locator: u64) -> Result<()>;
    fn len(&self) -> u64;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// True when the table already lives inside the image file and `close`
    /// must not serialize a separate compressed copy.
    fn is_file_backed(&self) -> bool {
        false
    }
}

/// Dense in-memory table.
#[derive(Debug)]
pub struct InMemoryDdt {
    entries: Vec<u64>,
}

impl InMemoryDdt {
    pub fn new(sector_count: u64) -> Self {
        Self {
            entries: vec![0u64; sector_count as usize],
        }
    }

    /// Serialize the entries little-endian for the DDT block payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 8);
        for &entry in &self.entries {
            out.extend_from_slice(&entry.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 8 != 0 {
            return Err(ImageError::MissingDeduplicationTable);
        }
        let entries = bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        Ok(Self { entries })
    }
}

impl DdtStorage for InMemoryDdt {
    fn get(&mut self, address: u64) -> Result<u64> {
        self.entries
            .get(address as usize)
            .copied()
            .ok_or(ImageError::SectorOutOfRange {
                address,
                total: self.entries.len() as u64,
            })
    }

    fn set(&mut self, address: u64, locator: u64) -> Result<()> {
        let total = self.entries.len() as u64;
        match self.entries.get_mut(address as usize) {
            Some(slot) => {
                *slot = locator;
                Ok(())
            }
            None => Err(ImageError::SectorOutOfRange { address, total }),
        }
    }

    fn len(&self) -> u64 {
        self.entries.len() as u64
    }
}

/// Table stored as a fixed uncompressed region of the image file.
#[derive(Debug)]
pub struct FileBackedDdt {
    file: File,
    /// File offset of the first entry (past the DDT header).
    base: u64,
    entries: u64,
}

impl FileBackedDdt {
    /// Open the reserved region through a second handle on the image path.
    pub fn open<P: AsRef<Path>>(path: P, base: u64, entries: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file,
            base,
            entries,
        })
    }

    /// Reserve `entries * 8` zeroed bytes at the current end of `file`.
    /// Returns the base offset of the entry region.
    pub fn reserve(file: &mut File, entries: u64) -> Result<u64> {
        let base = file.seek(SeekFrom::End(0))?;
        let zeroes = vec![0u8; 64 * 1024];
        let mut remaining = entries * 8;
        while remaining > 0 {
            let n = remaining.min(zeroes.len() as u64) as usize;
            file.write_all(&zeroes[..n])?;
            remaining -= n as u64;
        }
        Ok(base)
    }

    /// CRC64 of the whole entry region, streamed back from disk.
    pub fn crc64(&mut self) -> Result<u64> {
        self.file.seek(SeekFrom::Start(self.base))?;
        let mut digest = crate::block::CRC64.digest();
        let mut buf = vec![0u8; 64 * 1024];
        let mut remaining = self.entries * 8;
        while remaining > 0 {
            let n = remaining.min(buf.len() as u64) as usize;
            self.file.read_exact(&mut buf[..n])?;
            digest.update(&buf[..n]);
            remaining -= n as u64;
        }
        Ok(digest.finalize())
    }
}

impl DdtStorage for FileBackedDdt {
    fn get(&mut self, address: u64) -> Result<u64> {
        if address >= self.entries {
            return Err(ImageError::SectorOutOfRange {
                address,
                total: self.entries,
            });
        }
        self.file.seek(SeekFrom::Start(self.base + address * 8))?;
        Ok(self.file.read_u64::<LittleEndian>()?)
    }

    fn set(&mut self, address: u64, locator: u64) -> Result<()> {
        if address >= self.entries {
            return Err(ImageError::SectorOutOfRange {
                address,
                total: self.entries,
            });
        }
        self.file.seek(SeekFrom::Start(self.base + address * 8))?;
        self.file.write_u64::<LittleEndian>(locator)?;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.entries
    }

    fn is_file_backed(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_packing_roundtrip() {
        let locator = encode_locator(0x1_0000, 37, 6);
        assert_eq!(decode_locator(locator, 6), (0x1_0000, 37));
    }

    #[test]
    fn in_memory_bounds_are_enforced() {
        let mut ddt = InMemoryDdt::new(4);
        ddt.set(3, 42).unwrap();
        assert_eq!(ddt.get(3).unwrap(), 42);
        assert!(matches!(
            ddt.set(4, 1),
            Err(ImageError::SectorOutOfRange { .. })
        ));
    }

    #[test]
    fn in_memory_byte_roundtrip() {
        let mut ddt = InMemoryDdt::new(3);
        ddt.set(0, 7).unwrap();
        ddt.set(2, 9).unwrap();
        let restored = InMemoryDdt::from_bytes(&ddt.to_bytes()).unwrap();
        assert_eq!(restored.entries, vec![7, 0, 9]);
    }

    #[test]
    fn file_backed_get_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ddt.bin");
        let mut file = File::create(&path).unwrap();
        let base = FileBackedDdt::reserve(&mut file, 16).unwrap();
        drop(file);

        let mut ddt = FileBackedDdt::open(&path, base, 16).unwrap();
        assert_eq!(ddt.get(5).unwrap(), 0);
        ddt.set(5, 0xABCD).unwrap();
        assert_eq!(ddt.get(5).unwrap(), 0xABCD);
        assert!(ddt.get(16).is_err());
    }
}
