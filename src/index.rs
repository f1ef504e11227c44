//! Trailing index: ordered list of (block-kind, data-kind, offset) entries.
//!
//! User-data blocks are reachable through the deduplication table and are
//! never indexed; the index only references auxiliary blocks. At most one
//! live entry exists per (block-kind, data-kind) pair.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::block::crc64_of;
use crate::error::{ImageError, Result};

pub const INDEX_MAGIC: u32 = 0x5844_4E49; // "INDX"
pub const INDEX_ENTRY_SIZE: usize = 12;

/// Structural kind of an indexed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum BlockKind {
    DataBlock = 1,
    DeduplicationTable = 2,
    Index = 3,
    GeometryBlock = 4,
    MetadataBlock = 5,
    TracksBlock = 6,
    CdFixTable = 7,
    ChecksumBlock = 8,
    DumpBlock = 9,
}

impl BlockKind {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(BlockKind::DataBlock),
            2 => Some(BlockKind::DeduplicationTable),
            3 => Some(BlockKind::Index),
            4 => Some(BlockKind::GeometryBlock),
            5 => Some(BlockKind::MetadataBlock),
            6 => Some(BlockKind::TracksBlock),
            7 => Some(BlockKind::CdFixTable),
            8 => Some(BlockKind::ChecksumBlock),
            9 => Some(BlockKind::DumpBlock),
            _ => None,
        }
    }
}

/// Payload kind carried by a block. Media tags, sector tag stores and the
/// corrected-fragment side stores are all data blocks distinguished by this
/// tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum DataKind {
    NoData = 0,
    UserData = 1,
    CdPartialToc = 2,
    CdAtip = 3,
    CdFullToc = 4,
    CdPma = 5,
    CdText = 6,
    DvdPfi = 7,
    DvdDmi = 8,
    CdSectorSubchannel = 10,
    CdSectorSubHeader = 11,
    CdSectorPrefixCorrected = 12,
    CdSectorSuffixCorrected = 13,
    UserDataDdt = 14,
    CicmMetadata = 15,
    DumpProvenance = 16,
    TrackList = 17,
    Geometry = 18,
    ImageChecksums = 19,
}

impl DataKind {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(DataKind::NoData),
            1 => Some(DataKind::UserData),
            2 => Some(DataKind::CdPartialToc),
            3 => Some(DataKind::CdAtip),
            4 => Some(DataKind::CdFullToc),
            5 => Some(DataKind::CdPma),
            6 => Some(DataKind::CdText),
            7 => Some(DataKind::DvdPfi),
            8 => Some(DataKind::DvdDmi),
            10 => Some(DataKind::CdSectorSubchannel),
            11 => Some(DataKind::CdSectorSubHeader),
            12 => Some(DataKind::CdSectorPrefixCorrected),
            13 => Some(DataKind::CdSectorSuffixCorrected),
            14 => Some(DataKind::UserDataDdt),
            15 => Some(DataKind::CicmMetadata),
            16 => Some(DataKind::DumpProvenance),
            17 => Some(DataKind::TrackList),
            18 => Some(DataKind::Geometry),
            19 => Some(DataKind::ImageChecksums),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub block_kind: BlockKind,
    pub data_kind: DataKind,
    pub offset: u64,
}

impl IndexEntry {
    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_u16::<LittleEndian>(self.block_kind as u16)?;
        writer.write_u16::<LittleEndian>(self.data_kind as u16)?;
        writer.write_u64::<LittleEndian>(self.offset)?;
        Ok(())
    }

    /// Returns `Ok(None)` for entries whose kinds this build does not know;
    /// the caller skips them instead of failing the whole open.
    pub fn read<R: Read>(mut reader: R) -> Result<Option<Self>> {
        let block_code = reader.read_u16::<LittleEndian>()?;
        let data_code = reader.read_u16::<LittleEndian>()?;
        let offset = reader.read_u64::<LittleEndian>()?;
        let (block_kind, data_kind) =
            match (BlockKind::from_code(block_code), DataKind::from_code(data_code)) {
                (Some(b), Some(d)) => (b, d),
                _ => return Ok(None),
            };
        Ok(Some(Self {
            block_kind,
            data_kind,
            offset,
        }))
    }
}

/// In-memory index for one session. Append-only, except that pushing an
/// entry for an already-present kind pair replaces the old entry.
#[derive(Debug, Clone, Default)]
pub struct Index {
    pub entries: Vec<IndexEntry>,
}

impl Index {
    /// Remove any previous entry for the same (block-kind, data-kind) pair,
    /// then append.
    pub fn replace(&mut self, entry: IndexEntry) {
        self.entries.retain(|e| {
            e.block_kind != entry.block_kind || e.data_kind != entry.data_kind
        });
        self.entries.push(entry);
    }

    pub fn find(&self, block_kind: BlockKind, data_kind: DataKind) -> Option<&IndexEntry> {
        self.entries
            .iter()
            .find(|e| e.block_kind == block_kind && e.data_kind == data_kind)
    }

    /// Serialize as Index Header + entries. The CRC64 covers the raw entry
    /// bytes only.
    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        let mut body = Vec::with_capacity(self.entries.len() * INDEX_ENTRY_SIZE);
        for entry in &self.entries {
            entry.write(&mut body)?;
        }
        writer.write_u32::<LittleEndian>(INDEX_MAGIC)?;
        writer.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        writer.write_u64::<LittleEndian>(crc64_of(&body))?;
        writer.write_all(&body)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != INDEX_MAGIC {
            return Err(ImageError::CorruptIndex("bad index magic".into()));
        }
        let count = reader.read_u32::<LittleEndian>()?;
        let stored_crc = reader.read_u64::<LittleEndian>()?;
        let mut body = vec![0u8; count as usize * INDEX_ENTRY_SIZE];
        reader.read_exact(&mut body)?;
        if crc64_of(&body) != stored_crc {
            return Err(ImageError::CorruptIndex("index CRC64 mismatch".into()));
        }
        let mut entries = Vec::with_capacity(count as usize);
        let mut cursor = std::io::Cursor::new(&body);
        for _ in 0..count {
            if let Some(entry) = IndexEntry::read(&mut cursor)? {
                entries.push(entry);
            }
        }
        Ok(Self { entries })
    }
}
