//! Fixed on-disk block records: data block header, deduplication table
//! header and CD fix-table header. Pure encode/decode, no I/O policy.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::codec::CompressionId;
use crate::error::{ImageError, Result};
use crate::index::DataKind;

pub const BLOCK_MAGIC: u32 = 0x4B43_4C42; // "BLCK"
pub const DDT_MAGIC: u32 = 0x4254_4444; // "DDTB"
pub const CD_FIX_MAGIC: u32 = 0x5846_4443; // "CDFX"

pub const BLOCK_HEADER_SIZE: usize = 44;
pub const DDT_HEADER_SIZE: usize = 40;
pub const CD_FIX_HEADER_SIZE: usize = 40;

/// CRC-64/XZ, used for every on-disk integrity field.
pub static CRC64: crc::Crc<u64> = crc::Crc::<u64>::new(&crc::CRC_64_XZ);

pub fn crc64_of(bytes: &[u8]) -> u64 {
    CRC64.checksum(bytes)
}

/// Header preceding every stored block payload.
///
/// `crc64_raw` covers the uncompressed bytes, `crc64_stored` covers the
/// bytes as persisted (compressed form plus any codec side-channel).
/// `sector_size` is the logical size of the entries inside the block, or 0
/// when the payload is not sector-shaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub data_kind: DataKind,
    pub compression: CompressionId,
    pub sector_size: u32,
    pub raw_length: u64,
    pub stored_length: u64,
    pub crc64_raw: u64,
    pub crc64_stored: u64,
}

impl BlockHeader {
    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_u32::<LittleEndian>(BLOCK_MAGIC)?;
        writer.write_u16::<LittleEndian>(self.data_kind as u16)?;
        writer.write_u16::<LittleEndian>(self.compression as u16)?;
        writer.write_u32::<LittleEndian>(self.sector_size)?;
        writer.write_u64::<LittleEndian>(self.raw_length)?;
        writer.write_u64::<LittleEndian>(self.stored_length)?;
        writer.write_u64::<LittleEndian>(self.crc64_raw)?;
        writer.write_u64::<LittleEndian>(self.crc64_stored)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != BLOCK_MAGIC {
            return Err(ImageError::ChecksumMismatch {
                context: "block header magic",
            });
        }
        let data_code = reader.read_u16::<LittleEndian>()?;
        let compression_code = reader.read_u16::<LittleEndian>()?;
        let sector_size = reader.read_u32::<LittleEndian>()?;
        let raw_length = reader.read_u64::<LittleEndian>()?;
        let stored_length = reader.read_u64::<LittleEndian>()?;
        let crc64_raw = reader.read_u64::<LittleEndian>()?;
        let crc64_stored = reader.read_u64::<LittleEndian>()?;
        let data_kind = DataKind::from_code(data_code).unwrap_or(DataKind::NoData);
        let compression = CompressionId::from_code(compression_code)
            .ok_or(ImageError::UnknownCompression(compression_code))?;
        Ok(Self {
            data_kind,
            compression,
            sector_size,
            raw_length,
            stored_length,
            crc64_raw,
            crc64_stored,
        })
    }
}

/// Header of a deduplication table block.
///
/// `entry_width` is 8 for the user-data DDT and 4 for the CD fix tables'
/// on-disk form. `shift` is the group shift the locators were encoded with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdtHeader {
    pub entry_width: u8,
    pub shift: u8,
    pub compression: CompressionId,
    pub entries: u64,
    pub raw_length: u64,
    pub stored_length: u64,
    pub crc64_stored: u64,
}

impl DdtHeader {
    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_u32::<LittleEndian>(DDT_MAGIC)?;
        writer.write_u8(self.entry_width)?;
        writer.write_u8(self.shift)?;
        writer.write_u16::<LittleEndian>(self.compression as u16)?;
        writer.write_u64::<LittleEndian>(self.entries)?;
        writer.write_u64::<LittleEndian>(self.raw_length)?;
        writer.write_u64::<LittleEndian>(self.stored_length)?;
        writer.write_u64::<LittleEndian>(self.crc64_stored)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != DDT_MAGIC {
            return Err(ImageError::MissingDeduplicationTable);
        }
        let entry_width = reader.read_u8()?;
        let shift = reader.read_u8()?;
        let compression_code = reader.read_u16::<LittleEndian>()?;
        let compression = CompressionId::from_code(compression_code)
            .ok_or(ImageError::UnknownCompression(compression_code))?;
        Ok(Self {
            entry_width,
            shift,
            compression,
            entries: reader.read_u64::<LittleEndian>()?,
            raw_length: reader.read_u64::<LittleEndian>()?,
            stored_length: reader.read_u64::<LittleEndian>()?,
            crc64_stored: reader.read_u64::<LittleEndian>()?,
        })
    }
}

/// Which half of the raw sector a CD fix table covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CdFixKind {
    Prefix = 0,
    Suffix = 1,
}

impl CdFixKind {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(CdFixKind::Prefix),
            1 => Some(CdFixKind::Suffix),
            _ => None,
        }
    }
}

/// Header of a CD fix table block (one `u32` entry per sector).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdFixHeader {
    pub table_kind: CdFixKind,
    pub compression: CompressionId,
    pub entries: u64,
    pub raw_length: u64,
    pub stored_length: u64,
    pub crc64_stored: u64,
}

impl CdFixHeader {
    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_u32::<LittleEndian>(CD_FIX_MAGIC)?;
        writer.write_u16::<LittleEndian>(self.table_kind as u16)?;
        writer.write_u16::<LittleEndian>(self.compression as u16)?;
        writer.write_u64::<LittleEndian>(self.entries)?;
        writer.write_u64::<LittleEndian>(self.raw_length)?;
        writer.write_u64::<LittleEndian>(self.stored_length)?;
        writer.write_u64::<LittleEndian>(self.crc64_stored)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != CD_FIX_MAGIC {
            return Err(ImageError::ChecksumMismatch {
                context: "CD fix table magic",
            });
        }
        let kind_code = reader.read_u16::<LittleEndian>()?;
        let table_kind = CdFixKind::from_code(kind_code).ok_or(ImageError::ChecksumMismatch {
            context: "CD fix table kind",
        })?;
        let compression_code = reader.read_u16::<LittleEndian>()?;
        let compression = CompressionId::from_code(compression_code)
            .ok_or(ImageError::UnknownCompression(compression_code))?;
        Ok(Self {
            table_kind,
            compression,
            entries: reader.read_u64::<LittleEndian>()?,
            raw_length: reader.read_u64::<LittleEndian>()?,
            stored_length: reader.read_u64::<LittleEndian>()?,
            crc64_stored: reader.read_u64::<LittleEndian>()?,
        })
    }
}
