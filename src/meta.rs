//! Auxiliary metadata records: geometry, opaque CICM metadata, dump
//! provenance, and the media/sector tag vocabulary.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::{ImageError, Result};
use crate::index::DataKind;

pub const GEOMETRY_MAGIC: u32 = 0x4D4F_4547; // "GEOM"
pub const METADATA_MAGIC: u32 = 0x4154_454D; // "META"
pub const PROVENANCE_MAGIC: u32 = 0x5652_5044; // "DPRV"

/// Whole-media tag blobs (TOCs, disc structures) stored verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MediaTagType {
    CdPartialToc,
    CdAtip,
    CdFullToc,
    CdPma,
    CdText,
    DvdPfi,
    DvdDmi,
}

impl MediaTagType {
    pub fn data_kind(self) -> DataKind {
        match self {
            MediaTagType::CdPartialToc => DataKind::CdPartialToc,
            MediaTagType::CdAtip => DataKind::CdAtip,
            MediaTagType::CdFullToc => DataKind::CdFullToc,
            MediaTagType::CdPma => DataKind::CdPma,
            MediaTagType::CdText => DataKind::CdText,
            MediaTagType::DvdPfi => DataKind::DvdPfi,
            MediaTagType::DvdDmi => DataKind::DvdDmi,
        }
    }

    pub fn from_data_kind(kind: DataKind) -> Option<Self> {
        match kind {
            DataKind::CdPartialToc => Some(MediaTagType::CdPartialToc),
            DataKind::CdAtip => Some(MediaTagType::CdAtip),
            DataKind::CdFullToc => Some(MediaTagType::CdFullToc),
            DataKind::CdPma => Some(MediaTagType::CdPma),
            DataKind::CdText => Some(MediaTagType::CdText),
            DataKind::DvdPfi => Some(MediaTagType::DvdPfi),
            DataKind::DvdDmi => Some(MediaTagType::DvdDmi),
            _ => None,
        }
    }

    /// True when the tag only exists on CD-class media.
    pub fn is_cd_tag(self) -> bool {
        !matches!(self, MediaTagType::DvdPfi | MediaTagType::DvdDmi)
    }
}

/// Fixed-size per-sector tag stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SectorTagType {
    /// 96 bytes of deinterleaved subchannel per sector.
    CdSectorSubchannel,
    /// 8-byte Mode 2 subheader per sector.
    CdSectorSubHeader,
}

impl SectorTagType {
    pub fn size(self) -> usize {
        match self {
            SectorTagType::CdSectorSubchannel => 96,
            SectorTagType::CdSectorSubHeader => 8,
        }
    }

    pub fn data_kind(self) -> DataKind {
        match self {
            SectorTagType::CdSectorSubchannel => DataKind::CdSectorSubchannel,
            SectorTagType::CdSectorSubHeader => DataKind::CdSectorSubHeader,
        }
    }

    pub fn from_data_kind(kind: DataKind) -> Option<Self> {
        match kind {
            DataKind::CdSectorSubchannel => Some(SectorTagType::CdSectorSubchannel),
            DataKind::CdSectorSubHeader => Some(SectorTagType::CdSectorSubHeader),
            _ => None,
        }
    }
}

/// Drive geometry as reported by the dump tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cylinders: u32,
    pub heads: u32,
    pub sectors_per_track: u32,
}

impl Geometry {
    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_u32::<LittleEndian>(GEOMETRY_MAGIC)?;
        writer.write_u32::<LittleEndian>(self.cylinders)?;
        writer.write_u32::<LittleEndian>(self.heads)?;
        writer.write_u32::<LittleEndian>(self.sectors_per_track)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != GEOMETRY_MAGIC {
            return Err(ImageError::ChecksumMismatch {
                context: "geometry block magic",
            });
        }
        Ok(Self {
            cylinders: reader.read_u32::<LittleEndian>()?,
            heads: reader.read_u32::<LittleEndian>()?,
            sectors_per_track: reader.read_u32::<LittleEndian>()?,
        })
    }
}

/// Opaque metadata blob (CICM XML), stored and returned verbatim.
pub fn write_metadata_block<W: Write>(mut writer: W, blob: &[u8]) -> Result<()> {
    writer.write_u32::<LittleEndian>(METADATA_MAGIC)?;
    writer.write_u32::<LittleEndian>(blob.len() as u32)?;
    writer.write_all(blob)?;
    Ok(())
}

pub fn read_metadata_block<R: Read>(mut reader: R) -> Result<Vec<u8>> {
    let magic = reader.read_u32::<LittleEndian>()?;
    if magic != METADATA_MAGIC {
        return Err(ImageError::ChecksumMismatch {
            context: "metadata block magic",
        });
    }
    let len = reader.read_u32::<LittleEndian>()?;
    let mut blob = vec![0u8; len as usize];
    reader.read_exact(&mut blob)?;
    Ok(blob)
}

/// One dump-hardware record: who dumped which extents with what.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DumpHardware {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub software_name: String,
    pub software_version: String,
    pub operating_system: String,
    /// Inclusive (start, end) sector ranges this hardware dumped.
    pub extents: Vec<(u64, u64)>,
}

impl DumpHardware {
    fn strings(&self) -> [&str; 6] {
        [
            &self.manufacturer,
            &self.model,
            &self.serial,
            &self.software_name,
            &self.software_version,
            &self.operating_system,
        ]
    }
}

/// Serialize the dump provenance block. Strings are length-prefixed
/// C-strings; the length includes the trailing NUL.
pub fn write_provenance_block<W: Write>(mut writer: W, entries: &[DumpHardware]) -> Result<()> {
    writer.write_u32::<LittleEndian>(PROVENANCE_MAGIC)?;
    writer.write_u16::<LittleEndian>(entries.len() as u16)?;
    for entry in entries {
        writer.write_u16::<LittleEndian>(entry.extents.len() as u16)?;
        for &(start, end) in &entry.extents {
            writer.write_u64::<LittleEndian>(start)?;
            writer.write_u64::<LittleEndian>(end)?;
        }
        for s in entry.strings() {
            writer.write_u32::<LittleEndian>(s.len() as u32 + 1)?;
            writer.write_all(s.as_bytes())?;
            writer.write_u8(0)?;
        }
    }
    Ok(())
}

pub fn read_provenance_block<R: Read>(mut reader: R) -> Result<Vec<DumpHardware>> {
    let magic = reader.read_u32::<LittleEndian>()?;
    if magic != PROVENANCE_MAGIC {
        return Err(ImageError::ChecksumMismatch {
            context: "dump provenance magic",
        });
    }
    let count = reader.read_u16::<LittleEndian>()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let extent_count = reader.read_u16::<LittleEndian>()?;
        let mut extents = Vec::with_capacity(extent_count as usize);
        for _ in 0..extent_count {
            let start = reader.read_u64::<LittleEndian>()?;
            let end = reader.read_u64::<LittleEndian>()?;
            extents.push((start, end));
        }
        let mut strings = Vec::with_capacity(6);
        for _ in 0..6 {
            let len = reader.read_u32::<LittleEndian>()?;
            if len == 0 {
                return Err(ImageError::ChecksumMismatch {
                    context: "dump provenance string",
                });
            }
            let mut bytes = vec![0u8; len as usize];
            reader.read_exact(&mut bytes)?;
            bytes.pop(); // trailing NUL
            strings.push(String::from_utf8_lossy(&bytes).into_owned());
        }
        let mut it = strings.into_iter();
        entries.push(DumpHardware {
            manufacturer: it.next().unwrap_or_default(),
            model: it.next().unwrap_or_default(),
            serial: it.next().unwrap_or_default(),
            software_name: it.next().unwrap_or_default(),
            software_version: it.next().unwrap_or_default(),
            operating_system: it.next().unwrap_or_default(),
            extents,
        });
    }
    Ok(entries)
}
