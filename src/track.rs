//! Optical track records and the track-class dispatch used by the long
//! sector write path.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::block::crc64_of;
use crate::error::{ImageError, Result};

pub const TRACKS_MAGIC: u32 = 0x534B_5254; // "TRKS"
pub const TRACK_ENTRY_SIZE: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrackType {
    Audio = 0,
    Data = 1,
    CdMode1 = 2,
    CdMode2Formless = 3,
    CdMode2Form1 = 4,
    CdMode2Form2 = 5,
}

impl TrackType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TrackType::Audio),
            1 => Some(TrackType::Data),
            2 => Some(TrackType::CdMode1),
            3 => Some(TrackType::CdMode2Formless),
            4 => Some(TrackType::CdMode2Form1),
            5 => Some(TrackType::CdMode2Form2),
            _ => None,
        }
    }
}

/// How a raw long-sector write is handled. Resolved once per call from the
/// covering track, then matched exhaustively; read and write paths share
/// the same classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackClass {
    Audio,
    PlainData,
    CdMode1,
    CdMode2,
}

impl TrackClass {
    pub fn resolve(track_type: TrackType) -> Self {
        match track_type {
            TrackType::Audio => TrackClass::Audio,
            TrackType::Data => TrackClass::PlainData,
            TrackType::CdMode1 => TrackClass::CdMode1,
            TrackType::CdMode2Formless
            | TrackType::CdMode2Form1
            | TrackType::CdMode2Form2 => TrackClass::CdMode2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub sequence: u32,
    pub track_type: TrackType,
    pub start: u64,
    pub end: u64,
    pub pregap: u64,
    pub session: u8,
    pub flags: u8,
    pub isrc: Option<String>,
}

impl Track {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address <= self.end
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.sequence)?;
        writer.write_u8(self.track_type as u8)?;
        writer.write_u8(self.session)?;
        writer.write_u8(self.flags)?;
        writer.write_u8(0)?; // reserved
        writer.write_u64::<LittleEndian>(self.start)?;
        writer.write_u64::<LittleEndian>(self.end)?;
        writer.write_u64::<LittleEndian>(self.pregap)?;
        let mut isrc = [0u8; 16];
        if let Some(code) = &self.isrc {
            let bytes = code.as_bytes();
            let n = bytes.len().min(15);
            isrc[..n].copy_from_slice(&bytes[..n]);
        }
        writer.write_all(&isrc)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let sequence = reader.read_u32::<LittleEndian>()?;
        let type_code = reader.read_u8()?;
        let track_type = TrackType::from_code(type_code).ok_or(ImageError::CorruptIndex(
            format!("unknown track type code {type_code}"),
        ))?;
        let session = reader.read_u8()?;
        let flags = reader.read_u8()?;
        let _reserved = reader.read_u8()?;
        let start = reader.read_u64::<LittleEndian>()?;
        let end = reader.read_u64::<LittleEndian>()?;
        let pregap = reader.read_u64::<LittleEndian>()?;
        let mut isrc = [0u8; 16];
        reader.read_exact(&mut isrc)?;
        let end_pos = isrc.iter().position(|&b| b == 0).unwrap_or(isrc.len());
        let isrc = if end_pos == 0 {
            None
        } else {
            Some(String::from_utf8_lossy(&isrc[..end_pos]).into_owned())
        };
        Ok(Self {
            sequence,
            track_type,
            start,
            end,
            pregap,
            session,
            flags,
            isrc,
        })
    }
}

/// Serialize the track list block: magic, count, CRC64 of entry bytes,
/// entries.
pub fn write_tracks_block<W: Write>(mut writer: W, tracks: &[Track]) -> Result<()> {
    let mut body = Vec::with_capacity(tracks.len() * TRACK_ENTRY_SIZE);
    for track in tracks {
        track.write(&mut body)?;
    }
    writer.write_u32::<LittleEndian>(TRACKS_MAGIC)?;
    writer.write_u16::<LittleEndian>(tracks.len() as u16)?;
    writer.write_u16::<LittleEndian>(0)?;
    writer.write_u64::<LittleEndian>(crc64_of(&body))?;
    writer.write_all(&body)?;
    Ok(())
}

pub fn read_tracks_block<R: Read>(mut reader: R) -> Result<Vec<Track>> {
    let magic = reader.read_u32::<LittleEndian>()?;
    if magic != TRACKS_MAGIC {
        return Err(ImageError::ChecksumMismatch {
            context: "track list magic",
        });
    }
    let count = reader.read_u16::<LittleEndian>()?;
    let _reserved = reader.read_u16::<LittleEndian>()?;
    let stored_crc = reader.read_u64::<LittleEndian>()?;
    let mut body = vec![0u8; count as usize * TRACK_ENTRY_SIZE];
    reader.read_exact(&mut body)?;
    if crc64_of(&body) != stored_crc {
        return Err(ImageError::ChecksumMismatch {
            context: "track list entries",
        });
    }
    let mut cursor = std::io::Cursor::new(&body);
    (0..count).map(|_| Track::read(&mut cursor)).collect()
}
