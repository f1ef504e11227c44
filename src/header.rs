//! Container header: the fixed 88-byte record at offset 0.
//!
//! The header is written once as a stub when the image is created and
//! patched in place on `close` with the final index offset and the
//! last-write timestamp. Magic and major version must match before any
//! other field is trusted; the version only increases across appends.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::Utc;
use std::io::{Read, Write};

use crate::error::{ImageError, Result};
use crate::media::MediaType;

pub const MAGIC: &[u8; 8] = b"SECTRPAK";
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;
pub const HEADER_SIZE: usize = 88;

const APPLICATION_LEN: usize = 32;
const APP_VERSION_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct ContainerHeader {
    pub version_major: u16,
    pub version_minor: u16,
    pub media_type: MediaType,
    pub application: String,
    pub application_version: String,
    pub created: i64,
    pub last_written: i64,
    pub index_offset: u64,
}

impl ContainerHeader {
    pub fn new(media_type: MediaType) -> Self {
        let now = Utc::now().timestamp();
        Self {
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            media_type,
            application: env!("CARGO_PKG_NAME").to_owned(),
            application_version: env!("CARGO_PKG_VERSION").to_owned(),
            created: now,
            last_written: now,
            index_offset: 0,
        }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_all(MAGIC)?;
        writer.write_u16::<LittleEndian>(self.version_major)?;
        writer.write_u16::<LittleEndian>(self.version_minor)?;
        writer.write_u16::<LittleEndian>(self.media_type.code())?;
        writer.write_u16::<LittleEndian>(0)?; // reserved
        writer.write_all(&pad(&self.application, APPLICATION_LEN))?;
        writer.write_all(&pad(&self.application_version, APP_VERSION_LEN))?;
        writer.write_i64::<LittleEndian>(self.created)?;
        writer.write_i64::<LittleEndian>(self.last_written)?;
        writer.write_u64::<LittleEndian>(self.index_offset)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(ImageError::InvalidMagic);
        }
        let version_major = reader.read_u16::<LittleEndian>()?;
        let version_minor = reader.read_u16::<LittleEndian>()?;
        if version_major != VERSION_MAJOR {
            return Err(ImageError::UnsupportedVersion {
                major: version_major,
                minor: version_minor,
            });
        }
        let media_code = reader.read_u16::<LittleEndian>()?;
        let media_type =
            MediaType::from_code(media_code).ok_or(ImageError::UnknownMediaCode(media_code))?;
        let _reserved = reader.read_u16::<LittleEndian>()?;
        let mut application = [0u8; APPLICATION_LEN];
        reader.read_exact(&mut application)?;
        let mut application_version = [0u8; APP_VERSION_LEN];
        reader.read_exact(&mut application_version)?;
        let created = reader.read_i64::<LittleEndian>()?;
        let last_written = reader.read_i64::<LittleEndian>()?;
        let index_offset = reader.read_u64::<LittleEndian>()?;
        Ok(Self {
            version_major,
            version_minor,
            media_type,
            application: unpad(&application),
            application_version: unpad(&application_version),
            created,
            last_written,
            index_offset,
        })
    }
}

fn pad(s: &str, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn unpad(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_layout_is_exactly_88_bytes() {
        let header = ContainerHeader::new(MediaType::CompactDisc);
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(&buf[..8], MAGIC);
    }

    #[test]
    fn header_roundtrip_preserves_fields() {
        let mut header = ContainerHeader::new(MediaType::Dvd);
        header.index_offset = 0xDEAD_BEEF;
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        let parsed = ContainerHeader::read(Cursor::new(&buf)).unwrap();
        assert_eq!(parsed.media_type, MediaType::Dvd);
        assert_eq!(parsed.index_offset, 0xDEAD_BEEF);
        assert_eq!(parsed.application, env!("CARGO_PKG_NAME"));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let buf = vec![0u8; HEADER_SIZE];
        assert!(matches!(
            ContainerHeader::read(Cursor::new(&buf)),
            Err(ImageError::InvalidMagic)
        ));
    }
}
