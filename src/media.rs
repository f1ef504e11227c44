//! Media type codes stored in the container header.

use crate::error::ImageError;

/// Physical media class of the dumped volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MediaType {
    Unknown = 0,
    GenericHdd = 1,
    Floppy = 2,
    FlashDrive = 3,
    CompactDisc = 4,
    Dvd = 5,
    BluRay = 6,
    JaguarCd = 7,
}

impl MediaType {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(MediaType::Unknown),
            1 => Some(MediaType::GenericHdd),
            2 => Some(MediaType::Floppy),
            3 => Some(MediaType::FlashDrive),
            4 => Some(MediaType::CompactDisc),
            5 => Some(MediaType::Dvd),
            6 => Some(MediaType::BluRay),
            7 => Some(MediaType::JaguarCd),
            _ => None,
        }
    }

    /// CD-class media carry raw 2352-byte sectors, tracks and subchannel.
    pub fn is_cd(self) -> bool {
        matches!(self, MediaType::CompactDisc | MediaType::JaguarCd)
    }

    /// Optical media accept media tags (TOC, PFI, ...) and track lists.
    pub fn is_optical(self) -> bool {
        matches!(
            self,
            MediaType::CompactDisc | MediaType::Dvd | MediaType::BluRay | MediaType::JaguarCd
        )
    }
}

/// Gate used by `create` before any I/O happens.
pub fn check_supported(media: MediaType) -> Result<(), ImageError> {
    if media == MediaType::Unknown {
        return Err(ImageError::UnsupportedMediaType(media));
    }
    Ok(())
}
