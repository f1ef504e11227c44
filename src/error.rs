use std::io;
use thiserror::Error;

use crate::codec::CodecError;
use crate::media::MediaType;

/// Crate-wide error type.
///
/// Variants fall into four families: configuration errors (rejected before
/// any I/O), format errors (the open is aborted, discard the handle),
/// integrity errors (a block could not be trusted) and bounds errors
/// (the call is rejected, no state is mutated).
#[derive(Error, Debug)]
pub enum ImageError {
    // ── Configuration ────────────────────────────────────────────────────
    #[error("Invalid option: {0}")]
    InvalidOption(String),
    #[error("Unsupported media type: {0:?}")]
    UnsupportedMediaType(MediaType),

    // ── Format ───────────────────────────────────────────────────────────
    #[error("Invalid magic number")]
    InvalidMagic,
    #[error("Unsupported format version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("Media type mismatch: image holds {found:?}, requested {requested:?}")]
    MediaTypeMismatch {
        found: MediaType,
        requested: MediaType,
    },
    #[error("Image has no deduplication table, cannot append")]
    MissingDeduplicationTable,
    #[error("Sector count mismatch: image holds {found}, requested {requested}")]
    SectorCountMismatch { found: u64, requested: u64 },
    #[error("Corrupt index: {0}")]
    CorruptIndex(String),
    #[error("Unknown media type code {0}")]
    UnknownMediaCode(u16),

    // ── Integrity ────────────────────────────────────────────────────────
    #[error("CRC64 mismatch in {context}")]
    ChecksumMismatch { context: &'static str },
    #[error("Unknown compression code {0}")]
    UnknownCompression(u16),

    // ── Bounds ───────────────────────────────────────────────────────────
    #[error("Sector {address} is out of range (image holds {total} sectors)")]
    SectorOutOfRange { address: u64, total: u64 },
    #[error("No track covers sector {0}")]
    NoTrackForSector(u64),
    #[error("Wrong sector size: expected {expected} bytes, got {got}")]
    WrongSectorSize { expected: usize, got: usize },
    #[error("Operation requires optical media, image is {0:?}")]
    NotOpticalMedia(MediaType),

    // ── Plumbing ─────────────────────────────────────────────────────────
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ImageError>;
