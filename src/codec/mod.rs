//! Codec registry for block payloads.
//!
//! Compression codes are written into every block header on disk; a reader
//! that meets a code it does not know skips that block (the deduplication
//! table excepted, whose loss is fatal). The audio codec lives in
//! [`audio`] and is not part of the generic registry: it consumes PCM
//! sectors through an owned sink instead of a byte slice.

use std::io;
use thiserror::Error;

pub mod audio;

pub use audio::AudioSink;

/// On-disk compression algorithm code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CompressionId {
    /// Payload stored verbatim.
    None = 0,
    /// Zstandard: balanced speed/ratio (default generic codec).
    Zstd = 1,
    /// LZ4: maximum throughput, lower ratio.
    Lz4 = 2,
    /// FLAC: lossless audio, CD audio blocks only.
    Flac = 3,
}

impl CompressionId {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(CompressionId::None),
            1 => Some(CompressionId::Zstd),
            2 => Some(CompressionId::Lz4),
            3 => Some(CompressionId::Flac),
            _ => None,
        }
    }

    /// Human-readable name, for diagnostics only (never parsed).
    pub fn name(self) -> &'static str {
        match self {
            CompressionId::None => "none",
            CompressionId::Zstd => "zstd",
            CompressionId::Lz4 => "lz4",
            CompressionId::Flac => "flac",
        }
    }
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub trait Codec: Send + Sync {
    fn id(&self) -> CompressionId;
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn id(&self) -> CompressionId {
        CompressionId::None
    }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn id(&self) -> CompressionId {
        CompressionId::Zstd
    }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, level).map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::decode_all(data).map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn id(&self) -> CompressionId {
        CompressionId::Lz4
    }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress_prepend_size(data))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

/// Resolve a compression code to a byte codec.
///
/// `Flac` has no slice-oriented implementation; blocks written with it are
/// only produced through [`AudioSink`], so asking the registry for it is a
/// decompression error, not a panic.
pub fn get_codec(id: CompressionId) -> Result<Box<dyn Codec>, CodecError> {
    match id {
        CompressionId::None => Ok(Box::new(NoneCodec)),
        CompressionId::Zstd => Ok(Box::new(ZstdCodec)),
        CompressionId::Lz4 => Ok(Box::new(Lz4Codec)),
        CompressionId::Flac => Err(CodecError::Decompression(
            "flac blocks are not byte-codec decodable".into(),
        )),
    }
}
