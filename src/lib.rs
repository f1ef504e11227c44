//! sectorpack: a forensic disk image container.
//!
//! Sector-level dumps of disks and optical media are stored in
//! content-deduplicated, per-block compressed form. CD-class media get the
//! full treatment: raw 2352-byte sectors are split into re-derivable and
//! anomalous parts, ECC/EDC are verified against the Yellow Book layout,
//! and audio tracks are compressed losslessly with FLAC.
//!
//! The write path is [`ImageWriter`]: create or append, feed sectors, set
//! auxiliary metadata, `close`.

pub mod block;
pub mod cdfix;
pub mod checksum;
pub mod codec;
pub mod ddt;
pub mod ecc;
pub mod error;
pub mod header;
pub mod index;
pub mod media;
pub mod meta;
pub mod track;
pub mod writer;

pub use checksum::ChecksumAlgorithm;
pub use codec::CompressionId;
pub use error::{ImageError, Result};
pub use media::MediaType;
pub use meta::{DumpHardware, Geometry, MediaTagType, SectorTagType};
pub use track::{Track, TrackType};
pub use writer::{CreateOptions, ImageWriter, SessionFallback};
