//! Image writer: creation, appending, sector ingestion and close.
//!
//! One [`ImageWriter`] owns the file handle, the header, the index, the
//! deduplication table, the CD fix stores and the single currently-open
//! compression block. All operations are synchronous and must be called
//! sequentially; `close` consumes the handle, so use-after-close is a
//! compile error rather than a runtime one.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use crate::block::{
    crc64_of, BlockHeader, CdFixHeader, CdFixKind, DdtHeader, BLOCK_HEADER_SIZE,
    CD_FIX_HEADER_SIZE, DDT_HEADER_SIZE,
};
use crate::cdfix::{self, CdFixStore};
use crate::checksum::{write_checksum_block, ChecksumAccumulator, ChecksumAlgorithm};
use crate::codec::{get_codec, AudioSink, CompressionId};
use crate::ddt::{encode_locator, DdtStorage, FileBackedDdt, InMemoryDdt};
use crate::ecc::sector::{
    mode1_suffix_is_correct, mode2_classify, prefix_is_correct, MODE2_FORM1_DATA_SIZE,
    MODE2_FORM2_DATA_SIZE, MODE2_RAW_DATA_SIZE, PREFIX_SIZE, RAW_SECTOR_SIZE, SUFFIX_SIZE,
};
use crate::ecc::{EccTables, Mode2Form};
use crate::error::{ImageError, Result};
use crate::header::{ContainerHeader, HEADER_SIZE, VERSION_MINOR};
use crate::index::{BlockKind, DataKind, Index, IndexEntry};
use crate::media::{check_supported, MediaType};
use crate::meta::{
    read_metadata_block, read_provenance_block, write_metadata_block, write_provenance_block,
    DumpHardware, Geometry, MediaTagType, SectorTagType,
};
use crate::track::{read_tracks_block, write_tracks_block, Track, TrackClass};

/// When audio tracks fall back from the audio codec to the generic one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFallback {
    /// Per-media default: Jaguar CD tracks in sessions above 1 use the
    /// generic codec, everything else keeps the audio codec.
    MediaDefault,
    /// Never fall back.
    Never,
    /// Tracks in sessions above this number use the generic codec.
    AboveSession(u8),
}

/// Configuration for [`ImageWriter::create`]. Validated before any I/O.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// log2 of how many sectors share one compressed block.
    pub group_shift: u8,
    /// Compression dictionary size; must be a power of two.
    pub dictionary_size: u32,
    /// Generic byte codec for new blocks.
    pub generic_codec: CompressionId,
    pub compression_level: i32,
    /// Globally disable block compression ("store" everything).
    pub compress: bool,
    /// Use the audio codec for CD audio blocks.
    pub compress_audio: bool,
    /// Content-hash every sector for deduplication. All-zero sectors are
    /// deduplicated even when this is off.
    pub dedup: bool,
    /// Whole-image digest algorithms. Ignored in append mode.
    pub image_checksums: Vec<ChecksumAlgorithm>,
    /// Above this many bytes of locator data the DDT moves on disk.
    pub in_memory_ddt_cap: u64,
    pub audio_fallback: SessionFallback,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            group_shift: 8,
            dictionary_size: 1 << 25,
            generic_codec: CompressionId::Zstd,
            compression_level: 3,
            compress: true,
            compress_audio: true,
            dedup: true,
            image_checksums: vec![
                ChecksumAlgorithm::Crc64,
                ChecksumAlgorithm::Md5,
                ChecksumAlgorithm::Sha1,
                ChecksumAlgorithm::Sha256,
            ],
            in_memory_ddt_cap: 256 * 1024 * 1024,
            audio_fallback: SessionFallback::MediaDefault,
        }
    }
}

impl CreateOptions {
    pub fn validate(&self) -> Result<()> {
        if !(1..=16).contains(&self.group_shift) {
            return Err(ImageError::InvalidOption(format!(
                "group shift {} outside 1..=16",
                self.group_shift
            )));
        }
        if !self.dictionary_size.is_power_of_two()
            || !(4096..=512 * 1024 * 1024).contains(&self.dictionary_size)
        {
            return Err(ImageError::InvalidOption(format!(
                "dictionary size {} is not a power of two in 4 KiB..=512 MiB",
                self.dictionary_size
            )));
        }
        if self.generic_codec == CompressionId::Flac {
            return Err(ImageError::InvalidOption(
                "flac is not a generic byte codec".into(),
            ));
        }
        if !(0..=22).contains(&self.compression_level) {
            return Err(ImageError::InvalidOption(format!(
                "compression level {} outside 0..=22",
                self.compression_level
            )));
        }
        Ok(())
    }
}

/// Writer-side holder for the two DDT representations. The storage
/// contract is [`DdtStorage`]; the enum only exists so `close` can reach
/// representation-specific finalization.
#[derive(Debug)]
enum DdtBacking {
    Memory(InMemoryDdt),
    File(FileBackedDdt),
}

impl DdtStorage for DdtBacking {
    fn get(&mut self, address: u64) -> Result<u64> {
        match self {
            DdtBacking::Memory(t) => t.get(address),
            DdtBacking::File(t) => t.get(address),
        }
    }

    fn set(&mut self, address: u64, locator: u64) -> Result<()> {
        match self {
            DdtBacking::Memory(t) => t.set(address, locator),
            DdtBacking::File(t) => t.set(address, locator),
        }
    }

    fn len(&self) -> u64 {
        match self {
            DdtBacking::Memory(t) => t.len(),
            DdtBacking::File(t) => t.len(),
        }
    }

    fn is_file_backed(&self) -> bool {
        matches!(self, DdtBacking::File(_))
    }
}

/// The single currently-open output block.
#[derive(Debug)]
struct OpenBlock {
    /// File offset the block header will land at.
    offset: u64,
    sector_size: u32,
    use_audio: bool,
    buf: Vec<u8>,
    count: u32,
}

impl OpenBlock {
    fn new(offset: u64, sector_size: u32, use_audio: bool) -> Self {
        Self {
            offset,
            sector_size,
            use_audio,
            buf: Vec::new(),
            count: 0,
        }
    }
}

#[derive(Debug)]
pub struct ImageWriter {
    file: File,
    header: ContainerHeader,
    options: CreateOptions,
    media: MediaType,
    sector_count: u64,
    sector_size: u32,
    appending: bool,
    /// Logical append cursor; blocks land here.
    data_end: u64,
    shift: u8,
    ddt: DdtBacking,
    /// File offset of the on-disk DDT header, when file-backed.
    ddt_block_offset: Option<u64>,
    dedup: HashMap<[u8; 32], u64>,
    open_block: Option<OpenBlock>,
    ecc: EccTables,
    tracks: Vec<Track>,
    geometry: Option<Geometry>,
    media_tags: BTreeMap<MediaTagType, Vec<u8>>,
    tag_stores: BTreeMap<SectorTagType, Vec<u8>>,
    cicm_metadata: Option<Vec<u8>>,
    dump_provenance: Vec<DumpHardware>,
    cd_prefix: Option<CdFixStore>,
    cd_suffix: Option<CdFixStore>,
    checksums: ChecksumAccumulator,
}

impl ImageWriter {
    // ── Creation ─────────────────────────────────────────────────────────

    /// Open `path` for writing. A valid, version-compatible header with a
    /// matching media type switches to append mode; anything without our
    /// magic is truncated and initialized fresh.
    pub fn create<P: AsRef<Path>>(
        path: P,
        media: MediaType,
        options: CreateOptions,
        sector_count: u64,
        sector_size: u32,
    ) -> Result<Self> {
        options.validate()?;
        check_supported(media)?;
        if sector_count == 0 {
            return Err(ImageError::InvalidOption("sector count is zero".into()));
        }
        if sector_size == 0 {
            return Err(ImageError::InvalidOption("sector size is zero".into()));
        }

        let path = path.as_ref().to_owned();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        if file.metadata()?.len() >= HEADER_SIZE as u64 {
            file.seek(SeekFrom::Start(0))?;
            match ContainerHeader::read(&mut file) {
                Ok(existing) => {
                    return Self::append(path, file, existing, media, options, sector_count, sector_size);
                }
                Err(ImageError::InvalidMagic) => {
                    debug!("existing file is not a container, starting fresh");
                }
                Err(e) => return Err(e),
            }
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        let header = ContainerHeader::new(media);
        header.write(&mut file)?;

        let shift = options.group_shift;
        let mut ddt_block_offset = None;
        let ddt = if sector_count * 8 <= options.in_memory_ddt_cap {
            DdtBacking::Memory(InMemoryDdt::new(sector_count))
        } else {
            // Reserve the random-access region right after the header; the
            // CRC64 field is filled in at close.
            let header_offset = file.seek(SeekFrom::End(0))?;
            DdtHeader {
                entry_width: 8,
                shift,
                compression: CompressionId::None,
                entries: sector_count,
                raw_length: sector_count * 8,
                stored_length: sector_count * 8,
                crc64_stored: 0,
            }
            .write(&mut file)?;
            let base = FileBackedDdt::reserve(&mut file, sector_count)?;
            ddt_block_offset = Some(header_offset);
            DdtBacking::File(FileBackedDdt::open(&path, base, sector_count)?)
        };

        let data_end = file.seek(SeekFrom::End(0))?;
        let checksums = ChecksumAccumulator::new(options.image_checksums.clone());
        Ok(Self {
            file,
            header,
            options,
            media,
            sector_count,
            sector_size,
            appending: false,
            data_end,
            shift,
            ddt,
            ddt_block_offset,
            dedup: HashMap::new(),
            open_block: None,
            ecc: EccTables::new(),
            tracks: Vec::new(),
            geometry: None,
            media_tags: BTreeMap::new(),
            tag_stores: BTreeMap::new(),
            cicm_metadata: None,
            dump_provenance: Vec::new(),
            cd_prefix: None,
            cd_suffix: None,
            checksums,
        })
    }

    /// Reload every auxiliary structure of an existing image so the session
    /// can mutate and re-persist them. Whole-image checksumming is not
    /// resumed.
    #[allow(clippy::too_many_lines)]
    fn append(
        path: PathBuf,
        mut file: File,
        mut header: ContainerHeader,
        media: MediaType,
        options: CreateOptions,
        sector_count: u64,
        sector_size: u32,
    ) -> Result<Self> {
        if header.version_minor > VERSION_MINOR {
            return Err(ImageError::UnsupportedVersion {
                major: header.version_major,
                minor: header.version_minor,
            });
        }
        if header.media_type != media {
            return Err(ImageError::MediaTypeMismatch {
                found: header.media_type,
                requested: media,
            });
        }
        header.version_minor = header.version_minor.max(VERSION_MINOR);

        file.seek(SeekFrom::Start(header.index_offset))?;
        let old_index = Index::read(&mut file)?;

        let mut ddt = None;
        let mut ddt_block_offset = None;
        let mut shift = options.group_shift;
        let mut tracks = Vec::new();
        let mut geometry = None;
        let mut media_tags = BTreeMap::new();
        let mut tag_stores = BTreeMap::new();
        let mut cicm_metadata = None;
        let mut dump_provenance = Vec::new();
        let mut prefix_table: Option<Vec<u32>> = None;
        let mut suffix_table: Option<Vec<u32>> = None;
        let mut prefix_store: Option<Vec<u8>> = None;
        let mut suffix_store: Option<Vec<u8>> = None;

        for entry in &old_index.entries {
            match entry.block_kind {
                BlockKind::DeduplicationTable => {
                    file.seek(SeekFrom::Start(entry.offset))?;
                    let ddt_header = DdtHeader::read(&mut file)?;
                    if ddt_header.entry_width != 8 {
                        return Err(ImageError::MissingDeduplicationTable);
                    }
                    if ddt_header.entries != sector_count {
                        return Err(ImageError::SectorCountMismatch {
                            found: ddt_header.entries,
                            requested: sector_count,
                        });
                    }
                    shift = ddt_header.shift;
                    if ddt_header.compression == CompressionId::None {
                        let base = entry.offset + DDT_HEADER_SIZE as u64;
                        let mut backing = FileBackedDdt::open(&path, base, sector_count)?;
                        if backing.crc64()? != ddt_header.crc64_stored {
                            return Err(ImageError::ChecksumMismatch {
                                context: "deduplication table",
                            });
                        }
                        ddt_block_offset = Some(entry.offset);
                        ddt = Some(DdtBacking::File(backing));
                    } else {
                        let mut stored = vec![0u8; ddt_header.stored_length as usize];
                        file.read_exact(&mut stored)?;
                        if crc64_of(&stored) != ddt_header.crc64_stored {
                            return Err(ImageError::ChecksumMismatch {
                                context: "deduplication table",
                            });
                        }
                        let raw = get_codec(ddt_header.compression)?.decompress(&stored)?;
                        ddt = Some(DdtBacking::Memory(InMemoryDdt::from_bytes(&raw)?));
                    }
                }
                BlockKind::CdFixTable => {
                    match Self::read_fix_table(&mut file, entry.offset, sector_count) {
                        Ok((CdFixKind::Prefix, table)) => prefix_table = Some(table),
                        Ok((CdFixKind::Suffix, table)) => suffix_table = Some(table),
                        Err(e) => warn!(offset = entry.offset, error = %e, "skipping CD fix table"),
                    }
                }
                BlockKind::DataBlock => match Self::read_data_block(&mut file, entry.offset) {
                    Ok(raw) => match entry.data_kind {
                        DataKind::CdSectorPrefixCorrected => prefix_store = Some(raw),
                        DataKind::CdSectorSuffixCorrected => suffix_store = Some(raw),
                        kind => {
                            if let Some(tag) = MediaTagType::from_data_kind(kind) {
                                media_tags.insert(tag, raw);
                            } else if let Some(tag) = SectorTagType::from_data_kind(kind) {
                                tag_stores.insert(tag, raw);
                            } else {
                                warn!(?kind, "unhandled data block kind, dropping");
                            }
                        }
                    },
                    Err(e) => {
                        warn!(offset = entry.offset, error = %e, "skipping corrupt data block");
                    }
                },
                BlockKind::TracksBlock => {
                    file.seek(SeekFrom::Start(entry.offset))?;
                    match read_tracks_block(&mut file) {
                        Ok(t) => tracks = t,
                        Err(e) => warn!(error = %e, "skipping corrupt track list"),
                    }
                }
                BlockKind::GeometryBlock => {
                    file.seek(SeekFrom::Start(entry.offset))?;
                    match Geometry::read(&mut file) {
                        Ok(g) => geometry = Some(g),
                        Err(e) => warn!(error = %e, "skipping corrupt geometry block"),
                    }
                }
                BlockKind::MetadataBlock => {
                    file.seek(SeekFrom::Start(entry.offset))?;
                    match read_metadata_block(&mut file) {
                        Ok(blob) => cicm_metadata = Some(blob),
                        Err(e) => warn!(error = %e, "skipping corrupt metadata block"),
                    }
                }
                BlockKind::DumpBlock => {
                    file.seek(SeekFrom::Start(entry.offset))?;
                    match read_provenance_block(&mut file) {
                        Ok(entries) => dump_provenance = entries,
                        Err(e) => warn!(error = %e, "skipping corrupt dump provenance"),
                    }
                }
                // Whole-image hashing is not resumed on append; the old
                // checksum block is dropped.
                BlockKind::ChecksumBlock | BlockKind::Index => {}
            }
        }

        let ddt = ddt.ok_or(ImageError::MissingDeduplicationTable)?;

        let (cd_prefix, cd_suffix) = match (prefix_table, suffix_table) {
            (Some(p), Some(s)) => (
                Some(CdFixStore::from_parts(
                    p,
                    prefix_store.unwrap_or_default(),
                    PREFIX_SIZE,
                )?),
                Some(CdFixStore::from_parts(
                    s,
                    suffix_store.unwrap_or_default(),
                    SUFFIX_SIZE,
                )?),
            ),
            (None, None) => (None, None),
            _ => {
                warn!("only one CD fix table present, discarding both");
                (None, None)
            }
        };

        let data_end = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file,
            header,
            options,
            media,
            sector_count,
            sector_size,
            appending: true,
            data_end,
            shift,
            ddt,
            ddt_block_offset,
            dedup: HashMap::new(),
            open_block: None,
            ecc: EccTables::new(),
            tracks,
            geometry,
            media_tags,
            tag_stores,
            cicm_metadata,
            dump_provenance,
            cd_prefix,
            cd_suffix,
            checksums: ChecksumAccumulator::disabled(),
        })
    }

    fn read_fix_table(
        file: &mut File,
        offset: u64,
        sector_count: u64,
    ) -> Result<(CdFixKind, Vec<u32>)> {
        file.seek(SeekFrom::Start(offset))?;
        let header = CdFixHeader::read(&mut *file)?;
        // A table that does not cover every sector would be indexed out of
        // bounds on the next classification.
        if header.entries != sector_count {
            return Err(ImageError::SectorCountMismatch {
                found: header.entries,
                requested: sector_count,
            });
        }
        let mut stored = vec![0u8; header.stored_length as usize];
        file.read_exact(&mut stored)?;
        if crc64_of(&stored) != header.crc64_stored {
            return Err(ImageError::ChecksumMismatch {
                context: "CD fix table",
            });
        }
        let raw = if header.compression == CompressionId::None {
            stored
        } else {
            get_codec(header.compression)?.decompress(&stored)?
        };
        if raw.len() != header.entries as usize * 4 {
            return Err(ImageError::ChecksumMismatch {
                context: "CD fix table length",
            });
        }
        Ok((header.table_kind, CdFixStore::parse_table(&raw)))
    }

    /// Read back an auxiliary data block, verifying both CRCs.
    fn read_data_block(file: &mut File, offset: u64) -> Result<Vec<u8>> {
        file.seek(SeekFrom::Start(offset))?;
        let header = BlockHeader::read(&mut *file)?;
        let mut stored = vec![0u8; header.stored_length as usize];
        file.read_exact(&mut stored)?;
        if crc64_of(&stored) != header.crc64_stored {
            return Err(ImageError::ChecksumMismatch {
                context: "data block (stored)",
            });
        }
        let raw = if header.compression == CompressionId::None {
            stored
        } else {
            get_codec(header.compression)?.decompress(&stored)?
        };
        if raw.len() as u64 != header.raw_length || crc64_of(&raw) != header.crc64_raw {
            return Err(ImageError::ChecksumMismatch {
                context: "data block (raw)",
            });
        }
        Ok(raw)
    }

    // ── Setters ──────────────────────────────────────────────────────────

    pub fn write_media_tag(&mut self, tag: MediaTagType, data: &[u8]) -> Result<()> {
        let class_ok = if tag.is_cd_tag() {
            self.media.is_cd()
        } else {
            matches!(self.media, MediaType::Dvd | MediaType::BluRay)
        };
        if !class_ok {
            return Err(ImageError::NotOpticalMedia(self.media));
        }
        self.media_tags.insert(tag, data.to_vec());
        Ok(())
    }

    pub fn set_geometry(&mut self, cylinders: u32, heads: u32, sectors_per_track: u32) -> Result<()> {
        if cylinders == 0 || heads == 0 || sectors_per_track == 0 {
            return Err(ImageError::InvalidOption("zero geometry component".into()));
        }
        self.geometry = Some(Geometry {
            cylinders,
            heads,
            sectors_per_track,
        });
        Ok(())
    }

    pub fn set_tracks(&mut self, tracks: Vec<Track>) -> Result<()> {
        if !self.media.is_optical() {
            return Err(ImageError::NotOpticalMedia(self.media));
        }
        self.tracks = tracks;
        Ok(())
    }

    pub fn set_dump_provenance(&mut self, entries: Vec<DumpHardware>) -> Result<()> {
        self.dump_provenance = entries;
        Ok(())
    }

    pub fn set_cicm_metadata(&mut self, blob: &[u8]) -> Result<()> {
        self.cicm_metadata = Some(blob.to_vec());
        Ok(())
    }

    // ── Sector writes ────────────────────────────────────────────────────

    pub fn write_sector(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.check_bounds(address)?;
        if data.len() != self.sector_size as usize {
            return Err(ImageError::WrongSectorSize {
                expected: self.sector_size as usize,
                got: data.len(),
            });
        }
        self.checksums.feed(address, data);
        self.write_sector_inner(address, data, false)
    }

    pub fn write_sectors(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let size = self.sector_size as usize;
        if data.is_empty() || data.len() % size != 0 {
            return Err(ImageError::WrongSectorSize {
                expected: size,
                got: data.len(),
            });
        }
        for (i, chunk) in data.chunks(size).enumerate() {
            self.write_sector(address + i as u64, chunk)?;
        }
        Ok(())
    }

    /// Write one raw 2352-byte optical sector, demultiplexed by the track
    /// covering `address`.
    pub fn write_sector_long(&mut self, address: u64, data: &[u8]) -> Result<()> {
        if !self.media.is_cd() {
            return Err(ImageError::NotOpticalMedia(self.media));
        }
        self.check_bounds(address)?;
        if data.len() != RAW_SECTOR_SIZE {
            return Err(ImageError::WrongSectorSize {
                expected: RAW_SECTOR_SIZE,
                got: data.len(),
            });
        }
        let track = self
            .tracks
            .iter()
            .find(|t| t.contains(address))
            .ok_or(ImageError::NoTrackForSector(address))?;
        let class = TrackClass::resolve(track.track_type);
        let session = track.session;

        self.checksums.feed(address, data);

        match class {
            TrackClass::Audio => {
                let use_audio = self.audio_codec_allowed(session);
                self.write_sector_inner(address, data, use_audio)
            }
            TrackClass::PlainData => self.write_sector_inner(address, data, false),
            TrackClass::CdMode1 => {
                self.ensure_fix_stores();
                self.classify_prefix(address, data, 1)?;
                if mode1_suffix_is_correct(&self.ecc, data) {
                    self.suffix_sentinel(address, cdfix::CORRECT);
                } else {
                    self.suffix_anomaly(address, &data[0x810..])?;
                }
                self.write_sector_inner(address, &data[0x10..0x810], false)
            }
            TrackClass::CdMode2 => {
                self.ensure_fix_stores();
                self.classify_prefix(address, data, 2)?;
                self.store_subheader(address, &data[0x10..0x18]);
                let form = mode2_classify(&self.ecc, data);
                let (sentinel, payload): (u32, &[u8]) = match form {
                    Mode2Form::Form1 => (
                        cdfix::MODE2_FORM1_OK,
                        &data[0x18..0x18 + MODE2_FORM1_DATA_SIZE],
                    ),
                    Mode2Form::Form2 => (
                        cdfix::MODE2_FORM2_OK,
                        &data[0x18..0x18 + MODE2_FORM2_DATA_SIZE],
                    ),
                    Mode2Form::Form2NoEdc => (
                        cdfix::MODE2_FORM2_NO_CRC,
                        &data[0x18..0x18 + MODE2_FORM2_DATA_SIZE],
                    ),
                    Mode2Form::Verbatim => (
                        cdfix::MODE2_VERBATIM,
                        &data[0x18..0x18 + MODE2_RAW_DATA_SIZE],
                    ),
                };
                self.suffix_sentinel(address, sentinel);
                self.write_sector_inner(address, payload, false)
            }
        }
    }

    pub fn write_sectors_long(&mut self, address: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() || data.len() % RAW_SECTOR_SIZE != 0 {
            return Err(ImageError::WrongSectorSize {
                expected: RAW_SECTOR_SIZE,
                got: data.len(),
            });
        }
        for (i, chunk) in data.chunks(RAW_SECTOR_SIZE).enumerate() {
            self.write_sector_long(address + i as u64, chunk)?;
        }
        Ok(())
    }

    pub fn write_sector_tag(
        &mut self,
        address: u64,
        tag: SectorTagType,
        data: &[u8],
    ) -> Result<()> {
        if !self.media.is_cd() {
            return Err(ImageError::NotOpticalMedia(self.media));
        }
        self.check_bounds(address)?;
        if data.len() != tag.size() {
            return Err(ImageError::WrongSectorSize {
                expected: tag.size(),
                got: data.len(),
            });
        }
        let sector_count = self.sector_count as usize;
        let store = self
            .tag_stores
            .entry(tag)
            .or_insert_with(|| vec![0u8; sector_count * tag.size()]);
        let start = address as usize * tag.size();
        store[start..start + tag.size()].copy_from_slice(data);
        Ok(())
    }

    pub fn write_sectors_tag(
        &mut self,
        address: u64,
        tag: SectorTagType,
        data: &[u8],
    ) -> Result<()> {
        if data.is_empty() || data.len() % tag.size() != 0 {
            return Err(ImageError::WrongSectorSize {
                expected: tag.size(),
                got: data.len(),
            });
        }
        for (i, chunk) in data.chunks(tag.size()).enumerate() {
            self.write_sector_tag(address + i as u64, tag, chunk)?;
        }
        Ok(())
    }

    // ── Accessors (diagnostics and read-back) ────────────────────────────

    pub fn media_type(&self) -> MediaType {
        self.media
    }

    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }

    pub fn is_appending(&self) -> bool {
        self.appending
    }

    /// Raw DDT locator for `address` (0 = never written).
    pub fn ddt_locator(&mut self, address: u64) -> Result<u64> {
        self.ddt.get(address)
    }

    pub fn group_shift(&self) -> u8 {
        self.shift
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    pub fn media_tag(&self, tag: MediaTagType) -> Option<&[u8]> {
        self.media_tags.get(&tag).map(Vec::as_slice)
    }

    pub fn cicm_metadata(&self) -> Option<&[u8]> {
        self.cicm_metadata.as_deref()
    }

    pub fn dump_provenance(&self) -> &[DumpHardware] {
        &self.dump_provenance
    }

    pub fn sector_tag(&self, address: u64, tag: SectorTagType) -> Option<&[u8]> {
        let start = address as usize * tag.size();
        self.tag_stores
            .get(&tag)
            .and_then(|store| store.get(start..start + tag.size()))
    }

    pub fn cd_prefix_store(&self) -> Option<&CdFixStore> {
        self.cd_prefix.as_ref()
    }

    pub fn cd_suffix_store(&self) -> Option<&CdFixStore> {
        self.cd_suffix.as_ref()
    }

    // ── Block compression manager ────────────────────────────────────────

    fn write_sector_inner(&mut self, address: u64, data: &[u8], use_audio: bool) -> Result<()> {
        let all_zero = data.iter().all(|&b| b == 0);
        // Empty sectors are common and cheap to dedup, so they always
        // participate even when content hashing is off.
        let key = if self.options.dedup || all_zero {
            Some(*blake3::hash(data).as_bytes())
        } else {
            None
        };
        if let Some(k) = &key {
            if let Some(&locator) = self.dedup.get(k) {
                return self.ddt.set(address, locator);
            }
        }

        let size = data.len() as u32;
        let capacity = 1u32 << self.shift;
        let incompatible = match &self.open_block {
            Some(block) => {
                block.sector_size != size
                    || block.count >= capacity
                    || block.use_audio != use_audio
            }
            None => false,
        };
        if incompatible {
            self.close_open_block()?;
        }

        let offset = self.data_end;
        let block = self
            .open_block
            .get_or_insert_with(|| OpenBlock::new(offset, size, use_audio));
        let position = block.count;
        block.buf.extend_from_slice(data);
        block.count += 1;
        let block_offset = block.offset;

        let locator = encode_locator(block_offset, position, self.shift);
        self.ddt.set(address, locator)?;
        if let Some(k) = key {
            self.dedup.insert(k, locator);
        }
        Ok(())
    }

    /// Flush the open block: pick a codec, fall back to storing raw when
    /// compression does not shrink the data, write header + payload.
    fn close_open_block(&mut self) -> Result<()> {
        let block = match self.open_block.take() {
            Some(block) => block,
            None => return Ok(()),
        };
        let raw = block.buf;
        let raw_length = raw.len() as u64;
        let crc64_raw = crc64_of(&raw);

        let mut chosen: Option<(CompressionId, Vec<u8>)> = None;
        if self.options.compress {
            if block.use_audio {
                let mut sink = AudioSink::new();
                sink.feed(&raw)?;
                let flac = sink.finalize()?;
                if (flac.len() as u64) < raw_length {
                    chosen = Some((CompressionId::Flac, flac));
                }
            } else if self.options.generic_codec != CompressionId::None {
                let codec = get_codec(self.options.generic_codec)?;
                let packed = codec.compress(&raw, self.options.compression_level)?;
                if (packed.len() as u64) < raw_length {
                    chosen = Some((self.options.generic_codec, packed));
                }
            }
        }
        let (compression, payload) = match chosen {
            Some(pair) => pair,
            None => (CompressionId::None, raw),
        };

        let header = BlockHeader {
            data_kind: DataKind::UserData,
            compression,
            sector_size: block.sector_size,
            raw_length,
            stored_length: payload.len() as u64,
            crc64_raw,
            crc64_stored: crc64_of(&payload),
        };
        self.file.seek(SeekFrom::Start(block.offset))?;
        header.write(&mut self.file)?;
        self.file.write_all(&payload)?;
        self.data_end = block.offset + BLOCK_HEADER_SIZE as u64 + payload.len() as u64;
        Ok(())
    }

    // ── CD fix plumbing ──────────────────────────────────────────────────

    fn ensure_fix_stores(&mut self) {
        if self.cd_prefix.is_none() {
            self.cd_prefix = Some(CdFixStore::new(self.sector_count, PREFIX_SIZE));
        }
        if self.cd_suffix.is_none() {
            self.cd_suffix = Some(CdFixStore::new(self.sector_count, SUFFIX_SIZE));
        }
    }

    fn classify_prefix(&mut self, address: u64, data: &[u8], mode: u8) -> Result<()> {
        let correct = prefix_is_correct(data, address, mode);
        if let Some(store) = self.cd_prefix.as_mut() {
            if correct {
                store.set_sentinel(address, cdfix::CORRECT);
            } else {
                store.set_anomaly(address, &data[..PREFIX_SIZE])?;
            }
        }
        Ok(())
    }

    fn suffix_sentinel(&mut self, address: u64, sentinel: u32) {
        if let Some(store) = self.cd_suffix.as_mut() {
            store.set_sentinel(address, sentinel);
        }
    }

    fn suffix_anomaly(&mut self, address: u64, fragment: &[u8]) -> Result<()> {
        if let Some(store) = self.cd_suffix.as_mut() {
            store.set_anomaly(address, fragment)?;
        }
        Ok(())
    }

    fn store_subheader(&mut self, address: u64, subheader: &[u8]) {
        let tag = SectorTagType::CdSectorSubHeader;
        let sector_count = self.sector_count as usize;
        let store = self
            .tag_stores
            .entry(tag)
            .or_insert_with(|| vec![0u8; sector_count * tag.size()]);
        let start = address as usize * tag.size();
        store[start..start + tag.size()].copy_from_slice(subheader);
    }

    fn audio_codec_allowed(&self, session: u8) -> bool {
        if !self.options.compress || !self.options.compress_audio {
            return false;
        }
        match self.options.audio_fallback {
            SessionFallback::Never => true,
            SessionFallback::AboveSession(limit) => session <= limit,
            SessionFallback::MediaDefault => {
                self.media != MediaType::JaguarCd || session <= 1
            }
        }
    }

    fn check_bounds(&self, address: u64) -> Result<()> {
        if address >= self.sector_count {
            return Err(ImageError::SectorOutOfRange {
                address,
                total: self.sector_count,
            });
        }
        Ok(())
    }

    // ── Close ────────────────────────────────────────────────────────────

    /// Flush everything, serialize one block per populated auxiliary
    /// category, append the index and rewrite the header. Consumes the
    /// handle; the underlying file is closed on return.
    pub fn close(mut self) -> Result<()> {
        self.close_open_block()?;

        let mut index = Index::default();

        let tag_stores = std::mem::take(&mut self.tag_stores);
        for (tag, store) in &tag_stores {
            let offset = self.write_data_block(tag.data_kind(), store, tag.size() as u32)?;
            index.replace(IndexEntry {
                block_kind: BlockKind::DataBlock,
                data_kind: tag.data_kind(),
                offset,
            });
        }

        let cd_prefix = self.cd_prefix.take();
        let cd_suffix = self.cd_suffix.take();
        if let (Some(prefix), Some(suffix)) = (&cd_prefix, &cd_suffix) {
            if prefix.is_populated() || suffix.is_populated() {
                self.write_fix_pair(&mut index, CdFixKind::Prefix, prefix)?;
                self.write_fix_pair(&mut index, CdFixKind::Suffix, suffix)?;
            }
        }

        // Deduplication table.
        match &mut self.ddt {
            DdtBacking::Memory(table) => {
                let raw = table.to_bytes();
                let raw_length = raw.len() as u64;
                let mut chosen: Option<(CompressionId, Vec<u8>)> = None;
                if self.options.compress && self.options.generic_codec != CompressionId::None {
                    let packed = get_codec(self.options.generic_codec)?
                        .compress(&raw, self.options.compression_level)?;
                    if (packed.len() as u64) < raw_length {
                        chosen = Some((self.options.generic_codec, packed));
                    }
                }
                let (compression, payload) = match chosen {
                    Some(pair) => pair,
                    None => (CompressionId::None, raw),
                };
                let header = DdtHeader {
                    entry_width: 8,
                    shift: self.shift,
                    compression,
                    entries: self.sector_count,
                    raw_length,
                    stored_length: payload.len() as u64,
                    crc64_stored: crc64_of(&payload),
                };
                let offset = self.data_end;
                self.file.seek(SeekFrom::Start(offset))?;
                header.write(&mut self.file)?;
                self.file.write_all(&payload)?;
                self.data_end = offset + DDT_HEADER_SIZE as u64 + payload.len() as u64;
                index.replace(IndexEntry {
                    block_kind: BlockKind::DeduplicationTable,
                    data_kind: DataKind::UserDataDdt,
                    offset,
                });
            }
            DdtBacking::File(table) => {
                let crc = table.crc64()?;
                let offset = match self.ddt_block_offset {
                    Some(offset) => offset,
                    None => {
                        return Err(ImageError::MissingDeduplicationTable);
                    }
                };
                let header = DdtHeader {
                    entry_width: 8,
                    shift: self.shift,
                    compression: CompressionId::None,
                    entries: self.sector_count,
                    raw_length: self.sector_count * 8,
                    stored_length: self.sector_count * 8,
                    crc64_stored: crc,
                };
                self.file.seek(SeekFrom::Start(offset))?;
                header.write(&mut self.file)?;
                index.replace(IndexEntry {
                    block_kind: BlockKind::DeduplicationTable,
                    data_kind: DataKind::UserDataDdt,
                    offset,
                });
            }
        }

        let media_tags = std::mem::take(&mut self.media_tags);
        for (tag, blob) in &media_tags {
            let offset = self.write_data_block(tag.data_kind(), blob, 0)?;
            index.replace(IndexEntry {
                block_kind: BlockKind::DataBlock,
                data_kind: tag.data_kind(),
                offset,
            });
        }

        if let Some(geometry) = self.geometry {
            let mut buf = Vec::with_capacity(16);
            geometry.write(&mut buf)?;
            let offset = self.append_bytes(&buf)?;
            index.replace(IndexEntry {
                block_kind: BlockKind::GeometryBlock,
                data_kind: DataKind::Geometry,
                offset,
            });
        }

        if !self.dump_provenance.is_empty() {
            let mut buf = Vec::new();
            write_provenance_block(&mut buf, &self.dump_provenance)?;
            let offset = self.append_bytes(&buf)?;
            index.replace(IndexEntry {
                block_kind: BlockKind::DumpBlock,
                data_kind: DataKind::DumpProvenance,
                offset,
            });
        }

        if let Some(blob) = self.cicm_metadata.take() {
            let mut buf = Vec::with_capacity(blob.len() + 8);
            write_metadata_block(&mut buf, &blob)?;
            let offset = self.append_bytes(&buf)?;
            index.replace(IndexEntry {
                block_kind: BlockKind::MetadataBlock,
                data_kind: DataKind::CicmMetadata,
                offset,
            });
        }

        if !self.tracks.is_empty() {
            let mut buf = Vec::new();
            write_tracks_block(&mut buf, &self.tracks)?;
            let offset = self.append_bytes(&buf)?;
            index.replace(IndexEntry {
                block_kind: BlockKind::TracksBlock,
                data_kind: DataKind::TrackList,
                offset,
            });
        }

        let checksums =
            std::mem::replace(&mut self.checksums, ChecksumAccumulator::disabled());
        let entries = checksums.finalize();
        if !entries.is_empty() {
            let mut buf = Vec::new();
            write_checksum_block(&mut buf, &entries)?;
            let offset = self.append_bytes(&buf)?;
            index.replace(IndexEntry {
                block_kind: BlockKind::ChecksumBlock,
                data_kind: DataKind::ImageChecksums,
                offset,
            });
        }

        // Index last, then patch the header in place.
        let index_offset = self.data_end;
        self.file.seek(SeekFrom::Start(index_offset))?;
        index.write(&mut self.file)?;
        self.header.index_offset = index_offset;
        self.header.last_written = Utc::now().timestamp();
        self.file.seek(SeekFrom::Start(0))?;
        self.header.write(&mut self.file)?;
        self.file.sync_all()?;
        Ok(())
    }

    fn write_fix_pair(
        &mut self,
        index: &mut Index,
        kind: CdFixKind,
        store: &CdFixStore,
    ) -> Result<()> {
        let table = store.table_bytes();
        let raw_length = table.len() as u64;
        let mut chosen: Option<(CompressionId, Vec<u8>)> = None;
        if self.options.compress && self.options.generic_codec != CompressionId::None {
            let packed = get_codec(self.options.generic_codec)?
                .compress(&table, self.options.compression_level)?;
            if (packed.len() as u64) < raw_length {
                chosen = Some((self.options.generic_codec, packed));
            }
        }
        let (compression, payload) = match chosen {
            Some(pair) => pair,
            None => (CompressionId::None, table),
        };
        let header = CdFixHeader {
            table_kind: kind,
            compression,
            entries: self.sector_count,
            raw_length,
            stored_length: payload.len() as u64,
            crc64_stored: crc64_of(&payload),
        };
        let offset = self.data_end;
        self.file.seek(SeekFrom::Start(offset))?;
        header.write(&mut self.file)?;
        self.file.write_all(&payload)?;
        self.data_end = offset + CD_FIX_HEADER_SIZE as u64 + payload.len() as u64;

        let data_kind = match kind {
            CdFixKind::Prefix => DataKind::CdSectorPrefixCorrected,
            CdFixKind::Suffix => DataKind::CdSectorSuffixCorrected,
        };
        index.replace(IndexEntry {
            block_kind: BlockKind::CdFixTable,
            data_kind,
            offset,
        });

        if store.fragment_count() > 0 {
            let fragment_size = match kind {
                CdFixKind::Prefix => PREFIX_SIZE,
                CdFixKind::Suffix => SUFFIX_SIZE,
            };
            let offset =
                self.write_data_block(data_kind, store.store_bytes(), fragment_size as u32)?;
            index.replace(IndexEntry {
                block_kind: BlockKind::DataBlock,
                data_kind,
                offset,
            });
        }
        Ok(())
    }

    /// Write an auxiliary payload as a data block (compressed when it
    /// shrinks) and return the header's file offset.
    fn write_data_block(
        &mut self,
        data_kind: DataKind,
        raw: &[u8],
        sector_size: u32,
    ) -> Result<u64> {
        let raw_length = raw.len() as u64;
        let mut chosen: Option<(CompressionId, Vec<u8>)> = None;
        if self.options.compress && self.options.generic_codec != CompressionId::None {
            let packed = get_codec(self.options.generic_codec)?
                .compress(raw, self.options.compression_level)?;
            if (packed.len() as u64) < raw_length {
                chosen = Some((self.options.generic_codec, packed));
            }
        }
        let (compression, payload) = match chosen {
            Some(pair) => pair,
            None => (CompressionId::None, raw.to_vec()),
        };
        let header = BlockHeader {
            data_kind,
            compression,
            sector_size,
            raw_length,
            stored_length: payload.len() as u64,
            crc64_raw: crc64_of(raw),
            crc64_stored: crc64_of(&payload),
        };
        let offset = self.data_end;
        self.file.seek(SeekFrom::Start(offset))?;
        header.write(&mut self.file)?;
        self.file.write_all(&payload)?;
        self.data_end = offset + BLOCK_HEADER_SIZE as u64 + payload.len() as u64;
        Ok(offset)
    }

    fn append_bytes(&mut self, bytes: &[u8]) -> Result<u64> {
        let offset = self.data_end;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        self.data_end = offset + bytes.len() as u64;
        Ok(offset)
    }
}
