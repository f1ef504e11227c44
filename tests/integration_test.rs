//! End-to-end lifecycle tests: write an image, close it, then reparse the
//! file with the public layout types and check every byte landed where the
//! format says it must.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use sectorpack::block::{crc64_of, BlockHeader, CdFixHeader, CdFixKind, DdtHeader};
use sectorpack::cdfix;
use sectorpack::checksum::read_checksum_block;
use sectorpack::codec::get_codec;
use sectorpack::ddt::decode_locator;
use sectorpack::ecc::sector::{
    regenerate_mode1_suffix, regenerate_prefix, MODE2_FORM1_DATA_SIZE, MODE2_FORM2_DATA_SIZE,
    RAW_SECTOR_SIZE, SUFFIX_SIZE,
};
use sectorpack::ecc::{
    EccTables, P_INC, P_MAJOR, P_MINOR, P_MULT, Q_INC, Q_MAJOR, Q_MINOR, Q_MULT,
};
use sectorpack::header::ContainerHeader;
use sectorpack::index::{BlockKind, DataKind, Index};
use sectorpack::meta::read_provenance_block;
use sectorpack::track::read_tracks_block;
use sectorpack::{
    ChecksumAlgorithm, CompressionId, CreateOptions, DumpHardware, ImageError, ImageWriter,
    MediaTagType, MediaType, SectorTagType, Track, TrackType,
};

// ── Reparsing helpers ─────────────────────────────────────────────────────

fn open_index(path: &Path) -> (File, ContainerHeader, Index) {
    let mut file = File::open(path).unwrap();
    let header = ContainerHeader::read(&mut file).unwrap();
    file.seek(SeekFrom::Start(header.index_offset)).unwrap();
    let index = Index::read(&mut file).unwrap();
    (file, header, index)
}

fn read_stored(file: &mut File, offset: u64) -> (BlockHeader, Vec<u8>) {
    file.seek(SeekFrom::Start(offset)).unwrap();
    let header = BlockHeader::read(&mut *file).unwrap();
    let mut stored = vec![0u8; header.stored_length as usize];
    file.read_exact(&mut stored).unwrap();
    (header, stored)
}

fn read_raw_block(file: &mut File, offset: u64) -> (BlockHeader, Vec<u8>) {
    let (header, stored) = read_stored(file, offset);
    let raw = match header.compression {
        CompressionId::None => stored,
        id => get_codec(id).unwrap().decompress(&stored).unwrap(),
    };
    assert_eq!(raw.len() as u64, header.raw_length);
    (header, raw)
}

fn load_ddt(file: &mut File, index: &Index) -> (Vec<u64>, u8) {
    let entry = index
        .find(BlockKind::DeduplicationTable, DataKind::UserDataDdt)
        .expect("image has no deduplication table");
    file.seek(SeekFrom::Start(entry.offset)).unwrap();
    let header = DdtHeader::read(&mut *file).unwrap();
    assert_eq!(header.entry_width, 8);
    let mut stored = vec![0u8; header.stored_length as usize];
    file.read_exact(&mut stored).unwrap();
    let raw = match header.compression {
        CompressionId::None => stored,
        id => get_codec(id).unwrap().decompress(&stored).unwrap(),
    };
    let entries = raw
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect();
    (entries, header.shift)
}

/// Resolve one sector through the DDT, exactly like a reader would.
fn read_sector_via_ddt(file: &mut File, ddt: &[u64], shift: u8, address: u64) -> Vec<u8> {
    let locator = ddt[address as usize];
    assert_ne!(locator, 0, "sector {address} was never written");
    let (offset, position) = decode_locator(locator, shift);
    let (header, raw) = read_raw_block(file, offset);
    let size = header.sector_size as usize;
    raw[position as usize * size..][..size].to_vec()
}

fn load_fix_table(file: &mut File, index: &Index, kind: CdFixKind) -> Vec<u32> {
    let data_kind = match kind {
        CdFixKind::Prefix => DataKind::CdSectorPrefixCorrected,
        CdFixKind::Suffix => DataKind::CdSectorSuffixCorrected,
    };
    let entry = index.find(BlockKind::CdFixTable, data_kind).unwrap();
    file.seek(SeekFrom::Start(entry.offset)).unwrap();
    let header = CdFixHeader::read(&mut *file).unwrap();
    assert_eq!(header.table_kind, kind);
    let mut stored = vec![0u8; header.stored_length as usize];
    file.read_exact(&mut stored).unwrap();
    let raw = match header.compression {
        CompressionId::None => stored,
        id => get_codec(id).unwrap().decompress(&stored).unwrap(),
    };
    raw.chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn hdd_sector(address: u64, size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| ((address as usize * 31 + i * 7) % 251) as u8)
        .collect()
}

fn mode1_sector(tables: &EccTables, lba: u64) -> Vec<u8> {
    let mut sector = vec![0u8; RAW_SECTOR_SIZE];
    sector[..16].copy_from_slice(&regenerate_prefix(lba, 1));
    for i in 0..2048 {
        sector[0x10 + i] = ((lba as usize * 13 + i) % 239) as u8;
    }
    let suffix = regenerate_mode1_suffix(tables, &sector);
    sector[0x810..].copy_from_slice(&suffix);
    sector
}

fn mode2_form1_sector(tables: &EccTables, lba: u64) -> Vec<u8> {
    let mut sector = vec![0u8; RAW_SECTOR_SIZE];
    sector[..16].copy_from_slice(&regenerate_prefix(lba, 2));
    sector[0x12] = 0x08; // submode: data, form 1
    sector[0x16] = 0x08;
    for i in 0..MODE2_FORM1_DATA_SIZE {
        sector[0x18 + i] = ((lba as usize + i * 3) % 253) as u8;
    }
    let edc = tables.edc(0, &sector[0x10..0x818]);
    sector[0x818..0x81C].copy_from_slice(&edc.to_le_bytes());
    let zero = [0u8; 4];
    let (head, tail) = sector.split_at_mut(0x81C);
    tables.compute_pq(
        &zero,
        &head[0x10..],
        P_MAJOR,
        P_MINOR,
        P_MULT,
        P_INC,
        &mut tail[..2 * P_MAJOR],
    );
    let (head, tail) = sector.split_at_mut(0x8C8);
    tables.compute_pq(
        &zero,
        &head[0x10..],
        Q_MAJOR,
        Q_MINOR,
        Q_MULT,
        Q_INC,
        &mut tail[..2 * Q_MAJOR],
    );
    sector
}

fn mode2_form2_sector(tables: &EccTables, lba: u64) -> Vec<u8> {
    let mut sector = vec![0u8; RAW_SECTOR_SIZE];
    sector[..16].copy_from_slice(&regenerate_prefix(lba, 2));
    sector[0x12] = 0x20; // submode: form 2
    sector[0x16] = 0x20;
    for i in 0..MODE2_FORM2_DATA_SIZE {
        sector[0x18 + i] = ((lba as usize * 7 + i) % 241) as u8;
    }
    let edc = tables.edc(0, &sector[0x10..0x92C]);
    sector[0x92C..0x930].copy_from_slice(&edc.to_le_bytes());
    sector
}

// ── Block device lifecycle ────────────────────────────────────────────────

#[test]
fn hdd_image_roundtrips_sectors_and_checksums() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    let sector_size = 512u32;
    let count = 32u64;

    let mut writer = ImageWriter::create(
        &path,
        MediaType::GenericHdd,
        CreateOptions::default(),
        count,
        sector_size,
    )
    .unwrap();
    assert!(!writer.is_appending());

    let mut logical = Vec::new();
    for address in 0..count {
        let data = hdd_sector(address, sector_size as usize);
        writer.write_sector(address, &data).unwrap();
        logical.extend_from_slice(&data);
    }
    writer.set_geometry(4, 2, 4).unwrap();
    writer
        .set_dump_provenance(vec![DumpHardware {
            manufacturer: "Seagate".into(),
            model: "ST-225".into(),
            serial: "S42".into(),
            software_name: "dumper".into(),
            software_version: "0.1".into(),
            operating_system: "Linux".into(),
            extents: vec![(0, count - 1)],
        }])
        .unwrap();
    writer.close().unwrap();

    let (mut file, header, index) = open_index(&path);
    assert_eq!(header.media_type, MediaType::GenericHdd);
    let (ddt, shift) = load_ddt(&mut file, &index);
    assert_eq!(ddt.len() as u64, count);
    for address in 0..count {
        assert_eq!(
            read_sector_via_ddt(&mut file, &ddt, shift, address),
            hdd_sector(address, sector_size as usize)
        );
    }

    // Whole-image digests cover the logical sector stream in order.
    let entry = index
        .find(BlockKind::ChecksumBlock, DataKind::ImageChecksums)
        .unwrap();
    file.seek(SeekFrom::Start(entry.offset)).unwrap();
    let checksums = read_checksum_block(&mut file).unwrap();
    let md5 = checksums
        .iter()
        .find(|c| c.algorithm == ChecksumAlgorithm::Md5)
        .unwrap();
    use md5::{Digest, Md5};
    assert_eq!(md5.digest, Md5::digest(&logical).to_vec());

    let entry = index
        .find(BlockKind::DumpBlock, DataKind::DumpProvenance)
        .unwrap();
    file.seek(SeekFrom::Start(entry.offset)).unwrap();
    let provenance = read_provenance_block(&mut file).unwrap();
    assert_eq!(provenance[0].model, "ST-225");
    assert_eq!(provenance[0].extents, vec![(0, count - 1)]);
}

#[test]
fn identical_sectors_share_one_locator() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dedup.img");
    let mut writer = ImageWriter::create(
        &path,
        MediaType::FlashDrive,
        CreateOptions::default(),
        8,
        512,
    )
    .unwrap();

    let payload = vec![0x5Au8; 512];
    writer.write_sector(0, &payload).unwrap();
    writer.write_sector(1, &hdd_sector(1, 512)).unwrap();
    writer.write_sector(5, &payload).unwrap();

    let first = writer.ddt_locator(0).unwrap();
    let repeat = writer.ddt_locator(5).unwrap();
    let other = writer.ddt_locator(1).unwrap();
    assert_eq!(first, repeat);
    assert_ne!(first, other);
    writer.close().unwrap();
}

#[test]
fn all_zero_sectors_dedup_even_when_hashing_is_off() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zeros.img");
    let options = CreateOptions {
        dedup: false,
        ..CreateOptions::default()
    };
    let mut writer =
        ImageWriter::create(&path, MediaType::GenericHdd, options, 8, 512).unwrap();

    let zeros = vec![0u8; 512];
    writer.write_sector(0, &zeros).unwrap();
    writer.write_sector(3, &zeros).unwrap();
    assert_eq!(
        writer.ddt_locator(0).unwrap(),
        writer.ddt_locator(3).unwrap()
    );
    writer.close().unwrap();
}

// ── Append mode ───────────────────────────────────────────────────────────

#[test]
fn append_reloads_auxiliary_state_and_extends_the_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resume.img");
    let count = 16u64;

    let mut writer = ImageWriter::create(
        &path,
        MediaType::GenericHdd,
        CreateOptions::default(),
        count,
        512,
    )
    .unwrap();
    for address in 0..8 {
        writer.write_sector(address, &hdd_sector(address, 512)).unwrap();
    }
    writer.set_geometry(8, 1, 2).unwrap();
    writer.close().unwrap();

    // Wrong media type must be rejected before anything is touched.
    let err = ImageWriter::create(
        &path,
        MediaType::Floppy,
        CreateOptions::default(),
        count,
        512,
    )
    .unwrap_err();
    assert!(matches!(err, ImageError::MediaTypeMismatch { .. }));

    // Wrong sector count is just as fatal.
    let err = ImageWriter::create(
        &path,
        MediaType::GenericHdd,
        CreateOptions::default(),
        count + 1,
        512,
    )
    .unwrap_err();
    assert!(matches!(err, ImageError::SectorCountMismatch { .. }));

    let mut writer = ImageWriter::create(
        &path,
        MediaType::GenericHdd,
        CreateOptions::default(),
        count,
        512,
    )
    .unwrap();
    assert!(writer.is_appending());
    assert_eq!(
        writer.geometry().map(|g| (g.cylinders, g.heads, g.sectors_per_track)),
        Some((8, 1, 2))
    );
    // Previously written sectors stay resolvable.
    assert_ne!(writer.ddt_locator(3).unwrap(), 0);
    for address in 8..count {
        writer.write_sector(address, &hdd_sector(address, 512)).unwrap();
    }
    writer.close().unwrap();

    let (mut file, _, index) = open_index(&path);
    let (ddt, shift) = load_ddt(&mut file, &index);
    for address in 0..count {
        assert_eq!(
            read_sector_via_ddt(&mut file, &ddt, shift, address),
            hdd_sector(address, 512)
        );
    }
    // The old index was superseded, not duplicated.
    assert_eq!(
        index
            .entries
            .iter()
            .filter(|e| e.block_kind == BlockKind::GeometryBlock)
            .count(),
        1
    );
}

// ── Optical media ─────────────────────────────────────────────────────────

#[test]
fn mode1_sectors_are_demultiplexed_and_anomalies_kept_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disc.spk");
    let tables = EccTables::new();
    let count = 20u64;

    let mut writer = ImageWriter::create(
        &path,
        MediaType::CompactDisc,
        CreateOptions::default(),
        count,
        2048,
    )
    .unwrap();
    writer
        .set_tracks(vec![
            Track {
                sequence: 1,
                track_type: TrackType::CdMode1,
                start: 0,
                end: 9,
                pregap: 150,
                session: 1,
                flags: 0x04,
                isrc: None,
            },
            Track {
                sequence: 2,
                track_type: TrackType::Audio,
                start: 10,
                end: 19,
                pregap: 0,
                session: 1,
                flags: 0,
                isrc: None,
            },
        ])
        .unwrap();

    let mut sectors = Vec::new();
    for lba in 0..10u64 {
        let mut sector = mode1_sector(&tables, lba);
        if lba == 5 {
            // Damaged Q parity: the suffix no longer verifies.
            sector[0x8D0] ^= 0x40;
        }
        if lba == 7 {
            // Damaged sync: the prefix no longer verifies (the suffix was
            // regenerated over the damaged bytes, so it still does).
            sector[3] = 0xFE;
            let suffix = regenerate_mode1_suffix(&tables, &sector);
            sector[0x810..].copy_from_slice(&suffix);
        }
        writer.write_sector_long(lba, &sector).unwrap();
        sectors.push(sector);
    }
    for lba in 10..20u64 {
        // Quiet ramp so every audio sector is distinct but compressible.
        let mut sector = vec![0u8; RAW_SECTOR_SIZE];
        for (i, b) in sector.iter_mut().enumerate() {
            *b = ((lba as usize + i) % 4) as u8;
        }
        writer.write_sector_long(lba, &sector).unwrap();
        sectors.push(sector);
    }

    writer
        .write_media_tag(MediaTagType::CdFullToc, b"full toc bytes")
        .unwrap();
    writer
        .write_sector_tag(3, SectorTagType::CdSectorSubchannel, &[0x11u8; 96])
        .unwrap();

    // In-session view of the fix stores.
    let suffix_store = writer.cd_suffix_store().unwrap();
    assert_eq!(suffix_store.entry(0), cdfix::CORRECT);
    let anomaly = suffix_store.entry(5);
    assert!(anomaly > 0 && anomaly < cdfix::MODE2_VERBATIM);
    assert_eq!(
        suffix_store.fragment(anomaly).unwrap(),
        &sectors[5][0x810..]
    );
    let prefix_store = writer.cd_prefix_store().unwrap();
    assert_eq!(prefix_store.entry(0), cdfix::CORRECT);
    let bad_prefix = prefix_store.entry(7);
    assert!(bad_prefix > 0 && bad_prefix < cdfix::MODE2_VERBATIM);
    assert_eq!(prefix_store.fragment(bad_prefix).unwrap(), &sectors[7][..16]);
    assert_eq!(suffix_store.entry(7), cdfix::CORRECT);

    writer.close().unwrap();

    let (mut file, _, index) = open_index(&path);
    let (ddt, shift) = load_ddt(&mut file, &index);

    // Data sectors keep only the 2048-byte payload.
    for lba in 0..10u64 {
        assert_eq!(
            read_sector_via_ddt(&mut file, &ddt, shift, lba),
            sectors[lba as usize][0x10..0x810]
        );
    }
    // Audio sectors are stored whole, in a FLAC block.
    let (offset, _) = decode_locator(ddt[10], shift);
    let (audio_header, _) = read_stored(&mut file, offset);
    assert_eq!(audio_header.sector_size as usize, RAW_SECTOR_SIZE);
    assert_eq!(audio_header.compression, CompressionId::Flac);

    // Persisted fix tables agree with the in-session view.
    let suffix_table = load_fix_table(&mut file, &index, CdFixKind::Suffix);
    assert_eq!(suffix_table[0], cdfix::CORRECT);
    assert_eq!(suffix_table[5], anomaly);
    assert_eq!(suffix_table[12], cdfix::NOT_DUMPED); // audio sectors stay unclassified
    let side = index
        .find(BlockKind::DataBlock, DataKind::CdSectorSuffixCorrected)
        .unwrap();
    let (side_header, fragments) = read_raw_block(&mut file, side.offset);
    assert_eq!(side_header.sector_size as usize, SUFFIX_SIZE);
    let start = (anomaly as usize - 1) * SUFFIX_SIZE;
    assert_eq!(&fragments[start..start + SUFFIX_SIZE], &sectors[5][0x810..]);

    // Media tag and subchannel store.
    let toc = index.find(BlockKind::DataBlock, DataKind::CdFullToc).unwrap();
    let (_, toc_bytes) = read_raw_block(&mut file, toc.offset);
    assert_eq!(toc_bytes, b"full toc bytes");
    let sub = index
        .find(BlockKind::DataBlock, DataKind::CdSectorSubchannel)
        .unwrap();
    let (_, sub_bytes) = read_raw_block(&mut file, sub.offset);
    assert_eq!(&sub_bytes[3 * 96..4 * 96], &[0x11u8; 96]);
    assert_eq!(&sub_bytes[..96], &[0u8; 96]);

    // Track list survives.
    let entry = index.find(BlockKind::TracksBlock, DataKind::TrackList).unwrap();
    file.seek(SeekFrom::Start(entry.offset)).unwrap();
    let tracks = read_tracks_block(&mut file).unwrap();
    assert_eq!(tracks.len(), 2);
    assert_eq!(tracks[1].track_type, TrackType::Audio);
}

#[test]
fn jaguar_sessions_above_one_fall_back_to_the_generic_codec() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jaguar.spk");
    let mut writer = ImageWriter::create(
        &path,
        MediaType::JaguarCd,
        CreateOptions::default(),
        16,
        2352,
    )
    .unwrap();
    writer
        .set_tracks(vec![
            Track {
                sequence: 1,
                track_type: TrackType::Audio,
                start: 0,
                end: 7,
                pregap: 150,
                session: 1,
                flags: 0,
                isrc: None,
            },
            Track {
                sequence: 2,
                track_type: TrackType::Audio,
                start: 8,
                end: 15,
                pregap: 0,
                session: 2,
                flags: 0,
                isrc: None,
            },
        ])
        .unwrap();

    for lba in 0..16u64 {
        let mut sector = vec![0u8; RAW_SECTOR_SIZE];
        // Unique per sector so deduplication cannot cross the sessions.
        sector[..8].copy_from_slice(&lba.to_le_bytes());
        for (i, b) in sector.iter_mut().enumerate().skip(8) {
            *b = (i % 5) as u8;
        }
        writer.write_sector_long(lba, &sector).unwrap();
    }
    writer.close().unwrap();

    let (mut file, _, index) = open_index(&path);
    let (ddt, shift) = load_ddt(&mut file, &index);
    let (session1_offset, _) = decode_locator(ddt[0], shift);
    let (session2_offset, _) = decode_locator(ddt[8], shift);
    assert_ne!(session1_offset, session2_offset);

    let (first, _) = read_stored(&mut file, session1_offset);
    assert_eq!(first.compression, CompressionId::Flac);
    let (second, _) = read_stored(&mut file, session2_offset);
    assert_eq!(second.compression, CompressionId::Zstd);
}

#[test]
fn a_lone_fix_table_is_discarded_on_append() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lonefix.spk");
    let tables = EccTables::new();

    let mut writer = ImageWriter::create(
        &path,
        MediaType::CompactDisc,
        CreateOptions::default(),
        8,
        2048,
    )
    .unwrap();
    writer
        .set_tracks(vec![Track {
            sequence: 1,
            track_type: TrackType::CdMode1,
            start: 0,
            end: 7,
            pregap: 150,
            session: 1,
            flags: 0x04,
            isrc: None,
        }])
        .unwrap();
    let mut damaged = mode1_sector(&tables, 0);
    damaged[0x8D0] ^= 0x01;
    writer.write_sector_long(0, &damaged).unwrap();
    writer.write_sector_long(1, &mode1_sector(&tables, 1)).unwrap();
    writer.close().unwrap();

    // Corrupt the suffix table payload so its CRC64 no longer matches.
    let (_, _, index) = open_index(&path);
    let entry = index
        .find(BlockKind::CdFixTable, DataKind::CdSectorSuffixCorrected)
        .unwrap();
    let payload_offset = entry.offset + 40;
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    file.seek(SeekFrom::Start(payload_offset)).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).unwrap();
    byte[0] ^= 0xFF;
    file.seek(SeekFrom::Start(payload_offset)).unwrap();
    use std::io::Write;
    file.write_all(&byte).unwrap();
    drop(file);

    // Only the prefix table survives parsing, so both are dropped.
    let writer = ImageWriter::create(
        &path,
        MediaType::CompactDisc,
        CreateOptions::default(),
        8,
        2048,
    )
    .unwrap();
    assert!(writer.is_appending());
    assert!(writer.cd_prefix_store().is_none());
    assert!(writer.cd_suffix_store().is_none());
    writer.close().unwrap();
}

#[test]
fn mode2_sectors_are_compacted_by_form() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("xa.spk");
    let tables = EccTables::new();

    let mut writer = ImageWriter::create(
        &path,
        MediaType::CompactDisc,
        CreateOptions::default(),
        8,
        2048,
    )
    .unwrap();
    writer
        .set_tracks(vec![Track {
            sequence: 1,
            track_type: TrackType::CdMode2Form1,
            start: 0,
            end: 7,
            pregap: 150,
            session: 1,
            flags: 0x04,
            isrc: None,
        }])
        .unwrap();

    let form1 = mode2_form1_sector(&tables, 0);
    let form2 = mode2_form2_sector(&tables, 1);
    let mut no_edc = mode2_form2_sector(&tables, 2);
    no_edc[0x92C..0x930].copy_from_slice(&[0u8; 4]);
    let mut verbatim = mode2_form2_sector(&tables, 3);
    verbatim[0x20] ^= 0x01; // EDC no longer matches anything

    writer.write_sector_long(0, &form1).unwrap();
    writer.write_sector_long(1, &form2).unwrap();
    writer.write_sector_long(2, &no_edc).unwrap();
    writer.write_sector_long(3, &verbatim).unwrap();

    // One sentinel per classification, correct prefixes throughout.
    let suffix_store = writer.cd_suffix_store().unwrap();
    assert_eq!(suffix_store.entry(0), cdfix::MODE2_FORM1_OK);
    assert_eq!(suffix_store.entry(1), cdfix::MODE2_FORM2_OK);
    assert_eq!(suffix_store.entry(2), cdfix::MODE2_FORM2_NO_CRC);
    assert_eq!(suffix_store.entry(3), cdfix::MODE2_VERBATIM);
    let prefix_store = writer.cd_prefix_store().unwrap();
    for lba in 0..4 {
        assert_eq!(prefix_store.entry(lba), cdfix::CORRECT);
    }
    // The 8-byte subheader lands in its per-sector tag store.
    assert_eq!(
        writer
            .sector_tag(0, SectorTagType::CdSectorSubHeader)
            .unwrap(),
        &form1[0x10..0x18]
    );
    writer.close().unwrap();

    let (mut file, _, index) = open_index(&path);
    let (ddt, shift) = load_ddt(&mut file, &index);
    // Each form keeps exactly the bytes that are not re-derivable.
    assert_eq!(
        read_sector_via_ddt(&mut file, &ddt, shift, 0),
        form1[0x18..0x818]
    );
    assert_eq!(
        read_sector_via_ddt(&mut file, &ddt, shift, 1),
        form2[0x18..0x92C]
    );
    assert_eq!(
        read_sector_via_ddt(&mut file, &ddt, shift, 2),
        no_edc[0x18..0x92C]
    );
    assert_eq!(
        read_sector_via_ddt(&mut file, &ddt, shift, 3),
        verbatim[0x18..0x930]
    );

    // The persisted suffix table carries the sentinels.
    let suffix_table = load_fix_table(&mut file, &index, CdFixKind::Suffix);
    assert_eq!(
        &suffix_table[..5],
        &[
            cdfix::MODE2_FORM1_OK,
            cdfix::MODE2_FORM2_OK,
            cdfix::MODE2_FORM2_NO_CRC,
            cdfix::MODE2_VERBATIM,
            cdfix::NOT_DUMPED,
        ]
    );

    let sub = index
        .find(BlockKind::DataBlock, DataKind::CdSectorSubHeader)
        .unwrap();
    let (_, sub_bytes) = read_raw_block(&mut file, sub.offset);
    assert_eq!(&sub_bytes[..8], &form1[0x10..0x18]);
    assert_eq!(&sub_bytes[8..16], &form2[0x10..0x18]);
}

#[test]
fn an_undersized_fix_table_is_skipped_on_append() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shortfix.spk");
    let tables = EccTables::new();

    let mut writer = ImageWriter::create(
        &path,
        MediaType::CompactDisc,
        CreateOptions::default(),
        8,
        2048,
    )
    .unwrap();
    writer
        .set_tracks(vec![Track {
            sequence: 1,
            track_type: TrackType::CdMode1,
            start: 0,
            end: 7,
            pregap: 150,
            session: 1,
            flags: 0x04,
            isrc: None,
        }])
        .unwrap();
    writer.write_sector_long(0, &mode1_sector(&tables, 0)).unwrap();
    writer.write_sector_long(1, &mode1_sector(&tables, 1)).unwrap();
    writer.close().unwrap();

    // Replace the suffix table with a well-formed one covering a single
    // sector instead of all eight.
    let (_, _, index) = open_index(&path);
    let entry = index
        .find(BlockKind::CdFixTable, DataKind::CdSectorSuffixCorrected)
        .unwrap();
    let table = cdfix::CORRECT.to_le_bytes();
    let short_header = CdFixHeader {
        table_kind: CdFixKind::Suffix,
        compression: CompressionId::None,
        entries: 1,
        raw_length: table.len() as u64,
        stored_length: table.len() as u64,
        crc64_stored: crc64_of(&table),
    };
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    file.seek(SeekFrom::Start(entry.offset)).unwrap();
    use std::io::Write;
    short_header.write(&mut file).unwrap();
    file.write_all(&table).unwrap();
    drop(file);

    // The short table is rejected, which leaves a lone prefix table; both
    // are dropped and fresh full-size stores are built on demand.
    let mut writer = ImageWriter::create(
        &path,
        MediaType::CompactDisc,
        CreateOptions::default(),
        8,
        2048,
    )
    .unwrap();
    assert!(writer.is_appending());
    assert!(writer.cd_prefix_store().is_none());
    assert!(writer.cd_suffix_store().is_none());
    writer.write_sector_long(7, &mode1_sector(&tables, 7)).unwrap();
    assert_eq!(writer.cd_suffix_store().unwrap().entry(7), cdfix::CORRECT);
    writer.close().unwrap();
}

#[test]
fn incompressible_blocks_are_stored_raw() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("entropy.img");
    let mut writer = ImageWriter::create(
        &path,
        MediaType::GenericHdd,
        CreateOptions::default(),
        4,
        512,
    )
    .unwrap();

    // xorshift noise compresses to more than its own size.
    let mut state = 0x9E37_79B9_7F4A_7C15u64;
    for address in 0..4u64 {
        let mut sector = vec![0u8; 512];
        for b in sector.iter_mut() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            *b = state as u8;
        }
        writer.write_sector(address, &sector).unwrap();
    }
    writer.close().unwrap();

    let (mut file, _, index) = open_index(&path);
    let (ddt, shift) = load_ddt(&mut file, &index);
    let (offset, _) = decode_locator(ddt[0], shift);
    let (header, stored) = read_stored(&mut file, offset);
    assert_eq!(header.compression, CompressionId::None);
    assert_eq!(header.stored_length, header.raw_length);
    assert_eq!(stored.len() as u64, header.raw_length);
}

#[test]
fn a_rewound_write_suppresses_the_checksum_block() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rewind.img");
    let mut writer = ImageWriter::create(
        &path,
        MediaType::GenericHdd,
        CreateOptions::default(),
        8,
        512,
    )
    .unwrap();
    writer.write_sector(0, &hdd_sector(0, 512)).unwrap();
    writer.write_sector(5, &hdd_sector(5, 512)).unwrap();
    writer.write_sector(2, &hdd_sector(2, 512)).unwrap(); // rewind
    writer.close().unwrap();

    let (mut file, _, index) = open_index(&path);
    assert!(index
        .find(BlockKind::ChecksumBlock, DataKind::ImageChecksums)
        .is_none());
    // The sectors themselves are unaffected.
    let (ddt, shift) = load_ddt(&mut file, &index);
    assert_eq!(
        read_sector_via_ddt(&mut file, &ddt, shift, 2),
        hdd_sector(2, 512)
    );
}

#[test]
fn large_images_use_a_file_backed_ddt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bigddt.img");
    let count = 64u64;
    let options = CreateOptions {
        in_memory_ddt_cap: 0, // force the on-disk table
        ..CreateOptions::default()
    };
    let mut writer =
        ImageWriter::create(&path, MediaType::GenericHdd, options.clone(), count, 512).unwrap();
    for address in 0..count {
        writer.write_sector(address, &hdd_sector(address, 512)).unwrap();
    }
    writer.close().unwrap();

    {
        let (mut file, _, index) = open_index(&path);
        let entry = index
            .find(BlockKind::DeduplicationTable, DataKind::UserDataDdt)
            .unwrap();
        file.seek(SeekFrom::Start(entry.offset)).unwrap();
        let header = DdtHeader::read(&mut file).unwrap();
        assert_eq!(header.compression, CompressionId::None);
        assert_eq!(header.entries, count);
    }

    // Appending reuses the reserved region in place.
    let mut writer =
        ImageWriter::create(&path, MediaType::GenericHdd, options, count, 512).unwrap();
    assert!(writer.is_appending());
    let new_payload = vec![0xC3u8; 512];
    writer.write_sector(10, &new_payload).unwrap();
    writer.close().unwrap();

    let (mut file, _, index) = open_index(&path);
    let (ddt, shift) = load_ddt(&mut file, &index);
    assert_eq!(read_sector_via_ddt(&mut file, &ddt, shift, 10), new_payload);
    assert_eq!(
        read_sector_via_ddt(&mut file, &ddt, shift, 11),
        hdd_sector(11, 512)
    );
}

// ── Rejections ────────────────────────────────────────────────────────────

#[test]
fn invalid_writes_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bounds.img");
    let mut writer = ImageWriter::create(
        &path,
        MediaType::GenericHdd,
        CreateOptions::default(),
        4,
        512,
    )
    .unwrap();

    assert!(matches!(
        writer.write_sector(4, &[0u8; 512]),
        Err(ImageError::SectorOutOfRange { .. })
    ));
    assert!(matches!(
        writer.write_sector(0, &[0u8; 256]),
        Err(ImageError::WrongSectorSize { .. })
    ));
    assert!(matches!(
        writer.write_sector_long(0, &[0u8; RAW_SECTOR_SIZE]),
        Err(ImageError::NotOpticalMedia(_))
    ));
    assert!(matches!(
        writer.write_media_tag(MediaTagType::CdFullToc, b"toc"),
        Err(ImageError::NotOpticalMedia(_))
    ));
    writer.close().unwrap();
}

#[test]
fn long_writes_need_a_covering_track() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notrack.spk");
    let mut writer = ImageWriter::create(
        &path,
        MediaType::CompactDisc,
        CreateOptions::default(),
        4,
        2048,
    )
    .unwrap();
    assert!(matches!(
        writer.write_sector_long(0, &[0u8; RAW_SECTOR_SIZE]),
        Err(ImageError::NoTrackForSector(0))
    ));
    writer.close().unwrap();
}

#[test]
fn bad_options_never_touch_the_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("never.img");
    let options = CreateOptions {
        group_shift: 0,
        ..CreateOptions::default()
    };
    assert!(matches!(
        ImageWriter::create(&path, MediaType::GenericHdd, options, 4, 512),
        Err(ImageError::InvalidOption(_))
    ));
    let options = CreateOptions {
        dictionary_size: 1000, // not a power of two
        ..CreateOptions::default()
    };
    assert!(matches!(
        ImageWriter::create(&path, MediaType::GenericHdd, options, 4, 512),
        Err(ImageError::InvalidOption(_))
    ));
    assert!(matches!(
        ImageWriter::create(
            &path,
            MediaType::Unknown,
            CreateOptions::default(),
            4,
            512
        ),
        Err(ImageError::UnsupportedMediaType(_))
    ));
    assert!(!path.exists());
}
