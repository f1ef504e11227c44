//! Raw 2352-byte sector anatomy and classification.
//!
//! Offsets (Mode 1):
//! `0x000..0x00C` sync, `0x00C..0x010` header (BCD MSF + mode),
//! `0x010..0x810` user data, `0x810..0x814` EDC, `0x814..0x81C` reserved,
//! `0x81C..0x8C8` P parity, `0x8C8..0x930` Q parity.
//!
//! Mode 2 keeps the same 16-byte prefix; an 8-byte subheader follows at
//! `0x010`, Form 1 user data ends at `0x818` (EDC + P/Q follow with a
//! zeroed address), Form 2 user data ends at `0x92C` with an optional EDC
//! over subheader plus data in the last four bytes.

use super::{EccTables, P_INC, P_MAJOR, P_MINOR, P_MULT, Q_INC, Q_MAJOR, Q_MINOR, Q_MULT};

/// Sync pattern at the start of every raw data sector.
pub const SYNC_PATTERN: [u8; 12] = [
    0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00,
];

pub const RAW_SECTOR_SIZE: usize = 2352;
pub const PREFIX_SIZE: usize = 16;
pub const SUFFIX_SIZE: usize = 288;
pub const SUBHEADER_SIZE: usize = 8;
pub const MODE1_DATA_SIZE: usize = 2048;
pub const MODE2_FORM1_DATA_SIZE: usize = 2048;
pub const MODE2_FORM2_DATA_SIZE: usize = 2324;
/// Mode 2 payload after the subheader, when no compaction applies.
pub const MODE2_RAW_DATA_SIZE: usize = 2328;

/// Sectors are addressed 150 frames (2 seconds) into the lead-in.
pub const MSF_OFFSET: u64 = 150;

/// Classification of a Mode 2 sector payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode2Form {
    /// P/Q parity (zeroed address) and EDC hold: keep 2048 bytes.
    Form1,
    /// Form 2 EDC holds: keep 2324 bytes, EDC is re-derivable.
    Form2,
    /// Stored EDC field is zero: keep 2324 bytes, flagged distinctly.
    Form2NoEdc,
    /// Nothing verifies: keep the full 2328 bytes verbatim.
    Verbatim,
}

/// Convert a logical sector address to the BCD minute/second/frame triple
/// stored in the sector header.
pub fn lba_to_msf_bcd(lba: u64) -> [u8; 3] {
    let frames = lba + MSF_OFFSET;
    let minute = frames / 4500;
    let second = (frames % 4500) / 75;
    let frame = frames % 75;
    [bcd(minute), bcd(second), bcd(frame)]
}

fn bcd(value: u64) -> u8 {
    (((value / 10) << 4) | (value % 10)) as u8
}

/// Rebuild the 16-byte prefix a correct sector must carry.
pub fn regenerate_prefix(lba: u64, mode: u8) -> [u8; PREFIX_SIZE] {
    let mut prefix = [0u8; PREFIX_SIZE];
    prefix[..12].copy_from_slice(&SYNC_PATTERN);
    prefix[12..15].copy_from_slice(&lba_to_msf_bcd(lba));
    prefix[15] = mode;
    prefix
}

/// A prefix is correct iff the sync pattern matches exactly, the header
/// MSF equals the sector's logical address and the mode byte matches.
pub fn prefix_is_correct(sector: &[u8], lba: u64, mode: u8) -> bool {
    sector[..PREFIX_SIZE] == regenerate_prefix(lba, mode)
}

/// Mode 1 suffix: reserved bytes zero, P and Q parity hold, EDC over the
/// leading 0x810 bytes matches the stored value.
pub fn mode1_suffix_is_correct(tables: &EccTables, sector: &[u8]) -> bool {
    if sector[0x814..0x81C].iter().any(|&b| b != 0) {
        return false;
    }
    let address = [sector[0x0C], sector[0x0D], sector[0x0E], sector[0x0F]];
    let data = &sector[0x10..0x8C8];
    if !tables.check_pq(
        &address,
        data,
        P_MAJOR,
        P_MINOR,
        P_MULT,
        P_INC,
        &sector[0x81C..0x8C8],
    ) {
        return false;
    }
    if !tables.check_pq(
        &address,
        data,
        Q_MAJOR,
        Q_MINOR,
        Q_MULT,
        Q_INC,
        &sector[0x8C8..0x930],
    ) {
        return false;
    }
    tables.edc(0, &sector[..0x810]) == read_edc(&sector[0x810..0x814])
}

/// Rebuild a correct Mode 1 suffix from the first 0x810 sector bytes.
pub fn regenerate_mode1_suffix(tables: &EccTables, sector: &[u8]) -> [u8; SUFFIX_SIZE] {
    let mut suffix = [0u8; SUFFIX_SIZE];
    suffix[..4].copy_from_slice(&tables.edc(0, &sector[..0x810]).to_le_bytes());

    let address = [sector[0x0C], sector[0x0D], sector[0x0E], sector[0x0F]];
    // Q covers the P parity bytes, so stage data + P first.
    let mut staged = vec![0u8; 0x8B8];
    staged[..0x800].copy_from_slice(&sector[0x10..0x810]);
    staged[0x800..0x804].copy_from_slice(&suffix[..4]);
    // staged[0x804..0x80C] reserved, stays zero
    let (head, p_region) = staged.split_at_mut(0x80C);
    tables.compute_pq(&address, head, P_MAJOR, P_MINOR, P_MULT, P_INC, p_region);
    suffix[0x0C..0xB8].copy_from_slice(&staged[0x80C..0x8B8]);
    let mut q = [0u8; 2 * Q_MAJOR];
    tables.compute_pq(&address, &staged, Q_MAJOR, Q_MINOR, Q_MULT, Q_INC, &mut q);
    suffix[0xB8..0x120].copy_from_slice(&q);
    suffix
}

/// Classify a Mode 2 payload.
pub fn mode2_classify(tables: &EccTables, sector: &[u8]) -> Mode2Form {
    let zero_address = [0u8; 4];
    let data = &sector[0x10..0x8C8];
    let form1_edc = tables.edc(0, &sector[0x10..0x818]) == read_edc(&sector[0x818..0x81C]);
    if form1_edc
        && tables.check_pq(
            &zero_address,
            data,
            P_MAJOR,
            P_MINOR,
            P_MULT,
            P_INC,
            &sector[0x81C..0x8C8],
        )
        && tables.check_pq(
            &zero_address,
            data,
            Q_MAJOR,
            Q_MINOR,
            Q_MULT,
            Q_INC,
            &sector[0x8C8..0x930],
        )
    {
        return Mode2Form::Form1;
    }

    // Form 2: EDC over subheader + 2324 data bytes, stored in the last
    // four bytes of the sector.
    let stored = read_edc(&sector[0x92C..0x930]);
    if stored == 0 {
        return Mode2Form::Form2NoEdc;
    }
    if tables.edc(0, &sector[0x10..0x92C]) == stored {
        return Mode2Form::Form2;
    }
    Mode2Form::Verbatim
}

fn read_edc(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msf_encoding_is_bcd() {
        // LBA 0 is 00:02:00.
        assert_eq!(lba_to_msf_bcd(0), [0x00, 0x02, 0x00]);
        // LBA 4350 is 01:00:00 (4500 frames).
        assert_eq!(lba_to_msf_bcd(4350), [0x01, 0x00, 0x00]);
        // LBA 166 is 00:04:16.
        assert_eq!(lba_to_msf_bcd(166), [0x00, 0x04, 0x16]);
    }

    #[test]
    fn prefix_check_matches_regenerated_prefix() {
        let mut sector = vec![0u8; RAW_SECTOR_SIZE];
        sector[..PREFIX_SIZE].copy_from_slice(&regenerate_prefix(1234, 1));
        assert!(prefix_is_correct(&sector, 1234, 1));
        assert!(!prefix_is_correct(&sector, 1235, 1));
        assert!(!prefix_is_correct(&sector, 1234, 2));
        sector[3] = 0xFE;
        assert!(!prefix_is_correct(&sector, 1234, 1));
    }

    fn mode2_form1_sector(tables: &EccTables, lba: u64) -> Vec<u8> {
        let mut sector = vec![0u8; RAW_SECTOR_SIZE];
        sector[..PREFIX_SIZE].copy_from_slice(&regenerate_prefix(lba, 2));
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
        sector[..PREFIX_SIZE].copy_from_slice(&regenerate_prefix(lba, 2));
        sector[0x12] = 0x20; // submode: form 2
        sector[0x16] = 0x20;
        for i in 0..MODE2_FORM2_DATA_SIZE {
            sector[0x18 + i] = ((lba as usize * 7 + i) % 241) as u8;
        }
        let edc = tables.edc(0, &sector[0x10..0x92C]);
        sector[0x92C..0x930].copy_from_slice(&edc.to_le_bytes());
        sector
    }

    #[test]
    fn regenerated_mode1_suffix_verifies() {
        let tables = EccTables::new();
        let mut sector = vec![0u8; RAW_SECTOR_SIZE];
        sector[..PREFIX_SIZE].copy_from_slice(&regenerate_prefix(300, 1));
        for i in 0..MODE1_DATA_SIZE {
            sector[0x10 + i] = (i * 7 % 256) as u8;
        }
        let suffix = regenerate_mode1_suffix(&tables, &sector);
        sector[0x810..].copy_from_slice(&suffix);
        assert!(mode1_suffix_is_correct(&tables, &sector));

        // Any single corrupted byte flips the verdict.
        sector[0x820] ^= 0x01;
        assert!(!mode1_suffix_is_correct(&tables, &sector));
    }

    #[test]
    fn form1_parity_and_edc_classify_as_form1() {
        let tables = EccTables::new();
        let mut sector = mode2_form1_sector(&tables, 200);
        assert_eq!(mode2_classify(&tables, &sector), Mode2Form::Form1);

        // A damaged data byte invalidates the Form 1 verdict.
        sector[0x100] ^= 0x01;
        assert_ne!(mode2_classify(&tables, &sector), Mode2Form::Form1);
    }

    #[test]
    fn valid_form2_sector_is_classified_form2() {
        let tables = EccTables::new();
        let sector = mode2_form2_sector(&tables, 200);
        assert_eq!(mode2_classify(&tables, &sector), Mode2Form::Form2);
    }

    #[test]
    fn form2_with_zero_bytes_at_the_form1_edc_slot_is_still_form2() {
        // 0x91C..0x920 is plain user data in a Form 2 sector; zeroes there
        // must not be mistaken for an absent EDC.
        let tables = EccTables::new();
        let mut sector = mode2_form2_sector(&tables, 200);
        sector[0x91C..0x920].copy_from_slice(&[0u8; 4]);
        let edc = tables.edc(0, &sector[0x10..0x92C]);
        sector[0x92C..0x930].copy_from_slice(&edc.to_le_bytes());
        assert_eq!(mode2_classify(&tables, &sector), Mode2Form::Form2);
    }

    #[test]
    fn zero_edc_field_means_form2_without_checksum() {
        let tables = EccTables::new();
        let mut sector = mode2_form2_sector(&tables, 200);
        sector[0x92C..0x930].copy_from_slice(&[0u8; 4]);
        assert_eq!(mode2_classify(&tables, &sector), Mode2Form::Form2NoEdc);
    }

    #[test]
    fn unverifiable_mode2_payload_is_kept_verbatim() {
        let tables = EccTables::new();
        let mut sector = mode2_form2_sector(&tables, 200);
        let edc = tables.edc(0, &sector[0x10..0x92C]);
        // Nonzero and guaranteed not to match the payload.
        let bad = if edc >= 2 { edc - 1 } else { edc + 1 };
        sector[0x92C..0x930].copy_from_slice(&bad.to_le_bytes());
        assert_eq!(mode2_classify(&tables, &sector), Mode2Form::Verbatim);
    }
}
