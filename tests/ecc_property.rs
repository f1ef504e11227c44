//! Property tests for the ECC/EDC primitives and locator packing.

use proptest::prelude::*;

use sectorpack::ddt::{decode_locator, encode_locator};
use sectorpack::ecc::sector::{
    mode1_suffix_is_correct, prefix_is_correct, regenerate_mode1_suffix, regenerate_prefix,
    RAW_SECTOR_SIZE,
};
use sectorpack::ecc::EccTables;

fn built_mode1_sector(lba: u64, data: &[u8]) -> Vec<u8> {
    let tables = EccTables::new();
    let mut sector = vec![0u8; RAW_SECTOR_SIZE];
    sector[..16].copy_from_slice(&regenerate_prefix(lba, 1));
    sector[0x10..0x810].copy_from_slice(data);
    let suffix = regenerate_mode1_suffix(&tables, &sector);
    sector[0x810..].copy_from_slice(&suffix);
    sector
}

proptest! {
    #[test]
    fn regenerated_sectors_always_verify(
        lba in 0u64..404_850,
        data in prop::collection::vec(any::<u8>(), 2048),
    ) {
        let tables = EccTables::new();
        let sector = built_mode1_sector(lba, &data);
        prop_assert!(prefix_is_correct(&sector, lba, 1));
        prop_assert!(mode1_suffix_is_correct(&tables, &sector));
    }

    #[test]
    fn any_single_bit_flip_breaks_suffix_verification(
        lba in 0u64..404_850,
        data in prop::collection::vec(any::<u8>(), 2048),
        position in 0usize..0x930,
        bit in 0u8..8,
    ) {
        let tables = EccTables::new();
        let mut sector = built_mode1_sector(lba, &data);
        sector[position] ^= 1 << bit;
        prop_assert!(!mode1_suffix_is_correct(&tables, &sector));
    }

    #[test]
    fn locator_packing_roundtrips(
        shift in 1u8..=16,
        raw_offset in any::<u64>(),
        raw_position in any::<u32>(),
    ) {
        let offset = raw_offset & ((1u64 << (64 - shift)) - 1);
        let position = raw_position & ((1u32 << shift) - 1);
        let locator = encode_locator(offset, position, shift);
        prop_assert_eq!(decode_locator(locator, shift), (offset, position));
    }
}
