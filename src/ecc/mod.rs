//! CD-ROM error detection and correction primitives.
//!
//! P and Q are Reed-Solomon style parity codes over GF(2^8) with the field
//! generator polynomial x^8 + x^4 + x^3 + x^2 + 1 (0x11D). The EDC is a
//! reflected 32-bit CRC with polynomial 0xD8018001. All three tables are
//! derived once and cached for the lifetime of the writer.

pub mod sector;

pub use sector::Mode2Form;

const GF_POLY: u32 = 0x11D;
const EDC_POLY: u32 = 0xD801_8001;

/// P-code interleave: 86 major rows of 24 bytes, striding (2, 86).
pub const P_MAJOR: usize = 86;
pub const P_MINOR: usize = 24;
pub const P_MULT: usize = 2;
pub const P_INC: usize = 86;

/// Q-code interleave: 52 major rows of 43 bytes, striding (86, 88).
pub const Q_MAJOR: usize = 52;
pub const Q_MINOR: usize = 43;
pub const Q_MULT: usize = 86;
pub const Q_INC: usize = 88;

/// Precomputed Galois-field and EDC lookup tables.
#[derive(Debug)]
pub struct EccTables {
    forward: [u8; 256],
    backward: [u8; 256],
    edc: [u32; 256],
}

impl Default for EccTables {
    fn default() -> Self {
        Self::new()
    }
}

impl EccTables {
    pub fn new() -> Self {
        let mut forward = [0u8; 256];
        let mut backward = [0u8; 256];
        let mut edc = [0u32; 256];
        for i in 0..256u32 {
            let mut crc = i;
            for _ in 0..8 {
                crc = (crc >> 1) ^ if crc & 1 != 0 { EDC_POLY } else { 0 };
            }
            edc[i as usize] = crc;

            let j = ((i << 1) ^ if i & 0x80 != 0 { GF_POLY } else { 0 }) & 0xFF;
            forward[i as usize] = j as u8;
            backward[(i ^ j) as usize] = i as u8;
        }
        Self {
            forward,
            backward,
            edc,
        }
    }

    /// Table-driven EDC over `data`, continuing from `init`.
    pub fn edc(&self, init: u32, data: &[u8]) -> u32 {
        data.iter().fold(init, |edc, &b| {
            (edc >> 8) ^ self.edc[((edc ^ u32::from(b)) & 0xFF) as usize]
        })
    }

    /// Verify one parity plane.
    ///
    /// `address` is the 4-byte sector header (zeroed for Mode 2 Form 1);
    /// `data` starts at raw sector offset 0x10. `parity` holds
    /// `2 * major_count` stored parity bytes.
    #[allow(clippy::too_many_arguments)]
    pub fn check_pq(
        &self,
        address: &[u8; 4],
        data: &[u8],
        major_count: usize,
        minor_count: usize,
        major_mult: usize,
        minor_inc: usize,
        parity: &[u8],
    ) -> bool {
        let size = major_count * minor_count;
        for major in 0..major_count {
            let mut index = (major >> 1) * major_mult + (major & 1);
            let mut ecc_a = 0u8;
            let mut ecc_b = 0u8;
            for _ in 0..minor_count {
                let byte = if index < 4 {
                    address[index]
                } else {
                    data[index - 4]
                };
                index += minor_inc;
                if index >= size {
                    index -= size;
                }
                ecc_a ^= byte;
                ecc_b ^= byte;
                ecc_a = self.forward[ecc_a as usize];
            }
            ecc_a = self.backward[(self.forward[ecc_a as usize] ^ ecc_b) as usize];
            if parity[major] != ecc_a || parity[major + major_count] != (ecc_a ^ ecc_b) {
                return false;
            }
        }
        true
    }

    /// Compute one parity plane into `parity` (same shape as
    /// [`EccTables::check_pq`]). Used to regenerate suffixes classified as
    /// correct, and to synthesize sectors in tests.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_pq(
        &self,
        address: &[u8; 4],
        data: &[u8],
        major_count: usize,
        minor_count: usize,
        major_mult: usize,
        minor_inc: usize,
        parity: &mut [u8],
    ) {
        let size = major_count * minor_count;
        for major in 0..major_count {
            let mut index = (major >> 1) * major_mult + (major & 1);
            let mut ecc_a = 0u8;
            let mut ecc_b = 0u8;
            for _ in 0..minor_count {
                let byte = if index < 4 {
                    address[index]
                } else {
                    data[index - 4]
                };
                index += minor_inc;
                if index >= size {
                    index -= size;
                }
                ecc_a ^= byte;
                ecc_b ^= byte;
                ecc_a = self.forward[ecc_a as usize];
            }
            ecc_a = self.backward[(self.forward[ecc_a as usize] ^ ecc_b) as usize];
            parity[major] = ecc_a;
            parity[major + major_count] = ecc_a ^ ecc_b;
        }
    }
}
