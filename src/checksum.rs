//! Firmware image checksum codec
//!
//! A SIMK4x image carries the `"OK"` family flag at a family-specific
//! offset. Each family defines up to three regions; a region's checksum
//! table holds the current 16-bit checksum, a zone count, and per zone a
//! start/stop address pair stored as 3 reversed little-endian bytes. The
//! CRC is CRC-16/IBM (polynomial 0x8005, reflected), seeded for the first
//! zone from an initial-value slot in the image and chained from the
//! previous zone's result for the rest. The final value lands byte-swapped
//! in the current-checksum slot.

use crc::{Algorithm, Crc};
use log::{debug, info};

use crate::{DiagError, DiagServerResult};

const CRC16_IBM: Algorithm<u16> = Algorithm {
    width: 16,
    poly: 0x8005,
    init: 0x0000,
    refin: true,
    refout: true,
    xorout: 0x0000,
    check: 0xBB3D,
    residue: 0x0000,
};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC16_IBM);

/// One checksummed region of an image family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumRegion {
    /// Region label
    pub name: &'static str,
    /// Image offset of the 2 byte initial CRC value for the first zone
    pub init_address: usize,
    /// Image offset of the checksum table (current checksum, zone count,
    /// zone address pairs)
    pub cks_address: usize,
    /// Delta from the stored (physical) zone addresses to image offsets
    pub bin_offset: i64,
}

/// One image family, identified by its `"OK"` flag location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumFamily {
    /// Family label
    pub name: &'static str,
    /// Image offset of the 2 byte `"OK"` flag
    pub identification_flag_address: usize,
    /// Checksummed regions of this family
    pub regions: &'static [ChecksumRegion],
}

/// The documented image families
pub const CHECKSUM_FAMILIES: &[ChecksumFamily] = &[
    ChecksumFamily {
        name: "2mbit",
        identification_flag_address: 0xFEFE,
        regions: &[
            ChecksumRegion {
                name: "Calibration",
                init_address: 0x00800C,
                cks_address: 0x0FEE0,
                bin_offset: -0x88000,
            },
            ChecksumRegion {
                name: "Program",
                init_address: 0x010052,
                cks_address: 0x010010,
                bin_offset: -0x88000,
            },
        ],
    },
    ChecksumFamily {
        name: "4mbit",
        identification_flag_address: 0x017EFE,
        regions: &[
            ChecksumRegion {
                name: "Calibration",
                init_address: 0x01000C,
                cks_address: 0x017EE0,
                bin_offset: -0x080000,
            },
            ChecksumRegion {
                name: "Program",
                init_address: 0x020052,
                cks_address: 0x020010,
                bin_offset: -0x080000,
            },
        ],
    },
    ChecksumFamily {
        name: "v6",
        identification_flag_address: 0xDEFE,
        regions: &[
            ChecksumRegion {
                name: "Calibration",
                init_address: 0x0800C,
                cks_address: 0xDEE0,
                bin_offset: -0x88000,
            },
            ChecksumRegion {
                name: "Program",
                init_address: 0x010052,
                cks_address: 0x010010,
                bin_offset: -0x88000,
            },
        ],
    },
    ChecksumFamily {
        name: "8mbit",
        identification_flag_address: 0x97EFE,
        regions: &[
            ChecksumRegion {
                name: "Calibration",
                init_address: 0x09000C,
                cks_address: 0x097EE0,
                bin_offset: 0,
            },
            ChecksumRegion {
                name: "Program",
                init_address: 0x0A0052,
                cks_address: 0x0A0010,
                bin_offset: 0,
            },
        ],
    },
];

/// CRC-16/IBM over `payload`, continuing from `init`.
///
/// `digest_with_initial` treats its argument like `Algorithm::init` and
/// reflects it; pre-reflecting makes the internal register resume at
/// exactly `init`, which is what zone chaining requires.
pub fn zone_checksum(payload: &[u8], init: u16) -> u16 {
    let mut digest = CRC16.digest_with_initial(init.reverse_bits());
    digest.update(payload);
    digest.finalize()
}

fn read_reversed_u24(payload: &[u8], offset: usize) -> Option<u32> {
    let bytes = payload.get(offset..offset + 3)?;
    Some((bytes[2] as u32) << 16 | (bytes[1] as u32) << 8 | bytes[0] as u32)
}

fn read_reversed_u16(payload: &[u8], offset: usize) -> Option<u16> {
    let bytes = payload.get(offset..offset + 2)?;
    Some((bytes[1] as u16) << 8 | bytes[0] as u16)
}

/// Matches the image against the family table by its `"OK"` flag
pub fn detect_family(payload: &[u8]) -> Option<&'static ChecksumFamily> {
    CHECKSUM_FAMILIES.iter().find(|family| {
        payload
            .get(family.identification_flag_address..family.identification_flag_address + 2)
            == Some(b"OK")
    })
}

/// Outcome of recomputing one region's checksum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionReport {
    /// Region label
    pub region: &'static str,
    /// Checksum found in the image before recomputation
    pub previous: u16,
    /// Checksum written back
    pub corrected: u16,
}

/// Recomputes every region checksum of the image in place.
///
/// Idempotent: correcting an already-correct image is a byte-identical
/// no-op. Regions whose zone count is 0 or 0xFF are skipped. Returns one
/// report per processed region.
pub fn correct_checksum(payload: &mut [u8]) -> DiagServerResult<Vec<RegionReport>> {
    let family = detect_family(payload).ok_or(DiagError::ChecksumDetectionFailed)?;
    info!("detected {} image layout", family.name);

    let mut reports = Vec::new();
    for region in family.regions {
        let amount = *payload
            .get(region.cks_address + 2)
            .ok_or(DiagError::ChecksumDetectionFailed)?;
        if amount == 0 || amount == 0xFF {
            debug!("region {} declares no zones, skipping", region.name);
            continue;
        }

        let mut checksum = 0u16;
        let mut zone_address = region.cks_address;
        for zone_index in 0..amount {
            let zone_start = read_reversed_u24(payload, zone_address + 0x04)
                .ok_or(DiagError::ChecksumDetectionFailed)? as i64
                + region.bin_offset;
            let zone_stop = read_reversed_u24(payload, zone_address + 0x08)
                .ok_or(DiagError::ChecksumDetectionFailed)? as i64
                + region.bin_offset
                + 1;
            if zone_start < 0 || zone_stop <= zone_start || zone_stop as usize > payload.len() {
                return Err(DiagError::ChecksumDetectionFailed);
            }

            let init = if zone_index == 0 {
                read_reversed_u16(payload, region.init_address)
                    .ok_or(DiagError::ChecksumDetectionFailed)?
            } else {
                checksum
            };
            checksum = zone_checksum(&payload[zone_start as usize..zone_stop as usize], init);
            debug!(
                "region {} zone {}: 0x{zone_start:06X}-0x{zone_stop:06X} => 0x{checksum:04X}",
                region.name,
                zone_index + 1
            );
            zone_address += 0x08;
        }

        let corrected = checksum.swap_bytes();
        let previous = u16::from_be_bytes([
            payload[region.cks_address],
            payload[region.cks_address + 1],
        ]);
        payload[region.cks_address..region.cks_address + 2]
            .copy_from_slice(&corrected.to_be_bytes());
        info!(
            "region {}: checksum 0x{previous:04X} -> 0x{corrected:04X}",
            region.name
        );
        reports.push(RegionReport {
            region: region.name,
            previous,
            corrected,
        });
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_matches_reference_check_value() {
        assert_eq!(zone_checksum(b"123456789", 0), 0xBB3D);
    }

    #[test]
    fn chained_zones_equal_one_continuous_run() {
        let data = b"SIMK43 calibration and program bytes";
        let (a, b) = data.split_at(17);
        let chained = zone_checksum(b, zone_checksum(a, 0x1D0F));
        assert_eq!(chained, zone_checksum(data, 0x1D0F));
    }

    /// Builds a 512 KiB 4mbit-family image with a single declared zone
    /// `[0x010000, 0x01F000)` and some non-trivial content in it.
    fn four_mbit_image() -> Vec<u8> {
        let mut image = vec![0u8; 0x80000];
        for (i, byte) in image[0x10000..0x1F000].iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        image[0x17EFE] = b'O';
        image[0x17EFF] = b'K';
        // Zone count and the zone's physical start/stop, stored reversed
        image[0x17EE2] = 1;
        image[0x17EE4..0x17EE7].copy_from_slice(&[0x00, 0x00, 0x09]); // 0x090000
        image[0x17EE8..0x17EEB].copy_from_slice(&[0xFF, 0xEF, 0x09]); // 0x09EFFF
        // Initial CRC value slot, stored reversed
        image[0x1000C] = 0x34;
        image[0x1000D] = 0x12;
        image
    }

    #[test]
    fn four_mbit_zone_checksum_is_written_byte_swapped() {
        let mut image = four_mbit_image();
        let expected = zone_checksum(&image[0x10000..0x1F000], 0x1234).swap_bytes();

        let reports = correct_checksum(&mut image).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].region, "Calibration");
        assert_eq!(reports[0].corrected, expected);
        assert_eq!(
            &image[0x17EE0..0x17EE2],
            expected.to_be_bytes().as_slice()
        );
    }

    #[test]
    fn correction_is_idempotent() {
        let mut image = four_mbit_image();
        correct_checksum(&mut image).unwrap();
        let once = image.clone();
        correct_checksum(&mut image).unwrap();
        assert_eq!(once, image);
    }

    #[test]
    fn unknown_layout_is_an_error() {
        let mut blank = vec![0u8; 0x40000];
        assert!(matches!(
            correct_checksum(&mut blank),
            Err(DiagError::ChecksumDetectionFailed)
        ));
    }
}
