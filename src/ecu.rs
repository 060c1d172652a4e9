//! Bound ECU model: a matched variant plus its address arithmetic
//!
//! Three address spaces are in play. *Physical* addresses travel on the
//! wire. *Bin* offsets index image files, which are aligned differently per
//! variant. *Logical* addresses are the unified space the flash controller
//! quirks (write offset, page-switch window) are expressed in.

use log::{debug, info, warn};

use crate::definitions::{EcuVariant, IoIdentifier, ECU_IDENTIFICATION_TABLE};
use crate::kwp2000::ioctl::InputOutputControlParameter;
use crate::kwp2000::start_diagnostic_session::SessionKind;
use crate::kwp2000::{Kwp2000Protocol, STATUS_CANT_UPLOAD_FROM_ADDRESS};
use crate::{DiagError, DiagServerResult};

/// Logical address of the calibration identifier string
const CALIBRATION_ID_LOGICAL: u32 = 0x090000;
/// Logical address of the calibration description string
const CALIBRATION_DESC_LOGICAL: u32 = 0x090040;

/// An identified (or manually selected) ECU
#[derive(Debug, Clone, Copy)]
pub struct Ecu {
    variant: &'static EcuVariant,
}

impl Ecu {
    /// Binds a variant without probing, for manual override after a failed
    /// identification (e.g. reviving a soft-bricked ECU).
    pub fn from_variant(variant: &'static EcuVariant) -> Self {
        Self { variant }
    }

    /// The bound variant table entry
    pub fn variant(&self) -> &'static EcuVariant {
        self.variant
    }

    /// Human label of the variant
    pub fn name(&self) -> &'static str {
        self.variant.name
    }

    /// Maps a physical address to its offset inside an image file
    pub fn physical_to_bin(&self, physical: u32) -> usize {
        (physical as i64 + self.variant.bin_offset) as usize
    }

    /// Maps an image file offset back to a physical address
    pub fn bin_to_physical(&self, bin: usize) -> u32 {
        (bin as i64 - self.variant.bin_offset) as u32
    }

    /// Maps a logical address to physical
    pub fn logical_to_physical(&self, logical: u32) -> u32 {
        (logical as i64 + self.variant.memory_offset) as u32
    }

    /// RequestDownload address for a calibration-zone write. The flash
    /// controller expects the per-variant write offset applied in logical
    /// space and the result shifted left by four.
    pub fn memory_write_address(&self, physical: u32) -> u32 {
        let logical = physical as i64 - self.variant.memory_offset;
        ((logical + self.variant.memory_write_offset) << 4) as u32
    }

    /// Clamps a read size to one byte inside the variant's page-switch
    /// restriction window
    pub fn adjust_read_size(&self, address: u32, requested: u8) -> u8 {
        match self.variant.single_byte_restriction {
            Some((start, stop)) if address >= start && address <= stop => 1,
            _ => requested,
        }
    }

    /// Reads memory with the single-byte fallback strategy.
    ///
    /// A negative status 0x11 (can't upload from specified address) usually
    /// marks an eeprom page switch. The fallback reads the next 16 bytes
    /// one at a time - degrading each failed byte to 0xFF - then re-issues
    /// the remainder at full size.
    pub fn read_memory(
        &self,
        kwp: &mut Kwp2000Protocol,
        address: u32,
        size: u8,
    ) -> DiagServerResult<Vec<u8>> {
        match kwp.read_memory_by_address(address, size) {
            Err(DiagError::NegativeResponse {
                status: STATUS_CANT_UPLOAD_FROM_ADDRESS,
                ..
            }) if size > 1 => {
                warn!(
                    "can't upload from 0x{address:06X}; probably a restricted area or an \
                     eeprom page switch, reading the next 16 bytes one at a time"
                );
                let single = size.min(16);
                let mut data = Vec::with_capacity(size as usize);
                for i in 0..single as u32 {
                    match kwp.read_memory_by_address(address + i, 1) {
                        Ok(byte) => data.extend_from_slice(&byte),
                        Err(DiagError::NegativeResponse { .. }) => data.push(0xFF),
                        Err(e) => return Err(e),
                    }
                }
                if size > single {
                    data.extend(self.read_memory(kwp, address + single as u32, size - single)?);
                }
                Ok(data)
            }
            other => other,
        }
    }

    /// Reads the 8 character calibration identifier
    pub fn get_calibration(&self, kwp: &mut Kwp2000Protocol) -> DiagServerResult<String> {
        let raw =
            kwp.read_memory_by_address(self.logical_to_physical(CALIBRATION_ID_LOGICAL), 8)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Reads the 8 character calibration description
    pub fn get_calibration_description(
        &self,
        kwp: &mut Kwp2000Protocol,
    ) -> DiagServerResult<String> {
        let raw =
            kwp.read_memory_by_address(self.logical_to_physical(CALIBRATION_DESC_LOGICAL), 8)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Clears the ECU's learned adaptive values. Requires a default
    /// diagnostic session; changes apply after ten seconds of ignition off.
    pub fn clear_adaptive_values(
        &self,
        kwp: &mut Kwp2000Protocol,
        desired_baudrate: Option<crate::definitions::BaudrateIndex>,
    ) -> DiagServerResult<()> {
        kwp.start_diagnostic_session(SessionKind::Default, desired_baudrate)?;
        kwp.io_control(
            IoIdentifier::AdaptiveValues,
            InputOutputControlParameter::ResetToDefault,
            &[],
        )?;
        Ok(())
    }
}

/// Probes the variant table over ReadMemoryByAddress and binds the first
/// matching entry. Negative responses to a probe just move on to the next
/// candidate; only transport failures abort the scan.
pub fn identify_ecu(kwp: &mut Kwp2000Protocol) -> DiagServerResult<Ecu> {
    for variant in ECU_IDENTIFICATION_TABLE {
        let probe_len = variant.identification_expected[0].len() as u8;
        debug!(
            "probing for {} at 0x{:06X}",
            variant.name, variant.identification_offset
        );
        let result = match kwp.read_memory_by_address(variant.identification_offset, probe_len) {
            Ok(bytes) => bytes,
            Err(DiagError::NegativeResponse { .. }) => continue,
            Err(e) => return Err(e),
        };
        if variant
            .identification_expected
            .iter()
            .any(|expected| *expected == result.as_slice())
        {
            info!("identified ECU: {}", variant.name);
            return Ok(Ecu { variant });
        }
    }
    Err(DiagError::IdentificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulation::SimulationChannel;

    fn probe_address(req: &[u8]) -> u32 {
        (req[1] as u32) << 16 | (req[2] as u32) << 8 | req[3] as u32
    }

    #[test]
    fn identification_binds_matching_variant() {
        let channel = SimulationChannel::new(|req| match req[0] {
            0x23 if probe_address(req) == 0x90040 => {
                vec![vec![0x63, b'c', b'a', b'6', b'6', 0x00, 0x00, 0x00]]
            }
            0x23 => vec![vec![0x7F, 0x23, 0x31]],
            _ => vec![],
        });
        let mut kwp = Kwp2000Protocol::new(Box::new(channel));
        let ecu = identify_ecu(&mut kwp).unwrap();
        assert_eq!(ecu.name(), "SIMK43 2.0 4mbit");
        assert_eq!(ecu.variant().calibration_section_address, 0x90000);
    }

    #[test]
    fn no_match_yields_identification_error() {
        let channel = SimulationChannel::new(|req| match req[0] {
            0x23 => vec![vec![0x7F, 0x23, 0x31]],
            _ => vec![],
        });
        let mut kwp = Kwp2000Protocol::new(Box::new(channel));
        assert!(matches!(
            identify_ecu(&mut kwp),
            Err(DiagError::IdentificationFailed)
        ));
    }

    #[test]
    fn address_translation_roundtrips() {
        let ecu = Ecu::from_variant(&ECU_IDENTIFICATION_TABLE[1]);
        assert_eq!(ecu.physical_to_bin(0x90000), 0x10000);
        assert_eq!(ecu.bin_to_physical(0x10000), 0x90000);
        assert_eq!(ecu.bin_to_physical(ecu.physical_to_bin(0xA1234)), 0xA1234);
    }

    #[test]
    fn calibration_write_address_applies_shift_quirk() {
        // SIMK43 2.0: (0x90000 - 0x7000) << 4
        let ecu = Ecu::from_variant(&ECU_IDENTIFICATION_TABLE[1]);
        assert_eq!(ecu.memory_write_address(0x90000), 0x89000 << 4);
        // SIMK41: the logical calibration base is 0x90000 here as well
        let ecu = Ecu::from_variant(&ECU_IDENTIFICATION_TABLE[4]);
        assert_eq!(ecu.memory_write_address(0x48000), 0x84800 << 4);
    }

    #[test]
    fn single_byte_window_clamps_read_size() {
        let ecu = Ecu::from_variant(&ECU_IDENTIFICATION_TABLE[1]);
        assert_eq!(ecu.adjust_read_size(0x89FFF, 254), 1);
        assert_eq!(ecu.adjust_read_size(0x90010, 254), 254);
    }

    #[test]
    fn fallback_fills_failed_bytes_with_ff() {
        // Every read at 0x91000 fails regardless of size; single byte reads
        // elsewhere succeed.
        let channel = SimulationChannel::new(|req| match req[0] {
            0x23 => {
                let addr = probe_address(req);
                let size = req[4] as usize;
                if addr == 0x91000 {
                    vec![vec![0x7F, 0x23, 0x11]]
                } else {
                    let mut resp = vec![0x63];
                    resp.extend((0..size).map(|i| (addr as usize + i) as u8));
                    vec![resp]
                }
            }
            _ => vec![],
        });
        let mut kwp = Kwp2000Protocol::new(Box::new(channel));
        let ecu = Ecu::from_variant(&ECU_IDENTIFICATION_TABLE[1]);
        let data = ecu.read_memory(&mut kwp, 0x91000, 254).unwrap();
        assert_eq!(data.len(), 254);
        // First byte is the bad address itself, degraded to 0xFF
        assert_eq!(data[0], 0xFF);
        // Bytes 1..16 were readable one at a time
        assert_eq!(data[1], 0x01);
        assert_eq!(data[15], 0x0F);
        // Remainder came back as one full-size read
        assert_eq!(data[16], 0x10);
    }
}
