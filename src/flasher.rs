//! High level flasher operations
//!
//! This is the surface a CLI or GUI drives: session bring-up, variant
//! identification, zone reads, the full erase/write/verify/reset flash
//! sequence, checksum correction and the immobilizer shortcuts. Everything
//! here serializes through one [Kwp2000Protocol]; the BSL recovery jobs at
//! the bottom run over their own raw serial loader instead.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};

use crate::bsl::{BslAssets, BslLoader, FlashChip, TargetVariant};
use crate::checksum::{correct_checksum, RegionReport};
use crate::definitions::{AccessLevel, BaudrateIndex, ReprogrammingStatus, Routine};
use crate::ecu::{identify_ecu, Ecu};
use crate::immo::{self, ImmoInfo, ImmoOutcome};
use crate::kwp2000::ecu_reset::ResetMode;
use crate::kwp2000::read_ecu_identification::IdentificationPid;
use crate::kwp2000::security_access::SecurityAlgorithm;
use crate::kwp2000::start_diagnostic_session::SessionKind;
use crate::kwp2000::Kwp2000Protocol;
use crate::memory::{dynamic_find_end, read_memory, write_memory, CancellationToken};
use crate::{lineswap, DiagError, DiagServerResult, ProgressSink};

/// Timeout once a session is established
const SESSION_TIMEOUT: Duration = Duration::from_secs(12);
/// Widened timeout around the VerifyBlocks routine
const VERIFY_TIMEOUT: Duration = Duration::from_secs(300);
/// Timeout for the final reset, whose response is optional
const RESET_TIMEOUT: Duration = Duration::from_millis(500);
/// Bytes at the head of each zone holding the ready flag, which must stay
/// erased until verification has passed
const READY_FLAG_BYTES: usize = 16;

/// Which memory region a read targets
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadRegion {
    /// Calibration zone only
    Calibration,
    /// Program zone only
    Program,
    /// The whole eeprom
    Full,
}

/// Which zones a flash operation writes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FlashZones {
    /// Erase and write the calibration zone
    pub calibration: bool,
    /// Erase and write the program zone
    pub program: bool,
}

impl FlashZones {
    /// Both zones
    pub fn both() -> Self {
        Self {
            calibration: true,
            program: true,
        }
    }
}

/// Orchestration facade over one KWP2000 session
#[derive(Debug)]
pub struct Flasher {
    kwp: Kwp2000Protocol,
    ecu: Option<Ecu>,
    desired_baudrate: Option<BaudrateIndex>,
}

impl Flasher {
    /// Wraps a session engine. Nothing touches the wire until
    /// [Flasher::connect].
    pub fn new(kwp: Kwp2000Protocol) -> Self {
        Self {
            kwp,
            ecu: None,
            desired_baudrate: None,
        }
    }

    /// Direct access to the session engine, for operations the facade
    /// does not wrap
    pub fn kwp(&mut self) -> &mut Kwp2000Protocol {
        &mut self.kwp
    }

    /// The identified ECU, if identification has run
    pub fn ecu(&self) -> Option<&Ecu> {
        self.ecu.as_ref()
    }

    /// Overrides identification, e.g. to revive a soft-bricked ECU the
    /// probe cannot see
    pub fn set_ecu(&mut self, ecu: Ecu) {
        self.ecu = Some(ecu);
    }

    fn bound_ecu(&self) -> DiagServerResult<Ecu> {
        self.ecu.ok_or(DiagError::IdentificationFailed)
    }

    /// Brings up a flash reprogramming session: fast init, session start
    /// (renegotiating the baud rate if requested), timing maximization and
    /// the security handshake.
    pub fn connect(&mut self, desired_baudrate: Option<BaudrateIndex>) -> DiagServerResult<()> {
        self.desired_baudrate = desired_baudrate;
        self.kwp.init()?;
        self.kwp
            .start_diagnostic_session(SessionKind::FlashReprogramming, desired_baudrate)?;
        self.kwp.set_timeout(SESSION_TIMEOUT)?;
        info!("setting timing parameters to maximum");
        self.kwp.maximize_timing()?;
        self.security_access(AccessLevel::Hyundai)?;
        Ok(())
    }

    /// Runs the seed/key handshake. The variant is not known before the
    /// first unlock, so the common multiply-XOR derivation is tried first
    /// and the legacy fold second; once identification has run, the bound
    /// variant picks directly.
    pub fn security_access(&mut self, level: AccessLevel) -> DiagServerResult<()> {
        let algorithm = self
            .ecu
            .map(|e| e.variant().security_algorithm)
            .unwrap_or(SecurityAlgorithm::MultiplyXor);
        match self.kwp.security_access(level, algorithm) {
            Err(DiagError::NegativeResponse { .. }) if self.ecu.is_none() => {
                warn!("key rejected, retrying with the legacy derivation");
                self.kwp
                    .security_access(level, SecurityAlgorithm::XorFold)
            }
            other => other,
        }
    }

    /// Probes the variant table and binds the result
    pub fn identify(&mut self) -> DiagServerResult<Ecu> {
        let ecu = identify_ecu(&mut self.kwp)?;
        self.ecu = Some(ecu);
        Ok(ecu)
    }

    /// Reads a region into a full-size image buffer. Unread parts hold
    /// 0xFF, so partial dumps stay inspectable at their real offsets.
    pub fn read_region(
        &mut self,
        region: ReadRegion,
        progress: &mut dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> DiagServerResult<Vec<u8>> {
        let ecu = self.bound_ecu()?;
        let variant = ecu.variant();
        let (start, stop) = match region {
            ReadRegion::Calibration => (
                variant.calibration_section_address,
                variant.calibration_section_address + variant.calibration_size_bytes,
            ),
            ReadRegion::Program => (
                variant.program_section_address,
                variant.program_section_address + variant.program_section_size,
            ),
            ReadRegion::Full => {
                // Full dumps cover restricted areas; the development access
                // level unlocks them on patched ECUs
                if self.security_access(AccessLevel::Siemens).is_ok() {
                    info!("privilege escalation succeeded, full read available");
                } else {
                    warn!(
                        "privilege escalation failed; the read will only cover \
                         the calibration and program zones"
                    );
                }
                let start = ecu.bin_to_physical(0);
                (start, start + variant.eeprom_size_bytes as u32)
            }
        };
        self.read_range(start, stop, progress, cancel)
    }

    /// Reads `[start, stop)` and places it at its bin offset inside a
    /// full-size, 0xFF-prefilled image buffer.
    pub fn read_range(
        &mut self,
        address_start: u32,
        address_stop: u32,
        progress: &mut dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> DiagServerResult<Vec<u8>> {
        let ecu = self.bound_ecu()?;
        info!("reading from 0x{address_start:06X} to 0x{address_stop:06X}");
        let fetched = read_memory(&mut self.kwp, &ecu, address_start, address_stop, progress, cancel)?;

        let mut eeprom = vec![0xFF_u8; ecu.variant().eeprom_size_bytes];
        let bin_start = ecu.physical_to_bin(address_start);
        eeprom[bin_start..bin_start + fetched.len()].copy_from_slice(&fetched);
        Ok(eeprom)
    }

    /// Default dump filename:
    /// `{description}_{calibration}_{hw_rev_c}_{hw_rev_d}_{YYYY-MM-DD_HHMM}.bin`
    pub fn default_output_filename(&mut self) -> DiagServerResult<String> {
        let ecu = self.bound_ecu()?;
        let description = ecu.get_calibration_description(&mut self.kwp)?;
        let calibration = ecu.get_calibration(&mut self.kwp)?;
        let hw_rev_c = self
            .kwp
            .read_ecu_identification(IdentificationPid::BootloaderVersion as u8)?;
        let hw_rev_d = self
            .kwp
            .read_ecu_identification(IdentificationPid::ProgramCodeVersion as u8)?;
        Ok(format!(
            "{}_{}_{}_{}_{}.bin",
            strip(&description),
            strip(&calibration),
            strip(&String::from_utf8_lossy(&hw_rev_c[1..])),
            strip(&String::from_utf8_lossy(&hw_rev_d[1..])),
            chrono::Local::now().format("%Y-%m-%d_%H%M"),
        ))
    }

    /// Flashes the selected zones from a full-size image.
    ///
    /// The sequence is fixed: erase program, write program, erase
    /// calibration, write calibration, verify everything written in this
    /// session, reset. The first 16 bytes of each zone hold a ready flag
    /// and are never transferred; they stay erased until VerifyBlocks has
    /// accepted the zones. A failed verification surfaces the detailed
    /// reprogramming status and leaves the ECU soft-bricked (recoverable
    /// by flashing a valid image).
    pub fn flash_image(
        &mut self,
        image: &[u8],
        zones: FlashZones,
        progress: &mut dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> DiagServerResult<()> {
        let ecu = self.bound_ecu()?;
        let variant = ecu.variant();
        if image.len() < variant.eeprom_size_bytes {
            warn!(
                "image is {} bytes but {} expects {}",
                image.len(),
                variant.name,
                variant.eeprom_size_bytes
            );
            return Err(DiagError::ParameterInvalid);
        }

        if zones.program {
            info!("erasing program code section");
            self.kwp.start_routine(Routine::EraseProgram, &[])?;

            let bin_start =
                ecu.physical_to_bin(variant.program_section_address) + READY_FLAG_BYTES;
            let window = &image[bin_start..bin_start + variant.program_flash_size as usize];
            let payload = &window[..dynamic_find_end(window)];
            if payload.is_empty() {
                info!("program payload is all 0xFF, skipping the write");
            } else {
                let flash_start = variant.program_section_address + READY_FLAG_BYTES as u32;
                info!(
                    "writing {} program bytes at 0x{flash_start:06X}",
                    payload.len()
                );
                write_memory(&mut self.kwp, payload, flash_start, progress, cancel)?;
            }
        }

        if zones.calibration {
            info!("erasing calibration section");
            self.kwp.start_routine(Routine::EraseCalibration, &[])?;

            let bin_start =
                ecu.physical_to_bin(variant.calibration_section_address) + READY_FLAG_BYTES;
            let window = &image[bin_start..bin_start + variant.calibration_flash_size as usize
                - READY_FLAG_BYTES];
            let payload = &window[..dynamic_find_end(window)];
            if payload.is_empty() {
                info!("calibration payload is all 0xFF, skipping the write");
            } else {
                let flash_start = ecu.memory_write_address(
                    variant.calibration_section_address + READY_FLAG_BYTES as u32,
                );
                info!(
                    "writing {} calibration bytes (download address 0x{flash_start:08X})",
                    payload.len()
                );
                write_memory(&mut self.kwp, payload, flash_start, progress, cancel)?;
            }
        }

        self.verify_blocks()?;

        info!("resetting the ECU");
        self.kwp.set_timeout(RESET_TIMEOUT)?;
        match self.kwp.ecu_reset(ResetMode::PowerOnReset) {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {
                // The ECU reboots without answering more often than not
            }
            Err(e) => return Err(e),
        }
        self.kwp.set_timeout(SESSION_TIMEOUT)?;
        Ok(())
    }

    /// Runs VerifyBlocks under the widened timeout, translating a failure
    /// into the detailed reprogramming status.
    fn verify_blocks(&mut self) -> DiagServerResult<()> {
        info!("verifying written blocks (this can take minutes)");
        self.kwp.set_timeout(VERIFY_TIMEOUT)?;
        let verify = self.kwp.start_routine(Routine::VerifyBlocks, &[]);
        self.kwp.set_timeout(SESSION_TIMEOUT)?;

        match verify {
            Ok(_) => Ok(()),
            Err(DiagError::NegativeResponse { .. }) => {
                warn!("verifying blocks failed, did you forget to correct the checksum?");
                let data = self.kwp.start_routine(Routine::CheckReprogrammingStatus, &[])?;
                if data.len() < 3 {
                    return Err(DiagError::InvalidResponseLength);
                }
                let status =
                    ReprogrammingStatus::from_bits_retain(u16::from_be_bytes([data[1], data[2]]));
                warn!("reprogramming status: {status:?}");
                warn!(
                    "the ECU is now soft-bricked; there is no need to panic, \
                     flashing a valid image recovers it"
                );
                Err(DiagError::VerifyBlocksFailed { status })
            }
            Err(e) => Err(e),
        }
    }

    /// Clears learned adaptive values through IOCTL ResetToDefault
    pub fn clear_adaptive_values(&mut self) -> DiagServerResult<()> {
        let ecu = self.bound_ecu()?;
        ecu.clear_adaptive_values(&mut self.kwp, self.desired_baudrate)
    }

    /// Queries immobilizer status
    pub fn immo_query(&mut self) -> DiagServerResult<ImmoInfo> {
        immo::query_info(&mut self.kwp, self.desired_baudrate)
    }

    /// Resets the immobilizer with the 6 digit pin
    pub fn immo_reset(&mut self, pin: u32) -> DiagServerResult<ImmoOutcome> {
        immo::immo_reset(&mut self.kwp, self.desired_baudrate, pin)
    }

    /// Activates limp home mode with the 4 digit password
    pub fn limp_home(&mut self, password: u16) -> DiagServerResult<ImmoOutcome> {
        immo::limp_home(&mut self.kwp, self.desired_baudrate, password)
    }

    /// Teaches a single immobilizer key slot (0-3)
    pub fn teach_key(&mut self, index: u8, pin: u32) -> DiagServerResult<ImmoOutcome> {
        immo::teach_key(&mut self.kwp, self.desired_baudrate, index, pin)
    }

    /// Teaches `count` immobilizer keys
    pub fn teach_keys(&mut self, pin: u32, count: u8) -> DiagServerResult<ImmoOutcome> {
        immo::teach_keys(&mut self.kwp, self.desired_baudrate, pin, count)
    }

    /// Neutralizes the SMARTRA unit
    pub fn smartra_neutralize(&mut self, pin: u32) -> DiagServerResult<ImmoOutcome> {
        immo::smartra_neutralize(&mut self.kwp, self.desired_baudrate, pin)
    }

    /// Best-effort session teardown
    pub fn close(&mut self) {
        if let Err(e) = self.kwp.close() {
            warn!("session close failed: {e}");
        }
    }
}

fn strip(text: &str) -> String {
    text.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// Recomputes the checksums of an image file in place
pub fn correct_checksum_file(path: &Path) -> DiagServerResult<Vec<RegionReport>> {
    info!("reading {}", path.display());
    let mut image = std::fs::read(path)?;
    let reports = correct_checksum(&mut image)?;
    std::fs::write(path, &image)?;
    Ok(reports)
}

fn converted_path(path: &Path, extension: &str) -> PathBuf {
    path.with_extension(extension)
}

/// Converts a BIN image file to SIE, writing alongside the input
pub fn generate_sie(path: &Path) -> DiagServerResult<PathBuf> {
    let mut image = std::fs::read(path)?;
    lineswap::bin_to_sie(&mut image);
    let output = converted_path(path, "sie");
    std::fs::write(&output, &image)?;
    info!("converted file saved as {}", output.display());
    Ok(output)
}

/// Converts a SIE image file back to BIN
pub fn generate_bin(path: &Path) -> DiagServerResult<PathBuf> {
    let mut image = std::fs::read(path)?;
    lineswap::sie_to_bin(&mut image);
    let output = converted_path(path, "bin");
    std::fs::write(&output, &image)?;
    info!("converted file saved as {}", output.display());
    Ok(output)
}

/// BSL job: probe and report the flash hardware
pub fn bsl_hw_info(
    loader: &mut BslLoader,
    assets: &BslAssets,
    target: Option<TargetVariant>,
) -> DiagServerResult<(TargetVariant, &'static FlashChip)> {
    loader.connect(assets)?;
    Ok(loader.detect_chip(assets, target)?)
}

/// BSL job: dump the external flash to a file. Without `size` the whole
/// detected chip is read.
pub fn bsl_read(
    loader: &mut BslLoader,
    assets: &BslAssets,
    target: Option<TargetVariant>,
    size: Option<usize>,
    output: &Path,
    progress: &mut dyn ProgressSink,
) -> DiagServerResult<usize> {
    loader.connect(assets)?;
    let data = loader.read_external_flash(assets, target, size, progress)?;
    std::fs::write(output, &data)?;
    info!("saved {} bytes to {}", data.len(), output.display());
    Ok(data.len())
}

/// BSL job: program an image file into the external flash
pub fn bsl_write(
    loader: &mut BslLoader,
    assets: &BslAssets,
    target: Option<TargetVariant>,
    input: &Path,
    progress: &mut dyn ProgressSink,
) -> DiagServerResult<()> {
    let data = std::fs::read(input)?;
    info!("loaded {} bytes from {}", data.len(), input.display());
    loader.connect(assets)?;
    loader.write_external_flash(assets, target, &data, progress)?;
    Ok(())
}

/// BSL job: dump the internal mask ROM to a file
pub fn bsl_read_internal_rom(
    loader: &mut BslLoader,
    assets: &BslAssets,
    size: usize,
    output: &Path,
    progress: &mut dyn ProgressSink,
) -> DiagServerResult<usize> {
    loader.connect(assets)?;
    let data = loader.read_internal_rom(size, progress)?;
    std::fs::write(output, &data)?;
    info!("saved {} bytes to {}", data.len(), output.display());
    Ok(data.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::ECU_IDENTIFICATION_TABLE;
    use crate::hardware::simulation::SimulationChannel;
    use crate::NullProgress;

    fn i4_flasher<F>(responder: F) -> Flasher
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        let mut flasher = Flasher::new(Kwp2000Protocol::new(Box::new(SimulationChannel::new(
            responder,
        ))));
        flasher.set_ecu(Ecu::from_variant(&ECU_IDENTIFICATION_TABLE[1]));
        flasher
    }

    fn i4_image_with_program_payload() -> Vec<u8> {
        let mut image = vec![0xFF_u8; 0x80000];
        // Program zone starts at bin 0x20000; payload begins past the flag
        for byte in image[0x20010..0x20110].iter_mut() {
            *byte = 0x42;
        }
        image
    }

    #[test]
    fn flash_sequence_is_erase_write_verify_reset() {
        let mut image = i4_image_with_program_payload();
        // Calibration zone gets content too
        image[0x10010] = 0x01;

        let mut flasher = i4_flasher(|req| match req {
            [0x31, 0x00] | [0x31, 0x01] | [0x31, 0x02] => vec![vec![0x71, req[1]]],
            [0x34, ..] => vec![vec![0x74]],
            [0x36, ..] => vec![vec![0x76]],
            [0x37] => vec![vec![0x77]],
            [0x11, 0x01] => vec![vec![0x51, 0x01]],
            _ => vec![],
        });
        flasher
            .flash_image(
                &image,
                FlashZones::both(),
                &mut NullProgress,
                &CancellationToken::new(),
            )
            .unwrap();
    }

    #[test]
    fn failed_verify_surfaces_reprogramming_status() {
        let image = i4_image_with_program_payload();
        let mut flasher = i4_flasher(|req| match req {
            [0x31, 0x00] => vec![vec![0x71, 0x00]],
            [0x31, 0x02] => vec![vec![0x7F, 0x31, 0x10]],
            [0x31, 0x03] => vec![vec![0x71, 0x03, 0x00, 0x11]],
            [0x34, ..] => vec![vec![0x74]],
            [0x36, ..] => vec![vec![0x76]],
            [0x37] => vec![vec![0x77]],
            _ => vec![],
        });
        let err = flasher
            .flash_image(
                &image,
                FlashZones {
                    calibration: false,
                    program: true,
                },
                &mut NullProgress,
                &CancellationToken::new(),
            )
            .unwrap_err();
        match err {
            DiagError::VerifyBlocksFailed { status } => {
                assert!(status.contains(ReprogrammingStatus::CALIBRATION_CHECKSUM_CORRECT));
                assert!(status.contains(ReprogrammingStatus::SW_CHECKSUM_CORRECT));
                assert!(!status.contains(ReprogrammingStatus::REPROGRAMMING_COMPLETED));
            }
            other => panic!("expected VerifyBlocksFailed, got {other:?}"),
        }
    }

    #[test]
    fn undersized_image_is_rejected_before_any_erase() {
        let mut flasher = i4_flasher(|req| match req {
            // An erase reaching the wire would answer and fail the test
            [0x31, ..] => vec![],
            _ => vec![],
        });
        let err = flasher
            .flash_image(
                &[0u8; 0x1000],
                FlashZones::both(),
                &mut NullProgress,
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, DiagError::ParameterInvalid));
    }
}
