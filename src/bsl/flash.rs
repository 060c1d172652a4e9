//! External flash programming through the kernel's driver-call ABI
//!
//! The kernel maps the external 29Fx00B flash at 0x800000 once the CPU bus
//! registers are configured, hosts an uploaded flash driver at 0xF600 and
//! scratch blocks at 0xFC00, and calls into the driver with R8-R15 set up
//! per function code. On 2.0L boards the flash sits behind the line-swap
//! permutation: the driver image goes up transformed and probed IDs come
//! back transformed.

use log::{debug, info, warn};

use super::{BslAssets, BslError, BslLoader, BslPhase};
use crate::lineswap;
use crate::ProgressSink;

const SYSCON_ADDR: u32 = 0x00FF12;
/// ROM unmapped, external bus active
const SYSCON_DATA_EXTERNAL: u16 = 0xE204;
/// Internal ROM mapped at 0x010000
const SYSCON_DATA_INTERNAL: u16 = 0xF604;
const BUSCON0_ADDR: u32 = 0x00FF0C;
const BUSCON0_DATA: u16 = 0x04AD;
const ADDRSEL1_ADDR: u32 = 0x00FE18;
const ADDRSEL1_DATA: u16 = 0x4008;
const BUSCON1_ADDR: u32 = 0x00FF14;
const BUSCON1_DATA: u16 = 0x848E;

/// RAM address the flash driver image is uploaded to
pub const DRIVER_ADDRESS: u32 = 0x00F600;
/// Entry point of the uploaded driver
pub const DRIVER_ENTRY_POINT: u32 = 0x00F640;
/// Scratch RAM the program loop stages blocks through
pub const DRIVER_COPY_ADDRESS: u32 = 0x00FC00;
/// Bus window of the external flash
pub const EXT_FLASH_ADDRESS: u32 = 0x800000;
/// Bus address of the internal mask ROM
pub const INT_ROM_ADDRESS: u32 = 0x010000;
/// Transfer granularity of block reads and the program loop
pub const BLOCK_LENGTH: usize = 0x200;

/// Program flash driver function
const FC_PROG: u16 = 0x00;
/// Erase flash driver function
const FC_ERASE: u16 = 0x01;
/// Get state driver function (ID probe)
const FC_GETSTATE: u16 = 0x06;
const FC_GETSTATE_ADDR_MANUFID: u16 = 0x00;
const FC_GETSTATE_ADDR_DEVICEID: u16 = 0x01;

/// Hardware revision the driver targets, deciding both the driver blob
/// and whether the line-swap transform applies
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TargetVariant {
    /// V6 boards, straight wiring
    V6,
    /// 2.0L boards, swapped address/data lines
    I4,
}

/// Boot sector placement of a 29Fx00B part
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BootSectorLocation {
    /// Small sectors at the top of the address space
    Top,
    /// Small sectors at the bottom
    Bottom,
}

/// One entry of the supported chip table
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FlashChip {
    /// Part label
    pub name: &'static str,
    /// Manufacturer ID word
    pub manufacturer_id: u16,
    /// Device ID (low byte)
    pub device_id: u8,
    /// Part size in bytes
    pub size_bytes: usize,
    /// Where the small boot sectors sit
    pub boot_sector: BootSectorLocation,
}

/// Supported AMD and ST 29Fx00B parts, keyed by manufacturer and device ID
pub const CHIP_TABLE: &[FlashChip] = &[
    FlashChip { name: "AM29F200BB", manufacturer_id: 0x01, device_id: 0x57, size_bytes: 1 << 18, boot_sector: BootSectorLocation::Bottom },
    FlashChip { name: "AM29F400BB", manufacturer_id: 0x01, device_id: 0xAB, size_bytes: 1 << 19, boot_sector: BootSectorLocation::Bottom },
    FlashChip { name: "AM29F800BB", manufacturer_id: 0x01, device_id: 0x58, size_bytes: 1 << 20, boot_sector: BootSectorLocation::Bottom },
    FlashChip { name: "AM29F200BT", manufacturer_id: 0x01, device_id: 0x51, size_bytes: 1 << 18, boot_sector: BootSectorLocation::Top },
    FlashChip { name: "AM29F400BT", manufacturer_id: 0x01, device_id: 0x23, size_bytes: 1 << 19, boot_sector: BootSectorLocation::Top },
    FlashChip { name: "AM29F800BT", manufacturer_id: 0x01, device_id: 0xD6, size_bytes: 1 << 20, boot_sector: BootSectorLocation::Top },
    FlashChip { name: "M29F200BB", manufacturer_id: 0x20, device_id: 0xD4, size_bytes: 1 << 18, boot_sector: BootSectorLocation::Bottom },
    FlashChip { name: "M29F400BB", manufacturer_id: 0x20, device_id: 0xD6, size_bytes: 1 << 19, boot_sector: BootSectorLocation::Bottom },
    FlashChip { name: "M29F200BT", manufacturer_id: 0x20, device_id: 0xD5, size_bytes: 1 << 18, boot_sector: BootSectorLocation::Top },
    FlashChip { name: "M29F400BT", manufacturer_id: 0x20, device_id: 0xD3, size_bytes: 1 << 19, boot_sector: BootSectorLocation::Top },
];

/// Manufacturer label for a probed ID word
pub fn manufacturer_name(id: u16) -> &'static str {
    match id {
        0x01 => "AMD",
        0x20 => "ST",
        _ => "Unknown Manufacturer",
    }
}

fn lookup_chip(manufacturer: u16, device: u8) -> Option<&'static FlashChip> {
    CHIP_TABLE
        .iter()
        .find(|chip| chip.manufacturer_id == manufacturer && chip.device_id == device)
}

/// Sector length at position `sector` for the given part. The small boot
/// block is 16K/8K/8K/32K, sitting in the first four sector positions on
/// bottom-boot parts and the last four on top-boot parts; everything else
/// is 64K.
pub fn sector_size(sector: usize, chip: &FlashChip) -> usize {
    match chip.boot_sector {
        BootSectorLocation::Bottom => match sector {
            0 => 0x4000,
            1 | 2 => 0x2000,
            3 => 0x8000,
            _ => 0x10000,
        },
        BootSectorLocation::Top => {
            if chip.size_bytes == 1 << 20 {
                match sector {
                    18 => 0x4000,
                    16 | 17 => 0x2000,
                    15 => 0x8000,
                    _ => 0x10000,
                }
            } else {
                match sector {
                    10 => 0x4000,
                    8 | 9 => 0x2000,
                    7 => 0x8000,
                    _ => 0x10000,
                }
            }
        }
    }
}

impl BslLoader {
    /// Configures the CPU bus registers for the external flash mapping
    pub fn configure_external_bus(&mut self) -> Result<(), BslError> {
        self.write_word(SYSCON_ADDR, SYSCON_DATA_EXTERNAL)?;
        self.write_word(BUSCON0_ADDR, BUSCON0_DATA)?;
        self.write_word(ADDRSEL1_ADDR, ADDRSEL1_DATA)?;
        self.write_word(BUSCON1_ADDR, BUSCON1_DATA)
    }

    /// Maps the internal mask ROM back in
    pub fn configure_internal_bus(&mut self) -> Result<(), BslError> {
        self.write_word(SYSCON_ADDR, SYSCON_DATA_INTERNAL)
    }

    /// Uploads a flash driver image into kernel RAM. For 2.0L boards the
    /// image goes through the word line-swap, matching the bus wiring the
    /// driver will execute behind.
    pub fn upload_driver(&mut self, image: &[u8], variant: TargetVariant) -> Result<(), BslError> {
        let mut driver = image.to_vec();
        if variant == TargetVariant::I4 {
            lineswap::bin_to_sie(&mut driver);
        }
        info!("sending {variant:?} driver ({} bytes)", driver.len());
        self.write_block(DRIVER_ADDRESS, &driver)?;
        self.set_phase_driver_loaded();
        Ok(())
    }

    fn set_phase_driver_loaded(&mut self) {
        // write_block leaves the phase untouched; driver residency is a
        // property of this layer
        if self.phase() == BslPhase::KernelRunning {
            self.force_phase(BslPhase::DriverLoaded);
        }
    }

    /// Probes the flash manufacturer and device IDs through the driver
    pub fn read_chip_ids(&mut self, variant: TargetVariant) -> Result<(u16, u8), BslError> {
        let write_high = (EXT_FLASH_ADDRESS >> 16) as u16;
        let read_high = (EXT_FLASH_ADDRESS >> 16) as u16;

        let registers = [FC_GETSTATE, 0, write_high, read_high, 0, 0, FC_GETSTATE_ADDR_MANUFID, 1];
        let ret = self.call_function(DRIVER_ENTRY_POINT, registers)?;
        let mut manufacturer = ret[1];

        let registers = [FC_GETSTATE, 0, write_high, read_high, 0, 0, FC_GETSTATE_ADDR_DEVICEID, 1];
        let ret = self.call_function(DRIVER_ENTRY_POINT, registers)?;
        let mut device = ret[1];

        if variant == TargetVariant::I4 {
            manufacturer = lineswap::sie_to_bin_word(manufacturer);
            device = lineswap::sie_to_bin_word(device);
        }
        Ok((manufacturer, (device & 0xFF) as u8))
    }

    /// Configures the bus, uploads a driver and identifies the flash part.
    ///
    /// Without an explicit `target`, the V6 driver is tried first; an
    /// implausible manufacturer ID switches to the 2.0L driver and probes
    /// again through the line-swap transform.
    pub fn detect_chip(
        &mut self,
        assets: &BslAssets,
        target: Option<TargetVariant>,
    ) -> Result<(TargetVariant, &'static FlashChip), BslError> {
        self.configure_external_bus()?;

        let variant = match target {
            Some(v) => v,
            None => {
                info!("trying V6 driver");
                self.upload_driver(&assets.driver_v6, TargetVariant::V6)?;
                let (manufacturer, _) = self.read_chip_ids(TargetVariant::V6)?;
                if manufacturer == 0x01 || manufacturer == 0x20 {
                    TargetVariant::V6
                } else {
                    warn!(
                        "unexpected manufacturer ID 0x{manufacturer:04X}, switching to 2.0L driver"
                    );
                    TargetVariant::I4
                }
            }
        };

        let image = match variant {
            TargetVariant::V6 => &assets.driver_v6,
            TargetVariant::I4 => &assets.driver_i4,
        };
        self.upload_driver(image, variant)?;

        let (manufacturer, device) = self.read_chip_ids(variant)?;
        info!(
            "manufacturer: {} (ID 0x{manufacturer:04X})",
            manufacturer_name(manufacturer)
        );
        let chip = lookup_chip(manufacturer, device).ok_or(BslError::ChipUnknown {
            manufacturer,
            device,
        })?;
        info!(
            "detected chip: {}, size 0x{:X}, boot sector {:?}",
            chip.name, chip.size_bytes, chip.boot_sector
        );
        Ok((variant, chip))
    }

    /// Erases flash sectors from offset 0 up to at least `size` bytes
    pub fn erase_flash(
        &mut self,
        chip: &FlashChip,
        size: usize,
        progress: &mut dyn ProgressSink,
    ) -> Result<(), BslError> {
        let mut offset = 0usize;
        let mut sector = 0usize;
        progress.begin(size);
        while offset < size {
            let sector_len = sector_size(sector, chip);
            let write_address = EXT_FLASH_ADDRESS + offset as u32;
            let last_word = (EXT_FLASH_ADDRESS as usize + offset + sector_len - 2) as u16;

            progress.phase(&format!("Erase sector {sector}"));
            let registers = [
                FC_ERASE,
                write_address as u16,
                (write_address >> 16) as u16,
                (write_address >> 16) as u16,
                last_word,
                0,
                sector as u16,
                1,
            ];
            let ret = self.call_function(DRIVER_ENTRY_POINT, registers)?;
            if ret[7] != 0 {
                return Err(BslError::DriverCallFailed { status: ret[7] });
            }
            debug!("erased sector {sector} ({sector_len} bytes at 0x{offset:06X})");
            progress.advance(sector_len.min(size - offset));
            offset += sector_len;
            sector += 1;
        }
        info!("erased {sector} sectors");
        Ok(())
    }

    /// Programs `data` into flash in 512-byte blocks, skipping blocks that
    /// are entirely 0xFF (erased flash already reads as 0xFF).
    pub fn program_flash(
        &mut self,
        data: &[u8],
        progress: &mut dyn ProgressSink,
    ) -> Result<(), BslError> {
        progress.begin(data.len());
        for (index, block) in data.chunks(BLOCK_LENGTH).enumerate() {
            let offset = index * BLOCK_LENGTH;
            if block.iter().all(|b| *b == 0xFF) {
                progress.advance(block.len());
                continue;
            }
            progress.phase(&format!("Program block 0x{offset:06X}"));
            self.write_block(DRIVER_COPY_ADDRESS, block)?;

            let write_address = EXT_FLASH_ADDRESS + offset as u32;
            let registers = [
                FC_PROG,
                block.len() as u16,
                DRIVER_COPY_ADDRESS as u16,
                0,
                (write_address >> 16) as u16,
                write_address as u16,
                (write_address >> 16) as u16,
                1,
            ];
            let ret = self.call_function(DRIVER_ENTRY_POINT, registers)?;
            if ret[7] != 0 {
                return Err(BslError::DriverCallFailed { status: ret[7] });
            }
            progress.advance(block.len());
        }
        info!("programmed 0x{:06X} bytes", data.len());
        Ok(())
    }

    /// Full external flash write: chip detection, sector erase covering
    /// the image, then the program loop.
    pub fn write_external_flash(
        &mut self,
        assets: &BslAssets,
        target: Option<TargetVariant>,
        data: &[u8],
        progress: &mut dyn ProgressSink,
    ) -> Result<(), BslError> {
        let (_, chip) = self.detect_chip(assets, target)?;
        self.erase_flash(chip, data.len(), progress)?;
        self.program_flash(data, progress)
    }

    /// Reads the external flash. Without an explicit `size` the detected
    /// chip's capacity is dumped.
    pub fn read_external_flash(
        &mut self,
        assets: &BslAssets,
        target: Option<TargetVariant>,
        size: Option<usize>,
        progress: &mut dyn ProgressSink,
    ) -> Result<Vec<u8>, BslError> {
        let (_, chip) = self.detect_chip(assets, target)?;
        let size = size.unwrap_or(chip.size_bytes);
        self.read_range(EXT_FLASH_ADDRESS, size, progress)
    }

    /// Reads the internal mask ROM after flipping SYSCON to the internal
    /// mapping
    pub fn read_internal_rom(
        &mut self,
        size: usize,
        progress: &mut dyn ProgressSink,
    ) -> Result<Vec<u8>, BslError> {
        self.configure_internal_bus()?;
        self.read_range(INT_ROM_ADDRESS, size, progress)
    }

    fn read_range(
        &mut self,
        base: u32,
        size: usize,
        progress: &mut dyn ProgressSink,
    ) -> Result<Vec<u8>, BslError> {
        let mut out = Vec::with_capacity(size);
        let mut offset = 0usize;
        progress.begin(size);
        while offset < size {
            let len = BLOCK_LENGTH.min(size - offset);
            let block = self.read_block(base + offset as u32, len)?;
            out.extend_from_slice(&block);
            offset += len;
            progress.advance(len);
            progress.phase(&format!("Read 0x{offset:06X}"));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_map_covers_the_part_exactly() {
        for chip in CHIP_TABLE {
            let mut offset = 0usize;
            let mut sector = 0usize;
            while offset < chip.size_bytes {
                offset += sector_size(sector, chip);
                sector += 1;
            }
            assert_eq!(offset, chip.size_bytes, "sector map overruns {}", chip.name);
        }
    }

    #[test]
    fn bottom_boot_small_sectors_lead() {
        let chip = &CHIP_TABLE[1]; // AM29F400BB
        assert_eq!(sector_size(0, chip), 0x4000);
        assert_eq!(sector_size(1, chip), 0x2000);
        assert_eq!(sector_size(2, chip), 0x2000);
        assert_eq!(sector_size(3, chip), 0x8000);
        assert_eq!(sector_size(4, chip), 0x10000);
    }

    #[test]
    fn chip_lookup_distinguishes_vendors_with_shared_device_ids() {
        // 0xD6 exists for both AMD (800BT) and ST (400BB)
        assert_eq!(lookup_chip(0x01, 0xD6).unwrap().name, "AM29F800BT");
        assert_eq!(lookup_chip(0x20, 0xD6).unwrap().name, "M29F400BB");
        assert!(lookup_chip(0x42, 0xD6).is_none());
    }
}
