//! Built-in SIMK4x variant table and protocol constant catalogs
//!
//! Every variant-specific quirk lives as a field on [EcuVariant]; the table
//! is a compile-time constant, matched at identification time against live
//! memory reads. Addresses in the table are physical (live bus) addresses;
//! `bin_offset` converts them to image file offsets and `memory_offset`
//! converts them to the unified logical address space the flash controller
//! quirks are expressed in.

use bitflags::bitflags;
use strum_macros::FromRepr;

use crate::kwp2000::security_access::SecurityAlgorithm;

/// One entry of the built-in ECU variant table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcuVariant {
    /// Human label
    pub name: &'static str,
    /// Physical address probed during identification
    pub identification_offset: u32,
    /// Byte patterns accepted at the identification offset. Matching any
    /// one of them binds the variant.
    pub identification_expected: &'static [&'static [u8]],
    /// Total image size in bytes
    pub eeprom_size_bytes: usize,
    /// Signed delta from a physical address to its image file offset
    pub bin_offset: i64,
    /// Signed delta from the unified logical address space to physical
    pub memory_offset: i64,
    /// Verbatim per-variant constant for forming calibration RequestDownload
    /// addresses; applied as `(logical + memory_write_offset) << 4`.
    pub memory_write_offset: i64,
    /// Calibration zone start (physical)
    pub calibration_section_address: u32,
    /// Calibration zone length
    pub calibration_size_bytes: u32,
    /// Writable calibration span, pre-rounded to the transfer quantum
    pub calibration_flash_size: u32,
    /// Program zone start (physical)
    pub program_section_address: u32,
    /// Program zone length
    pub program_section_size: u32,
    /// Writable program span, pre-rounded to the transfer quantum
    pub program_flash_size: u32,
    /// Physical address window in which reads must degrade to one byte at
    /// a time (an eeprom page-switch quirk)
    pub single_byte_restriction: Option<(u32, u32)>,
    /// Key derivation this variant's security handshake expects
    pub security_algorithm: SecurityAlgorithm,
}

/// The built-in variant table, probed in order during identification
pub const ECU_IDENTIFICATION_TABLE: &[EcuVariant] = &[
    EcuVariant {
        name: "SIMK43 8mbit",
        identification_offset: 0x82014, // RSW zone
        identification_expected: &[b"6621"],
        eeprom_size_bytes: 0x100000,
        bin_offset: 0,
        memory_offset: 0,
        memory_write_offset: -0x7000,
        calibration_section_address: 0x90000,
        calibration_size_bytes: 0x10000,
        calibration_flash_size: 0xFEFE,
        program_section_address: 0xA0000,
        program_section_size: 0x60000,
        program_flash_size: 0x5FFE8,
        single_byte_restriction: None,
        security_algorithm: SecurityAlgorithm::MultiplyXor,
    },
    EcuVariant {
        name: "SIMK43 2.0 4mbit",
        identification_offset: 0x90040,
        identification_expected: &[b"ca66"],
        eeprom_size_bytes: 0x80000,
        bin_offset: -0x80000,
        memory_offset: 0,
        memory_write_offset: -0x7000,
        calibration_section_address: 0x90000,
        calibration_size_bytes: 0x10000,
        calibration_flash_size: 0xFEFE,
        program_section_address: 0xA0000,
        program_section_size: 0x60000,
        program_flash_size: 0x5FFE8,
        single_byte_restriction: Some((0x89FFF, 0x9000F)),
        security_algorithm: SecurityAlgorithm::MultiplyXor,
    },
    EcuVariant {
        name: "SIMK43 V6 4mbit (5WY17)",
        identification_offset: 0x88040,
        identification_expected: &[b"ca65401"],
        eeprom_size_bytes: 0x80000,
        bin_offset: -0x80000,
        memory_offset: -0x8000,
        memory_write_offset: -0x7800,
        calibration_section_address: 0x88000,
        calibration_size_bytes: 0x8000,
        calibration_flash_size: 0x5F40,
        program_section_address: 0x90000,
        program_section_size: 0x70000,
        program_flash_size: 0x6FFE4,
        single_byte_restriction: None,
        security_algorithm: SecurityAlgorithm::MultiplyXor,
    },
    EcuVariant {
        name: "SIMK43 V6 4mbit (5WY18+)",
        identification_offset: 0x88040,
        identification_expected: &[b"ca654", b"ca655"],
        eeprom_size_bytes: 0x80000,
        bin_offset: -0x80000,
        memory_offset: -0x8000,
        memory_write_offset: -0x7800,
        calibration_section_address: 0x88000,
        // A readable but non-writable stretch follows the calibration data
        calibration_size_bytes: 0x6EFF,
        calibration_flash_size: 0x6F20,
        program_section_address: 0x90000,
        program_section_size: 0x70000,
        program_flash_size: 0x6FFE4,
        single_byte_restriction: None,
        security_algorithm: SecurityAlgorithm::MultiplyXor,
    },
    EcuVariant {
        name: "SIMK41 / V6 2mbit",
        identification_offset: 0x48040,
        identification_expected: &[b"ca660", b"ca652", b"ca650"],
        eeprom_size_bytes: 0x40000,
        bin_offset: -0x40000,
        memory_offset: -0x48000,
        memory_write_offset: -0xB800,
        calibration_section_address: 0x48000,
        calibration_size_bytes: 0x8000,
        calibration_flash_size: 0x7F00,
        program_section_address: 0x50000,
        program_section_size: 0x30000,
        program_flash_size: 0x2FFF0,
        // Page switch just below the calibration zone
        single_byte_restriction: Some((0x41FFF, 0x4800F)),
        security_algorithm: SecurityAlgorithm::XorFold,
    },
    EcuVariant {
        name: "SIMK43 2.0 4mbit (Sonata)",
        identification_offset: 0x88040,
        identification_expected: &[b"ca661"],
        eeprom_size_bytes: 0x80000,
        bin_offset: -0x80000,
        memory_offset: -0x8000,
        memory_write_offset: -0x7800,
        calibration_section_address: 0x88000,
        // A 4mbit ECU with a calibration zone smaller than the 2mbit ones
        calibration_size_bytes: 0x5FF8,
        calibration_flash_size: 0x5F40,
        program_section_address: 0x90000,
        program_section_size: 0x70000,
        program_flash_size: 0x6FFE4,
        single_byte_restriction: None,
        security_algorithm: SecurityAlgorithm::MultiplyXor,
    },
];

/// Baud rate indices accepted by StartDiagnosticSession
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum BaudrateIndex {
    /// 10400 baud, the K-line default
    Baud10400 = 0x01,
    /// 20000 baud
    Baud20000 = 0x02,
    /// 40000 baud
    Baud40000 = 0x03,
    /// 60000 baud
    Baud60000 = 0x04,
    /// 120000 baud
    Baud120000 = 0x05,
}

impl BaudrateIndex {
    /// Link speed this index negotiates
    pub fn bits_per_second(self) -> u32 {
        match self {
            Self::Baud10400 => 10400,
            Self::Baud20000 => 20000,
            Self::Baud40000 => 40000,
            Self::Baud60000 => 60000,
            Self::Baud120000 => 120000,
        }
    }
}

/// Security access levels of the SIMK4x family
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum AccessLevel {
    /// Regular Hyundai diagnostic access
    Hyundai = 0x01,
    /// Siemens development access. Present on ECUs carrying the OpenGK
    /// IOCLID patch; unlocks full-memory reads over OBD2.
    Siemens = 0xFD,
}

/// Routine catalog for StartRoutineByLocalIdentifier
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Routine {
    /// Erase the program code section
    EraseProgram = 0x00,
    /// Erase the calibration section
    EraseCalibration = 0x01,
    /// Verify written blocks and mark them ready to execute
    VerifyBlocks = 0x02,
    /// Report the detailed reprogramming status word
    CheckReprogrammingStatus = 0x03,
    /// Query immobilizer info (keys learnt, ECU/key/SMARTRA status)
    QueryImmoInfo = 0x12,
    /// Prepare limp home password teaching
    BeforeLimpHomeTeaching = 0x13,
    /// Prepare immobilizer key teaching
    BeforeImmoKeyTeaching = 0x14,
    /// Prepare immobilizer reset
    BeforeImmoReset = 0x15,
    /// Prepare limp home activation
    BeforeLimpHome = 0x16,
    /// Submit a new limp home password
    LimpHomeInputNewPassword = 0x17,
    /// Activate limp home mode (password bytes as arguments)
    ActivateLimpHome = 0x18,
    /// Confirm the new limp home password
    LimpHomeConfirmNewPassword = 0x19,
    /// Submit the 6 digit immobilizer pin
    ImmoInputPassword = 0x1A,
    /// Teach immobilizer key 1
    ImmoTeachKey1 = 0x1B,
    /// Teach immobilizer key 2
    ImmoTeachKey2 = 0x1C,
    /// Teach immobilizer key 3
    ImmoTeachKey3 = 0x1D,
    /// Teach immobilizer key 4
    ImmoTeachKey4 = 0x1E,
    /// Confirm the immobilizer reset
    ImmoResetConfirm = 0x20,
    /// Prepare SMARTRA neutralization
    BeforeSmartraNeutralize = 0x25,
    /// Neutralize the SMARTRA unit
    SmartraNeutralize = 0x26,
}

/// Input/output local identifiers
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum IoIdentifier {
    /// Automatic transaxle version configuration
    VersionConfigurationAutomaticTransaxle = 0x40,
    /// Traction control version configuration
    VersionConfigurationTractionControl = 0x41,
    /// Learned adaptive values
    AdaptiveValues = 0x50,
    /// OpenGK patch privilege escalation hook
    PatchPrivilegeEscalation = 0xBB,
}

bitflags! {
    /// Consistency-check word returned by the CheckReprogrammingStatus
    /// routine after a failed block verification
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReprogrammingStatus: u16 {
        /// Checksum of the calibration data is correct
        const CALIBRATION_CHECKSUM_CORRECT = 1 << 0;
        /// Security keys for the calibration data are not written
        const CALIBRATION_KEYS_NOT_WRITTEN = 1 << 1;
        /// Security keys for the calibration data are correct
        const CALIBRATION_KEYS_CORRECT = 1 << 2;
        /// Calibration data is correct
        const CALIBRATION_DATA_CORRECT = 1 << 3;
        /// Checksum of the ECU software is correct
        const SW_CHECKSUM_CORRECT = 1 << 4;
        /// Security keys for the ECU software are not written
        const SW_KEYS_NOT_WRITTEN = 1 << 5;
        /// Security keys for the ECU software are correct
        const SW_KEYS_CORRECT = 1 << 6;
        /// ECU software is correct
        const SW_CORRECT = 1 << 7;
        /// Reprogramming completed successfully
        const REPROGRAMMING_COMPLETED = 1 << 8;
        /// ECU is not at the end of the reprogramming session
        const NOT_AT_END_OF_SESSION = 1 << 9;
        /// Coherence identifiers fit together
        const COHERENCE_IDS_FIT = 1 << 10;
        /// Calibration data does not fit the ECU software
        const CALIBRATION_DOES_NOT_FIT_SW = 1 << 11;
        /// ECU software does not fit the boot software
        const SW_DOES_NOT_FIT_BOOT = 1 << 12;
        /// Coherence identifier in the calibration data is erroneous
        const COHERENCE_ID_CALIBRATION_BAD = 1 << 13;
        /// Coherence identifier in the ECU software is erroneous
        const COHERENCE_ID_SW_BAD = 1 << 14;
        /// Coherence identifier in the boot software is erroneous
        const COHERENCE_ID_BOOT_BAD = 1 << 15;
    }
}
