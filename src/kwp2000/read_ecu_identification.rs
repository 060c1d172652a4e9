//! ECU identification parameter catalog (PIDs 0x86-0x9F)

use strum_macros::EnumIter;

use super::{Kwp2000Cmd, Kwp2000Protocol, ServiceId};
use crate::{DiagError, DiagServerResult};

/// Identification parameters a SIMK4x answers to. The 0x8A-0x8F block is
/// system-supplier specific; the names for 0x8C-0x8E are what Siemens put
/// there on this family.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, EnumIter)]
#[repr(u8)]
pub enum IdentificationPid {
    /// DCS ECU identification
    DcsEcuIdentification = 0x86,
    /// DCX/MMC ECU identification
    DcxMmcEcuIdentification = 0x87,
    /// VIN as programmed at the factory
    OriginalVin = 0x88,
    /// Diagnostic variant code
    DiagnosticVariantCode = 0x89,
    /// System supplier specific
    SupplierSpecific8A = 0x8A,
    /// System supplier specific
    SupplierSpecific8B = 0x8B,
    /// Bootloader version
    BootloaderVersion = 0x8C,
    /// Program code version
    ProgramCodeVersion = 0x8D,
    /// Calibration version
    CalibrationVersion = 0x8E,
    /// System supplier specific
    SupplierSpecific8F = 0x8F,
    /// VIN as currently stored
    CurrentVin = 0x90,
    /// Calibration identification
    CalibrationIdentification = 0x96,
    /// Calibration verification number
    CalibrationVerificationNumber = 0x97,
    /// ECU code fingerprint
    EcuCodeFingerprint = 0x9A,
    /// ECU data fingerprint
    EcuDataFingerprint = 0x9B,
    /// ECU code software identification
    EcuCodeSoftwareId = 0x9C,
    /// ECU data software identification
    EcuDataSoftwareId = 0x9D,
    /// ECU boot software identification
    EcuBootSoftwareId = 0x9E,
    /// ECU boot fingerprint
    EcuBootFingerprint = 0x9F,
}

impl IdentificationPid {
    /// Human readable label, as printed by the identification report
    pub fn name(&self) -> &'static str {
        match self {
            Self::DcsEcuIdentification => "DCS ECU Identification",
            Self::DcxMmcEcuIdentification => "DCX/MMC ECU Identification",
            Self::OriginalVin => "VIN (original)",
            Self::DiagnosticVariantCode => "Diagnostic Variant Code",
            Self::SupplierSpecific8A | Self::SupplierSpecific8B | Self::SupplierSpecific8F => {
                "System supplier specific"
            }
            Self::BootloaderVersion => "Bootloader version",
            Self::ProgramCodeVersion => "Program code version",
            Self::CalibrationVersion => "Calibration version",
            Self::CurrentVin => "VIN (current)",
            Self::CalibrationIdentification => "Calibration identification",
            Self::CalibrationVerificationNumber => "Calibration Verification Number",
            Self::EcuCodeFingerprint => "ECU Code Fingerprint",
            Self::EcuDataFingerprint => "ECU Data Fingerprint",
            Self::EcuCodeSoftwareId => "ECU Code Software Identification",
            Self::EcuDataSoftwareId => "ECU Data Software Identification",
            Self::EcuBootSoftwareId => "ECU Boot Software Identification",
            Self::EcuBootFingerprint => "ECU Boot Fingerprint",
        }
    }
}

impl Kwp2000Protocol {
    /// Reads one identification record. The returned bytes start with the
    /// record's status byte, followed by the value.
    pub fn read_ecu_identification(&mut self, pid: u8) -> DiagServerResult<Vec<u8>> {
        let resp = self.execute(Kwp2000Cmd::new(
            ServiceId::ReadEcuIdentification,
            &[pid],
            true,
        ))?;
        if resp.data().is_empty() {
            return Err(DiagError::InvalidResponseLength);
        }
        Ok(resp.into_data())
    }

    /// Sweeps the whole identification catalog, skipping records the ECU
    /// rejects. Returns `(pid, value)` pairs with the status byte stripped.
    pub fn fetch_ecu_identification(
        &mut self,
    ) -> DiagServerResult<Vec<(IdentificationPid, Vec<u8>)>> {
        use strum::IntoEnumIterator;
        let mut values = Vec::new();
        for pid in IdentificationPid::iter() {
            match self.read_ecu_identification(pid as u8) {
                Ok(record) => values.push((pid, record[1..].to_vec())),
                Err(DiagError::NegativeResponse { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulation::SimulationChannel;

    #[test]
    fn sweep_skips_rejected_pids() {
        let channel = SimulationChannel::new(|req| match req {
            [0x1A, 0x8C] => vec![vec![0x5A, 0x8C, 0x00, b'V', b'1']],
            [0x1A, pid] => vec![vec![0x7F, 0x1A, 0x31, *pid]],
            _ => vec![],
        });
        let mut kwp = Kwp2000Protocol::new(Box::new(channel));
        let values = kwp.fetch_ecu_identification().unwrap();
        assert_eq!(
            values,
            vec![(IdentificationPid::BootloaderVersion, vec![b'V', b'1'])]
        );
    }
}
