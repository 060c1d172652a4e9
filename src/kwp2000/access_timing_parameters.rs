//! Session timing parameter access (P2/P3/P4 windows)

use log::warn;

use super::{Kwp2000Cmd, Kwp2000Protocol, ServiceId};
use crate::{DiagError, DiagServerResult};

/// AccessTimingParameters sub-functions
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum TimingParameterMode {
    /// Read the limits the ECU can be driven to
    ReadLimits = 0x00,
    /// Restore the ISO14230 defaults
    SetToDefault = 0x01,
    /// Read the currently active values
    ReadCurrent = 0x02,
    /// Program the given values
    SetToGiven = 0x03,
}

/// One set of session timing parameters, in the raw ISO14230 encoding
/// (each byte scales per the standard's resolution tables).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TimingParameters {
    /// Minimum ECU response delay
    pub p2_min: u8,
    /// Maximum ECU response delay
    pub p2_max: u8,
    /// Minimum tester request gap
    pub p3_min: u8,
    /// Maximum tester request gap before the session drops
    pub p3_max: u8,
    /// Minimum inter-byte time for tester transmissions
    pub p4_min: u8,
}

impl TimingParameters {
    fn from_payload(data: &[u8]) -> DiagServerResult<Self> {
        // Data starts with the sub-function echo
        match data {
            [_, p2_min, p2_max, p3_min, p3_max, p4_min, ..] => Ok(Self {
                p2_min: *p2_min,
                p2_max: *p2_max,
                p3_min: *p3_min,
                p3_max: *p3_max,
                p4_min: *p4_min,
            }),
            _ => Err(DiagError::InvalidResponseLength),
        }
    }

    fn to_args(self) -> [u8; 5] {
        [self.p2_min, self.p2_max, self.p3_min, self.p3_max, self.p4_min]
    }
}

impl Kwp2000Protocol {
    /// Reads the timing limits the ECU supports
    pub fn read_timing_limits(&mut self) -> DiagServerResult<TimingParameters> {
        let resp = self.execute(Kwp2000Cmd::new(
            ServiceId::AccessTimingParameters,
            &[TimingParameterMode::ReadLimits as u8],
            true,
        ))?;
        TimingParameters::from_payload(resp.data())
    }

    /// Reads the currently active timing parameters
    pub fn read_current_timing(&mut self) -> DiagServerResult<TimingParameters> {
        let resp = self.execute(Kwp2000Cmd::new(
            ServiceId::AccessTimingParameters,
            &[TimingParameterMode::ReadCurrent as u8],
            true,
        ))?;
        TimingParameters::from_payload(resp.data())
    }

    /// Programs the given timing parameters
    pub fn set_timing(&mut self, timing: TimingParameters) -> DiagServerResult<()> {
        let mut args = vec![TimingParameterMode::SetToGiven as u8];
        args.extend_from_slice(&timing.to_args());
        self.execute(Kwp2000Cmd::new(ServiceId::AccessTimingParameters, &args, true))?;
        Ok(())
    }

    /// Restores the ECU's default timing parameters
    pub fn set_default_timing(&mut self) -> DiagServerResult<()> {
        self.execute(Kwp2000Cmd::new(
            ServiceId::AccessTimingParameters,
            &[TimingParameterMode::SetToDefault as u8],
            true,
        ))?;
        Ok(())
    }

    /// Reads the ECU's timing limits and programs them back as the active
    /// values, giving the fastest session the ECU claims to support. Not
    /// every SIMK4x supports the service; a negative response is tolerated.
    pub fn maximize_timing(&mut self) -> DiagServerResult<()> {
        match self.read_timing_limits() {
            Ok(limits) => self.set_timing(limits),
            Err(DiagError::NegativeResponse { status, .. }) => {
                warn!("timing parameter access not supported (status 0x{status:02X})");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulation::SimulationChannel;

    #[test]
    fn maximize_programs_read_limits() {
        let channel = SimulationChannel::new(|req| match req {
            [0x83, 0x00] => vec![vec![0xC3, 0x00, 0x00, 0x32, 0x00, 0xFF, 0x05]],
            [0x83, 0x03, 0x00, 0x32, 0x00, 0xFF, 0x05] => vec![vec![0xC3, 0x03]],
            _ => vec![vec![0x7F, 0x83, 0x12]],
        });
        let mut kwp = Kwp2000Protocol::new(Box::new(channel));
        kwp.maximize_timing().unwrap();
    }

    #[test]
    fn unsupported_service_is_tolerated() {
        let channel = SimulationChannel::new(|req| match req[0] {
            0x83 => vec![vec![0x7F, 0x83, 0x11]],
            _ => vec![],
        });
        let mut kwp = Kwp2000Protocol::new(Box::new(channel));
        kwp.maximize_timing().unwrap();
    }
}
