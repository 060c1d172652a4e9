//! ECU reset service

use super::{Kwp2000Cmd, Kwp2000Protocol, ServiceId, SessionState};
use crate::DiagServerResult;

/// ECU reset modes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResetMode {
    /// Simulates a power off/on cycle. Mandatory on all ECUs.
    PowerOnReset,
    /// Resets only non-volatile memory
    NonVolatileMemoryReset,
}

impl From<ResetMode> for u8 {
    fn from(x: ResetMode) -> Self {
        match x {
            ResetMode::PowerOnReset => 0x01,
            ResetMode::NonVolatileMemoryReset => 0x82,
        }
    }
}

impl Kwp2000Protocol {
    /// Requests an ECU reset. A resetting ECU frequently drops off the bus
    /// before answering, so callers at the end of a flash sequence treat a
    /// timeout here as success.
    pub fn ecu_reset(&mut self, mode: ResetMode) -> DiagServerResult<()> {
        let result = self
            .execute(Kwp2000Cmd::new(ServiceId::EcuReset, &[mode.into()], true))
            .map(|_| ());
        self.set_state(SessionState::Closed);
        result
    }
}
