//! ECU-resident routine execution

use super::{Kwp2000Cmd, Kwp2000Protocol, ServiceId};
use crate::definitions::Routine;
use crate::DiagServerResult;

impl Kwp2000Protocol {
    /// Starts a routine from the SIMK4x routine catalog. Returns the
    /// response data (routine identifier echo first).
    pub fn start_routine(&mut self, routine: Routine, args: &[u8]) -> DiagServerResult<Vec<u8>> {
        self.start_routine_by_id(routine as u8, args)
    }

    /// Starts a routine by raw local identifier. The immobilizer key
    /// teaching sequence uses consecutive identifiers outside the catalog.
    pub fn start_routine_by_id(&mut self, id: u8, args: &[u8]) -> DiagServerResult<Vec<u8>> {
        let mut payload = vec![id];
        payload.extend_from_slice(args);
        let resp = self.execute(Kwp2000Cmd::new(
            ServiceId::StartRoutineByLocalIdentifier,
            &payload,
            true,
        ))?;
        Ok(resp.into_data())
    }
}
