//! Diagnostic session control, including baud-rate renegotiation

use log::{debug, info, warn};

use super::{Kwp2000Cmd, Kwp2000Protocol, ServiceId, SessionState};
use crate::definitions::BaudrateIndex;
use crate::DiagServerResult;

/// KWP2000 diagnostic session kinds supported by the SIMK4x family
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionKind {
    /// Normal operation; only non-intrusive services are available
    Default,
    /// Flash reprogramming session; memory and transfer services unlock
    FlashReprogramming,
    /// Stand-by (slave) session
    Standby,
    /// ECU development session; the ECU mutes normal bus traffic
    Passive,
    /// Extended diagnostics; every service is available
    ExtendedDiagnostics,
}

impl From<SessionKind> for u8 {
    fn from(x: SessionKind) -> Self {
        match x {
            SessionKind::Default => 0x81,
            SessionKind::FlashReprogramming => 0x85,
            SessionKind::Standby => 0x89,
            SessionKind::Passive => 0x90,
            SessionKind::ExtendedDiagnostics => 0x92,
        }
    }
}

impl Kwp2000Protocol {
    /// Starts (or switches to) a diagnostic session.
    ///
    /// With `desired_baudrate` set, the request carries the baud index and
    /// on a positive response the channel is reprogrammed to match. If the
    /// ECU does not answer at the current baud - typical when an earlier
    /// session already shifted it - buffers are drained, the channel is
    /// switched unilaterally and the request is retried once.
    pub fn start_diagnostic_session(
        &mut self,
        kind: SessionKind,
        desired_baudrate: Option<BaudrateIndex>,
    ) -> DiagServerResult<()> {
        match desired_baudrate {
            None => {
                self.execute(Kwp2000Cmd::new(
                    ServiceId::StartDiagnosticSession,
                    &[kind.into()],
                    true,
                ))?;
            }
            Some(baud) => {
                let cmd = Kwp2000Cmd::new(
                    ServiceId::StartDiagnosticSession,
                    &[kind.into(), baud as u8],
                    true,
                );
                info!(
                    "starting {kind:?} session with baud rate {}",
                    baud.bits_per_second()
                );
                match self.execute(cmd.clone()) {
                    Ok(_) => {
                        self.set_channel_baudrate(baud.bits_per_second())?;
                    }
                    Err(e) if e.is_timeout() => {
                        warn!(
                            "no answer at current baud, retrying at {} directly",
                            baud.bits_per_second()
                        );
                        self.drain_channel()?;
                        self.set_channel_baudrate(baud.bits_per_second())?;
                        self.execute(cmd)?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        debug!("diagnostic session {kind:?} established");
        self.set_state(SessionState::DiagnosticSession(kind));
        Ok(())
    }

    /// Stops the active diagnostic session, falling back to normal mode
    pub fn stop_diagnostic_session(&mut self) -> DiagServerResult<()> {
        self.execute(Kwp2000Cmd::new(ServiceId::StopDiagnosticSession, &[], true))?;
        self.set_state(SessionState::CommunicationStarted);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulation::SimulationChannel;

    #[test]
    fn session_with_baud_reprograms_channel() {
        let channel = SimulationChannel::new(|req| match req {
            [0x10, 0x85, 0x04] => vec![vec![0x50, 0x85]],
            _ => vec![],
        });
        let mut kwp = Kwp2000Protocol::new(Box::new(channel));
        kwp.start_diagnostic_session(
            SessionKind::FlashReprogramming,
            Some(BaudrateIndex::Baud60000),
        )
        .unwrap();
        assert_eq!(
            kwp.state(),
            SessionState::DiagnosticSession(SessionKind::FlashReprogramming)
        );
    }

    #[test]
    fn silent_ecu_triggers_blind_baud_switch() {
        // ECU only answers once the tester has itself moved to the new baud,
        // which the simulation models by ignoring the first attempt.
        let mut attempts = 0;
        let channel = SimulationChannel::new(move |req| match req {
            [0x10, 0x85, 0x02] => {
                attempts += 1;
                if attempts == 1 {
                    vec![]
                } else {
                    vec![vec![0x50, 0x85]]
                }
            }
            _ => vec![],
        });
        let mut kwp = Kwp2000Protocol::new(Box::new(channel));
        kwp.start_diagnostic_session(
            SessionKind::FlashReprogramming,
            Some(BaudrateIndex::Baud20000),
        )
        .unwrap();
    }
}
