//! KWP2000 (ISO14230) session engine for SIMK4x ECUs
//!
//! One [Kwp2000Protocol] owns one [Kwp2000Channel] exclusively and
//! serializes every exchange on it. The engine implements the parts of the
//! protocol that are easy to get subtly wrong:
//!
//! * positive/negative response discrimination with the `SID + 0x40` rule
//! * the "response pending" contract: negative status 0x78 re-arms the
//!   read instead of failing the operation
//! * tester-present keep-alive as a due-by deadline between operations
//!   (never interleaved inside a multi-frame exchange)
//! * baud-rate renegotiation with the blind-retry fallback for ECUs that
//!   already sit at the requested baud

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::channel::{ChannelError, Kwp2000Channel};
use crate::{DiagError, DiagServerResult};

pub mod access_timing_parameters;
pub mod data_transfer;
pub mod ecu_reset;
pub mod frame;
pub mod ioctl;
pub mod read_ecu_identification;
pub mod read_memory_by_address;
pub mod routine;
pub mod security_access;
pub mod start_diagnostic_session;

use self::start_diagnostic_session::SessionKind;

/// Negative response service ID
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;
/// Negative status meaning "request received, response pending"
pub const STATUS_RESPONSE_PENDING: u8 = 0x78;
/// Negative status meaning "can't upload from specified address"
pub const STATUS_CANT_UPLOAD_FROM_ADDRESS: u8 = 0x11;

/// KWP2000 service IDs used by the SIMK4x family
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ServiceId {
    /// Start or change the diagnostic session mode
    StartDiagnosticSession = 0x10,
    /// Reset the ECU
    EcuReset = 0x11,
    /// Stop the diagnostic session
    StopDiagnosticSession = 0x20,
    /// Read ECU identification parameters
    ReadEcuIdentification = 0x1A,
    /// Read raw memory by physical address
    ReadMemoryByAddress = 0x23,
    /// Seed/key security handshake
    SecurityAccess = 0x27,
    /// Actuate or reset a component by local identifier
    InputOutputControlByLocalIdentifier = 0x30,
    /// Start an ECU-resident routine by local identifier
    StartRoutineByLocalIdentifier = 0x31,
    /// Announce a download (tester to ECU) of a memory region
    RequestDownload = 0x34,
    /// Transfer one block of a running download
    TransferData = 0x36,
    /// Finish a download
    RequestTransferExit = 0x37,
    /// Write a data record by local identifier
    WriteDataByLocalIdentifier = 0x3B,
    /// Write raw memory by physical address
    WriteMemoryByAddress = 0x3D,
    /// Keep-alive
    TesterPresent = 0x3E,
    /// Start communication (fast init handshake)
    StartCommunication = 0x81,
    /// Stop communication
    StopCommunication = 0x82,
    /// Read or set session timing parameters
    AccessTimingParameters = 0x83,
}

/// Whether the ECU should answer a TesterPresent
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TesterPresentType {
    /// ECU must send a positive response
    ResponseRequired,
    /// ECU stays silent
    ResponseSuppressed,
}

impl From<TesterPresentType> for u8 {
    fn from(x: TesterPresentType) -> Self {
        match x {
            TesterPresentType::ResponseRequired => 0x01,
            TesterPresentType::ResponseSuppressed => 0x02,
        }
    }
}

/// Session engine state
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No communication established
    Closed,
    /// StartCommunication answered positively
    CommunicationStarted,
    /// A diagnostic session of the given kind is active
    DiagnosticSession(SessionKind),
    /// Security access has been granted on top of a diagnostic session
    SecurityGranted,
}

/// One KWP2000 request payload
#[derive(Clone)]
pub struct Kwp2000Cmd {
    bytes: Vec<u8>,
    response_required: bool,
}

impl std::fmt::Debug for Kwp2000Cmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kwp2000Cmd")
            .field("service", &format_args!("0x{:02X}", self.bytes[0]))
            .field("args", &format_args!("{:02X?}", &self.bytes[1..]))
            .field("response_required", &self.response_required)
            .finish()
    }
}

impl Kwp2000Cmd {
    /// Creates a new KWP2000 payload
    pub fn new(sid: ServiceId, args: &[u8], response_required: bool) -> Self {
        let mut bytes = Vec::with_capacity(args.len() + 1);
        bytes.push(sid as u8);
        bytes.extend_from_slice(args);
        Self {
            bytes,
            response_required,
        }
    }

    /// Creates a payload with a raw service ID outside [ServiceId], for
    /// the few undocumented services the family answers to.
    pub fn from_raw(sid: u8, args: &[u8], response_required: bool) -> Self {
        let mut bytes = Vec::with_capacity(args.len() + 1);
        bytes.push(sid);
        bytes.extend_from_slice(args);
        Self {
            bytes,
            response_required,
        }
    }

    /// Raw service ID byte of the command
    pub fn service(&self) -> u8 {
        self.bytes[0]
    }

    /// Full payload (service ID + arguments) as sent on the wire
    pub fn to_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// One positive KWP2000 response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kwp2000Response {
    bytes: Vec<u8>,
}

impl Kwp2000Response {
    /// Response service ID (request service + 0x40)
    pub fn service(&self) -> u8 {
        self.bytes.first().copied().unwrap_or(0)
    }

    /// Response data after the service ID
    pub fn data(&self) -> &[u8] {
        self.bytes.get(1..).unwrap_or(&[])
    }

    /// Consumes the response, yielding the data after the service ID
    pub fn into_data(mut self) -> Vec<u8> {
        if !self.bytes.is_empty() {
            self.bytes.remove(0);
        }
        self.bytes
    }
}

/// Default per-operation timeout once a session is up
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(12);
/// Quiet time after which the engine owes the ECU a TesterPresent
pub const DEFAULT_KEEPALIVE_DELAY: Duration = Duration::from_millis(1500);

/// KWP2000 session engine. Exclusive owner of its channel.
pub struct Kwp2000Protocol {
    channel: Box<dyn Kwp2000Channel>,
    state: SessionState,
    keepalive_delay: Duration,
    keepalive_deadline: Option<Instant>,
    operation_timeout: Duration,
}

impl std::fmt::Debug for Kwp2000Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kwp2000Protocol")
            .field("state", &self.state)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

impl Kwp2000Protocol {
    /// Wraps a channel into a session engine. The channel does not need to
    /// be open yet; [Kwp2000Protocol::init] opens it.
    pub fn new(channel: Box<dyn Kwp2000Channel>) -> Self {
        Self {
            channel,
            state: SessionState::Closed,
            keepalive_delay: DEFAULT_KEEPALIVE_DELAY,
            keepalive_deadline: None,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    /// Sets both the channel read timeout and the per-operation budget for
    /// response-pending polling.
    pub fn set_timeout(&mut self, timeout: Duration) -> DiagServerResult<()> {
        self.channel.set_timeout(timeout)?;
        self.operation_timeout = timeout;
        Ok(())
    }

    /// Currently configured per-operation timeout
    pub fn timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Reprograms the link baud rate on the underlying channel
    pub fn set_channel_baudrate(&mut self, baud: u32) -> DiagServerResult<()> {
        self.channel.set_baudrate(baud)?;
        Ok(())
    }

    /// Discards any unread input on the channel
    pub fn drain_channel(&mut self) -> DiagServerResult<()> {
        self.channel.drain_input()?;
        Ok(())
    }

    /// Opens the channel and performs StartCommunication. On K-line this
    /// runs the fast-init wake-up waveform; on CAN it is a plain request.
    pub fn init(&mut self) -> DiagServerResult<()> {
        self.channel.open()?;
        let cmd = Kwp2000Cmd::new(ServiceId::StartCommunication, &[], true);
        match self.channel.fast_init(cmd.to_bytes()) {
            Ok(()) => {}
            Err(ChannelError::UnsupportedRequest) => {
                self.channel.send_request(cmd.to_bytes())?;
            }
            Err(e) => return Err(e.into()),
        }
        let response = self.collect_response(cmd.service())?;
        debug!("StartCommunication OK, key bytes {:02X?}", response.data());
        self.state = SessionState::CommunicationStarted;
        self.arm_keepalive();
        Ok(())
    }

    /// Performs StopCommunication and closes the channel. Keep-alive is
    /// implicitly cancelled.
    pub fn close(&mut self) -> DiagServerResult<()> {
        if self.state != SessionState::Closed {
            let cmd = Kwp2000Cmd::new(ServiceId::StopCommunication, &[], true);
            if let Err(e) = self.exec_inner(cmd) {
                warn!("StopCommunication failed on close: {e}");
            }
        }
        self.keepalive_deadline = None;
        self.state = SessionState::Closed;
        self.channel.close()?;
        Ok(())
    }

    /// Sends a TesterPresent
    pub fn tester_present(&mut self, kind: TesterPresentType) -> DiagServerResult<()> {
        let response_required = kind == TesterPresentType::ResponseRequired;
        let cmd = Kwp2000Cmd::new(ServiceId::TesterPresent, &[kind.into()], response_required);
        self.exec_inner(cmd).map(|_| ())
    }

    /// Executes one command and collects its response. Between operations
    /// this also services the keep-alive duty.
    pub fn execute(&mut self, cmd: Kwp2000Cmd) -> DiagServerResult<Kwp2000Response> {
        if cmd.service() != ServiceId::TesterPresent as u8 {
            self.service_keepalive();
        }
        self.exec_inner(cmd)
    }

    /// Convenience wrapper building the command inline
    pub fn execute_sid(&mut self, sid: ServiceId, args: &[u8]) -> DiagServerResult<Kwp2000Response> {
        self.execute(Kwp2000Cmd::new(sid, args, true))
    }

    /// Sends a command without waiting for any response
    pub fn execute_no_response(&mut self, sid: ServiceId, args: &[u8]) -> DiagServerResult<()> {
        self.execute(Kwp2000Cmd::new(sid, args, false)).map(|_| ())
    }

    fn arm_keepalive(&mut self) {
        self.keepalive_deadline = Some(Instant::now() + self.keepalive_delay);
    }

    /// Sends a TesterPresent if the quiet period has elapsed. Failures are
    /// logged, not propagated; the following request will surface any real
    /// link problem itself.
    fn service_keepalive(&mut self) {
        let due = matches!(self.keepalive_deadline, Some(d) if Instant::now() >= d);
        if !due {
            return;
        }
        debug!("keep-alive due, sending TesterPresent");
        let cmd = Kwp2000Cmd::new(
            ServiceId::TesterPresent,
            &[TesterPresentType::ResponseRequired.into()],
            true,
        );
        if let Err(e) = self.exec_inner(cmd) {
            warn!("keep-alive TesterPresent failed: {e}");
        }
    }

    fn exec_inner(&mut self, cmd: Kwp2000Cmd) -> DiagServerResult<Kwp2000Response> {
        debug!("executing {cmd:?}");
        self.channel.send_request(cmd.to_bytes())?;
        let result = if cmd.response_required {
            self.collect_response(cmd.service())
        } else {
            Ok(Kwp2000Response { bytes: Vec::new() })
        };
        if self.keepalive_deadline.is_some() {
            self.arm_keepalive();
        }
        result
    }

    /// Reads frames until a terminal response for `sid` arrives. Negative
    /// status 0x78 re-arms the read; the accumulated wait is bounded by the
    /// per-operation timeout.
    fn collect_response(&mut self, sid: u8) -> DiagServerResult<Kwp2000Response> {
        let deadline = Instant::now() + self.operation_timeout;
        loop {
            let payload = self.channel.read_response()?;
            if payload.is_empty() {
                return Err(DiagError::EmptyResponse);
            }
            if payload[0] == NEGATIVE_RESPONSE_SID {
                if payload.len() < 3 {
                    return Err(DiagError::InvalidResponseLength);
                }
                let status = payload[2];
                if status == STATUS_RESPONSE_PENDING {
                    debug!("ECU busy (response pending), re-arming read");
                    if Instant::now() >= deadline {
                        warn!("ECU still pending after operation timeout");
                        return Err(ChannelError::ReadTimeout.into());
                    }
                    continue;
                }
                debug!("ECU negative response: service 0x{:02X} status 0x{status:02X}", payload[1]);
                return Err(DiagError::NegativeResponse {
                    service: payload[1],
                    status,
                });
            }
            if payload[0] != sid.wrapping_add(0x40) {
                warn!(
                    "response SID 0x{:02X} does not answer request 0x{sid:02X}",
                    payload[0]
                );
                return Err(DiagError::WrongMessage);
            }
            return Ok(Kwp2000Response { bytes: payload });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulation::SimulationChannel;

    fn protocol_with<F>(responder: F) -> Kwp2000Protocol
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        Kwp2000Protocol::new(Box::new(SimulationChannel::new(responder)))
    }

    #[test]
    fn positive_response_roundtrip() {
        let mut kwp = protocol_with(|req| match req[0] {
            0x1A => vec![vec![0x5A, req[1], 0x41, 0x42]],
            _ => vec![],
        });
        let resp = kwp
            .execute_sid(ServiceId::ReadEcuIdentification, &[0x8C])
            .unwrap();
        assert_eq!(resp.service(), 0x5A);
        assert_eq!(resp.data(), &[0x8C, 0x41, 0x42]);
    }

    #[test]
    fn response_pending_is_consumed() {
        let mut kwp = protocol_with(|req| match req[0] {
            0x31 => vec![
                vec![0x7F, 0x31, 0x78],
                vec![0x7F, 0x31, 0x78],
                vec![0x71, 0x02],
            ],
            _ => vec![],
        });
        let resp = kwp
            .execute_sid(ServiceId::StartRoutineByLocalIdentifier, &[0x02])
            .unwrap();
        assert_eq!(resp.data(), &[0x02]);
    }

    #[test]
    fn negative_response_surfaces_status() {
        let mut kwp = protocol_with(|req| match req[0] {
            0x23 => vec![vec![0x7F, 0x23, 0x11]],
            _ => vec![],
        });
        let err = kwp
            .execute_sid(ServiceId::ReadMemoryByAddress, &[0x09, 0x00, 0x00, 0x10])
            .unwrap_err();
        assert!(matches!(
            err,
            DiagError::NegativeResponse {
                service: 0x23,
                status: 0x11
            }
        ));
    }

    #[test]
    fn mismatched_response_sid_is_rejected() {
        let mut kwp = protocol_with(|req| match req[0] {
            0x3E => vec![vec![0x50, 0x81]],
            _ => vec![],
        });
        let err = kwp.tester_present(TesterPresentType::ResponseRequired).unwrap_err();
        assert!(matches!(err, DiagError::WrongMessage));
    }

    #[test]
    fn init_establishes_communication() {
        let mut kwp = protocol_with(|req| match req[0] {
            0x81 => vec![vec![0xC1, 0xEA, 0x8F]],
            _ => vec![],
        });
        kwp.init().unwrap();
        assert_eq!(kwp.state(), SessionState::CommunicationStarted);
    }
}
