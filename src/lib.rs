#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications
)]

//! A crate for reflashing Siemens SIMK4x engine control units over K-line or
//! CAN using the KWP2000 (ISO14230) diagnostic protocol, with a factory
//! bootstrap-loader (BSL) recovery path over raw serial.
//!
//! ## Layers
//!
//! * [channel] / [hardware] - byte level transports (K-line serial with
//!   fast-init, ISO-TP over socketCAN)
//! * [kwp2000] - the KWP2000 session engine: framing, response-pending
//!   handling, keep-alive, timing parameters, security access
//! * [ecu] / [definitions] - the SIMK4x variant table and address model
//! * [memory] - paged reads and chunked flash writes
//! * [checksum] / [lineswap] - firmware image codec (CRC zones, BIN/SIE
//!   line-swap transform)
//! * [bsl] - the C167 bootstrap loader and external flash driver ABI
//! * [flasher] - the high level operations a CLI or GUI drives
//!
//! KWP2000 write operations on a running ECU can soft-brick it when misused.
//! The BSL path exists precisely because of that; treat both with caution.

use channel::ChannelError;
use hardware::HardwareError;

use crate::bsl::BslError;
use crate::definitions::ReprogrammingStatus;

pub mod bsl;
pub mod channel;
pub mod checksum;
pub mod config;
pub mod definitions;
pub mod ecu;
pub mod flasher;
pub mod hardware;
pub mod immo;
pub mod kwp2000;
pub mod lineswap;
pub mod memory;
pub mod smartra;

/// Diagnostic operation result
pub type DiagServerResult<T> = Result<T, DiagError>;

/// Diagnostic operation error
#[derive(Debug, thiserror::Error)]
pub enum DiagError {
    /// Error with the underlying communication channel
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    /// Device hardware error
    #[error("hardware error: {0}")]
    Hardware(#[from] HardwareError),
    /// Negative response from the ECU, with the raw status byte preserved.
    /// Status 0x78 (response pending) never surfaces here; the session
    /// engine consumes it internally.
    #[error("ECU rejected service 0x{service:02X} with status 0x{status:02X}")]
    NegativeResponse {
        /// Service ID of the rejected request
        service: u8,
        /// Raw negative status byte
        status: u8,
    },
    /// ECU provided an empty response
    #[error("ECU provided an empty response")]
    EmptyResponse,
    /// ECU responded, but not to the request that was sent
    #[error("ECU response message did not match request")]
    WrongMessage,
    /// ECU responded with a message of unexpected length
    #[error("ECU response message was of invalid length")]
    InvalidResponseLength,
    /// A parameter given to the function is invalid
    #[error("a parameter provided was invalid")]
    ParameterInvalid,
    /// No entry of the variant table matched the ECU
    #[error("failed to identify ECU")]
    IdentificationFailed,
    /// No known checksum layout matched the image
    #[error("could not detect the checksum layout of the image")]
    ChecksumDetectionFailed,
    /// Post-write block verification failed. The ECU is soft-bricked and
    /// recoverable by flashing a valid image.
    #[error("block verification failed, reprogramming status: {status:?}")]
    VerifyBlocksFailed {
        /// Detailed consistency-check bitfield reported by the ECU
        status: ReprogrammingStatus,
    },
    /// The operation was cancelled cooperatively
    #[error("operation cancelled")]
    Cancelled,
    /// Bootstrap loader error
    #[error("bootstrap loader error: {0}")]
    Bsl(#[from] BslError),
    /// File I/O error while reading or writing an image
    #[error("file error: {0}")]
    File(#[from] std::io::Error),
    /// Configuration file could not be parsed
    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),
}

impl DiagError {
    /// Returns true for errors that the block engines recover from by
    /// retrying the same sub-request (transport timeouts).
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DiagError::Channel(ChannelError::ReadTimeout | ChannelError::WriteTimeout)
        )
    }

    /// Returns the raw negative status byte, if this is a negative response.
    pub fn negative_status(&self) -> Option<u8> {
        match self {
            DiagError::NegativeResponse { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Receiver for progress reporting from long running operations.
///
/// The engines report progress through an explicit sink passed in by the
/// caller; there is no process-global progress state. A CLI typically backs
/// this with a progress bar, a GUI with a callback into its event loop.
pub trait ProgressSink {
    /// Called once when the total amount of work (in bytes) is known
    fn begin(&mut self, total: usize);
    /// Called when `amount` more bytes have been processed
    fn advance(&mut self, amount: usize);
    /// Called when the engine moves to a new sub-phase (page, packet, sector)
    fn phase(&mut self, title: &str);
}

/// A [ProgressSink] that discards all events
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn begin(&mut self, _total: usize) {}
    fn advance(&mut self, _amount: usize) {}
    fn phase(&mut self, _title: &str) {}
}
