//! Module for logical communication channels with an ECU
//!
//! A [Kwp2000Channel] carries whole KWP2000 payloads (service ID plus
//! arguments). How a payload crosses the wire differs per backend: the
//! K-line channel wraps it in an ISO14230 frame and deals with the local
//! echo, the CAN channel hands it to ISO-TP unframed.

use std::time::Duration;

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Error produced by a communication channel
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Underlying IO error with the channel
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    /// Timeout when writing data to the channel
    #[error("timeout writing to channel")]
    WriteTimeout,
    /// Timeout when reading from the channel. Recoverable: the data is
    /// still owed by the ECU, nothing was lost.
    #[error("timeout reading from channel")]
    ReadTimeout,
    /// The interface is not open
    #[error("channel's interface is not open")]
    InterfaceNotOpen,
    /// Unsupported channel request
    #[error("unsupported channel request")]
    UnsupportedRequest,
    /// Received frame checksum did not match its contents
    #[error("frame checksum mismatch (received 0x{received:02X}, computed 0x{computed:02X})")]
    ChecksumMismatch {
        /// Checksum byte carried by the frame
        received: u8,
        /// Checksum computed over the received bytes
        computed: u8,
    },
    /// Received frame violated the framing rules
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    /// The local echo on K-line did not mirror the transmitted bytes
    #[error("local echo did not match transmitted bytes")]
    EchoMismatch,
    /// Underlying API error with hardware
    #[error("underlying {api} API error: {desc}")]
    ApiError {
        /// Name of the API, e.g. 'serialport', 'socketCAN'
        api: &'static str,
        /// API error description
        desc: String,
    },
}

/// Payload-level channel between the KWP2000 session engine and an ECU.
///
/// Exactly one operation may be in flight at any time; the session engine
/// holds the exclusive handle and serializes all access.
pub trait Kwp2000Channel: Send {
    /// Opens the interface. Called once before any traffic.
    fn open(&mut self) -> ChannelResult<()>;

    /// Closes and destroys the channel
    fn close(&mut self) -> ChannelResult<()>;

    /// Reprograms the link baud rate. On K-line this takes effect
    /// immediately; the caller is responsible for having negotiated the
    /// change with the ECU first.
    fn set_baudrate(&mut self, baud: u32) -> ChannelResult<()>;

    /// Sets the blocking-read timeout for [Kwp2000Channel::read_response]
    fn set_timeout(&mut self, timeout: Duration) -> ChannelResult<()>;

    /// Returns the currently configured read timeout
    fn timeout(&self) -> Duration;

    /// Transmits one request payload (service ID + arguments) to the ECU
    fn send_request(&mut self, payload: &[u8]) -> ChannelResult<()>;

    /// Blocks until one response payload arrives, or the configured
    /// timeout elapses ([ChannelError::ReadTimeout]).
    fn read_response(&mut self) -> ChannelResult<Vec<u8>>;

    /// Discards everything in the receive buffer
    fn drain_input(&mut self) -> ChannelResult<()>;

    /// Performs the K-line fast-init wake-up waveform and transmits the
    /// given StartCommunication payload as part of it. Channels without a
    /// physical init sequence return [ChannelError::UnsupportedRequest]
    /// and the caller falls back to a plain request.
    fn fast_init(&mut self, payload: &[u8]) -> ChannelResult<()> {
        let _ = payload;
        Err(ChannelError::UnsupportedRequest)
    }
}
