//! Hardware adapters backing the logical [crate::channel::Kwp2000Channel]
//!
//! Two wire backends are provided: a K-line serial adapter (the primary
//! path for SIMK4x ECUs) and an ISO-TP socketCAN adapter (Linux only,
//! behind the `socketcan` feature). A scripted simulation channel is
//! included for unit testing the layers above.

pub mod kline;
pub mod simulation;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

/// Hardware API result
pub type HardwareResult<T> = Result<T, HardwareError>;

/// Error produced when locating or opening an adapter
#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    /// Low level driver error
    #[error("hardware API error: {desc}")]
    ApiError {
        /// API error description
        desc: String,
    },
    /// The named device does not exist on this machine
    #[error("device {name} not found")]
    DeviceNotFound {
        /// Interface name that failed to resolve
        name: String,
    },
}
