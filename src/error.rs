//! Error types for lualink.

use thiserror::Error;

use crate::connection::RETRYABLE_CONNECTION_ERRORS;
use crate::correlator::Channel;

/// Main error type for all lualink operations.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The platform has no usable BLE capability.
    #[error("BLE transport unavailable on this platform")]
    TransportUnavailable,

    /// No peripheral matched the selector (or the user declined).
    #[error("device selection failed: {0}")]
    SelectionFailed(String),

    /// Link-layer failure during connection setup.
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed or missing handshake/protocol data.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Outbound data exceeds the negotiated per-write ceiling.
    #[error("payload of {size} bytes exceeds the transmission ceiling of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Caller passed an argument the protocol cannot represent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The negotiated transmission size is too small for the protocol.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No response arrived within the deadline.
    #[error("timed out waiting for a response")]
    Timeout,

    /// An awaited request is already pending on this response channel.
    #[error("a request is already pending on the {0} channel")]
    ChannelBusy(Channel),

    /// Escaped content could not be split at a valid boundary.
    #[error("chunking error: {0}")]
    Chunking(String),

    /// The remote runtime rejected a file operation.
    #[error("remote write failed: {0}")]
    RemoteWrite(String),

    /// The link dropped while an operation was in flight.
    #[error("link disconnected")]
    Disconnected,

    /// I/O error from a transport implementation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Whether a failed connection attempt may be retried.
    ///
    /// Only link-layer errors whose message matches one of the known
    /// transient GATT failure phrases qualify. Everything else aborts the
    /// retry loop immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            LinkError::Connection(msg) => RETRYABLE_CONNECTION_ERRORS
                .iter()
                .any(|phrase| msg.contains(phrase)),
            _ => false,
        }
    }
}

/// Result type alias using LinkError.
pub type Result<T> = std::result::Result<T, LinkError>;
