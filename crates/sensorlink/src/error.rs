//! Error types for SensorLink
//!
//! Each kind carries its own handling policy: establishment failures are
//! fatal for the role that hit them, framing and decode failures end one
//! connection, delivery failures remove one subscriber, and malformed
//! control values are skipped.

use std::net::SocketAddr;
use std::time::Duration;

/// Transport establishment failures (bind, connect, accept)
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Could not bind a listening or datagram socket
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Remote unreachable or refused the connection
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Listener failed while accepting a consumer
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),
}

/// Stream boundary violations while decoding frames.
///
/// A clean end-of-stream between frames is not an error.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// Stream ended inside a frame header or payload
    #[error("stream ended mid-frame: needed {needed} bytes, got {received}")]
    Truncated { needed: usize, received: usize },

    /// Declared length exceeds the configured maximum
    #[error("frame too large: declared {declared} > max {max}")]
    OversizedFrame { declared: usize, max: usize },

    /// Underlying read failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FramingError {
    /// True for the two boundary-violation kinds (not plain I/O).
    pub fn is_boundary_violation(&self) -> bool {
        matches!(self, Self::Truncated { .. } | Self::OversizedFrame { .. })
    }
}

/// A frame sink could not interpret a payload.
#[derive(Debug, thiserror::Error)]
#[error("payload decode failed: {reason}")]
pub struct DecodeError {
    pub reason: String,
}

impl DecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Errors that end a consumer's receive loop
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// A control datagram did not contain a finite decimal number.
#[derive(Debug, thiserror::Error)]
#[error("malformed control value from {from}: {reason}")]
pub struct MalformedValueError {
    pub from: SocketAddr,
    pub reason: String,
}

/// Errors from a single control-channel receive
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Malformed(#[from] MalformedValueError),

    #[error("datagram receive failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A subscriber did not accept a write within the configured bound.
#[derive(Debug, thiserror::Error)]
#[error("write to {peer} timed out after {timeout:?}")]
pub struct WriteTimeoutError {
    pub peer: SocketAddr,
    pub timeout: Duration,
}

/// Per-subscriber fan-out failure; isolated to that subscriber.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Timeout(#[from] WriteTimeoutError),

    #[error("write to {peer} failed: {source}")]
    Io {
        peer: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Control-channel setup errors
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Paced senders need a non-zero interval
    #[error("send interval must be greater than zero")]
    InvalidInterval,
}
