//! Error types for the relay engine

use thiserror::Error;

/// Errors surfaced by the relay engine
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("packet too short: need {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("unsupported IP version: {0}")]
    InvalidIpVersion(u8),

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("cannot serialize ICMP type {0}, only echo packets are supported")]
    UnsupportedIcmpType(u8),

    #[error("invalid flow state: {0}")]
    InvalidState(String),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
