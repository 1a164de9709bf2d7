//! Error types for the XVDR network protocol.

use thiserror::Error;

/// Protocol-level errors that can occur while decoding or building messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Channel tag is unknown or not valid in this direction.
    #[error("Unknown channel tag: {0}")]
    UnknownChannel(u32),

    /// Request payload exceeds the sanity ceiling.
    #[error("Payload too large: {0} bytes (max: {1})")]
    PayloadTooLarge(u32, u32),

    /// Not enough bytes to decode the requested field.
    #[error("Incomplete data: expected {expected} bytes, got {actual}")]
    Incomplete { expected: usize, actual: usize },

    /// String field is not NUL-terminated or not valid UTF-8.
    #[error("Invalid string field: {0}")]
    InvalidString(String),

    /// A field was appended to a packet that has not been initialised.
    #[error("Packet not initialised")]
    NotInitialised,

    /// The packet was already initialised in another mode.
    #[error("Packet already initialised as {0}")]
    AlreadyInitialised(&'static str),
}
