//! Connection-level errors.

use std::io;

use thiserror::Error;
use xvdr_protocol::ProtocolError;

/// Reasons a client connection is closed.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Read timed out")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Opcode {0} received before login")]
    NotLoggedIn(u32),

    #[error("Unknown channel tag {0}")]
    UnknownChannel(u32),

    #[error("Connection closed by writer")]
    Closed,
}

impl From<tokio::time::error::Elapsed> for ConnectionError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ConnectionError::Timeout
    }
}
