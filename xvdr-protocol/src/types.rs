//! Wire constants and identifiers for the XVDR network protocol.

/// Maximum accepted request payload (sanity ceiling against malformed input).
pub const MAX_REQUEST_PAYLOAD: u32 = 200_000;

/// Size of a request header following the channel tag: request id, opcode, length.
pub const REQUEST_HEADER_SIZE: usize = 12;

/// Size of a request/response or status preamble: channel, opcode, id, length.
pub const RESPONSE_HEADER_SIZE: usize = 16;

/// Size of a stream control preamble: channel, opcode, stream id, duration, length.
pub const STREAM_HEADER_SIZE: usize = 20;

/// Size of a muxed packet header (nine big-endian words).
pub const MUX_HEADER_SIZE: usize = 36;

/// Timestamp value used when a packet carries no PTS/DTS.
pub const NO_PTS: u64 = 0xFFF0_0000_0000_0000;

/// Logical channels multiplexed over one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelTag {
    /// Command request / response.
    RequestResponse = 1,
    /// Live stream data and stream control messages.
    Stream = 2,
    /// Keepalive echo.
    Keepalive = 3,
    /// Asynchronous status notifications.
    Status = 5,
}

impl TryFrom<u32> for ChannelTag {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ChannelTag::RequestResponse),
            2 => Ok(ChannelTag::Stream),
            3 => Ok(ChannelTag::Keepalive),
            5 => Ok(ChannelTag::Status),
            other => Err(other),
        }
    }
}

impl From<ChannelTag> for u32 {
    fn from(value: ChannelTag) -> Self {
        value as u32
    }
}

/// Client command opcodes understood by the server core.
pub mod opcode {
    pub const LOGIN: u32 = 1;
    pub const GET_TIME: u32 = 2;
    pub const ENABLE_STATUS_INTERFACE: u32 = 3;
    pub const PING: u32 = 7;
    pub const CHANNEL_STREAM_OPEN: u32 = 20;
    pub const CHANNEL_STREAM_CLOSE: u32 = 21;
}

/// Opcodes of messages sent on the stream channel.
pub mod stream_opcode {
    pub const CHANGE: u32 = 1;
    pub const STATUS: u32 = 2;
    pub const MUXPKT: u32 = 4;
    pub const SIGNAL_INFO: u32 = 5;
    pub const CONTENT_INFO: u32 = 6;
}

/// Payload values of a stream `STATUS` message.
pub mod stream_status {
    pub const SIGNAL_LOST: u32 = 111;
    pub const SIGNAL_RESTORED: u32 = 112;
}

/// Opcodes of messages sent on the status channel.
pub mod status_opcode {
    pub const TIMER_CHANGE: u32 = 1;
    pub const RECORDING: u32 = 2;
    pub const MESSAGE: u32 = 3;
    pub const CHANNEL_CHANGE: u32 = 4;
    pub const RECORDINGS_CHANGE: u32 = 5;
}

/// Protocol version announced at login.
pub const PROTOCOL_VERSION: u32 = 1;

/// Return code carried as the first field of command responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReturnCode {
    /// Operation succeeded.
    Ok = 0,
    /// A recording is running on the requested resource.
    RecRunning = 1,
    /// Opcode not supported.
    NotSupported = 995,
    /// Requested data is unknown.
    DataUnknown = 996,
    /// Requested resource is locked (device busy, tuning failure).
    DataLocked = 997,
    /// Request data is invalid (unknown channel, malformed payload).
    DataInvalid = 998,
    /// Generic failure.
    Error = 999,
}

impl From<u32> for ReturnCode {
    fn from(value: u32) -> Self {
        match value {
            0 => ReturnCode::Ok,
            1 => ReturnCode::RecRunning,
            995 => ReturnCode::NotSupported,
            996 => ReturnCode::DataUnknown,
            997 => ReturnCode::DataLocked,
            998 => ReturnCode::DataInvalid,
            _ => ReturnCode::Error,
        }
    }
}

impl From<ReturnCode> for u32 {
    fn from(value: ReturnCode) -> Self {
        value as u32
    }
}

impl ReturnCode {
    /// Returns true if this code indicates success.
    pub fn is_ok(self) -> bool {
        self == ReturnCode::Ok
    }
}
