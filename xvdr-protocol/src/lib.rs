//! Network protocol definitions for the XVDR live-TV streaming server.
//!
//! This crate defines the binary protocol spoken between the streaming server
//! and its clients. Every message starts with a big-endian channel tag that
//! selects how the rest is framed.
//!
//! # Request Format
//!
//! ```text
//! +---------+------------+--------+--------+------------------+
//! | Channel | Request ID | Opcode | Length |     Payload      |
//! |    1    |   u32 BE   | u32 BE | u32 BE |  Length bytes    |
//! +---------+------------+--------+--------+------------------+
//! ```
//!
//! # Example
//!
//! ```rust
//! use xvdr_protocol::{decode_server_frame, ResponsePacket, ReturnCode, ServerFrame, opcode};
//!
//! let mut resp = ResponsePacket::response(opcode::PING, 9);
//! resp.add_u32(ReturnCode::Ok.into());
//! let bytes = resp.finalise().unwrap();
//!
//! let (frame, used) = decode_server_frame(&bytes).unwrap().unwrap();
//! assert_eq!(used, bytes.len());
//! assert!(matches!(frame, ServerFrame::Response { request_id: 9, .. }));
//! ```

pub mod codec;
pub mod error;
pub mod types;

pub use codec::{
    decode_server_frame, FieldReader, RequestHeader, RequestPacket, ResponsePacket, ServerFrame,
    StreamPacketHeader,
};
pub use error::ProtocolError;
pub use types::{
    opcode, status_opcode, stream_opcode, stream_status, ChannelTag, ReturnCode, MAX_REQUEST_PAYLOAD,
    MUX_HEADER_SIZE, NO_PTS, PROTOCOL_VERSION, REQUEST_HEADER_SIZE, RESPONSE_HEADER_SIZE,
    STREAM_HEADER_SIZE,
};
