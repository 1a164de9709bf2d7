//! Codec for requests, responses and stream messages.
//!
//! Request (client to server), after the 4-byte channel tag:
//! ```text
//! +------------+--------+--------+------------------+
//! | Request ID | Opcode | Length |     Payload      |
//! |   u32 BE   | u32 BE | u32 BE |  Length bytes    |
//! +------------+--------+--------+------------------+
//! ```
//!
//! Server messages all start with the channel tag and carry a length that is
//! back-patched by [`ResponsePacket::finalise`]:
//! ```text
//! response: [1][opcode][request id][length][fields...]
//! stream:   [2][opcode][stream id][duration][length][fields...]
//! status:   [5][opcode][0][length][fields...]
//! muxpkt:   [2][4][stream id][duration][dts hi][dts lo][pts hi][pts lo][length][payload]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::types::*;

/// Decoded request header (the part after the channel tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub request_id: u32,
    pub opcode: u32,
    pub payload_len: u32,
}

impl RequestHeader {
    /// Decode a request header from exactly [`REQUEST_HEADER_SIZE`] bytes.
    ///
    /// Fails if the announced payload exceeds [`MAX_REQUEST_PAYLOAD`].
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < REQUEST_HEADER_SIZE {
            return Err(ProtocolError::Incomplete {
                expected: REQUEST_HEADER_SIZE,
                actual: buf.len(),
            });
        }
        let mut buf = &buf[..REQUEST_HEADER_SIZE];
        let request_id = buf.get_u32();
        let opcode = buf.get_u32();
        let payload_len = buf.get_u32();
        if payload_len > MAX_REQUEST_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge(payload_len, MAX_REQUEST_PAYLOAD));
        }
        Ok(Self {
            request_id,
            opcode,
            payload_len,
        })
    }

    /// Encode the full request including the channel tag (used by clients and tests).
    pub fn encode_request(request_id: u32, opcode: u32, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + REQUEST_HEADER_SIZE + payload.len());
        buf.put_u32(ChannelTag::RequestResponse.into());
        buf.put_u32(request_id);
        buf.put_u32(opcode);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        buf.freeze()
    }
}

/// A complete client request with a read cursor over its payload.
#[derive(Debug, Clone)]
pub struct RequestPacket {
    pub request_id: u32,
    pub opcode: u32,
    payload: Bytes,
}

impl RequestPacket {
    pub fn new(header: RequestHeader, payload: Bytes) -> Self {
        Self {
            request_id: header.request_id,
            opcode: header.opcode,
            payload,
        }
    }

    /// Bytes not yet extracted.
    pub fn remaining(&self) -> usize {
        self.payload.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    fn ensure(&self, n: usize) -> Result<(), ProtocolError> {
        if self.payload.remaining() < n {
            return Err(ProtocolError::Incomplete {
                expected: n,
                actual: self.payload.remaining(),
            });
        }
        Ok(())
    }

    pub fn extract_u8(&mut self) -> Result<u8, ProtocolError> {
        self.ensure(1)?;
        Ok(self.payload.get_u8())
    }

    pub fn extract_u32(&mut self) -> Result<u32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.payload.get_u32())
    }

    pub fn extract_i32(&mut self) -> Result<i32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.payload.get_i32())
    }

    pub fn extract_u64(&mut self) -> Result<u64, ProtocolError> {
        self.ensure(8)?;
        Ok(self.payload.get_u64())
    }

    /// Extract a NUL-terminated UTF-8 string.
    pub fn extract_string(&mut self) -> Result<String, ProtocolError> {
        let end = self
            .payload
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ProtocolError::InvalidString("missing terminator".to_string()))?;
        let raw = self.payload.split_to(end);
        self.payload.advance(1);
        String::from_utf8(raw.to_vec()).map_err(|e| ProtocolError::InvalidString(e.to_string()))
    }
}

/// Framing mode of a [`ResponsePacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketMode {
    Response,
    Stream,
    Status,
}

impl PacketMode {
    fn name(self) -> &'static str {
        match self {
            PacketMode::Response => "response",
            PacketMode::Stream => "stream",
            PacketMode::Status => "status",
        }
    }
}

/// Builder for outbound server messages.
///
/// The preamble is written by one of the `init_*` methods, typed fields are
/// appended in call order, and [`finalise`](Self::finalise) patches the payload
/// length and hands out an immutable buffer.
#[derive(Debug, Default)]
pub struct ResponsePacket {
    buf: BytesMut,
    mode: Option<PacketMode>,
    length_pos: usize,
    header_len: usize,
    /// Set when a field was appended before initialisation.
    orphan_fields: bool,
}

impl ResponsePacket {
    /// Create an uninitialised packet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a request/response packet.
    pub fn response(opcode: u32, request_id: u32) -> Self {
        let mut packet = Self::new();
        packet.write_response_preamble(opcode, request_id);
        packet
    }

    /// Create a stream control packet.
    pub fn stream(opcode: u32, stream_id: u32, duration: u32) -> Self {
        let mut packet = Self::new();
        packet.write_stream_preamble(opcode, stream_id, duration);
        packet
    }

    /// Create a status notification packet.
    pub fn status(opcode: u32) -> Self {
        let mut packet = Self::new();
        packet.write_status_preamble(opcode);
        packet
    }

    fn check_uninitialised(&self) -> Result<(), ProtocolError> {
        match self.mode {
            Some(mode) => Err(ProtocolError::AlreadyInitialised(mode.name())),
            None => Ok(()),
        }
    }

    /// Initialise as a request/response packet carrying a correlation id.
    pub fn init(&mut self, opcode: u32, request_id: u32) -> Result<(), ProtocolError> {
        self.check_uninitialised()?;
        self.write_response_preamble(opcode, request_id);
        Ok(())
    }

    /// Initialise as a stream packet carrying a stream id and duration.
    pub fn init_stream(&mut self, opcode: u32, stream_id: u32, duration: u32) -> Result<(), ProtocolError> {
        self.check_uninitialised()?;
        self.write_stream_preamble(opcode, stream_id, duration);
        Ok(())
    }

    /// Initialise as a status notification.
    pub fn init_status(&mut self, opcode: u32) -> Result<(), ProtocolError> {
        self.check_uninitialised()?;
        self.write_status_preamble(opcode);
        Ok(())
    }

    fn write_response_preamble(&mut self, opcode: u32, request_id: u32) {
        self.buf.clear();
        self.buf.put_u32(ChannelTag::RequestResponse.into());
        self.buf.put_u32(opcode);
        self.buf.put_u32(request_id);
        self.length_pos = self.buf.len();
        self.buf.put_u32(0);
        self.header_len = RESPONSE_HEADER_SIZE;
        self.mode = Some(PacketMode::Response);
    }

    fn write_stream_preamble(&mut self, opcode: u32, stream_id: u32, duration: u32) {
        self.buf.clear();
        self.buf.put_u32(ChannelTag::Stream.into());
        self.buf.put_u32(opcode);
        self.buf.put_u32(stream_id);
        self.buf.put_u32(duration);
        self.length_pos = self.buf.len();
        self.buf.put_u32(0);
        self.header_len = STREAM_HEADER_SIZE;
        self.mode = Some(PacketMode::Stream);
    }

    fn write_status_preamble(&mut self, opcode: u32) {
        self.buf.clear();
        self.buf.put_u32(ChannelTag::Status.into());
        self.buf.put_u32(opcode);
        self.buf.put_u32(0);
        self.length_pos = self.buf.len();
        self.buf.put_u32(0);
        self.header_len = RESPONSE_HEADER_SIZE;
        self.mode = Some(PacketMode::Status);
    }

    fn guard(&mut self) -> bool {
        if self.mode.is_none() {
            self.orphan_fields = true;
            return false;
        }
        true
    }

    pub fn add_u8(&mut self, value: u8) -> &mut Self {
        if self.guard() {
            self.buf.put_u8(value);
        }
        self
    }

    pub fn add_u32(&mut self, value: u32) -> &mut Self {
        if self.guard() {
            self.buf.put_u32(value);
        }
        self
    }

    pub fn add_i32(&mut self, value: i32) -> &mut Self {
        if self.guard() {
            self.buf.put_i32(value);
        }
        self
    }

    pub fn add_u64(&mut self, value: u64) -> &mut Self {
        if self.guard() {
            self.buf.put_u64(value);
        }
        self
    }

    /// Append a NUL-terminated string.
    pub fn add_string(&mut self, value: &str) -> &mut Self {
        if self.guard() {
            self.buf.put_slice(value.as_bytes());
            self.buf.put_u8(0);
        }
        self
    }

    pub fn add_bytes(&mut self, value: &[u8]) -> &mut Self {
        if self.guard() {
            self.buf.put_slice(value);
        }
        self
    }

    /// Current payload length (fields appended after the preamble).
    pub fn payload_len(&self) -> usize {
        self.buf.len().saturating_sub(self.header_len)
    }

    /// Patch the payload length and return the ready-to-send message.
    pub fn finalise(mut self) -> Result<Bytes, ProtocolError> {
        if self.mode.is_none() || self.orphan_fields {
            return Err(ProtocolError::NotInitialised);
        }
        let len = self.payload_len() as u32;
        self.buf[self.length_pos..self.length_pos + 4].copy_from_slice(&len.to_be_bytes());
        Ok(self.buf.freeze())
    }
}

/// Header of a muxed elementary stream packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPacketHeader {
    pub stream_id: u32,
    pub duration: u32,
    pub dts: u64,
    pub pts: u64,
    pub length: u32,
}

impl StreamPacketHeader {
    /// Encode the fixed-size header; the payload follows as a separate write.
    pub fn encode(&self) -> [u8; MUX_HEADER_SIZE] {
        let mut out = [0u8; MUX_HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_u32(ChannelTag::Stream.into());
        buf.put_u32(stream_opcode::MUXPKT);
        buf.put_u32(self.stream_id);
        buf.put_u32(self.duration);
        buf.put_u32((self.dts >> 32) as u32);
        buf.put_u32(self.dts as u32);
        buf.put_u32((self.pts >> 32) as u32);
        buf.put_u32(self.pts as u32);
        buf.put_u32(self.length);
        out
    }
}

/// A decoded server message, as seen by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Response {
        opcode: u32,
        request_id: u32,
        payload: Bytes,
    },
    Stream {
        opcode: u32,
        stream_id: u32,
        duration: u32,
        payload: Bytes,
    },
    Packet {
        header: StreamPacketHeader,
        payload: Bytes,
    },
    Keepalive {
        timestamp: u32,
    },
    Status {
        opcode: u32,
        payload: Bytes,
    },
}

fn read_u32_at(buf: &[u8], pos: usize) -> u32 {
    u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

/// Try to decode one server message from the front of `buf`.
///
/// Returns `None` if more data is needed, otherwise the frame and the number
/// of bytes it occupied.
pub fn decode_server_frame(buf: &[u8]) -> Result<Option<(ServerFrame, usize)>, ProtocolError> {
    if buf.len() < 8 {
        return Ok(None);
    }
    let channel = read_u32_at(buf, 0);
    match ChannelTag::try_from(channel).map_err(ProtocolError::UnknownChannel)? {
        ChannelTag::Keepalive => Ok(Some((
            ServerFrame::Keepalive {
                timestamp: read_u32_at(buf, 4),
            },
            8,
        ))),
        ChannelTag::RequestResponse | ChannelTag::Status => {
            if buf.len() < RESPONSE_HEADER_SIZE {
                return Ok(None);
            }
            let opcode = read_u32_at(buf, 4);
            let id = read_u32_at(buf, 8);
            let len = read_u32_at(buf, 12) as usize;
            let total = RESPONSE_HEADER_SIZE + len;
            if buf.len() < total {
                return Ok(None);
            }
            let payload = Bytes::copy_from_slice(&buf[RESPONSE_HEADER_SIZE..total]);
            let frame = if channel == u32::from(ChannelTag::Status) {
                ServerFrame::Status { opcode, payload }
            } else {
                ServerFrame::Response {
                    opcode,
                    request_id: id,
                    payload,
                }
            };
            Ok(Some((frame, total)))
        }
        ChannelTag::Stream => {
            let opcode = read_u32_at(buf, 4);
            if opcode == stream_opcode::MUXPKT {
                if buf.len() < MUX_HEADER_SIZE {
                    return Ok(None);
                }
                let header = StreamPacketHeader {
                    stream_id: read_u32_at(buf, 8),
                    duration: read_u32_at(buf, 12),
                    dts: ((read_u32_at(buf, 16) as u64) << 32) | read_u32_at(buf, 20) as u64,
                    pts: ((read_u32_at(buf, 24) as u64) << 32) | read_u32_at(buf, 28) as u64,
                    length: read_u32_at(buf, 32),
                };
                let total = MUX_HEADER_SIZE + header.length as usize;
                if buf.len() < total {
                    return Ok(None);
                }
                let payload = Bytes::copy_from_slice(&buf[MUX_HEADER_SIZE..total]);
                return Ok(Some((ServerFrame::Packet { header, payload }, total)));
            }
            if buf.len() < STREAM_HEADER_SIZE {
                return Ok(None);
            }
            let len = read_u32_at(buf, 16) as usize;
            let total = STREAM_HEADER_SIZE + len;
            if buf.len() < total {
                return Ok(None);
            }
            Ok(Some((
                ServerFrame::Stream {
                    opcode,
                    stream_id: read_u32_at(buf, 8),
                    duration: read_u32_at(buf, 12),
                    payload: Bytes::copy_from_slice(&buf[STREAM_HEADER_SIZE..total]),
                },
                total,
            )))
        }
    }
}

/// Cursor over the fields of a decoded server message payload.
#[derive(Debug, Clone)]
pub struct FieldReader {
    inner: RequestPacket,
}

impl FieldReader {
    pub fn new(payload: Bytes) -> Self {
        Self {
            inner: RequestPacket {
                request_id: 0,
                opcode: 0,
                payload,
            },
        }
    }

    pub fn remaining(&self) -> usize {
        self.inner.remaining()
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.inner.extract_u32()
    }

    pub fn i32(&mut self) -> Result<i32, ProtocolError> {
        self.inner.extract_i32()
    }

    pub fn string(&mut self) -> Result<String, ProtocolError> {
        self.inner.extract_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_ceiling() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&7u32.to_be_bytes());
        raw.extend_from_slice(&opcode::CHANNEL_STREAM_OPEN.to_be_bytes());
        raw.extend_from_slice(&200_000u32.to_be_bytes());
        let header = RequestHeader::decode(&raw).unwrap();
        assert_eq!(header.request_id, 7);
        assert_eq!(header.payload_len, 200_000);

        raw[8..12].copy_from_slice(&200_001u32.to_be_bytes());
        assert_eq!(
            RequestHeader::decode(&raw),
            Err(ProtocolError::PayloadTooLarge(200_001, MAX_REQUEST_PAYLOAD))
        );
    }

    #[test]
    fn test_response_finalise_patches_length() {
        let mut resp = ResponsePacket::response(opcode::CHANNEL_STREAM_OPEN, 42);
        resp.add_u32(ReturnCode::DataInvalid.into());
        resp.add_string("abc");
        let bytes = resp.finalise().unwrap();

        assert_eq!(bytes.len(), RESPONSE_HEADER_SIZE + 4 + 4);
        assert_eq!(&bytes[0..4], &1u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &opcode::CHANNEL_STREAM_OPEN.to_be_bytes());
        assert_eq!(&bytes[8..12], &42u32.to_be_bytes());
        assert_eq!(&bytes[12..16], &8u32.to_be_bytes());
        assert_eq!(&bytes[20..24], b"abc\0");
    }

    #[test]
    fn test_stream_packet_preamble() {
        let mut resp = ResponsePacket::stream(stream_opcode::STATUS, 0, 0);
        resp.add_u32(stream_status::SIGNAL_LOST);
        let bytes = resp.finalise().unwrap();

        let (frame, used) = decode_server_frame(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        match frame {
            ServerFrame::Stream { opcode, stream_id, duration, payload } => {
                assert_eq!(opcode, stream_opcode::STATUS);
                assert_eq!(stream_id, 0);
                assert_eq!(duration, 0);
                assert_eq!(FieldReader::new(payload).u32().unwrap(), stream_status::SIGNAL_LOST);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_double_init_rejected() {
        let mut resp = ResponsePacket::new();
        resp.init(1, 1).unwrap();
        assert_eq!(
            resp.init_stream(1, 0, 0),
            Err(ProtocolError::AlreadyInitialised("response"))
        );

        let mut resp = ResponsePacket::stream(stream_opcode::CHANGE, 0, 0);
        assert!(resp.init_status(status_opcode::MESSAGE).is_err());
    }

    #[test]
    fn test_fields_before_init_fail_finalise() {
        let mut resp = ResponsePacket::new();
        resp.add_u32(5);
        resp.init_status(status_opcode::TIMER_CHANGE).unwrap();
        assert_eq!(resp.finalise(), Err(ProtocolError::NotInitialised));
        assert_eq!(ResponsePacket::new().finalise(), Err(ProtocolError::NotInitialised));
    }

    #[test]
    fn test_mux_header_splits_timestamps() {
        let header = StreamPacketHeader {
            stream_id: 101,
            duration: 3600,
            dts: 0x0000_0001_2345_6789,
            pts: NO_PTS,
            length: 4,
        };
        let mut raw = header.encode().to_vec();
        raw.extend_from_slice(&[1, 2, 3, 4]);

        assert_eq!(&raw[16..20], &1u32.to_be_bytes());
        assert_eq!(&raw[20..24], &0x2345_6789u32.to_be_bytes());
        assert_eq!(&raw[24..28], &0xFFF0_0000u32.to_be_bytes());
        assert_eq!(&raw[28..32], &0u32.to_be_bytes());

        let (frame, used) = decode_server_frame(&raw).unwrap().unwrap();
        assert_eq!(used, raw.len());
        assert_eq!(
            frame,
            ServerFrame::Packet {
                header,
                payload: Bytes::from_static(&[1, 2, 3, 4]),
            }
        );
    }

    #[test]
    fn test_request_packet_extraction() {
        let mut payload = BytesMut::new();
        payload.put_u32(5);
        payload.put_u8(1);
        payload.put_slice(b"kodi\0");
        let header = RequestHeader {
            request_id: 1,
            opcode: opcode::LOGIN,
            payload_len: payload.len() as u32,
        };
        let mut req = RequestPacket::new(header, payload.freeze());
        assert_eq!(req.extract_u32().unwrap(), 5);
        assert_eq!(req.extract_u8().unwrap(), 1);
        assert_eq!(req.extract_string().unwrap(), "kodi");
        assert!(req.extract_u32().is_err());
    }

    #[test]
    fn test_incomplete_frame_needs_more() {
        let bytes = ResponsePacket::status(status_opcode::CHANNEL_CHANGE).finalise().unwrap();
        assert!(decode_server_frame(&bytes[..10]).unwrap().is_none());
        assert!(matches!(
            decode_server_frame(&[0, 0, 0, 9, 0, 0, 0, 0]),
            Err(ProtocolError::UnknownChannel(9))
        ));
    }
}
