//! Transport stream demultiplexing.
//!
//! One [`TsDemuxer`] handles one elementary stream PID. It reassembles PES
//! packets from 188-byte TS packets, extracts timing, discovers stream
//! attributes from codec headers and classifies video frames.

pub mod audio;
pub mod video;

use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use xvdr_protocol::NO_PTS;

/// TS packet size.
pub const TS_PACKET_SIZE: usize = 188;

/// TS sync byte.
pub const TS_SYNC_BYTE: u8 = 0x47;

/// Upper bound for a reassembled PES packet.
const MAX_PES_SIZE: usize = 4 * 1024 * 1024;

/// Mask for 33-bit PES timestamps.
const PTS_MASK: u64 = 0x1_FFFF_FFFF;

/// Elementary stream kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Mpeg2Video,
    H264,
    Mpeg2Audio,
    Ac3,
    Eac3,
    Aac,
    Dts,
    DvbSub,
    Teletext,
    Unknown,
}

impl StreamKind {
    /// Type tag announced to clients, `None` for unknown kinds.
    pub fn tag(self) -> Option<&'static str> {
        match self {
            StreamKind::Mpeg2Video => Some("MPEG2VIDEO"),
            StreamKind::H264 => Some("H264"),
            StreamKind::Mpeg2Audio => Some("MPEG2AUDIO"),
            StreamKind::Ac3 => Some("AC3"),
            StreamKind::Eac3 => Some("EAC3"),
            StreamKind::Aac => Some("AAC"),
            StreamKind::Dts => Some("DTS"),
            StreamKind::DvbSub => Some("DVBSUB"),
            StreamKind::Teletext => Some("TELETEXT"),
            StreamKind::Unknown => None,
        }
    }

    pub fn is_video(self) -> bool {
        matches!(self, StreamKind::Mpeg2Video | StreamKind::H264)
    }

    pub fn is_audio(self) -> bool {
        matches!(
            self,
            StreamKind::Mpeg2Audio | StreamKind::Ac3 | StreamKind::Eac3 | StreamKind::Aac | StreamKind::Dts
        )
    }
}

/// Picture type of a video payload packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Unknown,
    IFrame,
    PFrame,
    BFrame,
}

/// Attributes discovered from the stream (video, audio and subtitle fields).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamAttributes {
    pub fps_scale: u32,
    pub fps_rate: u32,
    pub width: u32,
    pub height: u32,
    pub aspect: f64,
    pub channels: u32,
    pub sample_rate: u32,
    pub block_align: u32,
    pub bit_rate: u32,
    pub bits_per_sample: u32,
    pub composition_page_id: u32,
    pub ancillary_page_id: u32,
}

impl StreamAttributes {
    /// Aspect ratio as sent on the wire (x1000, truncated).
    pub fn aspect_wire(&self) -> i32 {
        (self.aspect * 1000.0) as i32
    }
}

/// A reassembled payload ready for forwarding.
#[derive(Debug, Clone)]
pub struct StreamPacket {
    pub index: usize,
    pub pid: u16,
    pub kind: StreamKind,
    pub frame_type: FrameType,
    pub dts: u64,
    pub pts: u64,
    pub duration: u32,
    pub data: Bytes,
}

/// Extract the 13-bit PID of a TS packet.
pub fn ts_pid(packet: &[u8]) -> u16 {
    (((packet[1] & 0x1F) as u16) << 8) | packet[2] as u16
}

/// Decode a 33-bit PES timestamp.
fn read_timestamp(b: &[u8]) -> u64 {
    (((b[0] >> 1) & 0x07) as u64) << 30
        | (b[1] as u64) << 22
        | ((b[2] >> 1) as u64) << 15
        | (b[3] as u64) << 7
        | (b[4] >> 1) as u64
}

/// Per-PID demultiplexer.
#[derive(Debug)]
pub struct TsDemuxer {
    index: usize,
    pid: u16,
    kind: StreamKind,
    language: String,
    attrs: StreamAttributes,
    pes: BytesMut,
    pes_started: bool,
    parsed: bool,
    attrs_changed: bool,
    last_pts: Option<u64>,
    last_cc: Option<u8>,
}

impl TsDemuxer {
    pub fn new(index: usize, pid: u16, kind: StreamKind) -> Self {
        Self {
            index,
            pid,
            kind,
            language: String::new(),
            attrs: StreamAttributes::default(),
            pes: BytesMut::new(),
            pes_started: false,
            parsed: matches!(kind, StreamKind::DvbSub | StreamKind::Teletext | StreamKind::Unknown),
            attrs_changed: false,
            last_pts: None,
            last_cc: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn set_language(&mut self, language: &str) {
        self.language = language.to_string();
    }

    pub fn attributes(&self) -> &StreamAttributes {
        &self.attrs
    }

    pub fn set_subtitle_pages(&mut self, composition_page_id: u16, ancillary_page_id: u16) {
        self.attrs.composition_page_id = composition_page_id as u32;
        self.attrs.ancillary_page_id = ancillary_page_id as u32;
    }

    /// True once the attributes required for announcing the stream are known.
    pub fn is_parsed(&self) -> bool {
        self.parsed
    }

    /// Returns and clears the "attributes changed" flag.
    pub fn take_attributes_changed(&mut self) -> bool {
        std::mem::take(&mut self.attrs_changed)
    }

    /// Feed one TS packet; returns a completed payload packet if one finished.
    pub fn process_ts_packet(&mut self, packet: &[u8]) -> Option<StreamPacket> {
        if packet.len() < TS_PACKET_SIZE || packet[0] != TS_SYNC_BYTE {
            return None;
        }
        if packet[1] & 0x80 != 0 {
            trace!("pid {}: transport error indicator set", self.pid);
            return None;
        }

        let unit_start = packet[1] & 0x40 != 0;
        let afc = (packet[3] >> 4) & 0x03;
        if afc & 0x01 == 0 {
            return None;
        }

        let cc = packet[3] & 0x0F;
        if let Some(last) = self.last_cc {
            if last == cc {
                trace!("pid {}: duplicate packet (cc {}), skipped", self.pid, cc);
                return None;
            }
            if (last + 1) & 0x0F != cc && !unit_start && self.pes_started {
                debug!("pid {}: continuity error ({} -> {}), dropping PES", self.pid, last, cc);
                self.pes.clear();
                self.pes_started = false;
            }
        }
        self.last_cc = Some(cc);

        let offset = if afc & 0x02 != 0 {
            5 + packet[4] as usize
        } else {
            4
        };
        if offset >= TS_PACKET_SIZE {
            return None;
        }
        let payload = &packet[offset..TS_PACKET_SIZE];

        let mut completed = None;
        if unit_start {
            if self.pes_started && !self.pes.is_empty() {
                let pes = self.pes.split().freeze();
                completed = self.parse_pes(pes);
            }
            self.pes.clear();
            self.pes_started = true;
        } else if !self.pes_started {
            return None;
        }

        if self.pes.len() + payload.len() > MAX_PES_SIZE {
            debug!("pid {}: PES exceeds {} bytes, dropping", self.pid, MAX_PES_SIZE);
            self.pes.clear();
            self.pes_started = false;
            return completed;
        }
        self.pes.extend_from_slice(payload);
        completed
    }

    fn parse_pes(&mut self, pes: Bytes) -> Option<StreamPacket> {
        if pes.len() < 9 || pes[0] != 0x00 || pes[1] != 0x00 || pes[2] != 0x01 {
            return None;
        }
        let header_len = pes[8] as usize;
        let start = 9 + header_len;
        if start > pes.len() {
            return None;
        }

        let flags = pes[7] >> 6;
        let pts = if flags & 0x02 != 0 && header_len >= 5 {
            Some(read_timestamp(&pes[9..14]))
        } else {
            None
        };
        let dts = if flags == 0x03 && header_len >= 10 {
            Some(read_timestamp(&pes[14..19]))
        } else {
            pts
        };

        let duration = match (self.last_pts, pts) {
            (Some(prev), Some(cur)) => {
                let delta = cur.wrapping_sub(prev) & PTS_MASK;
                u32::try_from(delta).unwrap_or(0)
            }
            _ => 0,
        };
        if pts.is_some() {
            self.last_pts = pts;
        }

        let es = pes.slice(start..);
        if es.is_empty() {
            return None;
        }
        let frame_type = self.inspect(&es);

        Some(StreamPacket {
            index: self.index,
            pid: self.pid,
            kind: self.kind,
            frame_type,
            dts: dts.unwrap_or(NO_PTS),
            pts: pts.unwrap_or(NO_PTS),
            duration,
            data: es,
        })
    }

    /// Update attributes from codec headers and classify the frame.
    fn inspect(&mut self, es: &[u8]) -> FrameType {
        match self.kind {
            StreamKind::Mpeg2Video => {
                if let Some(hdr) = video::parse_mpeg2_sequence(es) {
                    self.apply_video(hdr);
                }
                video::mpeg2_frame_type(es)
            }
            StreamKind::H264 => {
                if let Some(hdr) = video::parse_h264_sps(es) {
                    self.apply_video(hdr);
                }
                video::h264_frame_type(es)
            }
            StreamKind::Mpeg2Audio => {
                if let Some(hdr) = audio::parse_mpeg_audio(es) {
                    self.apply_audio(hdr);
                }
                FrameType::Unknown
            }
            StreamKind::Ac3 | StreamKind::Eac3 => {
                if let Some(hdr) = audio::parse_ac3(es) {
                    let kind = if hdr.enhanced { StreamKind::Eac3 } else { StreamKind::Ac3 };
                    if kind != self.kind {
                        debug!("pid {}: stream type {:?} -> {:?}", self.pid, self.kind, kind);
                        self.kind = kind;
                        self.attrs_changed = true;
                    }
                    self.apply_audio(hdr.audio);
                }
                FrameType::Unknown
            }
            StreamKind::Aac => {
                if let Some(hdr) = audio::parse_adts(es) {
                    self.apply_audio(hdr);
                }
                FrameType::Unknown
            }
            StreamKind::Dts => {
                if let Some(hdr) = audio::parse_dts(es) {
                    self.apply_audio(hdr);
                }
                FrameType::Unknown
            }
            StreamKind::DvbSub | StreamKind::Teletext | StreamKind::Unknown => FrameType::Unknown,
        }
    }

    fn apply_video(&mut self, hdr: video::VideoHeader) {
        let attrs = &mut self.attrs;
        let changed = attrs.width != hdr.width
            || attrs.height != hdr.height
            || attrs.fps_scale != hdr.fps_scale
            || attrs.fps_rate != hdr.fps_rate
            || (attrs.aspect - hdr.aspect).abs() > 1e-6;
        if changed {
            attrs.width = hdr.width;
            attrs.height = hdr.height;
            attrs.fps_scale = hdr.fps_scale;
            attrs.fps_rate = hdr.fps_rate;
            attrs.aspect = hdr.aspect;
            debug!(
                "pid {}: video {}x{} aspect {:.3} fps {}/{}",
                self.pid, hdr.width, hdr.height, hdr.aspect, hdr.fps_rate, hdr.fps_scale
            );
            self.attrs_changed = true;
        }
        self.parsed = attrs.width > 0 && attrs.height > 0;
    }

    fn apply_audio(&mut self, hdr: audio::AudioHeader) {
        let attrs = &mut self.attrs;
        let changed = attrs.channels != hdr.channels
            || attrs.sample_rate != hdr.sample_rate
            || attrs.bit_rate != hdr.bit_rate;
        if changed {
            attrs.channels = hdr.channels;
            attrs.sample_rate = hdr.sample_rate;
            attrs.bit_rate = hdr.bit_rate;
            attrs.block_align = hdr.block_align;
            attrs.bits_per_sample = hdr.bits_per_sample;
            debug!(
                "pid {}: audio {} ch {} Hz {} bit/s",
                self.pid, hdr.channels, hdr.sample_rate, hdr.bit_rate
            );
            self.attrs_changed = true;
        }
        self.parsed = attrs.sample_rate > 0;
    }
}
