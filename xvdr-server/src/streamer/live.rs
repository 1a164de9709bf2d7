//! Live streaming session.
//!
//! A session tunes a device, elects the channel's elementary streams and runs
//! a pump task that moves transport stream data from the receiver buffer
//! through the demultiplexers and out to the client:
//!
//! ```text
//! device -> LiveReceiver -> pump (resync, per-PID demux) -> ClientWriter
//! ```
//!
//! Payload is withheld until every stream is parsed and (for channels with
//! video) a key frame has been seen. A stream-change announcement precedes
//! the first payload and follows every signal restoration.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use xvdr_protocol::{
    opcode, stream_opcode, stream_status, ResponsePacket, ReturnCode, StreamPacketHeader,
};

use crate::channels::{Channel, SourceType};
use crate::demux::{ts_pid, FrameType, StreamKind, StreamPacket, TS_PACKET_SIZE, TS_SYNC_BYTE};
use crate::device::{Device, DeviceProvider, SignalReading, SignalSource};
use crate::server::writer::ClientWriter;
use crate::streamer::{LiveReceiver, StreamRegistry};

/// Largest run of buffered bytes processed per pump iteration.
const PUMP_CHUNK: usize = TS_PACKET_SIZE * 512;

/// Bounded wait for new data when the buffer is (nearly) empty.
const PUMP_WAIT: Duration = Duration::from_millis(100);

/// Interval of periodic stream and signal info while ready.
const INFO_INTERVAL: Duration = Duration::from_secs(10);

/// Write timeout for muxed payload packets.
const PACKET_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long teardown waits for the pump before aborting it.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Sentinel sent for unreadable 16-bit frontend values.
const UNREADABLE_U16: u16 = 0xFFFE;

/// Sentinel sent for unreadable 32-bit frontend values.
const UNREADABLE_U32: u32 = 0xFFFF_FFFE;

/// Session parameters.
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Device priority requested for live streaming.
    pub priority: i32,
    /// Silence after which the signal is considered lost.
    pub scan_timeout: Duration,
    /// Maximum number of elected elementary streams.
    pub max_streams: usize,
    /// Receiver buffer size in bytes.
    pub buffer_size: usize,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            priority: 50,
            scan_timeout: Duration::from_secs(10),
            max_streams: 64,
            buffer_size: 1024 * 1024,
        }
    }
}

/// Reasons a live session could not be started.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("No device available for channel {0}")]
    DeviceUnavailable(u32),

    #[error("Failed to tune channel {0}")]
    TuneFailed(u32),

    #[error("Channel {0} has no elementary streams")]
    NoStreams(u32),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StreamError {
    /// Return code reported to the client.
    pub fn return_code(&self) -> ReturnCode {
        match self {
            StreamError::DeviceUnavailable(_) | StreamError::TuneFailed(_) => ReturnCode::DataLocked,
            StreamError::NoStreams(_) => ReturnCode::DataInvalid,
            StreamError::Io(_) => ReturnCode::Error,
        }
    }
}

enum SignalProbe {
    Unopened,
    Unavailable,
    Open(Box<dyn SignalSource>),
}

/// State shared between the session owner and the pump task.
struct SessionState {
    conn_id: u64,
    channel: Channel,
    device: Arc<dyn Device>,
    writer: ClientWriter,
    registry: Mutex<StreamRegistry>,
    audio_only: bool,
    ready: AtomicBool,
    starting: AtomicBool,
    signal_lost: AtomicBool,
    request_change: AtomicBool,
    iframe_seen: AtomicBool,
    epoch: Instant,
    last_tick_ms: AtomicU64,
    scan_timeout: Duration,
    signal: Mutex<SignalProbe>,
}

impl SessionState {
    fn touch(&self) {
        self.last_tick_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Release);
    }

    fn since_tick(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_tick_ms.load(Ordering::Acquire)))
    }

    /// All elected streams parsed; cached once true.
    fn is_ready(&self) -> bool {
        if self.ready.load(Ordering::Acquire) {
            return true;
        }
        if !self.registry.lock().all_parsed() {
            return false;
        }
        self.ready.store(true, Ordering::Release);
        true
    }

    async fn send_stream_packet(&self, pkt: StreamPacket) -> io::Result<()> {
        if !self.is_ready() || pkt.data.is_empty() {
            return Ok(());
        }

        if !self.audio_only && !self.iframe_seen.load(Ordering::Acquire) && pkt.frame_type != FrameType::IFrame {
            return Ok(());
        }

        if self.starting.load(Ordering::Acquire) {
            info!("[Conn {}] Streaming of channel {} started", self.conn_id, self.channel.number);
            self.touch();
            self.request_change.store(true, Ordering::Release);
            self.starting.store(false, Ordering::Release);
        }

        if self.request_change.load(Ordering::Acquire) {
            self.send_stream_change().await?;
        }

        self.iframe_seen.store(true, Ordering::Release);

        if pkt.kind.is_audio() || pkt.kind.is_video() {
            if self.signal_lost.load(Ordering::Acquire) {
                info!("[Conn {}] Signal restored", self.conn_id);
                self.send_status(stream_status::SIGNAL_RESTORED).await?;
                self.signal_lost.store(false, Ordering::Release);
                self.iframe_seen.store(false, Ordering::Release);
                self.ready.store(false, Ordering::Release);
                self.request_change.store(true, Ordering::Release);
                self.touch();
                return Ok(());
            }
            self.touch();
        } else if self.signal_lost.load(Ordering::Acquire) {
            return Ok(());
        }

        trace!("[Conn {}] Stream packet pid {} ({:?})", self.conn_id, pkt.pid, pkt.kind);

        let header = StreamPacketHeader {
            stream_id: pkt.pid as u32,
            duration: pkt.duration,
            dts: pkt.dts,
            pts: pkt.pts,
            length: pkt.data.len() as u32,
        }
        .encode();
        self.writer
            .write_pair(&header, &pkt.data, Some(PACKET_WRITE_TIMEOUT))
            .await
    }

    fn build_stream_change(&self) -> Option<Bytes> {
        let registry = self.registry.lock();
        let mut resp = ResponsePacket::stream(stream_opcode::CHANGE, 0, 0);
        for stream in registry.iter() {
            let Some(tag) = stream.kind().tag() else {
                continue;
            };
            resp.add_u32(stream.pid() as u32).add_string(tag);
            let attrs = stream.attributes();
            match stream.kind() {
                StreamKind::Mpeg2Video | StreamKind::H264 => {
                    resp.add_u32(attrs.fps_scale)
                        .add_u32(attrs.fps_rate)
                        .add_u32(attrs.height)
                        .add_u32(attrs.width)
                        .add_i32(attrs.aspect_wire());
                }
                StreamKind::DvbSub => {
                    resp.add_string(stream.language())
                        .add_u32(attrs.composition_page_id)
                        .add_u32(attrs.ancillary_page_id);
                }
                StreamKind::Teletext | StreamKind::Unknown => {}
                _ => {
                    resp.add_string(stream.language());
                }
            }
            debug!("[Conn {}] {}: {} (index: {})", self.conn_id, tag, stream.pid(), stream.index());
        }
        match resp.finalise() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!("[Conn {}] Stream change packet failed: {}", self.conn_id, e);
                None
            }
        }
    }

    async fn send_stream_change(&self) -> io::Result<()> {
        debug!("[Conn {}] Sending stream change", self.conn_id);
        if let Some(bytes) = self.build_stream_change() {
            self.writer.write(&bytes, None).await?;
        }
        self.request_change.store(false, Ordering::Release);
        self.send_stream_info().await
    }

    async fn send_status(&self, status: u32) -> io::Result<()> {
        let mut resp = ResponsePacket::stream(stream_opcode::STATUS, 0, 0);
        resp.add_u32(status);
        match resp.finalise() {
            Ok(bytes) => self.writer.write(&bytes, None).await,
            Err(e) => {
                error!("[Conn {}] Stream status packet failed: {}", self.conn_id, e);
                Ok(())
            }
        }
    }

    fn build_stream_info(&self) -> Option<Bytes> {
        let registry = self.registry.lock();
        if registry.is_empty() {
            return None;
        }
        let mut resp = ResponsePacket::stream(stream_opcode::CONTENT_INFO, 0, 0);
        for stream in registry.iter() {
            let attrs = stream.attributes();
            let kind = stream.kind();
            if kind.is_audio() {
                resp.add_u32(stream.pid() as u32)
                    .add_string(stream.language())
                    .add_u32(attrs.channels)
                    .add_u32(attrs.sample_rate)
                    .add_u32(attrs.block_align)
                    .add_u32(attrs.bit_rate)
                    .add_u32(attrs.bits_per_sample);
            } else if kind.is_video() {
                resp.add_u32(stream.pid() as u32)
                    .add_u32(attrs.fps_scale)
                    .add_u32(attrs.fps_rate)
                    .add_u32(attrs.height)
                    .add_u32(attrs.width)
                    .add_i32(attrs.aspect_wire());
            } else if kind == StreamKind::DvbSub {
                resp.add_u32(stream.pid() as u32)
                    .add_string(stream.language())
                    .add_u32(attrs.composition_page_id)
                    .add_u32(attrs.ancillary_page_id);
            }
        }
        match resp.finalise() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!("[Conn {}] Stream info packet failed: {}", self.conn_id, e);
                None
            }
        }
    }

    async fn send_stream_info(&self) -> io::Result<()> {
        match self.build_stream_info() {
            Some(bytes) => {
                debug!("[Conn {}] Sending stream info", self.conn_id);
                self.writer.write(&bytes, None).await
            }
            None => Ok(()),
        }
    }

    /// Read the signal source, opening it on first use.
    fn read_signal(&self) -> Option<(String, String, [u32; 4])> {
        let mut probe = self.signal.lock();
        if matches!(*probe, SignalProbe::Unopened) {
            *probe = match self.device.signal_source() {
                Some(source) => SignalProbe::Open(source),
                None => {
                    debug!("[Conn {}] No signal source for card {}", self.conn_id, self.device.card_index());
                    SignalProbe::Unavailable
                }
            };
        }

        let reading = match &mut *probe {
            SignalProbe::Open(source) => source.read(),
            _ => return Some(("Unknown".to_string(), "Unknown".to_string(), [0; 4])),
        };

        match reading {
            Some(SignalReading::Frontend(fe)) => {
                let card = self.device.card_index();
                let adapter = match self.channel.source {
                    SourceType::Satellite => {
                        format!("DVB-S{} #{} - {}", if fe.dvb_s2 { "2" } else { "" }, card, fe.name)
                    }
                    SourceType::Cable => format!("DVB-C #{} - {}", card, fe.name),
                    SourceType::Terrestrial => format!("DVB-T #{} - {}", card, fe.name),
                    SourceType::Analog => format!("DVB #{} - {}", card, fe.name),
                };
                let flag = |on: bool, name: &'static str| if on { name } else { "-" };
                let status = format!(
                    "{}:{}:{}:{}:{}",
                    flag(fe.has_lock, "LOCKED"),
                    flag(fe.has_signal, "SIGNAL"),
                    flag(fe.has_carrier, "CARRIER"),
                    flag(fe.has_viterbi, "VITERBI"),
                    flag(fe.has_sync, "SYNC"),
                );
                let values = [
                    fe.snr.unwrap_or(UNREADABLE_U16) as u32,
                    fe.strength.unwrap_or(UNREADABLE_U16) as u32,
                    fe.ber.unwrap_or(UNREADABLE_U32),
                    fe.uncorrected_blocks.unwrap_or(UNREADABLE_U32),
                ];
                Some((adapter, status, values))
            }
            Some(SignalReading::Analog { device, card, driver }) => Some((
                format!("Analog #{} - {} ({})", device, card, driver),
                String::new(),
                [0; 4],
            )),
            None => {
                warn!("[Conn {}] Cannot read frontend info", self.conn_id);
                *probe = SignalProbe::Unavailable;
                None
            }
        }
    }

    async fn send_signal_info(&self) -> io::Result<()> {
        let Some((adapter, status, values)) = self.read_signal() else {
            return Ok(());
        };
        let mut resp = ResponsePacket::stream(stream_opcode::SIGNAL_INFO, 0, 0);
        resp.add_string(&adapter).add_string(&status);
        for value in values {
            resp.add_u32(value);
        }
        match resp.finalise() {
            Ok(bytes) => {
                debug!("[Conn {}] Sending signal info", self.conn_id);
                self.writer.write(&bytes, None).await
            }
            Err(e) => {
                error!("[Conn {}] Signal info packet failed: {}", self.conn_id, e);
                Ok(())
            }
        }
    }
}

/// A running live session for one connection.
pub struct LiveStreamer {
    state: Arc<SessionState>,
    receiver: Arc<LiveReceiver>,
    cancel: CancellationToken,
    pump: Option<JoinHandle<()>>,
    stopped: bool,
}

impl LiveStreamer {
    /// Acquire and tune a device, elect the streams, acknowledge the request
    /// and start pumping.
    ///
    /// The `[OK]` response to `request_id` is written before any stream
    /// message. On error nothing has been written and the caller answers.
    pub async fn start(
        conn_id: u64,
        channel: Channel,
        provider: &dyn DeviceProvider,
        writer: ClientWriter,
        request_id: u32,
        config: &StreamerConfig,
    ) -> Result<Self, StreamError> {
        info!(
            "[Conn {}] Channel streaming request: {} - {}",
            conn_id, channel.number, channel.name
        );

        let device = provider
            .acquire_device(&channel, config.priority)
            .ok_or(StreamError::DeviceUnavailable(channel.number))?;
        info!("[Conn {}] Found available device {}", conn_id, device.card_index() + 1);

        if !device.tune(&channel) {
            error!("[Conn {}] Can't switch to channel {} - {}", conn_id, channel.number, channel.name);
            return Err(StreamError::TuneFailed(channel.number));
        }

        let registry = StreamRegistry::elect(&channel, config.max_streams);
        if registry.is_empty() {
            return Err(StreamError::NoStreams(channel.number));
        }
        let pids = registry.pids();

        let mut ack = ResponsePacket::response(opcode::CHANNEL_STREAM_OPEN, request_id);
        ack.add_u32(ReturnCode::Ok.into());
        let ack = ack
            .finalise()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writer.write(&ack, None).await?;

        let state = Arc::new(SessionState {
            conn_id,
            audio_only: channel.is_radio(),
            channel,
            device: Arc::clone(&device),
            writer,
            registry: Mutex::new(registry),
            ready: AtomicBool::new(false),
            starting: AtomicBool::new(true),
            signal_lost: AtomicBool::new(false),
            request_change: AtomicBool::new(false),
            iframe_seen: AtomicBool::new(false),
            epoch: Instant::now(),
            last_tick_ms: AtomicU64::new(0),
            scan_timeout: config.scan_timeout,
            signal: Mutex::new(SignalProbe::Unopened),
        });
        state.touch();

        debug!("[Conn {}] Creating live receiver for pids {:?}", conn_id, pids);
        let receiver = Arc::new(LiveReceiver::new(config.buffer_size, config.priority, pids));
        device.attach_receiver(Arc::clone(&receiver));

        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump(Arc::clone(&state), Arc::clone(&receiver), cancel.clone()));

        info!(
            "[Conn {}] Successfully switched to channel {} - {}",
            conn_id, state.channel.number, state.channel.name
        );

        Ok(Self {
            state,
            receiver,
            cancel,
            pump: Some(pump),
            stopped: false,
        })
    }

    pub fn channel(&self) -> &Channel {
        &self.state.channel
    }

    pub fn receiver(&self) -> &Arc<LiveReceiver> {
        &self.receiver
    }

    /// True while the pump task is running.
    pub fn is_running(&self) -> bool {
        self.pump.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Tear the session down and wait (bounded) for the pump to exit.
    pub async fn stop(mut self) {
        let conn_id = self.state.conn_id;
        debug!("[Conn {}] Stopping live streamer", conn_id);

        self.cancel.cancel();
        self.state.device.detach(&self.receiver);

        if let Some(mut handle) = self.pump.take() {
            if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                warn!("[Conn {}] Pump did not stop in time, aborting", conn_id);
                handle.abort();
            }
        }

        self.state.registry.lock().clear();
        *self.state.signal.lock() = SignalProbe::Unavailable;
        self.receiver.clear();
        self.stopped = true;
        debug!("[Conn {}] Live streamer stopped", conn_id);
    }
}

impl Drop for LiveStreamer {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        self.cancel.cancel();
        self.state.device.detach(&self.receiver);
        if let Some(handle) = self.pump.take() {
            handle.abort();
        }
    }
}

/// Move data from the receiver through the demultiplexers to the client.
async fn pump(state: Arc<SessionState>, receiver: Arc<LiveReceiver>, cancel: CancellationToken) {
    let conn_id = state.conn_id;
    let mut last_info = Instant::now();

    'outer: loop {
        if cancel.is_cancelled() {
            break;
        }
        let buf = receiver.peek(PUMP_CHUNK);

        if !receiver.is_attached() {
            info!("[Conn {}] Returning from streamer task, receiver is no more attached", conn_id);
            break;
        }

        if !state.starting.load(Ordering::Acquire)
            && !state.signal_lost.load(Ordering::Acquire)
            && state.since_tick() > state.scan_timeout
        {
            info!("[Conn {}] Timeout, signal lost!", conn_id);
            if state.send_status(stream_status::SIGNAL_LOST).await.is_err() {
                break;
            }
            state.signal_lost.store(true, Ordering::Release);
        }

        if buf.len() <= TS_PACKET_SIZE {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = receiver.wait(PUMP_WAIT) => {}
            }
            continue;
        }

        // resync on two consecutive sync bytes
        let mut used = 0;
        while buf.len() - used > TS_PACKET_SIZE {
            if buf[used] == TS_SYNC_BYTE && buf[used + TS_PACKET_SIZE] == TS_SYNC_BYTE {
                break;
            }
            used += 1;
        }
        if used > 0 {
            debug!("[Conn {}] Skipped {} bytes to resync", conn_id, used);
        }

        while buf.len() - used >= TS_PACKET_SIZE {
            if cancel.is_cancelled() {
                break;
            }
            let packet = &buf[used..used + TS_PACKET_SIZE];
            used += TS_PACKET_SIZE;

            let completed = {
                let mut registry = state.registry.lock();
                match registry.find_mut(ts_pid(packet)) {
                    Some(demux) => {
                        let completed = demux.process_ts_packet(packet);
                        if demux.take_attributes_changed() {
                            state.request_change.store(true, Ordering::Release);
                        }
                        completed
                    }
                    None => None,
                }
            };

            if let Some(pkt) = completed {
                if let Err(e) = state.send_stream_packet(pkt).await {
                    debug!("[Conn {}] Stream write failed: {}", conn_id, e);
                    receiver.consume(used);
                    break 'outer;
                }
            }
        }
        receiver.consume(used);

        if last_info.elapsed() >= INFO_INTERVAL && state.is_ready() {
            last_info = Instant::now();
            if state.send_stream_info().await.is_err() || state.send_signal_info().await.is_err() {
                break;
            }
        }
    }

    debug!("[Conn {}] Pump finished", conn_id);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channels::tests::demo_channel;
    use crate::demux::audio::tests::ac3_frame;
    use crate::demux::tests::{packetize, pes};
    use crate::demux::video::tests::{idr_slice, p_slice, sps_1080, sps_720};
    use crate::device::testing::{FakeDevice, FakeProvider};
    use crate::device::FrontendStatus;
    use bytes::BytesMut;
    use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream};
    use xvdr_protocol::{decode_server_frame, FieldReader, ServerFrame};

    /// Reads and decodes server frames from the client end of a test stream.
    pub(crate) struct FrameReader<R> {
        stream: R,
        buf: BytesMut,
    }

    impl<R: AsyncRead + Unpin> FrameReader<R> {
        pub(crate) fn new(stream: R) -> Self {
            Self {
                stream,
                buf: BytesMut::new(),
            }
        }

        pub(crate) async fn next(&mut self) -> ServerFrame {
            self.try_next(Duration::from_secs(5)).await.expect("frame expected")
        }

        /// Next frame, `None` on timeout or end of stream.
        pub(crate) async fn try_next(&mut self, limit: Duration) -> Option<ServerFrame> {
            let deadline = tokio::time::Instant::now() + limit;
            loop {
                if let Some((frame, used)) = decode_server_frame(&self.buf).unwrap() {
                    let _ = self.buf.split_to(used);
                    return Some(frame);
                }
                let mut chunk = [0u8; 4096];
                let n = tokio::time::timeout_at(deadline, self.stream.read(&mut chunk))
                    .await
                    .ok()?
                    .ok()?;
                if n == 0 {
                    return None;
                }
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }

    fn test_config() -> StreamerConfig {
        StreamerConfig {
            scan_timeout: Duration::from_millis(200),
            ..StreamerConfig::default()
        }
    }

    struct Feed {
        video_cc: u8,
        audio_cc: u8,
        pts: u64,
    }

    impl Feed {
        fn new() -> Self {
            Self {
                video_cc: 0,
                audio_cc: 0,
                pts: 90_000,
            }
        }

        fn video(&mut self, es: &[u8]) -> Vec<u8> {
            self.pts += 3600;
            packetize(101, &mut self.video_cc, &pes(0xE0, Some(self.pts), es))
        }

        fn key_frame(&mut self) -> Vec<u8> {
            self.key_frame_with(sps_1080())
        }

        fn key_frame_with(&mut self, sps: Vec<u8>) -> Vec<u8> {
            let mut au = sps;
            au.extend(idr_slice());
            self.video(&au)
        }

        fn audio(&mut self) -> Vec<u8> {
            packetize(102, &mut self.audio_cc, &pes(0xBD, Some(self.pts), &ac3_frame()))
        }
    }

    async fn start_session(device: &Arc<FakeDevice>) -> (LiveStreamer, FrameReader<DuplexStream>) {
        start_channel(device, demo_channel(), &test_config()).await
    }

    async fn start_channel(
        device: &Arc<FakeDevice>,
        channel: Channel,
        config: &StreamerConfig,
    ) -> (LiveStreamer, FrameReader<DuplexStream>) {
        let (client, server) = tokio::io::duplex(1 << 20);
        let provider = FakeProvider::new(Arc::clone(device));
        let streamer = LiveStreamer::start(1, channel, provider.as_ref(), ClientWriter::new(server), 77, config)
            .await
            .unwrap();
        (streamer, FrameReader::new(client))
    }

    /// Configuration that keeps signal loss out of short tests.
    fn patient_config() -> StreamerConfig {
        StreamerConfig {
            scan_timeout: Duration::from_secs(30),
            ..StreamerConfig::default()
        }
    }

    fn expect_ok(frame: ServerFrame) {
        match frame {
            ServerFrame::Response { opcode: op, request_id, payload } => {
                assert_eq!(op, opcode::CHANNEL_STREAM_OPEN);
                assert_eq!(request_id, 77);
                assert_eq!(FieldReader::new(payload).u32().unwrap(), 0);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    fn stream_opcode_of(frame: &ServerFrame) -> u32 {
        match frame {
            ServerFrame::Stream { opcode, .. } => *opcode,
            ServerFrame::Packet { .. } => stream_opcode::MUXPKT,
            other => panic!("expected stream frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_announcement_precedes_payload() {
        let device = FakeDevice::new(0);
        let mut feed = Feed::new();
        let mut ts = Vec::new();
        ts.extend(feed.audio());
        ts.extend(feed.audio());
        ts.extend(feed.key_frame());
        ts.extend(feed.video(&p_slice()));
        ts.extend(feed.audio());
        device.set_initial(ts);

        let (streamer, mut frames) = start_session(&device).await;
        expect_ok(frames.next().await);

        match frames.next().await {
            ServerFrame::Stream { opcode, payload, .. } => {
                assert_eq!(opcode, stream_opcode::CHANGE);
                let mut r = FieldReader::new(payload);
                assert_eq!(r.u32().unwrap(), 101);
                assert_eq!(r.string().unwrap(), "H264");
                assert_eq!(r.u32().unwrap(), 2002);
                assert_eq!(r.u32().unwrap(), 60000);
                assert_eq!(r.u32().unwrap(), 1080);
                assert_eq!(r.u32().unwrap(), 1920);
                assert_eq!(r.i32().unwrap(), 1777);
                assert_eq!(r.u32().unwrap(), 102);
                assert_eq!(r.string().unwrap(), "AC3");
                assert_eq!(r.string().unwrap(), "eng");
                assert_eq!(r.remaining(), 0);
            }
            other => panic!("expected stream change, got {:?}", other),
        }

        let info = frames.next().await;
        assert_eq!(stream_opcode_of(&info), stream_opcode::CONTENT_INFO);

        match frames.next().await {
            ServerFrame::Packet { header, payload } => {
                assert_eq!(header.stream_id, 101);
                assert_eq!(header.pts, 90_000 + 3600);
                assert_eq!(header.dts, header.pts);
                assert_eq!(&payload[..4], &[0x00, 0x00, 0x00, 0x01]);
                assert_eq!(payload[4] & 0x1F, 7);
            }
            other => panic!("expected mux packet, got {:?}", other),
        }
        match frames.next().await {
            ServerFrame::Packet { header, .. } => assert_eq!(header.stream_id, 102),
            other => panic!("expected mux packet, got {:?}", other),
        }

        streamer.stop().await;
    }

    #[tokio::test]
    async fn test_waits_for_key_frame() {
        let device = FakeDevice::new(0);
        let mut feed = Feed::new();
        let mut ts = Vec::new();
        ts.extend(feed.audio());
        ts.extend(feed.audio());
        // parse the SPS without an IDR, then a P slice
        ts.extend(feed.video(&sps_1080()));
        ts.extend(feed.video(&p_slice()));
        ts.extend(feed.key_frame());
        ts.extend(feed.video(&p_slice()));
        device.set_initial(ts);

        let (streamer, mut frames) = start_session(&device).await;
        expect_ok(frames.next().await);
        assert_eq!(stream_opcode_of(&frames.next().await), stream_opcode::CHANGE);
        assert_eq!(stream_opcode_of(&frames.next().await), stream_opcode::CONTENT_INFO);
        match frames.next().await {
            ServerFrame::Packet { header, payload } => {
                assert_eq!(header.stream_id, 101);
                assert_eq!(header.duration, 3600);
                assert!(payload.windows(4).any(|w| w == [0x00, 0x00, 0x01, 0x65]));
            }
            other => panic!("expected key frame, got {:?}", other),
        }
        streamer.stop().await;
    }

    #[tokio::test]
    async fn test_signal_lost_once_and_restored() {
        let device = FakeDevice::new(0);
        let mut feed = Feed::new();
        let mut ts = Vec::new();
        ts.extend(feed.audio());
        ts.extend(feed.audio());
        ts.extend(feed.key_frame());
        ts.extend(feed.video(&p_slice()));
        device.set_initial(ts);

        let (streamer, mut frames) = start_session(&device).await;
        expect_ok(frames.next().await);
        assert_eq!(stream_opcode_of(&frames.next().await), stream_opcode::CHANGE);
        assert_eq!(stream_opcode_of(&frames.next().await), stream_opcode::CONTENT_INFO);
        assert_eq!(stream_opcode_of(&frames.next().await), stream_opcode::MUXPKT);

        // silence well past the scan timeout yields exactly one SIGNALLOST
        tokio::time::sleep(Duration::from_millis(800)).await;
        match frames.next().await {
            ServerFrame::Stream { opcode, payload, .. } => {
                assert_eq!(opcode, stream_opcode::STATUS);
                assert_eq!(FieldReader::new(payload).u32().unwrap(), stream_status::SIGNAL_LOST);
            }
            other => panic!("expected status, got {:?}", other),
        }
        assert!(frames.try_next(Duration::from_millis(100)).await.is_none());

        // the pending P slice proves restoration and is not forwarded
        let mut more = Vec::new();
        more.extend(feed.key_frame());
        more.extend(feed.key_frame());
        more.extend(feed.video(&p_slice()));
        device.feed(&more);

        match frames.next().await {
            ServerFrame::Stream { opcode, payload, .. } => {
                assert_eq!(opcode, stream_opcode::STATUS);
                assert_eq!(FieldReader::new(payload).u32().unwrap(), stream_status::SIGNAL_RESTORED);
            }
            other => panic!("expected status, got {:?}", other),
        }
        assert_eq!(stream_opcode_of(&frames.next().await), stream_opcode::CHANGE);
        assert_eq!(stream_opcode_of(&frames.next().await), stream_opcode::CONTENT_INFO);
        match frames.next().await {
            ServerFrame::Packet { header, .. } => {
                assert_eq!(header.stream_id, 101);
                assert_eq!(header.pts, 90_000 + 3 * 3600);
            }
            other => panic!("expected mux packet, got {:?}", other),
        }
        streamer.stop().await;
    }

    #[tokio::test]
    async fn test_audio_only_skips_key_frame_wait() {
        let device = FakeDevice::new(0);
        let mut radio = demo_channel();
        radio.video = None;
        let mut feed = Feed::new();
        let mut ts = Vec::new();
        for _ in 0..4 {
            ts.extend(feed.audio());
        }
        device.set_initial(ts);

        let (streamer, mut frames) = start_channel(&device, radio, &patient_config()).await;
        expect_ok(frames.next().await);
        match frames.next().await {
            ServerFrame::Stream { opcode, payload, .. } => {
                assert_eq!(opcode, stream_opcode::CHANGE);
                let mut r = FieldReader::new(payload);
                assert_eq!(r.u32().unwrap(), 102);
                assert_eq!(r.string().unwrap(), "AC3");
                assert_eq!(r.string().unwrap(), "eng");
                assert_eq!(r.remaining(), 0);
            }
            other => panic!("expected stream change, got {:?}", other),
        }
        assert_eq!(stream_opcode_of(&frames.next().await), stream_opcode::CONTENT_INFO);
        for _ in 0..3 {
            match frames.next().await {
                ServerFrame::Packet { header, .. } => assert_eq!(header.stream_id, 102),
                other => panic!("expected mux packet, got {:?}", other),
            }
        }
        assert!(frames.try_next(Duration::from_millis(200)).await.is_none());
        streamer.stop().await;
    }

    #[tokio::test]
    async fn test_attribute_change_reannounced_once() {
        let device = FakeDevice::new(0);
        let mut feed = Feed::new();
        let mut ts = Vec::new();
        ts.extend(feed.audio());
        ts.extend(feed.audio());
        ts.extend(feed.key_frame());
        ts.extend(feed.video(&p_slice()));
        // the broadcaster switches to 720p
        ts.extend(feed.key_frame_with(sps_720()));
        ts.extend(feed.video(&p_slice()));
        ts.extend(feed.video(&p_slice()));
        device.set_initial(ts);

        let (streamer, mut frames) = start_channel(&device, demo_channel(), &patient_config()).await;
        expect_ok(frames.next().await);
        assert_eq!(stream_opcode_of(&frames.next().await), stream_opcode::CHANGE);
        assert_eq!(stream_opcode_of(&frames.next().await), stream_opcode::CONTENT_INFO);
        for pts in [90_000 + 3600, 90_000 + 2 * 3600] {
            match frames.next().await {
                ServerFrame::Packet { header, .. } => assert_eq!(header.pts, pts),
                other => panic!("expected mux packet, got {:?}", other),
            }
        }

        match frames.next().await {
            ServerFrame::Stream { opcode, payload, .. } => {
                assert_eq!(opcode, stream_opcode::CHANGE);
                let mut r = FieldReader::new(payload);
                assert_eq!(r.u32().unwrap(), 101);
                assert_eq!(r.string().unwrap(), "H264");
                assert_eq!(r.u32().unwrap(), 2002);
                assert_eq!(r.u32().unwrap(), 60000);
                assert_eq!(r.u32().unwrap(), 720);
                assert_eq!(r.u32().unwrap(), 1280);
            }
            other => panic!("expected stream change, got {:?}", other),
        }
        assert_eq!(stream_opcode_of(&frames.next().await), stream_opcode::CONTENT_INFO);
        for pts in [90_000 + 3 * 3600, 90_000 + 4 * 3600] {
            match frames.next().await {
                ServerFrame::Packet { header, .. } => assert_eq!(header.pts, pts),
                other => panic!("expected mux packet, got {:?}", other),
            }
        }
        assert!(frames.try_next(Duration::from_millis(200)).await.is_none());
        streamer.stop().await;
    }

    #[tokio::test]
    async fn test_stop_detaches_and_ends_pump() {
        let device = FakeDevice::new(3);
        let (streamer, mut frames) = start_session(&device).await;
        expect_ok(frames.next().await);
        let receiver = Arc::clone(streamer.receiver());
        assert!(receiver.is_attached());
        assert!(streamer.is_running());

        streamer.stop().await;
        assert!(!receiver.is_attached());
        assert_eq!(
            device.events(),
            vec!["tune 101".to_string(), "attach [101, 102]".to_string(), "detach [101, 102]".to_string()]
        );
    }

    #[tokio::test]
    async fn test_detached_receiver_ends_session() {
        let device = FakeDevice::new(0);
        let (streamer, mut frames) = start_session(&device).await;
        expect_ok(frames.next().await);

        let receiver = Arc::clone(streamer.receiver());
        device.detach(&receiver);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!streamer.is_running());
        streamer.stop().await;
    }

    #[tokio::test]
    async fn test_start_errors_map_to_return_codes() {
        let device = FakeDevice::new(0);
        let provider = FakeProvider::new(Arc::clone(&device));
        let (_client, server) = tokio::io::duplex(1024);
        let writer = ClientWriter::new(server);

        provider.busy.store(true, Ordering::SeqCst);
        let err = LiveStreamer::start(1, demo_channel(), provider.as_ref(), writer.clone(), 1, &test_config())
            .await
            .err()
            .unwrap();
        assert_eq!(err.return_code(), ReturnCode::DataLocked);

        provider.busy.store(false, Ordering::SeqCst);
        device.tune_ok.store(false, Ordering::SeqCst);
        let err = LiveStreamer::start(1, demo_channel(), provider.as_ref(), writer.clone(), 1, &test_config())
            .await
            .err()
            .unwrap();
        assert_eq!(err.return_code(), ReturnCode::DataLocked);

        device.tune_ok.store(true, Ordering::SeqCst);
        let mut empty = demo_channel();
        empty.video = None;
        empty.dolby.clear();
        let err = LiveStreamer::start(1, empty, provider.as_ref(), writer, 1, &test_config())
            .await
            .err()
            .unwrap();
        assert_eq!(err.return_code(), ReturnCode::DataInvalid);
    }

    #[tokio::test]
    async fn test_signal_info_formats() {
        let device = FakeDevice::new(2);
        let (streamer, mut frames) = start_session(&device).await;
        expect_ok(frames.next().await);

        streamer.state.send_signal_info().await.unwrap();
        match frames.next().await {
            ServerFrame::Stream { opcode, payload, .. } => {
                assert_eq!(opcode, stream_opcode::SIGNAL_INFO);
                let mut r = FieldReader::new(payload);
                assert_eq!(r.string().unwrap(), "Unknown");
                assert_eq!(r.string().unwrap(), "Unknown");
                for _ in 0..4 {
                    assert_eq!(r.u32().unwrap(), 0);
                }
            }
            other => panic!("expected signal info, got {:?}", other),
        }
        streamer.stop().await;

        let device = FakeDevice::new(2);
        *device.signal.lock() = Some(SignalReading::Frontend(FrontendStatus {
            name: "Tuner X".to_string(),
            dvb_s2: true,
            has_lock: true,
            has_signal: true,
            has_sync: true,
            snr: Some(1234),
            ber: Some(7),
            ..FrontendStatus::default()
        }));
        let (streamer, mut frames) = start_session(&device).await;
        expect_ok(frames.next().await);
        streamer.state.send_signal_info().await.unwrap();
        match frames.next().await {
            ServerFrame::Stream { payload, .. } => {
                let mut r = FieldReader::new(payload);
                assert_eq!(r.string().unwrap(), "DVB-S2 #2 - Tuner X");
                assert_eq!(r.string().unwrap(), "LOCKED:SIGNAL:-:-:SYNC");
                assert_eq!(r.u32().unwrap(), 1234);
                assert_eq!(r.u32().unwrap(), 0xFFFE);
                assert_eq!(r.u32().unwrap(), 7);
                assert_eq!(r.u32().unwrap(), 0xFFFF_FFFE);
            }
            other => panic!("expected signal info, got {:?}", other),
        }
        streamer.stop().await;
    }
}
