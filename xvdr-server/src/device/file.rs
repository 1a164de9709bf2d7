//! File replay devices.
//!
//! Each configured device replays the `source_file` of the channel it is
//! tuned to, paced at the device bitrate and looping at end of file. Only the
//! PIDs a receiver asked for are delivered into its buffer.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::channels::{Channel, DeviceDefinition};
use crate::demux::{ts_pid, TS_PACKET_SIZE, TS_SYNC_BYTE};
use crate::device::lock::PriorityLock;
use crate::device::{Device, DeviceProvider, FrontendStatus, SignalReading, SignalSource};
use crate::streamer::LiveReceiver;

/// TS packets read per replay tick.
const REPLAY_CHUNK_PACKETS: usize = 64;

struct Attached {
    holder: u64,
    receiver: Arc<LiveReceiver>,
}

struct Feeder {
    channel_uid: u32,
    cancel: CancellationToken,
}

/// One replay device.
pub struct FileDevice {
    definition: DeviceDefinition,
    lock: PriorityLock,
    receivers: Arc<Mutex<Vec<Attached>>>,
    feeder: Mutex<Option<Feeder>>,
}

impl FileDevice {
    fn new(definition: DeviceDefinition) -> Self {
        Self {
            definition,
            lock: PriorityLock::new(),
            receivers: Arc::new(Mutex::new(Vec::new())),
            feeder: Mutex::new(None),
        }
    }

    pub fn card_index(&self) -> i32 {
        self.definition.card_index
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Channel the device is currently locked on.
    pub fn current_channel(&self) -> Option<u32> {
        self.lock.channel()
    }

    pub fn is_feeding(&self) -> bool {
        self.feeder
            .lock()
            .as_ref()
            .map(|f| !f.cancel.is_cancelled())
            .unwrap_or(false)
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.lock().len()
    }

    /// Detach every receiver belonging to one of `holders`.
    fn evict(&self, holders: &[u64]) {
        let mut receivers = self.receivers.lock();
        receivers.retain(|attached| {
            if holders.contains(&attached.holder) {
                attached.receiver.set_attached(false);
                false
            } else {
                true
            }
        });
    }

    fn start_feeder(&self, channel: &Channel) -> bool {
        let mut feeder = self.feeder.lock();
        if let Some(current) = feeder.as_ref() {
            if current.channel_uid == channel.uid && !current.cancel.is_cancelled() {
                return true;
            }
        }
        if let Some(old) = feeder.take() {
            old.cancel.cancel();
        }

        let Some(path) = channel.source_file.clone() else {
            warn!("Device {}: channel {} has no source file", self.card_index(), channel.number);
            return false;
        };
        if !path.is_file() {
            error!("Device {}: source file {} not found", self.card_index(), path.display());
            return false;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!("Device {}: no runtime for replay: {}", self.card_index(), e);
                return false;
            }
        };

        let cancel = CancellationToken::new();
        runtime.spawn(replay(
            self.card_index(),
            path,
            self.definition.bitrate_kbps,
            Arc::clone(&self.receivers),
            cancel.clone(),
        ));
        *feeder = Some(Feeder {
            channel_uid: channel.uid,
            cancel,
        });
        true
    }

    fn stop_feeder(&self) {
        if let Some(feeder) = self.feeder.lock().take() {
            debug!("Device {}: stopping replay of channel {:#x}", self.card_index(), feeder.channel_uid);
            feeder.cancel.cancel();
        }
    }

    fn release(&self, holder: u64) {
        if let Err(e) = self.lock.release(holder) {
            debug!("Device {}: {}", self.card_index(), e);
            return;
        }
        if self.lock.holder_count() == 0 {
            self.stop_feeder();
        }
    }
}

/// Hands out replay devices by priority.
pub struct FileDeviceProvider {
    devices: Vec<Arc<FileDevice>>,
}

impl FileDeviceProvider {
    pub fn new(definitions: &[DeviceDefinition]) -> Self {
        Self {
            devices: definitions
                .iter()
                .cloned()
                .map(|d| Arc::new(FileDevice::new(d)))
                .collect(),
        }
    }

    pub fn devices(&self) -> &[Arc<FileDevice>] {
        &self.devices
    }
}

impl DeviceProvider for FileDeviceProvider {
    fn acquire_device(&self, channel: &Channel, priority: i32) -> Option<Arc<dyn Device>> {
        if channel.source_file.is_none() {
            debug!("Channel {} has no source file, no device can receive it", channel.number);
            return None;
        }

        // prefer a device already on this channel, then any we may take
        let device = self
            .devices
            .iter()
            .find(|d| d.current_channel() == Some(channel.uid))
            .or_else(|| self.devices.iter().find(|d| d.lock.check(channel.uid, priority).is_ok()));

        match device {
            Some(device) => Some(Arc::new(FileDeviceHandle::new(Arc::clone(device), priority))),
            None => {
                info!(
                    "No device available for channel {} at priority {}",
                    channel.number, priority
                );
                None
            }
        }
    }
}

/// A device as seen by one session: carries the requested priority and the
/// lock holder id once tuned.
struct FileDeviceHandle {
    device: Arc<FileDevice>,
    priority: i32,
    holder: Mutex<Option<u64>>,
}

impl FileDeviceHandle {
    fn new(device: Arc<FileDevice>, priority: i32) -> Self {
        Self {
            device,
            priority,
            holder: Mutex::new(None),
        }
    }
}

impl Device for FileDeviceHandle {
    fn card_index(&self) -> i32 {
        self.device.card_index()
    }

    fn tune(&self, channel: &Channel) -> bool {
        let grant = match self.device.lock.acquire(channel.uid, self.priority) {
            Ok(grant) => grant,
            Err(e) => {
                warn!("Device {}: {}", self.card_index(), e);
                return false;
            }
        };
        if !grant.preempted.is_empty() {
            info!(
                "Device {}: priority {} preempts {} holder(s)",
                self.card_index(),
                self.priority,
                grant.preempted.len()
            );
            self.device.evict(&grant.preempted);
        }
        if let Some(previous) = self.holder.lock().replace(grant.id) {
            self.device.release(previous);
        }

        if !self.device.start_feeder(channel) {
            self.holder.lock().take();
            self.device.release(grant.id);
            return false;
        }
        true
    }

    fn attach_receiver(&self, receiver: Arc<LiveReceiver>) {
        let Some(holder) = *self.holder.lock() else {
            warn!("Device {}: attach before tune ignored", self.card_index());
            return;
        };
        receiver.set_attached(true);
        self.device.receivers.lock().push(Attached { holder, receiver });
    }

    fn detach(&self, receiver: &Arc<LiveReceiver>) {
        receiver.set_attached(false);
        self.device
            .receivers
            .lock()
            .retain(|attached| !Arc::ptr_eq(&attached.receiver, receiver));
        if let Some(holder) = self.holder.lock().take() {
            self.device.release(holder);
        }
    }

    fn signal_source(&self) -> Option<Box<dyn SignalSource>> {
        Some(Box::new(FileSignal {
            device: Arc::clone(&self.device),
        }))
    }
}

impl Drop for FileDeviceHandle {
    fn drop(&mut self) {
        if let Some(holder) = self.holder.get_mut().take() {
            self.device.release(holder);
        }
    }
}

/// Reports the replay state as a frontend lock.
struct FileSignal {
    device: Arc<FileDevice>,
}

impl SignalSource for FileSignal {
    fn read(&mut self) -> Option<SignalReading> {
        let feeding = self.device.is_feeding();
        Some(SignalReading::Frontend(FrontendStatus {
            name: self.device.name().to_string(),
            dvb_s2: false,
            has_lock: feeding,
            has_signal: feeding,
            has_carrier: feeding,
            has_viterbi: feeding,
            has_sync: feeding,
            snr: None,
            strength: None,
            ber: Some(0),
            uncorrected_blocks: Some(0),
        }))
    }
}

/// Time one chunk of `chunk_len` bytes takes at `bitrate_kbps`.
fn chunk_period(chunk_len: usize, bitrate_kbps: u32) -> Duration {
    let bits = chunk_len as u64 * 8;
    Duration::from_micros(bits * 1000 / bitrate_kbps.max(1) as u64)
}

/// Remove whole, sync-aligned packets from the front of `pending`.
fn take_packets(pending: &mut BytesMut) -> BytesMut {
    let mut out = BytesMut::with_capacity(pending.len());
    let mut pos = 0;
    while pending.len() - pos >= TS_PACKET_SIZE {
        if pending[pos] != TS_SYNC_BYTE {
            pos += 1;
            continue;
        }
        out.extend_from_slice(&pending[pos..pos + TS_PACKET_SIZE]);
        pos += TS_PACKET_SIZE;
    }
    pending.advance(pos);
    out
}

fn deliver(packets: &[u8], receivers: &Mutex<Vec<Attached>>) {
    let receivers = receivers.lock();
    for attached in receivers.iter() {
        let mut wanted = Vec::with_capacity(packets.len());
        for packet in packets.chunks_exact(TS_PACKET_SIZE) {
            if attached.receiver.wants_pid(ts_pid(packet)) {
                wanted.extend_from_slice(packet);
            }
        }
        if !wanted.is_empty() {
            attached.receiver.receive(&wanted);
        }
    }
}

async fn replay(
    card: i32,
    path: PathBuf,
    bitrate_kbps: u32,
    receivers: Arc<Mutex<Vec<Attached>>>,
    cancel: CancellationToken,
) {
    let mut file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            error!("Device {}: cannot open {}: {}", card, path.display(), e);
            cancel.cancel();
            return;
        }
    };
    info!("Device {}: replaying {} at {} kbit/s", card, path.display(), bitrate_kbps);

    let chunk_len = TS_PACKET_SIZE * REPLAY_CHUNK_PACKETS;
    let mut ticker = tokio::time::interval(chunk_period(chunk_len, bitrate_kbps));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buf = vec![0u8; chunk_len];
    let mut pending = BytesMut::with_capacity(chunk_len * 2);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let n = match file.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                error!("Device {}: read error on {}: {}", card, path.display(), e);
                break;
            }
        };
        if n == 0 {
            debug!("Device {}: end of {}, rewinding", card, path.display());
            if let Err(e) = file.seek(SeekFrom::Start(0)).await {
                error!("Device {}: cannot rewind {}: {}", card, path.display(), e);
                break;
            }
            pending.clear();
            continue;
        }

        pending.extend_from_slice(&buf[..n]);
        let packets = take_packets(&mut pending);
        if !packets.is_empty() {
            deliver(&packets, &receivers);
        }
    }

    cancel.cancel();
    debug!("Device {}: replay of {} stopped", card, path.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::tests::demo_channel;

    fn ts_packet(pid: u16) -> Vec<u8> {
        let mut pkt = vec![0xFF; TS_PACKET_SIZE];
        pkt[0] = TS_SYNC_BYTE;
        pkt[1] = (pid >> 8) as u8 & 0x1F;
        pkt[2] = pid as u8;
        pkt[3] = 0x10;
        pkt
    }

    fn source_file(name: &str, pids: &[u16]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("xvdr-{}-{}.ts", std::process::id(), name));
        let mut data = Vec::new();
        for _ in 0..20 {
            for &pid in pids {
                data.extend(ts_packet(pid));
            }
        }
        std::fs::write(&path, data).unwrap();
        path
    }

    fn channel(uid: u32, number: u32, path: &PathBuf) -> Channel {
        let mut channel = demo_channel();
        channel.uid = uid;
        channel.number = number;
        channel.source_file = Some(path.clone());
        channel
    }

    fn provider(cards: i32) -> FileDeviceProvider {
        let definitions: Vec<_> = (0..cards)
            .map(|card_index| DeviceDefinition {
                card_index,
                name: format!("Replay {}", card_index),
                bitrate_kbps: 50_000,
            })
            .collect();
        FileDeviceProvider::new(&definitions)
    }

    #[test]
    fn test_take_packets_resyncs() {
        let mut pending = BytesMut::new();
        pending.extend_from_slice(&[0x00, 0x01]);
        pending.extend_from_slice(&ts_packet(101));
        pending.extend_from_slice(&ts_packet(102)[..100]);
        let packets = take_packets(&mut pending);
        assert_eq!(packets.len(), TS_PACKET_SIZE);
        assert_eq!(ts_pid(&packets), 101);
        assert_eq!(pending.len(), 100);
    }

    #[test]
    fn test_chunk_period() {
        assert_eq!(chunk_period(1000, 8), Duration::from_secs(1));
        assert_eq!(chunk_period(TS_PACKET_SIZE * 64, 8_000), Duration::from_micros(12_032));
    }

    #[test]
    fn test_channel_without_file() {
        let provider = provider(1);
        assert!(provider.acquire_device(&demo_channel(), 50).is_none());
    }

    #[tokio::test]
    async fn test_replay_delivers_wanted_pids() {
        let path = source_file("pids", &[101, 200]);
        let provider = provider(1);
        let device = provider.acquire_device(&channel(1, 1, &path), 50).unwrap();
        assert!(device.tune(&channel(1, 1, &path)));

        let rx = Arc::new(LiveReceiver::new(1 << 16, 50, vec![101]));
        device.attach_receiver(Arc::clone(&rx));
        assert!(rx.is_attached());

        for _ in 0..100 {
            if rx.available() >= TS_PACKET_SIZE * 4 {
                break;
            }
            rx.wait(Duration::from_millis(20)).await;
        }
        let data = rx.peek(usize::MAX);
        assert!(data.len() >= TS_PACKET_SIZE * 4);
        assert!(data.chunks_exact(TS_PACKET_SIZE).all(|p| ts_pid(p) == 101));

        device.detach(&rx);
        assert!(!rx.is_attached());
        assert!(!provider.devices()[0].is_feeding());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_higher_priority_holder_blocks() {
        let path = source_file("priority", &[101]);
        let provider = provider(1);
        let first = channel(1, 1, &path);
        let second = channel(2, 2, &path);

        let holder = provider.acquire_device(&first, 80).unwrap();
        assert!(holder.tune(&first));
        let rx = Arc::new(LiveReceiver::new(1024, 80, vec![101]));
        holder.attach_receiver(Arc::clone(&rx));

        assert!(provider.acquire_device(&second, 50).is_none());
        // same channel is shared regardless of priority
        assert!(provider.acquire_device(&first, 10).is_some());

        let preempting = provider.acquire_device(&second, 90).unwrap();
        assert!(preempting.tune(&second));
        assert!(!rx.is_attached());
        assert_eq!(provider.devices()[0].current_channel(), Some(2));
        assert_eq!(provider.devices()[0].receiver_count(), 0);

        drop(preempting);
        assert_eq!(provider.devices()[0].current_channel(), None);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_second_device_serves_other_channel() {
        let path = source_file("two", &[101]);
        let provider = provider(2);
        let first = channel(1, 1, &path);
        let second = channel(2, 2, &path);

        let a = provider.acquire_device(&first, 50).unwrap();
        assert!(a.tune(&first));
        let b = provider.acquire_device(&second, 50).unwrap();
        assert_eq!(b.card_index(), 1);
        assert!(b.tune(&second));

        match b.signal_source().unwrap().read() {
            Some(SignalReading::Frontend(fe)) => {
                assert_eq!(fe.name, "Replay 1");
                assert!(fe.has_lock);
            }
            other => panic!("unexpected reading {:?}", other),
        }
        let _ = std::fs::remove_file(path);
    }
}
