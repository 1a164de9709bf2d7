//! Live receiver: the shared buffer between a device and a streaming session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::demux::TS_PACKET_SIZE;

/// Bounded byte buffer fed by a device and drained by the session pump.
///
/// The device side appends with [`receive`](Self::receive); on overflow only
/// whole TS packets are kept and the rest is dropped. The pump peeks the available run, processes it and then
/// consumes exactly what it used.
pub struct LiveReceiver {
    buffer: Mutex<BytesMut>,
    capacity: usize,
    notify: Notify,
    attached: AtomicBool,
    priority: i32,
    pids: Vec<u16>,
    dropped: AtomicU64,
}

impl LiveReceiver {
    pub fn new(capacity: usize, priority: i32, pids: Vec<u16>) -> Self {
        Self {
            buffer: Mutex::new(BytesMut::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            attached: AtomicBool::new(false),
            priority,
            pids,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// PIDs this receiver wants delivered.
    pub fn pids(&self) -> &[u16] {
        &self.pids
    }

    pub fn wants_pid(&self, pid: u16) -> bool {
        self.pids.contains(&pid)
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Called by the device when the receiver is attached or detached.
    pub fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::Release);
        if !attached {
            // wake the pump so it notices the detach
            self.notify.notify_one();
        }
    }

    /// Append device data. Returns the number of bytes accepted.
    pub fn receive(&self, data: &[u8]) -> usize {
        let accepted = {
            let mut buf = self.buffer.lock();
            let free = self.capacity.saturating_sub(buf.len());
            let n = if data.len() <= free {
                data.len()
            } else {
                free - free % TS_PACKET_SIZE
            };
            buf.extend_from_slice(&data[..n]);
            n
        };
        if accepted < data.len() {
            let total = self.dropped.fetch_add((data.len() - accepted) as u64, Ordering::Relaxed);
            if total == 0 {
                warn!("live receiver buffer overflow, dropping data");
            }
        }
        if accepted > 0 {
            self.notify.notify_one();
        }
        accepted
    }

    /// Bytes currently buffered.
    pub fn available(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Copy of up to `max_len` bytes from the front of the buffer.
    pub fn peek(&self, max_len: usize) -> Bytes {
        let buf = self.buffer.lock();
        let n = buf.len().min(max_len);
        Bytes::copy_from_slice(&buf[..n])
    }

    /// Drop `count` bytes from the front of the buffer.
    pub fn consume(&self, count: usize) {
        let mut buf = self.buffer.lock();
        let n = count.min(buf.len());
        buf.advance(n);
    }

    /// Wait until new data arrives or `timeout` expires.
    pub async fn wait(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    /// Discard buffered data.
    pub fn clear(&self) {
        self.buffer.lock().clear();
    }

    /// Total bytes dropped on overflow.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for LiveReceiver {
    fn drop(&mut self) {
        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            debug!("live receiver dropped {} bytes on overflow", dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_peek_consume() {
        let rx = LiveReceiver::new(16, 50, vec![101]);
        assert_eq!(rx.receive(&[1, 2, 3, 4]), 4);
        assert_eq!(&rx.peek(2)[..], &[1, 2]);
        rx.consume(3);
        assert_eq!(&rx.peek(10)[..], &[4]);
        assert!(rx.wants_pid(101));
        assert!(!rx.wants_pid(102));
    }

    #[test]
    fn test_overflow_keeps_whole_packets() {
        let rx = LiveReceiver::new(3 * TS_PACKET_SIZE + 100, 50, vec![]);
        let data = vec![0x47; 4 * TS_PACKET_SIZE];
        assert_eq!(rx.receive(&data), 3 * TS_PACKET_SIZE);
        assert_eq!(rx.available(), 3 * TS_PACKET_SIZE);
        assert_eq!(rx.dropped_bytes(), TS_PACKET_SIZE as u64);

        // remaining room is smaller than one packet
        assert_eq!(rx.receive(&data[..TS_PACKET_SIZE]), 0);
        assert_eq!(rx.available(), 3 * TS_PACKET_SIZE);
        assert_eq!(rx.dropped_bytes(), 2 * TS_PACKET_SIZE as u64);

        rx.consume(TS_PACKET_SIZE);
        assert_eq!(rx.receive(&data[..TS_PACKET_SIZE]), TS_PACKET_SIZE);
        assert_eq!(rx.available() % TS_PACKET_SIZE, 0);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_data() {
        let rx = Arc::new(LiveReceiver::new(64, 50, vec![]));
        let writer = Arc::clone(&rx);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.receive(&[0x47]);
        });
        rx.wait(Duration::from_secs(5)).await;
        assert_eq!(rx.available(), 1);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_is_bounded() {
        let rx = LiveReceiver::new(64, 50, vec![]);
        let start = std::time::Instant::now();
        rx.wait(Duration::from_millis(30)).await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
