//! Device collaborators.
//!
//! A [`DeviceProvider`] hands out devices able to receive a channel at a
//! given priority. A [`Device`] tunes, feeds attached [`LiveReceiver`]s and
//! optionally exposes a [`SignalSource`] for diagnostics.

pub mod file;
pub mod lock;

use std::sync::Arc;

use crate::channels::Channel;
use crate::streamer::LiveReceiver;

pub use file::FileDeviceProvider;

/// A tuner (or tuner-like source) of transport stream data.
pub trait Device: Send + Sync {
    /// Zero-based card index used in diagnostics.
    fn card_index(&self) -> i32;

    /// Switch to `channel`. Returns false if the switch failed.
    fn tune(&self, channel: &Channel) -> bool;

    /// Start delivering the receiver's PIDs into its buffer.
    fn attach_receiver(&self, receiver: Arc<LiveReceiver>);

    /// Stop delivering to the receiver.
    fn detach(&self, receiver: &Arc<LiveReceiver>);

    /// Open the signal diagnostics source, if the device has one.
    fn signal_source(&self) -> Option<Box<dyn SignalSource>>;
}

/// Hands out devices for channels.
pub trait DeviceProvider: Send + Sync {
    /// Find a device able to receive `channel` at `priority`.
    fn acquire_device(&self, channel: &Channel, priority: i32) -> Option<Arc<dyn Device>>;
}

/// Frontend status as reported by a DVB device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrontendStatus {
    pub name: String,
    /// Frontend supports second generation satellite modulation.
    pub dvb_s2: bool,
    pub has_lock: bool,
    pub has_signal: bool,
    pub has_carrier: bool,
    pub has_viterbi: bool,
    pub has_sync: bool,
    pub snr: Option<u16>,
    pub strength: Option<u16>,
    pub ber: Option<u32>,
    pub uncorrected_blocks: Option<u32>,
}

/// One reading from a signal source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalReading {
    Frontend(FrontendStatus),
    Analog {
        device: String,
        card: String,
        driver: String,
    },
}

/// Signal diagnostics of a device.
pub trait SignalSource: Send {
    /// Current reading, `None` if the source could not be queried.
    fn read(&mut self) -> Option<SignalReading>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable devices for session and connection tests.

    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// A device that records attach/detach calls and lets tests push data.
    pub(crate) struct FakeDevice {
        pub(crate) card: i32,
        pub(crate) tune_ok: AtomicBool,
        pub(crate) receivers: Mutex<Vec<Arc<LiveReceiver>>>,
        pub(crate) events: Mutex<Vec<String>>,
        pub(crate) initial: Mutex<Vec<u8>>,
        pub(crate) signal: Mutex<Option<SignalReading>>,
    }

    impl FakeDevice {
        pub(crate) fn new(card: i32) -> Arc<Self> {
            Arc::new(Self {
                card,
                tune_ok: AtomicBool::new(true),
                receivers: Mutex::new(Vec::new()),
                events: Mutex::new(Vec::new()),
                initial: Mutex::new(Vec::new()),
                signal: Mutex::new(None),
            })
        }

        /// Data delivered to each receiver as soon as it attaches.
        pub(crate) fn set_initial(&self, data: Vec<u8>) {
            *self.initial.lock() = data;
        }

        pub(crate) fn feed(&self, data: &[u8]) {
            for rx in self.receivers.lock().iter() {
                rx.receive(data);
            }
        }

        pub(crate) fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl Device for FakeDevice {
        fn card_index(&self) -> i32 {
            self.card
        }

        fn tune(&self, channel: &Channel) -> bool {
            self.events.lock().push(format!("tune {}", channel.number));
            self.tune_ok.load(Ordering::SeqCst)
        }

        fn attach_receiver(&self, receiver: Arc<LiveReceiver>) {
            self.events.lock().push(format!("attach {:?}", receiver.pids()));
            receiver.set_attached(true);
            let initial = self.initial.lock().clone();
            if !initial.is_empty() {
                receiver.receive(&initial);
            }
            self.receivers.lock().push(receiver);
        }

        fn detach(&self, receiver: &Arc<LiveReceiver>) {
            self.events.lock().push(format!("detach {:?}", receiver.pids()));
            receiver.set_attached(false);
            self.receivers.lock().retain(|r| !Arc::ptr_eq(r, receiver));
        }

        fn signal_source(&self) -> Option<Box<dyn SignalSource>> {
            let reading = self.signal.lock().clone()?;
            Some(Box::new(FixedSignal(reading)))
        }
    }

    struct FixedSignal(SignalReading);

    impl SignalSource for FixedSignal {
        fn read(&mut self) -> Option<SignalReading> {
            Some(self.0.clone())
        }
    }

    /// Provider returning one fixed device, or none when `busy` is set.
    pub(crate) struct FakeProvider {
        pub(crate) device: Arc<FakeDevice>,
        pub(crate) busy: AtomicBool,
    }

    impl FakeProvider {
        pub(crate) fn new(device: Arc<FakeDevice>) -> Arc<Self> {
            Arc::new(Self {
                device,
                busy: AtomicBool::new(false),
            })
        }
    }

    impl DeviceProvider for FakeProvider {
        fn acquire_device(&self, _channel: &Channel, _priority: i32) -> Option<Arc<dyn Device>> {
            if self.busy.load(Ordering::SeqCst) {
                return None;
            }
            Some(self.device.clone() as Arc<dyn Device>)
        }
    }
}
