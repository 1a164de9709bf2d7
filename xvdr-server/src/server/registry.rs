//! Connection registry and status fan-out.
//!
//! Every connection registers its writer here. Status events raised by the
//! server (lineup reloads, recordings, messages) are sent to all connections
//! that enabled the status interface.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use xvdr_protocol::{status_opcode, ResponsePacket};

use crate::server::writer::ClientWriter;

/// Upper bound for writing one status message to one client.
const STATUS_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Messages never forwarded to clients: interactive prompts of the recorder.
const SUPPRESSED_MESSAGES: &[&str] = &[
    "Channel not available!",
    "Delete timer?",
    "Delete recording?",
    "Press any key to cancel shutdown",
    "Press any key to cancel restart",
    "Editing - shut down anyway?",
    "Recording - shut down anyway?",
    "shut down anyway?",
    "Recording - restart anyway?",
    "Editing - restart anyway?",
    "Delete channel?",
    "Timer still recording - really delete?",
    "Delete marks information?",
    "Delete resume information?",
    "CAM is in use - really reset?",
    "Really restart?",
    "Stop recording?",
    "Cancel editing?",
    "Cutter already running - Add to cutting queue?",
    "No index-file found. Creating may take minutes. Create one?",
];

/// A server-side event forwarded on the status channel.
///
/// Timer and recording events are raised by a recorder attached to the
/// registry; the server itself raises channel changes and messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    #[allow(dead_code)]
    TimerChange,
    ChannelChange,
    #[allow(dead_code)]
    RecordingsChange,
    #[allow(dead_code)]
    Recording {
        card: i32,
        on: bool,
        name: String,
        file: String,
    },
    Message(String),
}

impl StatusEvent {
    /// Encode the event, or `None` if it must not be sent.
    pub fn encode(&self) -> Option<bytes::Bytes> {
        let mut resp = match self {
            StatusEvent::TimerChange => ResponsePacket::status(status_opcode::TIMER_CHANGE),
            StatusEvent::ChannelChange => ResponsePacket::status(status_opcode::CHANNEL_CHANGE),
            StatusEvent::RecordingsChange => ResponsePacket::status(status_opcode::RECORDINGS_CHANGE),
            StatusEvent::Recording { card, on, name, file } => {
                let mut resp = ResponsePacket::status(status_opcode::RECORDING);
                resp.add_i32(*card)
                    .add_i32(*on as i32)
                    .add_string(name)
                    .add_string(file);
                resp
            }
            StatusEvent::Message(text) => {
                if is_suppressed(text) {
                    debug!("Suppressing status message: {}", text);
                    return None;
                }
                let mut resp = ResponsePacket::status(status_opcode::MESSAGE);
                resp.add_u32(0).add_string(text);
                resp
            }
        };
        match resp.finalise() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!("Status packet failed: {}", e);
                None
            }
        }
    }
}

fn is_suppressed(text: &str) -> bool {
    SUPPRESSED_MESSAGES
        .iter()
        .any(|suppressed| suppressed.eq_ignore_ascii_case(text))
}

struct Entry {
    addr: SocketAddr,
    writer: ClientWriter,
    status_enabled: Arc<AtomicBool>,
}

/// Registry of live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<u64, Entry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection.
    pub async fn register(&self, id: u64, addr: SocketAddr, writer: ClientWriter, status_enabled: Arc<AtomicBool>) {
        self.connections.write().await.insert(
            id,
            Entry {
                addr,
                writer,
                status_enabled,
            },
        );
    }

    /// Unregister a connection.
    pub async fn unregister(&self, id: u64) {
        self.connections.write().await.remove(&id);
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Send `event` to every connection with the status interface enabled.
    /// Returns the number of connections it was written to.
    ///
    /// Clients are written concurrently; a client that does not take the
    /// message within the write timeout is skipped and marked closed.
    pub async fn broadcast(&self, event: &StatusEvent) -> usize {
        let Some(bytes) = event.encode() else {
            return 0;
        };

        // collect writers first so slow clients don't hold the map lock
        let targets: Vec<(u64, SocketAddr, ClientWriter)> = self
            .connections
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.status_enabled.load(Ordering::Acquire))
            .map(|(&id, entry)| (id, entry.addr, entry.writer.clone()))
            .collect();

        let mut writes = JoinSet::new();
        for (id, addr, writer) in targets {
            let bytes = bytes.clone();
            writes.spawn(async move {
                match writer.write(&bytes, Some(STATUS_WRITE_TIMEOUT)).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("[Conn {}] Status write to {} failed: {}", id, addr, e);
                        false
                    }
                }
            });
        }

        let mut sent = 0;
        while let Some(result) = writes.join_next().await {
            if matches!(result, Ok(true)) {
                sent += 1;
            }
        }
        info!("Status event {:?} sent to {} connection(s)", event, sent);
        sent
    }
}
