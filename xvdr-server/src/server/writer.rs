//! Serialized access to the write half of a client socket.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Cloneable writer shared by the connection, its command worker and the
/// streaming pump.
///
/// Every message is written while holding the mutex, so messages from
/// different tasks never interleave. The first write failure marks the
/// writer closed and fires [`closed`](Self::closed).
#[derive(Clone)]
pub struct ClientWriter {
    inner: Arc<Mutex<BoxedWrite>>,
    closed: CancellationToken,
}

impl ClientWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
            closed: CancellationToken::new(),
        }
    }

    /// Token cancelled once a write has failed.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Write one complete message.
    pub async fn write(&self, buf: &[u8], timeout: Option<Duration>) -> io::Result<()> {
        self.write_parts(&[buf], timeout).await
    }

    /// Write a header and its payload back to back. A failed header write
    /// skips the payload.
    pub async fn write_pair(&self, header: &[u8], payload: &[u8], timeout: Option<Duration>) -> io::Result<()> {
        self.write_parts(&[header, payload], timeout).await
    }

    async fn write_parts(&self, parts: &[&[u8]], timeout: Option<Duration>) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"));
        }
        let mut writer = self.inner.lock().await;
        let result = async {
            for part in parts {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, writer.write_all(part))
                        .await
                        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))??,
                    None => writer.write_all(part).await?,
                }
            }
            writer.flush().await
        }
        .await;

        if result.is_err() {
            self.closed.cancel();
        }
        result
    }

    /// Shut down the write half.
    pub async fn shutdown(&self) {
        let mut writer = self.inner.lock().await;
        let _ = writer.shutdown().await;
        self.closed.cancel();
    }
}
