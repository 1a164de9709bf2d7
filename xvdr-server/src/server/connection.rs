//! Client connection handling.
//!
//! The reader loop dispatches on the channel tag of each incoming message.
//! Channel open/close and login run inline; every other request goes to a
//! per-connection command worker so a slow command never stalls keepalives.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use xvdr_protocol::{
    opcode, ChannelTag, RequestHeader, RequestPacket, ResponsePacket, ReturnCode, REQUEST_HEADER_SIZE,
};

use crate::channels::ChannelDirectory;
use crate::device::DeviceProvider;
use crate::error::ConnectionError;
use crate::server::commands::CommandHandler;
use crate::server::registry::ConnectionRegistry;
use crate::server::writer::ClientWriter;
use crate::streamer::{LiveStreamer, StreamError, StreamerConfig};

/// Timeout for the rest of a request once its channel tag arrived.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the timestamp of a keepalive.
const KEEPALIVE_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// How long cleanup waits for the command worker to drain.
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection state visible to command handlers.
#[derive(Debug)]
pub struct ConnectionContext {
    pub id: u64,
    pub logged_in: AtomicBool,
    pub status_enabled: Arc<AtomicBool>,
    pub client_name: Mutex<Option<String>>,
}

impl ConnectionContext {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            logged_in: AtomicBool::new(false),
            status_enabled: Arc::new(AtomicBool::new(false)),
            client_name: Mutex::new(None),
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Acquire)
    }
}

/// Server-wide collaborators shared by all connections.
#[derive(Clone)]
pub struct Services {
    pub channels: Arc<dyn ChannelDirectory>,
    pub devices: Arc<dyn DeviceProvider>,
    pub commands: Arc<dyn CommandHandler>,
    pub registry: Arc<ConnectionRegistry>,
    pub streamer: StreamerConfig,
}

/// One client connection.
pub struct Connection<R> {
    ctx: Arc<ConnectionContext>,
    reader: R,
    writer: ClientWriter,
    services: Services,
    streamer: Option<LiveStreamer>,
    worker_tx: Option<mpsc::UnboundedSender<RequestPacket>>,
    worker: Option<JoinHandle<()>>,
}

impl<R> Connection<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(id: u64, reader: R, writer: ClientWriter, services: Services) -> Self {
        Self {
            ctx: Arc::new(ConnectionContext::new(id)),
            reader,
            writer,
            services,
            streamer: None,
            worker_tx: None,
            worker: None,
        }
    }

    pub fn context(&self) -> &Arc<ConnectionContext> {
        &self.ctx
    }

    /// Serve the connection until the client disconnects or violates the
    /// protocol. Any running session is torn down before returning.
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        self.spawn_worker();
        let result = self.read_loop().await;
        self.cleanup().await;
        result
    }

    async fn read_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            let tag = tokio::select! {
                _ = self.writer.closed().cancelled() => {
                    debug!("[Conn {}] Writer closed, leaving reader loop", self.ctx.id);
                    return Err(ConnectionError::Closed);
                }
                tag = read_tag(&mut self.reader) => tag?,
            };
            let Some(tag) = tag else {
                info!("[Conn {}] Client disconnected", self.ctx.id);
                return Ok(());
            };

            match ChannelTag::try_from(tag) {
                Ok(ChannelTag::RequestResponse) => self.read_request().await?,
                Ok(ChannelTag::Keepalive) => self.keepalive().await?,
                _ => {
                    error!("[Conn {}] Incoming channel number {} unknown", self.ctx.id, tag);
                    return Err(ConnectionError::UnknownChannel(tag));
                }
            }
        }
    }

    async fn read_request(&mut self) -> Result<(), ConnectionError> {
        let mut header = [0u8; REQUEST_HEADER_SIZE];
        tokio::time::timeout(REQUEST_READ_TIMEOUT, self.reader.read_exact(&mut header)).await??;
        let header = RequestHeader::decode(&header).map_err(|e| {
            error!("[Conn {}] {}", self.ctx.id, e);
            e
        })?;

        let mut payload = vec![0u8; header.payload_len as usize];
        if !payload.is_empty() {
            tokio::time::timeout(REQUEST_READ_TIMEOUT, self.reader.read_exact(&mut payload)).await??;
        }

        debug!(
            "[Conn {}] Received ser={}, op={}, edl={}",
            self.ctx.id, header.request_id, header.opcode, header.payload_len
        );

        if !self.ctx.is_logged_in() && header.opcode != opcode::LOGIN {
            error!("[Conn {}] Not logged in and opcode {} is not login", self.ctx.id, header.opcode);
            return Err(ConnectionError::NotLoggedIn(header.opcode));
        }

        let mut req = RequestPacket::new(header, Bytes::from(payload));
        match header.opcode {
            opcode::CHANNEL_STREAM_OPEN => self.open_stream(req).await,
            opcode::CHANNEL_STREAM_CLOSE => {
                self.stop_streaming().await;
                Ok(())
            }
            opcode::LOGIN => {
                if let Some(bytes) = self.services.commands.handle(&mut req, &self.ctx) {
                    self.writer.write(&bytes, None).await?;
                }
                Ok(())
            }
            _ => {
                self.dispatch(req);
                Ok(())
            }
        }
    }

    async fn keepalive(&mut self) -> Result<(), ConnectionError> {
        let mut stamp = [0u8; 4];
        tokio::time::timeout(KEEPALIVE_READ_TIMEOUT, self.reader.read_exact(&mut stamp)).await??;
        trace!("[Conn {}] Keepalive {}", self.ctx.id, u32::from_be_bytes(stamp));

        let mut reply = [0u8; 8];
        reply[..4].copy_from_slice(&u32::from(ChannelTag::Keepalive).to_be_bytes());
        reply[4..].copy_from_slice(&stamp);
        self.writer.write(&reply, None).await.map_err(|e| {
            error!("[Conn {}] Could not send back keepalive reply", self.ctx.id);
            ConnectionError::Io(e)
        })
    }

    async fn open_stream(&mut self, mut req: RequestPacket) -> Result<(), ConnectionError> {
        let request_id = req.request_id;
        let reference = match req.extract_u32() {
            Ok(reference) => reference,
            Err(e) => {
                error!("[Conn {}] Channel open without channel reference: {}", self.ctx.id, e);
                return self.reply_open(request_id, ReturnCode::DataInvalid).await;
            }
        };

        self.stop_streaming().await;

        let channels = &self.services.channels;
        let Some(channel) = channels
            .find_by_uid(reference)
            .or_else(|| channels.find_by_number(reference))
        else {
            error!("[Conn {}] Can't find channel {:08x}", self.ctx.id, reference);
            return self.reply_open(request_id, ReturnCode::DataInvalid).await;
        };

        let name = channel.name.clone();
        match LiveStreamer::start(
            self.ctx.id,
            channel,
            self.services.devices.as_ref(),
            self.writer.clone(),
            request_id,
            &self.services.streamer,
        )
        .await
        {
            Ok(streamer) => {
                info!("[Conn {}] Started streaming of channel {}", self.ctx.id, name);
                self.streamer = Some(streamer);
                Ok(())
            }
            Err(StreamError::Io(e)) => Err(e.into()),
            Err(e) => {
                debug!("[Conn {}] Can't stream channel {}: {}", self.ctx.id, name, e);
                self.reply_open(request_id, e.return_code()).await
            }
        }
    }

    async fn reply_open(&self, request_id: u32, code: ReturnCode) -> Result<(), ConnectionError> {
        let mut resp = ResponsePacket::response(opcode::CHANNEL_STREAM_OPEN, request_id);
        resp.add_u32(code.into());
        let bytes = resp.finalise()?;
        self.writer.write(&bytes, None).await?;
        Ok(())
    }

    async fn stop_streaming(&mut self) {
        if let Some(streamer) = self.streamer.take() {
            info!(
                "[Conn {}] Stopping streaming of channel {}",
                self.ctx.id,
                streamer.channel().name
            );
            streamer.stop().await;
        }
    }

    fn spawn_worker(&mut self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<RequestPacket>();
        let handler = Arc::clone(&self.services.commands);
        let ctx = Arc::clone(&self.ctx);
        let writer = self.writer.clone();

        self.worker = Some(tokio::spawn(async move {
            while let Some(mut req) = rx.recv().await {
                let Some(bytes) = handler.handle(&mut req, &ctx) else {
                    continue;
                };
                if let Err(e) = writer.write(&bytes, None).await {
                    debug!("[Conn {}] Command response write failed: {}", ctx.id, e);
                    break;
                }
            }
            trace!("[Conn {}] Command worker finished", ctx.id);
        }));
        self.worker_tx = Some(tx);
    }

    fn dispatch(&self, req: RequestPacket) {
        match &self.worker_tx {
            Some(tx) => {
                if tx.send(req).is_err() {
                    warn!("[Conn {}] Command worker gone, request dropped", self.ctx.id);
                }
            }
            None => warn!("[Conn {}] No command worker, request dropped", self.ctx.id),
        }
    }

    async fn cleanup(&mut self) {
        self.stop_streaming().await;
        self.worker_tx.take();
        if let Some(mut worker) = self.worker.take() {
            if tokio::time::timeout(WORKER_STOP_TIMEOUT, &mut worker).await.is_err() {
                warn!("[Conn {}] Command worker did not stop in time, aborting", self.ctx.id);
                worker.abort();
            }
        }
    }
}

impl<R> Drop for Connection<R> {
    fn drop(&mut self) {
        debug!("[Conn {}] Connection dropped", self.ctx.id);
    }
}

/// Read a channel tag. `None` on a clean end of stream before the first byte.
async fn read_tag<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<u32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "partial channel tag"));
        }
        filled += n;
    }
    Ok(Some(u32::from_be_bytes(buf)))
}
