//! TCP listener for accepting client connections.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info};
use tokio::net::{TcpListener, TcpStream};

use crate::server::connection::{Connection, Services};
use crate::server::registry::ConnectionRegistry;
use crate::server::writer::ClientWriter;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
}

/// The main server that listens for connections and spawns connection tasks.
pub struct Server {
    config: ServerConfig,
    services: Services,
}

impl Server {
    pub fn new(config: ServerConfig, services: Services) -> Self {
        Self { config, services }
    }

    /// Run the server, accepting connections until shutdown.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!("Server listening on {}", self.config.listen_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut connection_count = 0u64;

        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    connection_count += 1;
                    let conn_id = connection_count;

                    info!("[Conn {}] New connection from {}", conn_id, addr);

                    let services = self.services.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, addr, conn_id, services).await {
                            error!("[Conn {}] Connection error: {}", conn_id, e);
                        }
                        info!("[Conn {}] Connection closed", conn_id);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Registry of the connections currently being served.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.services.registry
    }
}

/// Handle a single client connection.
async fn handle_connection(
    socket: TcpStream,
    addr: SocketAddr,
    conn_id: u64,
    services: Services,
) -> Result<(), crate::error::ConnectionError> {
    // Disable Nagle's algorithm for lower latency
    socket.set_nodelay(true)?;

    let (reader, writer) = socket.into_split();
    let writer = ClientWriter::new(writer);
    let registry = Arc::clone(&services.registry);

    let mut connection = Connection::new(conn_id, reader, writer.clone(), services);
    let status_enabled = Arc::clone(&connection.context().status_enabled);
    registry.register(conn_id, addr, writer.clone(), status_enabled).await;

    let result = connection.run().await;

    registry.unregister(conn_id).await;
    writer.shutdown().await;

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::tests::demo_channel;
    use crate::channels::ChannelList;
    use crate::device::testing::{FakeDevice, FakeProvider};
    use crate::server::commands::BuiltinCommands;
    use crate::server::registry::StatusEvent;
    use crate::streamer::StreamerConfig;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use xvdr_protocol::{opcode, RequestHeader, PROTOCOL_VERSION};

    #[tokio::test]
    async fn test_tcp_login_and_status_broadcast() {
        let services = Services {
            channels: Arc::new(ChannelList::new(vec![demo_channel()]).unwrap()),
            devices: FakeProvider::new(FakeDevice::new(0)),
            commands: Arc::new(BuiltinCommands::new("test server")),
            registry: Arc::new(ConnectionRegistry::new()),
            streamer: StreamerConfig::default(),
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(ServerConfig { listen_addr: addr }, services));
        let registry = Arc::clone(server.registry());
        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve(listener).await });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut login = PROTOCOL_VERSION.to_be_bytes().to_vec();
        login.push(0);
        login.extend_from_slice(b"tcp client\0");
        client
            .write_all(&RequestHeader::encode_request(1, opcode::LOGIN, &login))
            .await
            .unwrap();
        client
            .write_all(&RequestHeader::encode_request(2, opcode::ENABLE_STATUS_INTERFACE, &[1]))
            .await
            .unwrap();

        // login response header, then the status interface reply
        let mut header = [0u8; 16];
        client.read_exact(&mut header).await.unwrap();
        let len = u32::from_be_bytes([header[12], header[13], header[14], header[15]]) as usize;
        let mut body = vec![0u8; len];
        client.read_exact(&mut body).await.unwrap();
        let mut reply = [0u8; 20];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..12], &[0, 0, 0, 1, 0, 0, 0, 3, 0, 0, 0, 2]);

        let mut sent = 0;
        for _ in 0..50 {
            sent = registry.broadcast(&StatusEvent::RecordingsChange).await;
            if sent == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sent, 1);
        let mut status = [0u8; 16];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(&status[..8], &[0, 0, 0, 5, 0, 0, 0, 5]);

        drop(client);
        for _ in 0..50 {
            if registry.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.is_empty().await);
    }
}
