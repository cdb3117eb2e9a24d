//! TCP transport.
//!
//! Every mesh channel is its own TCP stream. The opener sends a preamble
//! `"MSH1" || channel id (32 bytes) || service port (u16 LE)` so the
//! acceptor knows which network the stream is for and where the opener
//! listens.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BoxedStream, ChannelSet, Connection, ConnectionManager, InboundHandler, TrackedStream};
use crate::crypto::ChannelId;
use crate::mesh::endpoint::Endpoint;
use crate::mesh::error::MeshError;

const PREAMBLE_MAGIC: &[u8; 4] = b"MSH1";
const PREAMBLE_LEN: usize = 4 + 32 + 2;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(10);

struct Shared {
    local_addr: SocketAddr,
    handler: Mutex<Option<Weak<dyn InboundHandler>>>,
    connections: Mutex<HashMap<Endpoint, Arc<TcpConnection>>>,
}

impl Shared {
    fn connection_to(&self, remote: &Endpoint, stream: Option<TcpStream>) -> Arc<TcpConnection> {
        let mut connections = self.connections.lock();
        let connection = connections
            .entry(remote.clone())
            .or_insert_with(|| {
                Arc::new(TcpConnection {
                    remote_endpoint: remote.clone(),
                    service_port: self.local_addr.port(),
                    pending: Mutex::new(None),
                    channels: ChannelSet::new(),
                })
            })
            .clone();
        if let Some(stream) = stream {
            *connection.pending.lock() = Some(stream);
        }
        connection
    }
}

/// Connection manager that listens on a TCP socket.
pub struct TcpConnectionManager {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl TcpConnectionManager {
    /// Binds the listener and starts accepting channels.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, MeshError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MeshError::TransportError(format!("Failed to bind: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| MeshError::TransportError(format!("Failed to get local addr: {}", e)))?;

        let shared = Arc::new(Shared {
            local_addr,
            handler: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
        });
        let shutdown = CancellationToken::new();

        tokio::spawn(accept_loop(listener, Arc::downgrade(&shared), shutdown.clone()));

        Ok(Self { shared, shutdown })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }
}

impl Drop for TcpConnectionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, shared: Weak<Shared>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_inbound(stream, addr, shared).await {
                        debug!(peer = %addr, error = %e, "inbound channel rejected");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_inbound(mut stream: TcpStream, addr: SocketAddr, shared: Weak<Shared>) -> Result<(), MeshError> {
    let mut preamble = [0u8; PREAMBLE_LEN];
    tokio::time::timeout(PREAMBLE_TIMEOUT, stream.read_exact(&mut preamble))
        .await
        .map_err(|_| MeshError::TransportError("preamble timed out".into()))??;

    if &preamble[..4] != PREAMBLE_MAGIC {
        return Err(MeshError::ProtocolError("bad preamble magic".into()));
    }
    let mut channel_id = [0u8; 32];
    channel_id.copy_from_slice(&preamble[4..36]);
    let channel_id = ChannelId(channel_id);
    let service_port = u16::from_le_bytes([preamble[36], preamble[37]]);
    let _ = stream.set_nodelay(true);

    let shared = shared
        .upgrade()
        .ok_or_else(|| MeshError::TransportError("connection manager dropped".into()))?;
    let handler = shared
        .handler
        .lock()
        .as_ref()
        .and_then(Weak::upgrade)
        .ok_or_else(|| MeshError::TransportError("no inbound handler attached".into()))?;

    let remote = Endpoint::Ip(SocketAddr::new(addr.ip(), service_port));
    let connection = shared.connection_to(&remote, None);
    let tracked: BoxedStream = Box::new(TrackedStream::new(stream, connection.channels.clone(), channel_id));

    debug!(peer = %remote, channel = %channel_id.short(), "inbound channel");
    handler.accept(tracked, channel_id, connection).await;
    Ok(())
}

#[async_trait]
impl ConnectionManager for TcpConnectionManager {
    async fn make_connection(&self, endpoint: &Endpoint) -> Result<Arc<dyn Connection>, MeshError> {
        let existing = self.shared.connections.lock().get(endpoint).cloned();
        if let Some(existing) = existing {
            return Ok(existing);
        }

        let stream = dial(endpoint).await?;
        Ok(self.shared.connection_to(endpoint, Some(stream)))
    }

    async fn make_virtual_connection(
        &self,
        via: &Arc<dyn Connection>,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn Connection>, MeshError> {
        Err(MeshError::TransportError(format!(
            "no relay support for {} via {}",
            endpoint,
            via.remote_endpoint()
        )))
    }

    fn local_endpoint(&self) -> Option<Endpoint> {
        Some(Endpoint::Ip(self.shared.local_addr))
    }

    fn attach(&self, handler: Weak<dyn InboundHandler>) {
        *self.shared.handler.lock() = Some(handler);
    }
}

async fn dial(endpoint: &Endpoint) -> Result<TcpStream, MeshError> {
    let addr = endpoint
        .socket_addr()
        .ok_or_else(|| MeshError::TransportError(format!("cannot dial {} over TCP", endpoint)))?;
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| MeshError::TransportError(format!("connect to {} timed out", endpoint)))?
        .map_err(|e| MeshError::TransportError(format!("Failed to connect to {}: {}", endpoint, e)))?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// TCP path to one remote node.
pub struct TcpConnection {
    remote_endpoint: Endpoint,
    service_port: u16,
    /// Stream dialed by `make_connection`, used by the next channel.
    pending: Mutex<Option<TcpStream>>,
    channels: Arc<ChannelSet>,
}

#[async_trait]
impl Connection for TcpConnection {
    fn remote_endpoint(&self) -> Endpoint {
        self.remote_endpoint.clone()
    }

    fn via_endpoint(&self) -> Option<Endpoint> {
        None
    }

    async fn connect_mesh_network(&self, channel_id: &ChannelId) -> Result<BoxedStream, MeshError> {
        let pending = self.pending.lock().take();
        let mut stream = match pending {
            Some(stream) => stream,
            None => dial(&self.remote_endpoint).await?,
        };

        let mut preamble = Vec::with_capacity(PREAMBLE_LEN);
        preamble.extend_from_slice(PREAMBLE_MAGIC);
        preamble.extend_from_slice(channel_id.as_bytes());
        preamble.extend_from_slice(&self.service_port.to_le_bytes());
        stream.write_all(&preamble).await?;
        stream.flush().await?;

        Ok(Box::new(TrackedStream::new(stream, self.channels.clone(), *channel_id)))
    }

    fn channel_exists(&self, channel_id: &ChannelId) -> bool {
        self.channels.contains(channel_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct Collect {
        tx: mpsc::UnboundedSender<(ChannelId, Endpoint, Vec<u8>)>,
    }

    #[async_trait]
    impl InboundHandler for Collect {
        async fn accept(&self, mut stream: BoxedStream, channel_id: ChannelId, connection: Arc<dyn Connection>) {
            let mut buf = [0u8; 4];
            if stream.read_exact(&mut buf).await.is_ok() {
                let _ = self.tx.send((channel_id, connection.remote_endpoint(), buf.to_vec()));
            }
        }
    }

    #[tokio::test]
    async fn test_channel_preamble() {
        let server = TcpConnectionManager::bind("127.0.0.1:0").await.unwrap();
        let client = TcpConnectionManager::bind("127.0.0.1:0").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn InboundHandler> = Arc::new(Collect { tx });
        server.attach(Arc::downgrade(&handler));

        let target = server.local_endpoint().unwrap();
        let conn = client.make_connection(&target).await.unwrap();
        let channel = ChannelId([9; 32]);
        let mut stream = conn.connect_mesh_network(&channel).await.unwrap();
        stream.write_all(b"ping").await.unwrap();

        let (id, from, data) = rx.recv().await.unwrap();
        assert_eq!(id, channel);
        assert_eq!(data, b"ping");
        assert_eq!(from, Endpoint::Ip(client.local_addr()));
        assert!(conn.channel_exists(&channel));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = TcpConnectionManager::bind("127.0.0.1:0").await.unwrap();
        assert!(client.make_connection(&Endpoint::Ip(addr)).await.is_err());
    }

    #[tokio::test]
    async fn test_onion_not_dialable() {
        let client = TcpConnectionManager::bind("127.0.0.1:0").await.unwrap();
        let onion: Endpoint = "abc.onion:80".parse().unwrap();
        assert!(matches!(
            client.make_connection(&onion).await,
            Err(MeshError::TransportError(_))
        ));
    }
}
