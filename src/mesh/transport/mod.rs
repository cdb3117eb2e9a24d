//! Connection transports and peer discovery.
//!
//! The mesh core only talks to these traits:
//! - [`ConnectionManager`] opens direct or relayed [`Connection`]s to endpoints
//!   and hands inbound mesh channels to an [`InboundHandler`]
//! - [`Connection::connect_mesh_network`] opens one raw byte stream for a
//!   channel id on that connection
//! - [`PeerDiscovery`] announces networks and finds peers (DHT, LAN, bootstrap)
//! - [`TcpRelayClient`] registers networks hosted through a TCP relay
//!
//! Implementations: [`TcpConnectionManager`], [`MemoryHub`], [`MemoryDht`],
//! [`StaticDiscovery`].

mod discovery;
mod memory;
mod tcp;

pub use discovery::{DiscoveryCallback, MemoryDht, PeerDiscovery, StaticDiscovery};
pub use memory::{MemoryConnection, MemoryConnectionManager, MemoryHub};
pub use tcp::{TcpConnection, TcpConnectionManager};

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::crypto::{ChannelId, NetworkId};
use crate::mesh::endpoint::Endpoint;
use crate::mesh::error::MeshError;

/// Byte stream usable by the mesh.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Owned, type-erased byte stream.
pub type BoxedStream = Box<dyn AsyncStream>;

/// A direct or relayed path to a remote node.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Service endpoint of the remote node.
    fn remote_endpoint(&self) -> Endpoint;

    /// Relay endpoint for virtual connections.
    fn via_endpoint(&self) -> Option<Endpoint>;

    /// Opens a raw stream for `channel_id` on this connection.
    async fn connect_mesh_network(&self, channel_id: &ChannelId) -> Result<BoxedStream, MeshError>;

    /// True while a stream for `channel_id` is open on this connection.
    fn channel_exists(&self, channel_id: &ChannelId) -> bool;
}

/// Receives mesh channels opened by remote nodes.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn accept(&self, stream: BoxedStream, channel_id: ChannelId, connection: Arc<dyn Connection>);
}

/// Connection factory.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Opens (or reuses) a direct connection.
    async fn make_connection(&self, endpoint: &Endpoint) -> Result<Arc<dyn Connection>, MeshError>;

    /// Opens a connection to `endpoint` relayed through `via`.
    async fn make_virtual_connection(
        &self,
        via: &Arc<dyn Connection>,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn Connection>, MeshError>;

    /// Endpoint remote nodes reach this node at.
    fn local_endpoint(&self) -> Option<Endpoint>;

    /// Registers the handler for inbound channels.
    fn attach(&self, handler: Weak<dyn InboundHandler>);
}

/// TCP relay registration for networks behind NAT.
pub trait TcpRelayClient: Send + Sync {
    fn register_hosted_network(&self, network_id: &NetworkId);
    fn unregister_hosted_network(&self, network_id: &NetworkId);
}

/// Open channel ids of one connection, reference counted.
#[derive(Debug, Default)]
pub struct ChannelSet {
    open: Mutex<HashMap<ChannelId, usize>>,
}

impl ChannelSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn contains(&self, channel_id: &ChannelId) -> bool {
        self.open.lock().contains_key(channel_id)
    }

    fn add(&self, channel_id: ChannelId) {
        *self.open.lock().entry(channel_id).or_insert(0) += 1;
    }

    fn remove(&self, channel_id: &ChannelId) {
        let mut open = self.open.lock();
        if let Some(count) = open.get_mut(channel_id) {
            *count -= 1;
            if *count == 0 {
                open.remove(channel_id);
            }
        }
    }
}

/// Stream that keeps its channel id registered on the owning connection
/// until dropped.
pub struct TrackedStream<S> {
    inner: S,
    channels: Arc<ChannelSet>,
    channel_id: ChannelId,
}

impl<S> TrackedStream<S> {
    pub fn new(inner: S, channels: Arc<ChannelSet>, channel_id: ChannelId) -> Self {
        channels.add(channel_id);
        Self {
            inner,
            channels,
            channel_id,
        }
    }
}

impl<S> Drop for TrackedStream<S> {
    fn drop(&mut self) {
        self.channels.remove(&self.channel_id);
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Helper to write a length-prefixed message asynchronously.
pub async fn write_length_prefixed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> io::Result<()> {
    let len = data.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Helper to read a length-prefixed message asynchronously.
pub async fn read_length_prefixed<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", len),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(data)
}
