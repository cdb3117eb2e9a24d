//! In-memory transport.
//!
//! A [`MemoryHub`] routes mesh channels between [`MemoryConnectionManager`]s
//! over `tokio::io::duplex` pipes. Endpoints or single links can be marked
//! unreachable to force the relayed (virtual connection) path, and relaying
//! can be switched off.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{BoxedStream, ChannelSet, Connection, ConnectionManager, InboundHandler, TrackedStream};
use crate::crypto::ChannelId;
use crate::mesh::endpoint::Endpoint;
use crate::mesh::error::MeshError;

const DUPLEX_BUF_SIZE: usize = 64 * 1024;

#[derive(Default)]
struct HubInner {
    nodes: Mutex<HashMap<Endpoint, Weak<ManagerInner>>>,
    unreachable: Mutex<HashSet<Endpoint>>,
    blocked_links: Mutex<HashSet<(Endpoint, Endpoint)>>,
    relay_disabled: AtomicBool,
}

impl HubInner {
    fn node(&self, endpoint: &Endpoint) -> Option<Arc<ManagerInner>> {
        self.nodes.lock().get(endpoint).and_then(Weak::upgrade)
    }

    fn is_link_blocked(&self, a: &Endpoint, b: &Endpoint) -> bool {
        let links = self.blocked_links.lock();
        links.contains(&(a.clone(), b.clone())) || links.contains(&(b.clone(), a.clone()))
    }

    fn is_direct_reachable(&self, from: &Endpoint, to: &Endpoint) -> bool {
        !self.unreachable.lock().contains(to) && self.node(to).is_some() && !self.is_link_blocked(from, to)
    }
}

/// Shared broker for in-memory nodes.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a connection manager reachable at `addr`.
    pub fn manager(&self, addr: SocketAddr) -> MemoryConnectionManager {
        let endpoint = Endpoint::Ip(addr);
        let inner = Arc::new(ManagerInner {
            endpoint: endpoint.clone(),
            hub: self.inner.clone(),
            handler: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
        });
        self.inner
            .nodes
            .lock()
            .insert(endpoint, Arc::downgrade(&inner));
        MemoryConnectionManager { inner }
    }

    /// Makes direct connections to `endpoint` fail. Relayed connections still
    /// reach it.
    pub fn set_unreachable(&self, endpoint: &Endpoint, unreachable: bool) {
        let mut set = self.inner.unreachable.lock();
        if unreachable {
            set.insert(endpoint.clone());
        } else {
            set.remove(endpoint);
        }
    }

    /// Makes direct connections between `a` and `b` fail in both directions.
    pub fn set_link_blocked(&self, a: &Endpoint, b: &Endpoint, blocked: bool) {
        let mut links = self.inner.blocked_links.lock();
        if blocked {
            links.insert((a.clone(), b.clone()));
        } else {
            links.remove(&(a.clone(), b.clone()));
            links.remove(&(b.clone(), a.clone()));
        }
    }

    /// Enables or disables virtual (relayed) connections. Enabled by default.
    pub fn set_relay_enabled(&self, enabled: bool) {
        self.inner.relay_disabled.store(!enabled, Ordering::SeqCst);
    }
}

struct ManagerInner {
    endpoint: Endpoint,
    hub: Arc<HubInner>,
    handler: Mutex<Option<Weak<dyn InboundHandler>>>,
    connections: Mutex<HashMap<Endpoint, Arc<MemoryConnection>>>,
}

impl ManagerInner {
    fn connection_to(self: &Arc<Self>, remote: &Endpoint) -> Arc<MemoryConnection> {
        self.connections
            .lock()
            .entry(remote.clone())
            .or_insert_with(|| {
                Arc::new(MemoryConnection {
                    local: Arc::downgrade(self),
                    remote_endpoint: remote.clone(),
                    via_endpoint: None,
                    channels: ChannelSet::new(),
                })
            })
            .clone()
    }
}

/// Connection manager of one in-memory node.
pub struct MemoryConnectionManager {
    inner: Arc<ManagerInner>,
}

impl Drop for MemoryConnectionManager {
    fn drop(&mut self) {
        self.inner.hub.nodes.lock().remove(&self.inner.endpoint);
    }
}

#[async_trait]
impl ConnectionManager for MemoryConnectionManager {
    async fn make_connection(&self, endpoint: &Endpoint) -> Result<Arc<dyn Connection>, MeshError> {
        if !self.inner.hub.is_direct_reachable(&self.inner.endpoint, endpoint) {
            return Err(MeshError::TransportError(format!("{} is unreachable", endpoint)));
        }
        Ok(self.inner.connection_to(endpoint))
    }

    async fn make_virtual_connection(
        &self,
        via: &Arc<dyn Connection>,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn Connection>, MeshError> {
        let via_endpoint = via.remote_endpoint();
        let hub = &self.inner.hub;
        if hub.relay_disabled.load(Ordering::SeqCst)
            || hub.node(&via_endpoint).is_none()
            || hub.node(endpoint).is_none()
            || hub.is_link_blocked(&via_endpoint, endpoint)
        {
            return Err(MeshError::TransportError(format!(
                "no relay path to {} via {}",
                endpoint, via_endpoint
            )));
        }
        Ok(Arc::new(MemoryConnection {
            local: Arc::downgrade(&self.inner),
            remote_endpoint: endpoint.clone(),
            via_endpoint: Some(via_endpoint),
            channels: ChannelSet::new(),
        }))
    }

    fn local_endpoint(&self) -> Option<Endpoint> {
        Some(self.inner.endpoint.clone())
    }

    fn attach(&self, handler: Weak<dyn InboundHandler>) {
        *self.inner.handler.lock() = Some(handler);
    }
}

/// Path from one in-memory node to another.
pub struct MemoryConnection {
    local: Weak<ManagerInner>,
    remote_endpoint: Endpoint,
    via_endpoint: Option<Endpoint>,
    channels: Arc<ChannelSet>,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn remote_endpoint(&self) -> Endpoint {
        self.remote_endpoint.clone()
    }

    fn via_endpoint(&self) -> Option<Endpoint> {
        self.via_endpoint.clone()
    }

    async fn connect_mesh_network(&self, channel_id: &ChannelId) -> Result<BoxedStream, MeshError> {
        let local = self
            .local
            .upgrade()
            .ok_or_else(|| MeshError::TransportError("connection manager dropped".into()))?;
        let remote = local.hub.node(&self.remote_endpoint).ok_or_else(|| {
            MeshError::TransportError(format!("{} is unreachable", self.remote_endpoint))
        })?;
        let handler = remote
            .handler
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                MeshError::TransportError(format!("{} does not accept channels", self.remote_endpoint))
            })?;

        let (ours, theirs) = tokio::io::duplex(DUPLEX_BUF_SIZE);
        let remote_connection = remote.connection_to(&local.endpoint);
        let inbound: BoxedStream = Box::new(TrackedStream::new(
            theirs,
            remote_connection.channels.clone(),
            *channel_id,
        ));
        let outbound: BoxedStream = Box::new(TrackedStream::new(ours, self.channels.clone(), *channel_id));

        debug!(from = %local.endpoint, to = %self.remote_endpoint, channel = %channel_id.short(), "opening in-memory channel");
        let channel_id = *channel_id;
        tokio::spawn(async move {
            handler.accept(inbound, channel_id, remote_connection).await;
        });

        Ok(outbound)
    }

    fn channel_exists(&self, channel_id: &ChannelId) -> bool {
        self.channels.contains(channel_id)
    }
}
