//! The local node: identity, profile and every network.
//!
//! The node is the inbound handler of the connection manager. Channels opened
//! on a network id go to that network; channels opened on the masked local
//! user id carry private chat invitations.

use std::path::Path;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crypto::{masked_user_id, ChannelId, NetworkId, UserId};
use crate::mesh::error::MeshError;
use crate::mesh::event::MeshEvent;
use crate::mesh::network::MeshNetwork;
use crate::mesh::peer::PeerProfile;
use crate::mesh::state::{NetworkState, NodeState, NODE_STATE_VERSION};
use crate::mesh::transport::{BoxedStream, Connection, DiscoveryCallback, InboundHandler};
use crate::mesh::types::ProfileStatus;
use crate::mesh::MeshContext;

/// Owner of all networks of the local user.
pub struct MeshNode {
    ctx: Arc<MeshContext>,
    networks: RwLock<Vec<Arc<MeshNetwork>>>,
    invitation_timer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("user_id", &self.ctx.user_id())
            .field("networks", &self.networks.read().len())
            .finish()
    }
}

impl MeshNode {
    /// Creates the node and attaches it to the connection manager. When
    /// invitations are allowed the masked user id is announced periodically.
    pub fn new(ctx: Arc<MeshContext>) -> Arc<Self> {
        let node = Arc::new(Self {
            ctx,
            networks: RwLock::new(Vec::new()),
            invitation_timer: Mutex::new(None),
        });

        let handler: Weak<dyn InboundHandler> = Arc::downgrade(&node) as Weak<dyn InboundHandler>;
        node.ctx.connections().attach(handler);

        if node.ctx.config().allow_invitations {
            node.start_invitation_announcer();
        }
        info!(user = %node.ctx.user_id().short(), "mesh node started");
        node
    }

    fn start_invitation_announcer(&self) {
        let Some(discovery) = self.ctx.discovery().cloned() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime, invitations will not be announced");
            return;
        };

        let masked = masked_user_id(&self.ctx.user_id());
        let local_endpoint = self.ctx.connections().local_endpoint();
        let config = self.ctx.config();
        let (initial_delay, period) = (config.announce_initial_delay(), config.announce_interval());
        let callback: DiscoveryCallback = Arc::new(|_, _| {});

        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + initial_delay, period);
            loop {
                interval.tick().await;
                discovery.begin_announce(&masked, false, local_endpoint.clone(), callback.clone());
            }
        });
        *self.invitation_timer.lock() = Some(handle);
    }

    pub fn context(&self) -> &Arc<MeshContext> {
        &self.ctx
    }

    pub fn user_id(&self) -> UserId {
        self.ctx.user_id()
    }

    /// Rendezvous id other users open invitation channels on.
    pub fn masked_user_id(&self) -> ChannelId {
        masked_user_id(&self.ctx.user_id())
    }

    pub fn profile(&self) -> PeerProfile {
        self.ctx.profile()
    }

    pub fn networks(&self) -> Vec<Arc<MeshNetwork>> {
        self.networks.read().clone()
    }

    pub fn get_network(&self, network_id: &NetworkId) -> Option<Arc<MeshNetwork>> {
        self.networks
            .read()
            .iter()
            .find(|n| n.network_id() == *network_id)
            .cloned()
    }

    fn add_network(&self, network: Arc<MeshNetwork>) -> Result<Arc<MeshNetwork>, MeshError> {
        let network_id = network.network_id();
        let mut networks = self.networks.write();
        if networks.iter().any(|n| n.network_id() == network_id) {
            return Err(MeshError::InvalidOperation(format!(
                "network {} already exists",
                network_id.short()
            )));
        }
        networks.push(network.clone());
        Ok(network)
    }

    /// Creates a private chat and takes it online. With `invitation`, the
    /// text is delivered to the other user as an invitation first.
    pub fn create_private_network(
        &self,
        peer_user_id: UserId,
        peer_display_name: Option<String>,
        shared_secret: &str,
        invitation: Option<&str>,
    ) -> Result<Arc<MeshNetwork>, MeshError> {
        let network = MeshNetwork::create_private(
            self.ctx.clone(),
            peer_user_id,
            peer_display_name,
            shared_secret,
            invitation,
        )?;
        let network = self.add_network(network)?;
        network.go_online();
        Ok(network)
    }

    /// Creates (or joins) a group chat and takes it online.
    pub fn create_group_network(
        &self,
        name: &str,
        shared_secret: &str,
        local_network_only: bool,
    ) -> Result<Arc<MeshNetwork>, MeshError> {
        let network = MeshNetwork::create_group(self.ctx.clone(), name, shared_secret, local_network_only)?;
        let network = self.add_network(network)?;
        network.go_online();
        Ok(network)
    }

    /// Removes a network and its stored messages.
    pub async fn delete_network(&self, network_id: &NetworkId) -> Result<(), MeshError> {
        let network = {
            let mut networks = self.networks.write();
            let index = networks
                .iter()
                .position(|n| n.network_id() == *network_id)
                .ok_or_else(|| MeshError::InvalidOperation(format!("unknown network {}", network_id.short())))?;
            networks.remove(index)
        };
        network.delete_network().await
    }

    /// Updates the local profile and pushes it to every network.
    pub async fn set_profile(&self, display_name: &str, status: ProfileStatus, status_message: &str) {
        self.ctx
            .update_profile(display_name.to_string(), status, status_message.to_string());
        for network in self.networks() {
            network.profile_trigger_update(false).await;
        }
    }

    pub async fn set_profile_display_image(&self, image: Vec<u8>) {
        let profile = self.ctx.update_display_image(image);
        let packet = profile.display_image_packet();
        for network in self.networks() {
            for peer in network.peers() {
                peer.send_packet(&packet).await;
            }
        }
    }

    /// Events of every network.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.ctx.subscribe()
    }

    /// Persisted form of the node.
    pub fn state(&self) -> NodeState {
        NodeState {
            version: NODE_STATE_VERSION,
            identity_secret: self.ctx.identity().secret_bytes(),
            profile: self.ctx.profile(),
            networks: self.networks().iter().map(|n| n.state()).collect(),
        }
    }

    /// Encrypts the node state with `passphrase` and writes it to `path`.
    pub fn save(&self, path: &Path, passphrase: &str) -> Result<(), MeshError> {
        self.state().save(path, passphrase)
    }

    /// Loads saved networks. Networks that were online go online again.
    pub fn restore_networks(&self, states: Vec<NetworkState>) -> Result<(), MeshError> {
        for state in states {
            let network = MeshNetwork::load(self.ctx.clone(), state)?;
            if let Err(e) = self.add_network(network.clone()) {
                warn!(network = %network.network_id().short(), error = %e, "skipping duplicate network");
            }
        }
        Ok(())
    }

    /// Takes every network offline and stops announcing invitations.
    pub async fn shutdown(&self) {
        if let Some(timer) = self.invitation_timer.lock().take() {
            timer.abort();
        }
        for network in self.networks() {
            network.go_offline().await;
        }
    }

    async fn route_inbound(
        &self,
        stream: BoxedStream,
        channel_id: ChannelId,
        connection: Arc<dyn Connection>,
    ) -> Result<(), MeshError> {
        let network = self
            .networks
            .read()
            .iter()
            .find(|n| ChannelId::from(n.network_id()) == channel_id)
            .cloned();
        if let Some(network) = network {
            network.accept_connection(stream, connection).await?;
            return Ok(());
        }

        if channel_id == self.masked_user_id() {
            if !self.ctx.config().allow_invitations {
                return Err(MeshError::InvalidOperation("invitations are disabled".into()));
            }
            let network =
                MeshNetwork::accept_private_network_invitation(self.ctx.clone(), stream, connection).await?;
            self.adopt_invitation(network);
            return Ok(());
        }

        Err(MeshError::InvalidOperation(format!(
            "no network for channel {}",
            channel_id.short()
        )))
    }

    fn adopt_invitation(&self, network: Arc<MeshNetwork>) {
        let network_id = network.network_id();
        let peer_user_id = network.other_peer().map(|p| p.user_id()).unwrap_or_default();

        if self.add_network(network.clone()).is_err() {
            debug!(network = %network_id.short(), "invitation for an existing network dropped");
            if let Err(e) = network.store().delete() {
                warn!(error = %e, "failed to delete duplicate invitation store");
            }
            return;
        }
        self.ctx.emit(MeshEvent::InvitationReceived {
            network_id,
            peer_user_id,
        });
    }
}

#[async_trait]
impl InboundHandler for MeshNode {
    async fn accept(&self, stream: BoxedStream, channel_id: ChannelId, connection: Arc<dyn Connection>) {
        let endpoint = connection.remote_endpoint();
        if let Err(e) = self.route_inbound(stream, channel_id, connection).await {
            debug!(endpoint = %endpoint, channel = %channel_id.short(), error = %e, "inbound channel rejected");
        }
    }
}

impl Drop for MeshNode {
    fn drop(&mut self) {
        if let Some(timer) = self.invitation_timer.get_mut().take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::UserIdentity;
    use crate::mesh::config::MeshConfig;
    use crate::mesh::transport::MemoryHub;

    fn node(hub: &MemoryHub, addr: &str) -> Arc<MeshNode> {
        let ctx = MeshContext::builder(UserIdentity::generate(), MeshConfig::default())
            .connections(Arc::new(hub.manager(addr.parse().unwrap())))
            .build()
            .unwrap();
        MeshNode::new(ctx)
    }

    #[tokio::test]
    async fn test_duplicate_group_rejected() {
        let hub = MemoryHub::new();
        let node = node(&hub, "10.0.0.1:9000");
        node.create_group_network("Friends", "pw", false).unwrap();
        assert!(matches!(
            node.create_group_network("friends", "pw", false),
            Err(MeshError::InvalidOperation(_))
        ));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_network_removes_it() {
        let hub = MemoryHub::new();
        let node = node(&hub, "10.0.0.1:9000");
        let network = node.create_group_network("Friends", "pw", false).unwrap();
        let id = network.network_id();

        node.delete_network(&id).await.unwrap();
        assert!(node.get_network(&id).is_none());
        assert!(node.delete_network(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_state_restores_networks() {
        let hub = MemoryHub::new();
        let first = node(&hub, "10.0.0.1:9000");
        first.set_profile("alice", ProfileStatus::Active, "hi").await;
        first.create_group_network("Friends", "pw", false).unwrap();
        let state = first.state();
        first.shutdown().await;

        let ctx = MeshContext::builder(
            UserIdentity::from_secret_bytes(&state.identity_secret),
            MeshConfig::default(),
        )
        .connections(Arc::new(hub.manager("10.0.0.2:9000".parse().unwrap())))
        .profile(state.profile.clone())
        .build()
        .unwrap();
        let second = MeshNode::new(ctx);
        second.restore_networks(state.networks.clone()).unwrap();

        assert_eq!(second.user_id(), first.user_id());
        assert_eq!(second.profile().display_name, "alice");
        assert_eq!(second.networks().len(), 1);
        second.shutdown().await;
    }
}
