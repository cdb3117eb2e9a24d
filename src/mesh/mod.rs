//! Mesh network session and connectivity engine.
//!
//! This module provides:
//! - [`MeshNode`]: owner of the local identity, profile and networks; routes
//!   inbound channels and accepts private chat invitations
//! - [`MeshNetwork`]: one private or group chat, its peers and message store
//! - [`Peer`] and [`Session`]: participants and their live channels
//! - [`DataStream`] and [`FileTransfer`]: sub-streams and file downloads
//! - [`MeshContext`]: the collaborators every network shares (identity,
//!   configuration, connection manager, discovery, relay, profile, events)

pub mod channel;
pub mod config;
pub mod connectivity;
pub mod data_stream;
pub mod endpoint;
pub mod error;
pub mod event;
mod frame;
pub mod network;
pub mod node;
pub mod packet;
pub mod peer;
pub mod peer_info;
pub mod session;
pub mod state;
pub mod store;
pub mod transfer;
pub mod transport;
pub mod types;

pub use channel::{CipherSuite, SecureChannel, SecureChannelError, SecureChannelErrorCode};
pub use config::MeshConfig;
pub use data_stream::DataStream;
pub use endpoint::{DhtNetworkType, Endpoint};
pub use error::MeshError;
pub use event::MeshEvent;
pub use network::{MeshNetwork, NegotiationPlan};
pub use node::MeshNode;
pub use packet::{MeshNetworkPacket, MessagePacket};
pub use peer::{KnownPeer, Peer, PeerProfile};
pub use peer_info::MeshNetworkPeerInfo;
pub use session::Session;
pub use state::{NetworkState, NodeState};
pub use transfer::{FileTransfer, FileTransferStatus, TransferProgress};
pub use types::{MeshNetworkStatus, NetworkType, PeerConnectivityStatus, ProfileStatus};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::crypto::{UserId, UserIdentity};
use channel::ChannelParams;
use transport::{ConnectionManager, PeerDiscovery, TcpRelayClient};

/// Capacity of event channels. Slow subscribers miss old events.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Collaborators shared by a node and all of its networks.
pub struct MeshContext {
    identity: UserIdentity,
    user_id: UserId,
    config: MeshConfig,
    connections: Arc<dyn ConnectionManager>,
    discovery: Option<Arc<dyn PeerDiscovery>>,
    relay: Option<Arc<dyn TcpRelayClient>>,
    profile: RwLock<PeerProfile>,
    events: broadcast::Sender<MeshEvent>,
}

impl std::fmt::Debug for MeshContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshContext")
            .field("user_id", &self.user_id)
            .field("config", &self.config)
            .field("discovery", &self.discovery.is_some())
            .field("relay", &self.relay.is_some())
            .finish_non_exhaustive()
    }
}

impl MeshContext {
    pub fn builder(identity: UserIdentity, config: MeshConfig) -> MeshContextBuilder {
        MeshContextBuilder {
            identity,
            config,
            connections: None,
            discovery: None,
            relay: None,
            profile: PeerProfile::default(),
        }
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn connections(&self) -> &Arc<dyn ConnectionManager> {
        &self.connections
    }

    pub fn discovery(&self) -> Option<&Arc<dyn PeerDiscovery>> {
        self.discovery.as_ref()
    }

    pub fn relay(&self) -> Option<&Arc<dyn TcpRelayClient>> {
        self.relay.as_ref()
    }

    /// The local user's profile.
    pub fn profile(&self) -> PeerProfile {
        self.profile.read().clone()
    }

    pub(crate) fn update_profile(
        &self,
        display_name: String,
        status: ProfileStatus,
        status_message: String,
    ) -> PeerProfile {
        let mut profile = self.profile.write();
        profile.display_name = display_name;
        profile.status = status;
        profile.status_message = status_message;
        profile.date_modified = Utc::now();
        profile.clone()
    }

    pub(crate) fn update_display_image(&self, image: Vec<u8>) -> PeerProfile {
        let mut profile = self.profile.write();
        profile.display_image = image;
        profile.display_image_date_modified = Utc::now();
        profile.clone()
    }

    /// Applies a profile published by another device of the local user if it
    /// is strictly newer. Compare and write happen under one lock.
    pub(crate) fn apply_profile(
        &self,
        display_name: String,
        status: ProfileStatus,
        status_message: String,
        date_modified: DateTime<Utc>,
    ) -> bool {
        self.profile
            .write()
            .apply(display_name, status, status_message, date_modified)
    }

    pub(crate) fn apply_display_image(&self, image: Vec<u8>, date_modified: DateTime<Utc>) -> bool {
        self.profile.write().apply_display_image(image, date_modified)
    }

    /// Events of every network of this context.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }

    /// Handshake parameters with the configured ciphers, timeouts and
    /// renegotiation limits.
    pub(crate) fn channel_params(&self, psk: Vec<u8>, trusted_user_ids: Option<Vec<UserId>>) -> ChannelParams {
        let mut params = ChannelParams::new(self.identity.clone(), psk).with_trusted(trusted_user_ids);
        params.renegotiate_after_bytes = self.config.renegotiate_after_bytes;
        params.renegotiate_after_secs = self.config.renegotiate_after_secs;
        params.supported_ciphers = self.config.supported_ciphers.clone();
        params.handshake_timeout = self.config.handshake_timeout();
        params
    }
}

/// Builder for [`MeshContext`].
pub struct MeshContextBuilder {
    identity: UserIdentity,
    config: MeshConfig,
    connections: Option<Arc<dyn ConnectionManager>>,
    discovery: Option<Arc<dyn PeerDiscovery>>,
    relay: Option<Arc<dyn TcpRelayClient>>,
    profile: PeerProfile,
}

impl MeshContextBuilder {
    pub fn connections(mut self, connections: Arc<dyn ConnectionManager>) -> Self {
        self.connections = Some(connections);
        self
    }

    pub fn discovery(mut self, discovery: Arc<dyn PeerDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn relay(mut self, relay: Arc<dyn TcpRelayClient>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn profile(mut self, profile: PeerProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Display name with a fresh modification date.
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.profile.display_name = name.into();
        self.profile.date_modified = Utc::now();
        self
    }

    /// Validates the configuration and builds the context.
    pub fn build(self) -> Result<Arc<MeshContext>, MeshError> {
        self.config.validate()?;
        let connections = self
            .connections
            .ok_or_else(|| MeshError::Config("a connection manager is required".into()))?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Arc::new(MeshContext {
            user_id: self.identity.user_id(),
            identity: self.identity,
            config: self.config,
            connections,
            discovery: self.discovery,
            relay: self.relay,
            profile: RwLock::new(self.profile),
            events,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::transport::MemoryHub;

    #[test]
    fn test_build_requires_connections() {
        let result = MeshContext::builder(UserIdentity::generate(), MeshConfig::default()).build();
        assert!(matches!(result, Err(MeshError::Config(_))));
    }

    #[test]
    fn test_profile_updates_are_dated() {
        let hub = MemoryHub::new();
        let ctx = MeshContext::builder(UserIdentity::generate(), MeshConfig::default())
            .connections(Arc::new(hub.manager("10.0.0.1:9000".parse().unwrap())))
            .build()
            .unwrap();

        let before = ctx.profile().date_modified;
        let profile = ctx.update_profile("alice".into(), ProfileStatus::Busy, "afk".into());
        assert!(profile.date_modified > before);
        assert_eq!(ctx.profile().display_name, "alice");
    }

    #[test]
    fn test_channel_params_follow_config() {
        let hub = MemoryHub::new();
        let config = MeshConfig {
            supported_ciphers: vec![CipherSuite::XChaCha20Poly1305],
            handshake_timeout_secs: 3,
            ..MeshConfig::default()
        };
        let ctx = MeshContext::builder(UserIdentity::generate(), config)
            .connections(Arc::new(hub.manager("10.0.0.1:9000".parse().unwrap())))
            .build()
            .unwrap();

        let params = ctx.channel_params(vec![1; 32], None);
        assert_eq!(params.supported_ciphers, vec![CipherSuite::XChaCha20Poly1305]);
        assert_eq!(params.handshake_timeout, std::time::Duration::from_secs(3));
    }
}
