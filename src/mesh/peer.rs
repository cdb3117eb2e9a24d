//! Participants of a network.
//!
//! A [`Peer`] is one user id within one network. It owns the sessions to that
//! user and the user's profile, and is online while at least one session is
//! open. The self peer stands for the local user; its profile is the node's
//! profile and it is online while the network is.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crypto::UserId;
use crate::mesh::channel::SecureChannel;
use crate::mesh::endpoint::Endpoint;
use crate::mesh::error::MeshError;
use crate::mesh::event::MeshEvent;
use crate::mesh::network::MeshNetwork;
use crate::mesh::packet::MeshNetworkPacket;
use crate::mesh::peer_info::MeshNetworkPeerInfo;
use crate::mesh::session::Session;
use crate::mesh::store::{MessageItem, MessageType};
use crate::mesh::transfer::{self, FileTransfer};
use crate::mesh::transport::Connection;
use crate::mesh::types::{NetworkType, PeerConnectivityStatus, ProfileStatus};
use crate::mesh::MeshContext;

/// Profile a user publishes to every network. Dates default to the Unix
/// epoch so any real update wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProfile {
    pub display_name: String,
    pub status: ProfileStatus,
    pub status_message: String,
    pub date_modified: DateTime<Utc>,
    pub display_image: Vec<u8>,
    pub display_image_date_modified: DateTime<Utc>,
}

impl PeerProfile {
    /// Applies a profile update if it is strictly newer.
    pub(crate) fn apply(
        &mut self,
        display_name: String,
        status: ProfileStatus,
        status_message: String,
        date_modified: DateTime<Utc>,
    ) -> bool {
        if date_modified <= self.date_modified {
            return false;
        }
        self.display_name = display_name;
        self.status = status;
        self.status_message = status_message;
        self.date_modified = date_modified;
        true
    }

    /// Applies a display image if it is strictly newer.
    pub(crate) fn apply_display_image(&mut self, image: Vec<u8>, date_modified: DateTime<Utc>) -> bool {
        if date_modified <= self.display_image_date_modified {
            return false;
        }
        self.display_image = image;
        self.display_image_date_modified = date_modified;
        true
    }

    pub(crate) fn profile_packet(&self) -> MeshNetworkPacket {
        MeshNetworkPacket::Profile {
            display_name: self.display_name.clone(),
            status: self.status,
            status_message: self.status_message.clone(),
            date_modified: self.date_modified,
        }
    }

    pub(crate) fn display_image_packet(&self) -> MeshNetworkPacket {
        MeshNetworkPacket::ProfileDisplayImage {
            image: self.display_image.clone(),
            date_modified: self.display_image_date_modified,
        }
    }
}

/// Persisted form of a known peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownPeer {
    pub user_id: UserId,
    pub profile: PeerProfile,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Default)]
struct PeerState {
    profile: PeerProfile,
    connectivity: PeerConnectivityStatus,
    connected: Vec<MeshNetworkPeerInfo>,
    disconnected: Vec<MeshNetworkPeerInfo>,
    last_known_endpoints: Vec<Endpoint>,
}

/// One user within a network.
pub struct Peer {
    ctx: Arc<MeshContext>,
    network: Weak<MeshNetwork>,
    user_id: UserId,
    is_self: bool,
    state: RwLock<PeerState>,
    sessions: RwLock<Vec<Arc<Session>>>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("user_id", &self.user_id)
            .field("is_self", &self.is_self)
            .field("sessions", &self.sessions.read().len())
            .finish()
    }
}

impl Peer {
    pub(crate) fn new(ctx: Arc<MeshContext>, network: Weak<MeshNetwork>, user_id: UserId) -> Arc<Self> {
        let is_self = user_id == ctx.user_id();
        Arc::new(Self {
            ctx,
            network,
            user_id,
            is_self,
            state: RwLock::new(PeerState::default()),
            sessions: RwLock::new(Vec::new()),
        })
    }

    pub(crate) fn restore(ctx: Arc<MeshContext>, network: Weak<MeshNetwork>, known: KnownPeer) -> Arc<Self> {
        let peer = Self::new(ctx, network, known.user_id);
        {
            let mut state = peer.state.write();
            state.profile = known.profile;
            state.last_known_endpoints = known.endpoints;
        }
        peer
    }

    pub(crate) fn known_peer(&self) -> KnownPeer {
        let state = self.state.read();
        KnownPeer {
            user_id: self.user_id,
            profile: state.profile.clone(),
            endpoints: state.last_known_endpoints.clone(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn is_self(&self) -> bool {
        self.is_self
    }

    fn network(&self) -> Result<Arc<MeshNetwork>, MeshError> {
        self.network.upgrade().ok_or(MeshError::NetworkOffline)
    }

    /// Online while a session is open; the self peer follows the network.
    pub fn is_online(&self) -> bool {
        if self.is_self {
            return self.network.upgrade().map(|n| n.is_online()).unwrap_or(false);
        }
        !self.sessions.read().is_empty()
    }

    pub fn profile(&self) -> PeerProfile {
        if self.is_self {
            return self.ctx.profile();
        }
        self.state.read().profile.clone()
    }

    pub fn display_name(&self) -> String {
        self.profile().display_name
    }

    /// Display name, or the short user id when none was published.
    pub fn name_or_id(&self) -> String {
        let name = self.display_name();
        if name.is_empty() {
            self.user_id.short()
        } else {
            name
        }
    }

    pub fn connectivity_status(&self) -> PeerConnectivityStatus {
        self.state.read().connectivity
    }

    /// Connected list recorded by the last connectivity update.
    pub fn connected_peers(&self) -> Vec<MeshNetworkPeerInfo> {
        self.state.read().connected.clone()
    }

    /// Peers the rest of the network sees but this peer does not.
    pub fn disconnected_peers(&self) -> Vec<MeshNetworkPeerInfo> {
        self.state.read().disconnected.clone()
    }

    pub fn last_known_endpoints(&self) -> Vec<Endpoint> {
        self.state.read().last_known_endpoints.clone()
    }

    /// Records an endpoint the peer was last reached at.
    pub(crate) fn remember_endpoint(&self, endpoint: Endpoint) {
        let mut state = self.state.write();
        state.last_known_endpoints.retain(|e| *e != endpoint);
        state.last_known_endpoints.insert(0, endpoint);
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().clone()
    }

    pub(crate) fn has_session_to(&self, endpoint: &Endpoint) -> bool {
        self.sessions.read().iter().any(|s| s.remote_endpoint() == endpoint)
    }

    /// Entry describing this peer in peer exchange.
    pub fn info(&self) -> MeshNetworkPeerInfo {
        let endpoints: Vec<Endpoint> = self
            .sessions
            .read()
            .iter()
            .map(|s| s.remote_endpoint().clone())
            .collect();
        let name = self.display_name();
        MeshNetworkPeerInfo::new(self.user_id, (!name.is_empty()).then_some(name), endpoints)
    }

    /// The peers this peer is connected to right now.
    ///
    /// What the peer's sessions last reported through peer exchange. The self
    /// peer also counts every online remote peer; its own sessions belong to
    /// other devices of the local user.
    pub(crate) fn current_connected_list(&self, network: &MeshNetwork) -> Vec<MeshNetworkPeerInfo> {
        let mut lists: Vec<Vec<MeshNetworkPeerInfo>> = Vec::new();
        if self.is_self {
            lists.push(
                network
                    .peers()
                    .into_iter()
                    .filter(|p| !p.is_self && p.is_online())
                    .map(|p| p.info())
                    .collect(),
            );
        }
        lists.extend(self.sessions.read().iter().map(|s| s.peer_exchange_list()));
        crate::mesh::connectivity::union_of(lists.iter().map(Vec::as_slice))
    }

    /// Records the outcome of a connectivity update. Returns true when the
    /// status changed.
    pub(crate) fn set_connectivity(
        &self,
        status: PeerConnectivityStatus,
        connected: Vec<MeshNetworkPeerInfo>,
        disconnected: Vec<MeshNetworkPeerInfo>,
    ) -> bool {
        let mut state = self.state.write();
        state.connected = connected;
        state.disconnected = disconnected;
        let changed = state.connectivity != status;
        state.connectivity = status;
        changed
    }

    /// Registers a negotiated channel as a new session and brings the peer up
    /// to date.
    pub(crate) async fn add_session(
        self: &Arc<Self>,
        channel: SecureChannel,
        connection: Arc<dyn Connection>,
        is_client: bool,
    ) -> Result<Arc<Session>, MeshError> {
        let network = self.network()?;
        let (session, reader) = Session::new(self, &network, channel, connection, is_client);

        let first = {
            let mut sessions = self.sessions.write();
            sessions.push(session.clone());
            sessions.len() == 1
        };
        self.remember_endpoint(session.remote_endpoint().clone());
        session.spawn_read_loop(reader);

        debug!(
            network = %network.network_id().short(),
            peer = %self.user_id.short(),
            endpoint = %session.remote_endpoint(),
            cipher = ?session.cipher(),
            "session added"
        );

        if first && !self.is_self {
            network.emit(MeshEvent::PeerStateChanged {
                network_id: network.network_id(),
                peer_user_id: self.user_id,
                online: true,
            });
            network.append_info(format!("{} is online", self.name_or_id()));
        }

        if let Err(e) = self.push_local_state(&session, &network).await {
            debug!(peer = %self.user_id.short(), error = %e, "failed to push local state");
        }

        network.update_connectivity_status();
        network.broadcast_peer_exchange().await;

        if network.network_type() == NetworkType::Private && !self.is_self {
            self.replay_undelivered(&session, &network).await;
        }
        Ok(session)
    }

    async fn push_local_state(&self, session: &Session, network: &MeshNetwork) -> Result<(), MeshError> {
        let profile = self.ctx.profile();
        session.send_packet(&profile.profile_packet()).await?;
        session.send_packet(&profile.display_image_packet()).await?;
        for packet in network.settings_packets() {
            session.send_packet(&packet).await?;
        }
        Ok(())
    }

    /// Resends the trailing run of undelivered local text messages, oldest
    /// first. Info lines in between are skipped.
    async fn replay_undelivered(&self, session: &Session, network: &MeshNetwork) {
        let store = network.store();
        let local = network.local_user_id();

        let mut pending = Vec::new();
        for number in (0..store.count()).rev() {
            let item = match MessageItem::read_from(store.as_ref(), number) {
                Ok(item) => item,
                Err(e) => {
                    warn!(message_number = number, error = %e, "unreadable message during replay");
                    break;
                }
            };
            if item.message_type == MessageType::Info {
                continue;
            }
            if item.message_type != MessageType::TextMessage || !item.is_sent_by(&local) || item.is_delivered() {
                break;
            }
            pending.push(item);
        }

        for item in pending.iter().rev() {
            debug!(message_number = item.message_number, "replaying undelivered message");
            if let Err(e) = session.send_packet(&MeshNetworkPacket::Message(item.into())).await {
                debug!(error = %e, "replay interrupted");
                return;
            }
        }
    }

    /// Forgets a finished session.
    pub(crate) fn remove_session(&self, session_id: u64) {
        let went_offline = {
            let mut sessions = self.sessions.write();
            let before = sessions.len();
            sessions.retain(|s| s.id() != session_id);
            before != sessions.len() && sessions.is_empty()
        };

        let Some(network) = self.network.upgrade() else {
            return;
        };
        if went_offline && !self.is_self {
            network.emit(MeshEvent::PeerStateChanged {
                network_id: network.network_id(),
                peer_user_id: self.user_id,
                online: false,
            });
            network.append_info(format!("{} is offline", self.name_or_id()));
        }
        network.update_connectivity_status();
        tokio::spawn(async move { network.broadcast_peer_exchange().await });
    }

    /// Sends a packet on the first session that accepts it.
    pub async fn send_packet(&self, packet: &MeshNetworkPacket) {
        for session in self.sessions() {
            match session.send_packet(packet).await {
                Ok(()) => return,
                Err(e) => debug!(peer = %self.user_id.short(), session = session.id(), error = %e, "send failed"),
            }
        }
    }

    /// Sends a packet on every session, e.g. keepalive pings.
    pub(crate) async fn send_packet_all(&self, packet: &MeshNetworkPacket) {
        for session in self.sessions() {
            if let Err(e) = session.send_packet(packet).await {
                debug!(peer = %self.user_id.short(), session = session.id(), error = %e, "send failed");
            }
        }
    }

    pub async fn disconnect_all(&self) {
        for session in self.sessions() {
            session.disconnect().await;
        }
    }

    /// Applies a profile received from the peer.
    pub(crate) fn receive_profile(
        &self,
        display_name: String,
        status: ProfileStatus,
        status_message: String,
        date_modified: DateTime<Utc>,
    ) {
        let (accepted, old_name) = if self.is_self {
            // another device of the local user
            let old_name = self.ctx.profile().display_name;
            let accepted = self.ctx.apply_profile(display_name, status, status_message, date_modified);
            (accepted, old_name)
        } else {
            let mut state = self.state.write();
            let old_name = state.profile.display_name.clone();
            let accepted = state.profile.apply(display_name, status, status_message, date_modified);
            (accepted, old_name)
        };
        if !accepted {
            return;
        }
        let Some(network) = self.network.upgrade() else {
            return;
        };
        network.emit(MeshEvent::PeerProfileChanged {
            network_id: network.network_id(),
            peer_user_id: self.user_id,
        });
        let name = self.name_or_id();
        if !old_name.is_empty() && old_name != name {
            network.append_info(format!("{} changed their name to {}", old_name, name));
        } else {
            network.append_info(format!("{} updated their profile", name));
        }
    }

    pub(crate) fn receive_display_image(&self, image: Vec<u8>, date_modified: DateTime<Utc>) {
        let accepted = if self.is_self {
            self.ctx.apply_display_image(image, date_modified)
        } else {
            self.state.write().profile.apply_display_image(image, date_modified)
        };
        if !accepted {
            return;
        }
        if let Some(network) = self.network.upgrade() {
            network.emit(MeshEvent::PeerDisplayImageChanged {
                network_id: network.network_id(),
                peer_user_id: self.user_id,
            });
        }
    }

    /// Downloads the attachment of received message `message_number` into
    /// `path`, resuming at the file's current length.
    pub async fn receive_file_attachment(
        self: &Arc<Self>,
        message_number: u32,
        path: PathBuf,
    ) -> Result<FileTransfer, MeshError> {
        let network = self.network()?;
        let item = MessageItem::read_from(network.store().as_ref(), message_number)?;
        if !item.is_sent_by(&self.user_id) || item.message_type != MessageType::FileAttachment {
            return Err(MeshError::InvalidOperation(format!(
                "message {} is not a file from {}",
                message_number,
                self.user_id.short()
            )));
        }
        let remote_number = item
            .remote_message_number
            .ok_or(MeshError::MessageNotFound(message_number))?;
        let session = self
            .sessions()
            .into_iter()
            .next()
            .ok_or(MeshError::PeerNotFound(self.user_id))?;

        transfer::download(network, session, item.message_number, remote_number, path).await
    }
}
