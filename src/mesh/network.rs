//! One private or group chat.
//!
//! A [`MeshNetwork`] owns the network identity, the self peer, the remote
//! peers and the message store. While online it pings its sessions,
//! gossips peer lists, announces itself through discovery and connects to
//! every endpoint it learns about. Connections are negotiated either for an
//! invitation (private network whose first message has not reached the other
//! user yet) or for the network itself.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crypto::{
    derive_group_network, derive_private_network, masked_user_id, ChannelId, NetworkId, NetworkKeys, UserId,
};
use crate::mesh::channel::{SecureChannel, SecureChannelError};
use crate::mesh::connectivity::{classify, union_of};
use crate::mesh::endpoint::Endpoint;
use crate::mesh::error::MeshError;
use crate::mesh::event::MeshEvent;
use crate::mesh::frame::{self, PacketAssembler, CONTROL_PORT};
use crate::mesh::packet::{MeshNetworkPacket, MessagePacket};
use crate::mesh::peer::{KnownPeer, Peer};
use crate::mesh::session::Session;
use crate::mesh::state::{NetworkState, NETWORK_STATE_VERSION};
use crate::mesh::store::{open_message_store, FileAttachment, MessageItem, MessageStore, MessageType};
use crate::mesh::transfer::FileTransfer;
use crate::mesh::transport::{BoxedStream, Connection, DiscoveryCallback};
use crate::mesh::types::{MeshNetworkStatus, NetworkType};
use crate::mesh::{MeshContext, EVENT_CHANNEL_CAPACITY};

/// How a connection for this network is negotiated.
#[derive(Debug, Clone)]
pub struct NegotiationPlan {
    /// Channel the stream is opened on.
    pub channel_id: ChannelId,
    pub psk: Vec<u8>,
    /// `None` trusts any authenticated user.
    pub trusted_user_ids: Option<Vec<UserId>>,
    /// Pending invitation to deliver instead of joining.
    pub invitation: Option<MessageItem>,
}

#[derive(Clone)]
struct NetworkIdentity {
    keys: NetworkKeys,
    shared_secret: String,
}

#[derive(Debug, Clone, Default)]
struct NetworkSettings {
    local_network_only: bool,
    local_network_only_date_modified: DateTime<Utc>,
    group_display_image: Vec<u8>,
    group_display_image_date_modified: DateTime<Utc>,
    group_lock_network: bool,
    group_lock_network_date_modified: DateTime<Utc>,
    mute: bool,
}

enum Members {
    Private { other: Arc<Peer> },
    /// Keyed by user id; always contains the self peer.
    Group { peers: RwLock<HashMap<UserId, Arc<Peer>>> },
}

/// Parameters shared by the constructors.
struct Blueprint {
    network_type: NetworkType,
    network_name: Option<String>,
    identity: NetworkIdentity,
    settings: NetworkSettings,
    store_id: String,
    store_key: [u8; 32],
    known_peers: Vec<KnownPeer>,
}

/// A private or group chat network.
pub struct MeshNetwork {
    ctx: Arc<MeshContext>,
    weak_self: Weak<MeshNetwork>,
    network_type: NetworkType,
    network_name: Option<String>,
    identity: RwLock<NetworkIdentity>,
    status: RwLock<MeshNetworkStatus>,
    settings: RwLock<NetworkSettings>,
    self_peer: Arc<Peer>,
    members: Members,
    store: Arc<dyn MessageStore>,
    store_id: String,
    store_key: [u8; 32],
    /// Serializes read-modify-write of stored messages.
    store_lock: tokio::sync::Mutex<()>,
    dht_peers: Mutex<Vec<Endpoint>>,
    tcp_relay_peers: Mutex<Vec<Endpoint>>,
    connecting: Mutex<HashSet<Endpoint>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<MeshEvent>,
}

impl std::fmt::Debug for MeshNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNetwork")
            .field("network_id", &self.network_id())
            .field("network_type", &self.network_type)
            .field("network_name", &self.network_name)
            .field("status", &*self.status.read())
            .finish_non_exhaustive()
    }
}

impl MeshNetwork {
    /// Creates a private chat with `peer_user_id`. With `invitation` the text
    /// becomes message 0 and is delivered as an invitation before the network
    /// proper is used.
    pub fn create_private(
        ctx: Arc<MeshContext>,
        peer_user_id: UserId,
        peer_display_name: Option<String>,
        shared_secret: &str,
        invitation: Option<&str>,
    ) -> Result<Arc<Self>, MeshError> {
        let local = ctx.user_id();
        if peer_user_id == local {
            return Err(MeshError::InvalidOperation("cannot open a private chat with yourself".into()));
        }

        let mut other = KnownPeer {
            user_id: peer_user_id,
            profile: Default::default(),
            endpoints: Vec::new(),
        };
        if let Some(name) = peer_display_name {
            other.profile.display_name = name;
        }

        let (store_id, store_key) = new_store_keys();
        let network = Self::build(
            ctx,
            Blueprint {
                network_type: NetworkType::Private,
                network_name: None,
                identity: NetworkIdentity {
                    keys: derive_private_network(&local, &peer_user_id, shared_secret),
                    shared_secret: shared_secret.to_string(),
                },
                settings: NetworkSettings::default(),
                store_id,
                store_key,
                known_peers: vec![other],
            },
        )?;

        if let Some(text) = invitation {
            let mut item = MessageItem::text(local, text, [peer_user_id]);
            network.append_message(&mut item)?;
        }
        Ok(network)
    }

    /// Creates a group chat named `name`.
    pub fn create_group(
        ctx: Arc<MeshContext>,
        name: &str,
        shared_secret: &str,
        local_network_only: bool,
    ) -> Result<Arc<Self>, MeshError> {
        if name.trim().is_empty() {
            return Err(MeshError::InvalidOperation("group name cannot be empty".into()));
        }
        let (store_id, store_key) = new_store_keys();
        let mut settings = NetworkSettings::default();
        if local_network_only {
            settings.local_network_only = true;
            settings.local_network_only_date_modified = Utc::now();
        }
        Self::build(
            ctx,
            Blueprint {
                network_type: NetworkType::Group,
                network_name: Some(name.to_string()),
                identity: NetworkIdentity {
                    keys: derive_group_network(name, shared_secret),
                    shared_secret: shared_secret.to_string(),
                },
                settings,
                store_id,
                store_key,
                known_peers: Vec::new(),
            },
        )
    }

    /// Restores a network. It goes online if it was online when saved.
    pub fn load(ctx: Arc<MeshContext>, state: NetworkState) -> Result<Arc<Self>, MeshError> {
        state.validate()?;
        if state.local_user_id != ctx.user_id() {
            return Err(MeshError::InvalidOperation("network state belongs to another identity".into()));
        }

        let network = Self::build(
            ctx,
            Blueprint {
                network_type: state.network_type,
                network_name: state.network_name,
                identity: NetworkIdentity {
                    keys: NetworkKeys {
                        network_id: state.network_id,
                        network_secret: state.network_secret,
                    },
                    shared_secret: state.shared_secret,
                },
                settings: NetworkSettings {
                    local_network_only: state.local_network_only,
                    local_network_only_date_modified: state.local_network_only_date_modified,
                    group_display_image: state.group_display_image,
                    group_display_image_date_modified: state.group_display_image_date_modified,
                    group_lock_network: state.group_lock_network,
                    group_lock_network_date_modified: state.group_lock_network_date_modified,
                    mute: state.mute,
                },
                store_id: state.store_id,
                store_key: state.store_key,
                known_peers: state.known_peers,
            },
        )?;

        if state.status == MeshNetworkStatus::Online {
            network.go_online();
        }
        Ok(network)
    }

    fn build(ctx: Arc<MeshContext>, blueprint: Blueprint) -> Result<Arc<Self>, MeshError> {
        let store = open_message_store(
            ctx.config().store_dir.as_deref(),
            &blueprint.store_id,
            &blueprint.store_key,
        )?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let local = ctx.user_id();

        let network = Arc::new_cyclic(|weak: &Weak<MeshNetwork>| {
            let self_peer = Peer::new(ctx.clone(), weak.clone(), local);
            let mut known = blueprint
                .known_peers
                .into_iter()
                .filter(|k| k.user_id != local)
                .map(|k| Peer::restore(ctx.clone(), weak.clone(), k));

            let members = match blueprint.network_type {
                NetworkType::Private => {
                    let other = known
                        .next()
                        .unwrap_or_else(|| Peer::new(ctx.clone(), weak.clone(), UserId::default()));
                    Members::Private { other }
                }
                NetworkType::Group => {
                    let mut peers: HashMap<UserId, Arc<Peer>> = known.map(|p| (p.user_id(), p)).collect();
                    peers.insert(local, self_peer.clone());
                    Members::Group {
                        peers: RwLock::new(peers),
                    }
                }
            };

            MeshNetwork {
                ctx: ctx.clone(),
                weak_self: weak.clone(),
                network_type: blueprint.network_type,
                network_name: blueprint.network_name,
                identity: RwLock::new(blueprint.identity),
                status: RwLock::new(MeshNetworkStatus::Offline),
                settings: RwLock::new(blueprint.settings),
                self_peer,
                members,
                store,
                store_id: blueprint.store_id,
                store_key: blueprint.store_key,
                store_lock: tokio::sync::Mutex::new(()),
                dht_peers: Mutex::new(Vec::new()),
                tcp_relay_peers: Mutex::new(Vec::new()),
                connecting: Mutex::new(HashSet::new()),
                timers: Mutex::new(Vec::new()),
                events,
            }
        });

        debug!(
            network = %network.network_id().short(),
            network_type = %network.network_type,
            "network created"
        );
        Ok(network)
    }

    // ---- accessors ----

    pub fn context(&self) -> &Arc<MeshContext> {
        &self.ctx
    }

    pub fn network_id(&self) -> NetworkId {
        self.identity.read().keys.network_id
    }

    pub fn network_type(&self) -> NetworkType {
        self.network_type
    }

    /// Group name, or the other user's name for a private chat.
    pub fn network_name(&self) -> String {
        match (&self.network_name, &self.members) {
            (Some(name), _) => name.clone(),
            (None, Members::Private { other }) => other.name_or_id(),
            (None, Members::Group { .. }) => self.network_id().short(),
        }
    }

    pub fn shared_secret(&self) -> String {
        self.identity.read().shared_secret.clone()
    }

    pub fn local_user_id(&self) -> UserId {
        self.ctx.user_id()
    }

    pub fn status(&self) -> MeshNetworkStatus {
        *self.status.read()
    }

    pub fn is_online(&self) -> bool {
        self.status() == MeshNetworkStatus::Online
    }

    pub fn local_network_only(&self) -> bool {
        self.settings.read().local_network_only
    }

    pub fn group_display_image(&self) -> Vec<u8> {
        self.settings.read().group_display_image.clone()
    }

    pub fn group_lock_network(&self) -> bool {
        self.settings.read().group_lock_network
    }

    pub fn is_muted(&self) -> bool {
        self.settings.read().mute
    }

    pub fn set_mute(&self, mute: bool) {
        self.settings.write().mute = mute;
    }

    pub fn self_peer(&self) -> &Arc<Peer> {
        &self.self_peer
    }

    /// The other user of a private chat.
    pub fn other_peer(&self) -> Option<&Arc<Peer>> {
        match &self.members {
            Members::Private { other } => Some(other),
            Members::Group { .. } => None,
        }
    }

    /// Every peer, self included.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        match &self.members {
            Members::Private { other } => vec![self.self_peer.clone(), other.clone()],
            Members::Group { peers } => peers.read().values().cloned().collect(),
        }
    }

    pub fn peer(&self, user_id: &UserId) -> Option<Arc<Peer>> {
        self.peers().into_iter().find(|p| p.user_id() == *user_id)
    }

    fn remote_peers(&self) -> Vec<Arc<Peer>> {
        self.peers().into_iter().filter(|p| !p.is_self()).collect()
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub(crate) fn store_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.store_lock
    }

    /// Endpoints found through discovery.
    pub fn dht_peers(&self) -> Vec<Endpoint> {
        self.dht_peers.lock().clone()
    }

    /// Endpoints received from the TCP relay.
    pub fn tcp_relay_peers(&self) -> Vec<Endpoint> {
        self.tcp_relay_peers.lock().clone()
    }

    /// Events of this network only.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: MeshEvent) {
        let _ = self.events.send(event.clone());
        self.ctx.emit(event);
    }

    fn peer_name(&self, user_id: &UserId) -> String {
        self.peer(user_id)
            .map(|p| p.name_or_id())
            .unwrap_or_else(|| user_id.short())
    }

    // ---- messages ----

    fn append_message(&self, item: &mut MessageItem) -> Result<u32, MeshError> {
        let number = item.append_to(self.store.as_ref())?;
        self.emit(MeshEvent::MessageReceived {
            network_id: self.network_id(),
            message: item.clone(),
        });
        Ok(number)
    }

    /// Appends an informational line. Store failures are logged.
    pub(crate) fn append_info(&self, text: impl Into<String>) {
        let mut item = MessageItem::info(text);
        if let Err(e) = self.append_message(&mut item) {
            warn!(network = %self.network_id().short(), error = %e, "failed to store info message");
        }
    }

    pub fn message_count(&self) -> u32 {
        self.store.count()
    }

    pub fn get_message(&self, message_number: u32) -> Result<MessageItem, MeshError> {
        MessageItem::read_from(self.store.as_ref(), message_number)
    }

    /// Up to `count` messages starting at `start`.
    pub fn get_messages(&self, start: u32, count: u32) -> Result<Vec<MessageItem>, MeshError> {
        let end = start.saturating_add(count).min(self.store.count());
        (start..end).map(|n| self.get_message(n)).collect()
    }

    /// Stores a text message and sends it to every connected peer.
    pub async fn send_text_message(&self, text: &str) -> Result<MessageItem, MeshError> {
        let recipients = self.remote_peers().iter().map(|p| p.user_id()).collect::<Vec<_>>();
        let mut item = MessageItem::text(self.local_user_id(), text, recipients);
        self.append_message(&mut item)?;
        self.send_to_all(&MeshNetworkPacket::Message(MessagePacket::from(&item))).await;
        Ok(item)
    }

    /// Offers the file at `path` to every connected peer.
    pub async fn send_file_attachment(&self, path: &Path, text: &str) -> Result<MessageItem, MeshError> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(MeshError::InvalidOperation(format!("{} is not a file", path.display())));
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| MeshError::InvalidOperation(format!("{} has no file name", path.display())))?;
        let attachment = FileAttachment {
            file_name,
            file_size: metadata.len(),
            local_path: Some(path.to_path_buf()),
        };

        let recipients = self.remote_peers().iter().map(|p| p.user_id()).collect::<Vec<_>>();
        let mut item = MessageItem::file(self.local_user_id(), attachment, text, recipients);
        self.append_message(&mut item)?;
        self.send_to_all(&MeshNetworkPacket::Message(MessagePacket::from(&item))).await;
        Ok(item)
    }

    pub async fn send_typing_notification(&self) {
        self.send_to_all(&MeshNetworkPacket::MessageTypingNotification).await;
    }

    /// Downloads the attachment of received message `message_number`.
    pub async fn receive_file_attachment(
        &self,
        message_number: u32,
        path: PathBuf,
    ) -> Result<FileTransfer, MeshError> {
        let item = self.get_message(message_number)?;
        let sender = item
            .sender_user_id
            .ok_or_else(|| MeshError::InvalidOperation(format!("message {} has no sender", message_number)))?;
        let peer = self.peer(&sender).ok_or(MeshError::PeerNotFound(sender))?;
        peer.receive_file_attachment(message_number, path).await
    }

    async fn send_to_all(&self, packet: &MeshNetworkPacket) {
        for peer in self.peers() {
            peer.send_packet(packet).await;
        }
    }

    pub(crate) fn receive_message(&self, peer: &Peer, packet: MessagePacket) -> Result<(), MeshError> {
        let mut item = MessageItem::received(peer.user_id(), &packet);
        self.append_message(&mut item)?;
        Ok(())
    }

    /// Marks `message_number` delivered to `peer`. Repeats are harmless.
    pub(crate) async fn receive_delivery_notification(&self, peer: &Peer, message_number: u32) -> Result<(), MeshError> {
        let item = {
            let _guard = self.store_lock.lock().await;
            let mut item = MessageItem::read_from(self.store.as_ref(), message_number)?;
            if !item.is_sent_by(&self.local_user_id()) {
                return Err(MeshError::InvalidOperation(format!(
                    "message {} was not sent by the local user",
                    message_number
                )));
            }
            if !item.mark_delivered(&peer.user_id()) {
                return Err(MeshError::PeerNotFound(peer.user_id()));
            }
            item.update_in(self.store.as_ref())?;
            item
        };

        self.emit(MeshEvent::MessageDeliveryNotification {
            network_id: self.network_id(),
            peer_user_id: peer.user_id(),
            message: item,
        });
        Ok(())
    }

    pub(crate) fn receive_typing_notification(&self, peer: &Peer) {
        self.emit(MeshEvent::PeerTyping {
            network_id: self.network_id(),
            peer_user_id: peer.user_id(),
        });
    }

    // ---- settings ----

    /// Settings packets pushed to every new session.
    pub(crate) fn settings_packets(&self) -> Vec<MeshNetworkPacket> {
        let settings = self.settings.read();
        let mut packets = vec![MeshNetworkPacket::LocalNetworkOnly {
            enabled: settings.local_network_only,
            date_modified: settings.local_network_only_date_modified,
        }];
        if self.network_type == NetworkType::Group {
            packets.push(MeshNetworkPacket::GroupDisplayImage {
                image: settings.group_display_image.clone(),
                date_modified: settings.group_display_image_date_modified,
            });
            packets.push(MeshNetworkPacket::GroupLockNetwork {
                locked: settings.group_lock_network,
                date_modified: settings.group_lock_network_date_modified,
            });
        }
        packets
    }

    /// Restricts connections to private addresses. Enabling clears the
    /// discovery caches and leaves the relay; disabling registers with the
    /// relay again while online but does not bring the caches back.
    pub async fn set_local_network_only(&self, enabled: bool) {
        let date_modified = Utc::now();
        {
            let mut settings = self.settings.write();
            settings.local_network_only = enabled;
            settings.local_network_only_date_modified = date_modified;
        }
        self.apply_local_network_only(enabled);
        self.send_to_all(&MeshNetworkPacket::LocalNetworkOnly { enabled, date_modified })
            .await;
    }

    fn apply_local_network_only(&self, enabled: bool) {
        let network_id = self.network_id();
        if enabled {
            self.dht_peers.lock().clear();
            self.tcp_relay_peers.lock().clear();
            if let Some(relay) = self.ctx.relay() {
                relay.unregister_hosted_network(&network_id);
            }
        } else if self.is_online() {
            if let Some(relay) = self.ctx.relay() {
                relay.register_hosted_network(&network_id);
            }
        }
        self.emit(MeshEvent::LocalNetworkOnlyChanged { network_id, enabled });
    }

    pub(crate) fn receive_local_network_only(&self, peer: &Peer, enabled: bool, date_modified: DateTime<Utc>) {
        {
            let mut settings = self.settings.write();
            if date_modified <= settings.local_network_only_date_modified {
                return;
            }
            settings.local_network_only = enabled;
            settings.local_network_only_date_modified = date_modified;
        }
        self.apply_local_network_only(enabled);
        let state = if enabled { "enabled" } else { "disabled" };
        self.append_info(format!("{} {} local network only mode", peer.name_or_id(), state));
    }

    pub async fn set_group_display_image(&self, image: Vec<u8>) -> Result<(), MeshError> {
        self.require_group()?;
        let date_modified = Utc::now();
        {
            let mut settings = self.settings.write();
            settings.group_display_image = image.clone();
            settings.group_display_image_date_modified = date_modified;
        }
        self.emit(MeshEvent::GroupDisplayImageChanged {
            network_id: self.network_id(),
        });
        self.send_to_all(&MeshNetworkPacket::GroupDisplayImage { image, date_modified })
            .await;
        Ok(())
    }

    pub(crate) fn receive_group_display_image(&self, _peer: &Peer, image: Vec<u8>, date_modified: DateTime<Utc>) {
        if self.network_type != NetworkType::Group {
            return;
        }
        {
            let mut settings = self.settings.write();
            if date_modified <= settings.group_display_image_date_modified {
                return;
            }
            settings.group_display_image = image;
            settings.group_display_image_date_modified = date_modified;
        }
        self.emit(MeshEvent::GroupDisplayImageChanged {
            network_id: self.network_id(),
        });
    }

    /// Locks the group to the peers already known.
    pub async fn set_group_lock_network(&self, locked: bool) -> Result<(), MeshError> {
        self.require_group()?;
        let date_modified = Utc::now();
        {
            let mut settings = self.settings.write();
            settings.group_lock_network = locked;
            settings.group_lock_network_date_modified = date_modified;
        }
        self.emit(MeshEvent::GroupLockNetworkChanged {
            network_id: self.network_id(),
            locked,
        });
        self.send_to_all(&MeshNetworkPacket::GroupLockNetwork { locked, date_modified })
            .await;
        Ok(())
    }

    pub(crate) fn receive_group_lock_network(&self, peer: &Peer, locked: bool, date_modified: DateTime<Utc>) {
        if self.network_type != NetworkType::Group {
            return;
        }
        {
            let mut settings = self.settings.write();
            if date_modified <= settings.group_lock_network_date_modified {
                return;
            }
            settings.group_lock_network = locked;
            settings.group_lock_network_date_modified = date_modified;
        }
        self.emit(MeshEvent::GroupLockNetworkChanged {
            network_id: self.network_id(),
            locked,
        });
        let action = if locked { "locked" } else { "unlocked" };
        self.append_info(format!("{} {} the group", peer.name_or_id(), action));
    }

    fn require_group(&self) -> Result<(), MeshError> {
        match self.network_type {
            NetworkType::Group => Ok(()),
            NetworkType::Private => Err(MeshError::InvalidOperation("not a group network".into())),
        }
    }

    /// Re-derives the network id and secret. Existing sessions stay up.
    pub fn set_shared_secret(&self, shared_secret: &str) {
        let old_id = self.network_id();
        let keys = match (&self.network_name, &self.members) {
            (Some(name), _) => derive_group_network(name, shared_secret),
            (None, Members::Private { other }) => {
                derive_private_network(&self.local_user_id(), &other.user_id(), shared_secret)
            }
            (None, Members::Group { .. }) => return,
        };
        *self.identity.write() = NetworkIdentity {
            keys,
            shared_secret: shared_secret.to_string(),
        };

        if self.is_online() && !self.local_network_only() {
            if let Some(relay) = self.ctx.relay() {
                relay.unregister_hosted_network(&old_id);
                relay.register_hosted_network(&keys.network_id);
            }
        }
        info!(old = %old_id.short(), new = %keys.network_id.short(), "network secret changed");
    }

    /// Pushes the local profile to every session.
    pub async fn profile_trigger_update(&self, include_image: bool) {
        let profile = self.ctx.profile();
        self.send_to_all(&profile.profile_packet()).await;
        if include_image {
            self.send_to_all(&profile.display_image_packet()).await;
        }
    }

    // ---- connectivity ----

    /// Reclassifies every peer against the union of all connected lists.
    pub fn update_connectivity_status(&self) {
        let peers = self.peers();
        let lists: Vec<(Arc<Peer>, Vec<_>)> = peers
            .into_iter()
            .map(|peer| {
                let list = if peer.is_online() {
                    peer.current_connected_list(self)
                } else {
                    Vec::new()
                };
                (peer, list)
            })
            .collect();

        let union = union_of(lists.iter().map(|(_, list)| list.as_slice()));
        let network_id = self.network_id();
        for (peer, list) in lists {
            let (status, disconnected) = classify(&peer.user_id(), &list, &union);
            if peer.set_connectivity(status, list, disconnected) {
                self.emit(MeshEvent::PeerConnectivityChanged {
                    network_id,
                    peer_user_id: peer.user_id(),
                    status,
                });
            }
        }
    }

    /// Sends the self peer's connected list to every session.
    pub async fn broadcast_peer_exchange(&self) {
        let peers = self.self_peer.current_connected_list(self);
        self.send_to_all(&MeshNetworkPacket::PeerExchange { peers }).await;
    }

    // ---- online / offline ----

    /// Starts timers, registers with the relay and reconnects to known peers.
    pub fn go_online(&self) {
        {
            let mut status = self.status.write();
            if *status == MeshNetworkStatus::Online {
                return;
            }
            *status = MeshNetworkStatus::Online;
        }
        let network_id = self.network_id();
        info!(network = %network_id.short(), "network online");
        self.emit(MeshEvent::NetworkStatusChanged {
            network_id,
            status: MeshNetworkStatus::Online,
        });

        self.start_timers();
        if !self.local_network_only() {
            if let Some(relay) = self.ctx.relay() {
                relay.register_hosted_network(&network_id);
            }
        }
        for peer in self.remote_peers() {
            for endpoint in peer.last_known_endpoints() {
                self.begin_make_connection(endpoint, None);
            }
        }
        self.update_connectivity_status();
    }

    /// Stops timers and closes every session.
    pub async fn go_offline(&self) {
        {
            let mut status = self.status.write();
            if *status == MeshNetworkStatus::Offline {
                return;
            }
            *status = MeshNetworkStatus::Offline;
        }
        let network_id = self.network_id();
        info!(network = %network_id.short(), "network offline");

        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
        for peer in self.peers() {
            peer.disconnect_all().await;
        }
        if let Some(relay) = self.ctx.relay() {
            relay.unregister_hosted_network(&network_id);
        }
        self.dht_peers.lock().clear();
        self.tcp_relay_peers.lock().clear();

        self.emit(MeshEvent::NetworkStatusChanged {
            network_id,
            status: MeshNetworkStatus::Offline,
        });
        self.update_connectivity_status();
    }

    fn start_timers(&self) {
        let config = self.ctx.config();
        let ping = tokio::spawn(ping_loop(self.weak_self.clone(), config.ping_interval()));
        let announce = tokio::spawn(announce_loop(
            self.weak_self.clone(),
            config.announce_initial_delay(),
            config.announce_interval(),
        ));
        self.timers.lock().extend([ping, announce]);
    }

    async fn ping(&self) {
        for peer in self.peers() {
            peer.send_packet_all(&MeshNetworkPacket::PingRequest).await;
        }
        self.broadcast_peer_exchange().await;
    }

    /// Publishes the network through discovery, or looks for the invited
    /// user while an invitation is pending.
    pub fn announce(&self) {
        let Some(discovery) = self.ctx.discovery() else {
            return;
        };
        let weak = self.weak_self.clone();
        let callback: DiscoveryCallback = Arc::new(move |network_type, endpoints| {
            if let Some(network) = weak.upgrade() {
                debug!(network = %network.network_id().short(), ?network_type, count = endpoints.len(), "peers discovered");
                network.discovered_peers(endpoints);
            }
        });

        let local_only = self.local_network_only();
        match (self.pending_invitation(), self.other_peer()) {
            (Some(_), Some(other)) => {
                discovery.begin_find_peers(&masked_user_id(&other.user_id()), local_only, callback);
            }
            _ => {
                discovery.begin_announce(
                    &ChannelId::from(self.network_id()),
                    local_only,
                    self.ctx.connections().local_endpoint(),
                    callback,
                );
            }
        }
    }

    fn discovered_peers(&self, endpoints: Vec<Endpoint>) {
        {
            let mut cache = self.dht_peers.lock();
            for endpoint in &endpoints {
                if !cache.contains(endpoint) {
                    cache.push(endpoint.clone());
                }
            }
        }
        for endpoint in endpoints {
            self.begin_make_connection(endpoint, None);
        }
    }

    /// Endpoints the TCP relay reported for this network, reachable through
    /// `via`.
    pub fn tcp_relay_received_peers(&self, via: Arc<dyn Connection>, endpoints: Vec<Endpoint>) {
        if self.local_network_only() {
            return;
        }
        {
            let mut cache = self.tcp_relay_peers.lock();
            for endpoint in &endpoints {
                if !cache.contains(endpoint) {
                    cache.push(endpoint.clone());
                }
            }
        }
        for endpoint in endpoints {
            self.begin_make_connection(endpoint, Some(via.clone()));
        }
    }

    // ---- connection protocol ----

    fn has_session_to(&self, endpoint: &Endpoint) -> bool {
        self.peers().iter().any(|p| p.has_session_to(endpoint))
    }

    /// Connects to `endpoint` in the background unless there is no need to.
    pub fn begin_make_connection(&self, endpoint: Endpoint, fallback: Option<Arc<dyn Connection>>) {
        if !self.is_online() {
            return;
        }
        if self.local_network_only() && !endpoint.is_private() {
            return;
        }
        if self.ctx.connections().local_endpoint().as_ref() == Some(&endpoint) {
            return;
        }
        if self.has_session_to(&endpoint) {
            return;
        }
        if !self.connecting.lock().insert(endpoint.clone()) {
            return;
        }
        let Some(network) = self.weak_self.upgrade() else {
            return;
        };

        tokio::spawn(async move {
            if let Err(e) = network.make_connection(endpoint.clone(), fallback).await {
                debug!(network = %network.network_id().short(), endpoint = %endpoint, error = %e, "connection attempt failed");
            }
            network.connecting.lock().remove(&endpoint);
        });
    }

    #[tracing::instrument(skip_all, fields(network = %self.network_id().short(), endpoint = %endpoint))]
    async fn make_connection(
        &self,
        endpoint: Endpoint,
        fallback: Option<Arc<dyn Connection>>,
    ) -> Result<(), MeshError> {
        let connections = self.ctx.connections();
        let connection = match connections.make_connection(&endpoint).await {
            Ok(connection) => connection,
            Err(e) => match &fallback {
                Some(via) => {
                    debug!(error = %e, via = %via.remote_endpoint(), "direct connection failed, trying relay");
                    connections.make_virtual_connection(via, &endpoint).await?
                }
                None => return Err(e),
            },
        };

        let plan = self.negotiation_plan();
        if connection.channel_exists(&plan.channel_id) {
            debug!("channel already open");
            return Ok(());
        }

        let stream = connection.connect_mesh_network(&plan.channel_id).await?;
        let params = self
            .ctx
            .channel_params(plan.psk, plan.trusted_user_ids)
            .with_endpoints(Some(endpoint.clone()), connection.via_endpoint());
        let channel = match SecureChannel::connect(stream, params).await {
            Ok(channel) => channel,
            Err(e) => {
                self.record_channel_failure(&e);
                return Err(e.into());
            }
        };

        match plan.invitation {
            Some(invitation) => self.deliver_invitation(channel, invitation).await,
            None => self.join(channel, connection, true).await.map(|_| ()),
        }
    }

    /// The undelivered invitation, if message 0 is one.
    pub fn pending_invitation(&self) -> Option<MessageItem> {
        let other = self.other_peer()?;
        if self.store.count() == 0 {
            return None;
        }
        let first = MessageItem::read_from(self.store.as_ref(), 0).ok()?;
        let pending = first.message_type == MessageType::TextMessage
            && first.is_sent_by(&self.local_user_id())
            && first.recipients.iter().any(|r| r.user_id == other.user_id())
            && !first.is_delivered();
        pending.then_some(first)
    }

    /// How an outbound connection is negotiated right now.
    pub fn negotiation_plan(&self) -> NegotiationPlan {
        if let (Some(invitation), Some(other)) = (self.pending_invitation(), self.other_peer()) {
            let other_id = other.user_id();
            return NegotiationPlan {
                channel_id: masked_user_id(&other_id),
                psk: other_id.as_bytes().to_vec(),
                trusted_user_ids: Some(vec![other_id]),
                invitation: Some(invitation),
            };
        }

        let keys = self.identity.read().keys;
        NegotiationPlan {
            channel_id: ChannelId::from(keys.network_id),
            psk: keys.network_secret.to_vec(),
            trusted_user_ids: self.trusted_user_ids(),
            invitation: None,
        }
    }

    fn trusted_user_ids(&self) -> Option<Vec<UserId>> {
        match &self.members {
            Members::Private { other } => Some(vec![other.user_id()]),
            Members::Group { peers } if self.group_lock_network() => Some(peers.read().keys().copied().collect()),
            Members::Group { .. } => None,
        }
    }

    /// Sends the invitation, waits for its acknowledgment and closes.
    async fn deliver_invitation(&self, channel: SecureChannel, invitation: MessageItem) -> Result<(), MeshError> {
        let peer_user_id = channel.remote_user_id();
        let (mut reader, mut writer) = tokio::io::split(channel);
        frame::write_packet(&mut writer, &MeshNetworkPacket::Message(MessagePacket::from(&invitation))).await?;

        let timeout = self.ctx.config().handshake_timeout();
        let mut assembler = PacketAssembler::default();
        let acknowledged = tokio::time::timeout(timeout, async {
            while let Some(packet) = frame::read_packet(&mut reader, &mut assembler).await? {
                if let MeshNetworkPacket::MessageDeliveryNotification { message_number } = packet {
                    return Ok::<_, MeshError>(message_number == invitation.message_number);
                }
            }
            Ok(false)
        })
        .await
        .map_err(|_| MeshError::ReadTimeout(timeout))??;

        let _ = frame::write_frame(&mut writer, CONTROL_PORT, &[]).await;
        let _ = writer.shutdown().await;

        if !acknowledged {
            return Err(MeshError::InvitationNotFound(format!(
                "{} did not acknowledge the invitation",
                peer_user_id.short()
            )));
        }
        info!(peer = %peer_user_id.short(), "invitation delivered");
        let other = self.other_peer().ok_or(MeshError::PeerNotFound(peer_user_id))?.clone();
        self.receive_delivery_notification(&other, invitation.message_number).await
    }

    /// Binds a negotiated channel to its peer and starts a session.
    async fn join(
        &self,
        channel: SecureChannel,
        connection: Arc<dyn Connection>,
        is_client: bool,
    ) -> Result<Arc<Session>, MeshError> {
        let remote = channel.remote_user_id();
        let peer = if remote == self.local_user_id() {
            self.self_peer.clone()
        } else {
            match &self.members {
                Members::Private { other } if other.user_id() == remote => other.clone(),
                Members::Private { .. } => return Err(MeshError::PeerNotFound(remote)),
                Members::Group { .. } => self.get_or_add_peer(remote),
            }
        };
        peer.add_session(channel, connection, is_client).await
    }

    fn get_or_add_peer(&self, user_id: UserId) -> Arc<Peer> {
        let Members::Group { peers } = &self.members else {
            return self.self_peer.clone();
        };
        let (peer, added) = {
            let mut peers = peers.write();
            match peers.get(&user_id) {
                Some(peer) => (peer.clone(), false),
                None => {
                    let peer = Peer::new(self.ctx.clone(), self.weak_self.clone(), user_id);
                    peers.insert(user_id, peer.clone());
                    (peer, true)
                }
            }
        };
        if added {
            self.emit(MeshEvent::PeerAdded {
                network_id: self.network_id(),
                peer_user_id: user_id,
            });
        }
        peer
    }

    /// Server side of a channel opened on this network's id.
    pub(crate) async fn accept_connection(
        &self,
        stream: BoxedStream,
        connection: Arc<dyn Connection>,
    ) -> Result<Arc<Session>, MeshError> {
        let remote_endpoint = connection.remote_endpoint();
        if !self.is_online() {
            return Err(MeshError::NetworkOffline);
        }
        if self.local_network_only() && !remote_endpoint.is_private() {
            return Err(MeshError::NotLocalEndpoint(remote_endpoint));
        }

        let keys = self.identity.read().keys;
        let params = self
            .ctx
            .channel_params(keys.network_secret.to_vec(), self.trusted_user_ids())
            .with_endpoints(Some(remote_endpoint), connection.via_endpoint());
        let channel = match SecureChannel::accept(stream, params).await {
            Ok(channel) => channel,
            Err(e) => {
                self.record_channel_failure(&e);
                return Err(e.into());
            }
        };
        self.join(channel, connection, false).await
    }

    /// Server side of an invitation channel opened on the masked local user
    /// id. Creates an offline private network holding the invitation.
    pub async fn accept_private_network_invitation(
        ctx: Arc<MeshContext>,
        stream: BoxedStream,
        connection: Arc<dyn Connection>,
    ) -> Result<Arc<MeshNetwork>, MeshError> {
        let remote_endpoint = connection.remote_endpoint();
        let params = ctx
            .channel_params(ctx.user_id().as_bytes().to_vec(), None)
            .with_endpoints(Some(remote_endpoint.clone()), connection.via_endpoint());
        let channel = SecureChannel::accept(stream, params).await?;
        let peer_user_id = channel.remote_user_id();
        let (mut reader, mut writer) = tokio::io::split(channel);

        let timeout = ctx.config().handshake_timeout();
        let mut assembler = PacketAssembler::default();
        let packet = tokio::time::timeout(timeout, frame::read_packet(&mut reader, &mut assembler))
            .await
            .map_err(|_| MeshError::ReadTimeout(timeout))??;
        let message = match packet {
            Some(MeshNetworkPacket::Message(message)) => message,
            Some(other) => {
                return Err(MeshError::ProtocolError(format!(
                    "expected an invitation message, got {}",
                    other.kind()
                )))
            }
            None => return Err(MeshError::SessionClosed),
        };

        let network = Self::create_private(ctx, peer_user_id, None, "", None)?;
        network.append_info(format!(
            "Invitation received from {} ({})",
            peer_user_id.short(),
            remote_endpoint
        ));
        let mut item = MessageItem::received(peer_user_id, &message);
        network.append_message(&mut item)?;
        network.append_info("Go online to accept the invitation");
        if let Some(other) = network.other_peer() {
            other.remember_endpoint(remote_endpoint);
        }

        frame::write_packet(
            &mut writer,
            &MeshNetworkPacket::MessageDeliveryNotification {
                message_number: message.message_number,
            },
        )
        .await?;
        let _ = frame::write_frame(&mut writer, CONTROL_PORT, &[]).await;
        let _ = writer.shutdown().await;

        info!(peer = %peer_user_id.short(), network = %network.network_id().short(), "invitation accepted");
        Ok(network)
    }

    fn record_channel_failure(&self, error: &SecureChannelError) {
        let who = match (&error.peer_user_id, &error.peer_endpoint) {
            (Some(user_id), _) => self.peer_name(user_id),
            (None, Some(endpoint)) => endpoint.to_string(),
            (None, None) => "unknown peer".to_string(),
        };
        warn!(network = %self.network_id().short(), peer = %who, code = %error.code, "secure channel failed");
        self.append_info(format!("Secure channel with {} failed: {}", who, error.code));
    }

    // ---- lifecycle ----

    /// Persisted form of the network.
    pub fn state(&self) -> NetworkState {
        let identity = self.identity.read().clone();
        let settings = self.settings.read().clone();
        NetworkState {
            version: NETWORK_STATE_VERSION,
            network_type: self.network_type,
            local_user_id: self.local_user_id(),
            network_name: self.network_name.clone(),
            shared_secret: identity.shared_secret,
            status: self.status(),
            network_id: identity.keys.network_id,
            network_secret: identity.keys.network_secret,
            store_id: self.store_id.clone(),
            store_key: self.store_key,
            local_network_only: settings.local_network_only,
            local_network_only_date_modified: settings.local_network_only_date_modified,
            group_display_image: settings.group_display_image,
            group_display_image_date_modified: settings.group_display_image_date_modified,
            group_lock_network: settings.group_lock_network,
            group_lock_network_date_modified: settings.group_lock_network_date_modified,
            mute: settings.mute,
            known_peers: self.remote_peers().iter().map(|p| p.known_peer()).collect(),
        }
    }

    /// Goes offline and deletes the message store.
    pub async fn delete_network(&self) -> Result<(), MeshError> {
        self.go_offline().await;
        if let Some(relay) = self.ctx.relay() {
            relay.unregister_hosted_network(&self.network_id());
        }
        self.store.delete()?;
        info!(network = %self.network_id().short(), "network deleted");
        Ok(())
    }
}

impl Drop for MeshNetwork {
    fn drop(&mut self) {
        for timer in self.timers.get_mut().drain(..) {
            timer.abort();
        }
    }
}

fn new_store_keys() -> (String, [u8; 32]) {
    let mut id = [0u8; 16];
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut id);
    rand::thread_rng().fill_bytes(&mut key);
    (hex::encode(id), key)
}

async fn ping_loop(network: Weak<MeshNetwork>, period: Duration) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        interval.tick().await;
        let Some(network) = network.upgrade() else {
            break;
        };
        network.ping().await;
    }
}

async fn announce_loop(network: Weak<MeshNetwork>, initial_delay: Duration, period: Duration) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + initial_delay, period);
    loop {
        interval.tick().await;
        let Some(network) = network.upgrade() else {
            break;
        };
        network.announce();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::UserIdentity;
    use crate::mesh::channel::ChannelParams;
    use crate::mesh::config::MeshConfig;
    use crate::mesh::transport::{MemoryHub, TcpRelayClient};
    use crate::mesh::types::ProfileStatus;

    #[derive(Default)]
    struct RecordingRelay {
        calls: Mutex<Vec<(bool, NetworkId)>>,
    }

    impl TcpRelayClient for RecordingRelay {
        fn register_hosted_network(&self, network_id: &NetworkId) {
            self.calls.lock().push((true, *network_id));
        }

        fn unregister_hosted_network(&self, network_id: &NetworkId) {
            self.calls.lock().push((false, *network_id));
        }
    }

    fn context(relay: Option<Arc<RecordingRelay>>) -> Arc<MeshContext> {
        let hub = MemoryHub::new();
        let mut builder = MeshContext::builder(UserIdentity::generate(), MeshConfig::default())
            .connections(Arc::new(hub.manager("10.0.0.1:9000".parse().unwrap())));
        if let Some(relay) = relay {
            builder = builder.relay(relay);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_private_network_ids_match_on_both_sides() {
        let alice = context(None);
        let bob = context(None);
        let a = MeshNetwork::create_private(alice.clone(), bob.user_id(), None, "s3cret", None).unwrap();
        let b = MeshNetwork::create_private(bob, alice.user_id(), None, "s3cret", None).unwrap();
        assert_eq!(a.network_id(), b.network_id());
    }

    #[test]
    fn test_private_network_with_self_rejected() {
        let ctx = context(None);
        let me = ctx.user_id();
        assert!(MeshNetwork::create_private(ctx, me, None, "", None).is_err());
    }

    #[test]
    fn test_pending_invitation_negotiates_on_masked_id() {
        let ctx = context(None);
        let bob = UserId([5; 32]);
        let network = MeshNetwork::create_private(ctx, bob, None, "", Some("hi bob")).unwrap();

        let plan = network.negotiation_plan();
        assert_eq!(plan.channel_id, masked_user_id(&bob));
        assert_eq!(plan.psk, bob.as_bytes().to_vec());
        assert_eq!(plan.trusted_user_ids, Some(vec![bob]));
        assert!(plan.invitation.is_some());
    }

    #[tokio::test]
    async fn test_delivered_invitation_negotiates_on_network_id() {
        let ctx = context(None);
        let bob = UserId([5; 32]);
        let network = MeshNetwork::create_private(ctx, bob, None, "", Some("hi bob")).unwrap();
        let other = network.other_peer().unwrap().clone();

        network.receive_delivery_notification(&other, 0).await.unwrap();
        // repeated acknowledgments are harmless
        network.receive_delivery_notification(&other, 0).await.unwrap();

        let plan = network.negotiation_plan();
        assert!(plan.invitation.is_none());
        assert_eq!(plan.channel_id, ChannelId::from(network.network_id()));
        assert_eq!(plan.psk, network.state().network_secret.to_vec());
        assert!(network.get_message(0).unwrap().is_delivered());
    }

    #[test]
    fn test_group_trust_follows_lock() {
        let ctx = context(None);
        let network = MeshNetwork::create_group(ctx.clone(), "Friends", "pw", false).unwrap();
        assert_eq!(network.negotiation_plan().trusted_user_ids, None);

        network.settings.write().group_lock_network = true;
        assert_eq!(network.negotiation_plan().trusted_user_ids, Some(vec![ctx.user_id()]));
    }

    #[test]
    fn test_group_contains_self() {
        let ctx = context(None);
        let network = MeshNetwork::create_group(ctx.clone(), "Friends", "pw", false).unwrap();
        let peers = network.peers();
        assert_eq!(peers.len(), 1);
        assert!(peers[0].is_self());
        assert_eq!(network.network_name(), "Friends");
    }

    #[tokio::test]
    async fn test_local_network_only_clears_caches_and_relay() {
        let relay = Arc::new(RecordingRelay::default());
        let ctx = context(Some(relay.clone()));
        let network = MeshNetwork::create_group(ctx, "Friends", "pw", false).unwrap();
        network.go_online();
        let id = network.network_id();
        assert_eq!(*relay.calls.lock(), vec![(true, id)]);

        network.dht_peers.lock().push("8.8.8.8:9000".parse().unwrap());
        network.tcp_relay_peers.lock().push("8.8.4.4:9000".parse().unwrap());

        network.set_local_network_only(true).await;
        assert!(network.dht_peers().is_empty());
        assert!(network.tcp_relay_peers().is_empty());
        assert_eq!(relay.calls.lock().last(), Some(&(false, id)));

        network.set_local_network_only(false).await;
        assert!(network.dht_peers().is_empty());
        assert_eq!(relay.calls.lock().last(), Some(&(true, id)));

        network.go_offline().await;
    }

    #[tokio::test]
    async fn test_stale_local_network_only_is_ignored() {
        let ctx = context(None);
        let network = MeshNetwork::create_group(ctx.clone(), "Friends", "pw", true).unwrap();
        let peer = network.self_peer().clone();

        network.receive_local_network_only(&peer, false, DateTime::<Utc>::default());
        assert!(network.local_network_only());

        network.receive_local_network_only(&peer, false, Utc::now() + chrono::Duration::seconds(5));
        assert!(!network.local_network_only());
    }

    #[tokio::test]
    async fn test_self_profile_from_other_device_is_last_writer_wins() {
        let hub = MemoryHub::new();
        let ctx = MeshContext::builder(UserIdentity::generate(), MeshConfig::default())
            .connections(Arc::new(hub.manager("10.0.0.1:9000".parse().unwrap())))
            .display_name("laptop")
            .build()
            .unwrap();
        let network = MeshNetwork::create_group(ctx.clone(), "Friends", "pw", false).unwrap();
        let me = network.self_peer().clone();
        let current = ctx.profile().date_modified;

        me.receive_profile("stale".into(), ProfileStatus::Busy, String::new(), current);
        assert_eq!(me.display_name(), "laptop");

        let newer = current + chrono::Duration::seconds(60);
        me.receive_profile("phone-name".into(), ProfileStatus::Busy, "on the go".into(), newer);
        assert_eq!(ctx.profile().display_name, "phone-name");
        assert_eq!(me.profile().status, ProfileStatus::Busy);
        assert_eq!(me.profile().date_modified, newer);

        me.receive_display_image(vec![1, 2, 3], newer);
        assert_eq!(ctx.profile().display_image, vec![1, 2, 3]);
        me.receive_display_image(vec![9], newer);
        assert_eq!(ctx.profile().display_image, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_each_message_is_acknowledged_once() {
        const COUNT: u32 = 5;
        let hub = MemoryHub::new();
        let ctx = MeshContext::builder(UserIdentity::generate(), MeshConfig::default())
            .connections(Arc::new(hub.manager("10.0.0.1:9000".parse().unwrap())))
            .build()
            .unwrap();
        let _remote_manager = hub.manager("10.0.0.2:9000".parse().unwrap());
        let network = MeshNetwork::create_group(ctx.clone(), "Friends", "pw", false).unwrap();
        let secret = network.state().network_secret.to_vec();

        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (local, remote) = tokio::join!(
            SecureChannel::accept(Box::new(ours), ctx.channel_params(secret.clone(), None)),
            SecureChannel::connect(Box::new(theirs), ChannelParams::new(UserIdentity::generate(), secret)),
        );
        let remote_endpoint = Endpoint::Ip("10.0.0.2:9000".parse().unwrap());
        let connection = ctx.connections().make_connection(&remote_endpoint).await.unwrap();
        network.join(local.unwrap(), connection, false).await.unwrap();

        let (mut reader, mut writer) = tokio::io::split(remote.unwrap());
        for n in 0..COUNT {
            let packet = MeshNetworkPacket::Message(MessagePacket {
                message_number: n,
                message_type: MessageType::TextMessage,
                message_date: Utc::now(),
                message_text: format!("message {}", n),
                file: None,
            });
            frame::write_packet(&mut writer, &packet).await.unwrap();
        }

        let mut assembler = PacketAssembler::default();
        let mut acknowledged = Vec::new();
        while acknowledged.len() < COUNT as usize {
            let packet = tokio::time::timeout(Duration::from_secs(5), frame::read_packet(&mut reader, &mut assembler))
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let MeshNetworkPacket::MessageDeliveryNotification { message_number } = packet {
                acknowledged.push(message_number);
            }
        }
        assert_eq!(acknowledged, (0..COUNT).collect::<Vec<_>>());

        let extra = tokio::time::timeout(Duration::from_millis(300), async {
            loop {
                match frame::read_packet(&mut reader, &mut assembler).await {
                    Ok(Some(MeshNetworkPacket::MessageDeliveryNotification { message_number })) => {
                        return Some(message_number)
                    }
                    Ok(Some(_)) => continue,
                    _ => return None,
                }
            }
        })
        .await;
        assert!(!matches!(extra, Ok(Some(_))), "unexpected extra acknowledgment: {:?}", extra);

        let received: Vec<_> = network
            .get_messages(0, network.message_count())
            .unwrap()
            .into_iter()
            .filter(|m| m.message_type == MessageType::TextMessage)
            .map(|m| m.remote_message_number)
            .collect();
        assert_eq!(received, (0..COUNT).map(Some).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_state_restores_network() {
        let ctx = context(None);
        let network = MeshNetwork::create_group(ctx.clone(), "Friends", "pw", true).unwrap();
        network.set_mute(true);

        let restored = MeshNetwork::load(ctx, network.state()).unwrap();
        assert_eq!(restored.network_id(), network.network_id());
        assert!(restored.local_network_only());
        assert!(restored.is_muted());
        assert_eq!(restored.status(), MeshNetworkStatus::Offline);
    }

    #[test]
    fn test_shared_secret_changes_network_id() {
        let ctx = context(None);
        let network = MeshNetwork::create_group(ctx, "Friends", "pw", false).unwrap();
        let before = network.network_id();
        network.set_shared_secret("other");
        assert_ne!(network.network_id(), before);
        assert_eq!(network.network_id(), derive_group_network("friends", "other").network_id);
    }

    #[test]
    fn test_get_messages_clamps_to_count() {
        let ctx = context(None);
        let network = MeshNetwork::create_group(ctx, "Friends", "pw", false).unwrap();
        network.append_info("one");
        network.append_info("two");
        let messages = network.get_messages(1, 10).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_text, "two");
    }
}
