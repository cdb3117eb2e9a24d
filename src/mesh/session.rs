//! One authenticated channel to one peer.
//!
//! A session multiplexes the control channel (port 0) and data sub-streams
//! over a [`SecureChannel`]. A dedicated task reads frames, dispatches control
//! packets to the owning peer and network, and feeds data ports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, trace, warn};

use crate::crypto::UserId;
use crate::mesh::channel::{ChannelFault, CipherSuite, SecureChannel};
use crate::mesh::data_stream::{DataStream, StreamBuffer};
use crate::mesh::endpoint::Endpoint;
use crate::mesh::error::MeshError;
use crate::mesh::frame::{self, PacketAssembler, CONTROL_PORT};
use crate::mesh::network::MeshNetwork;
use crate::mesh::packet::MeshNetworkPacket;
use crate::mesh::peer::Peer;
use crate::mesh::peer_info::MeshNetworkPeerInfo;
use crate::mesh::transfer;
use crate::mesh::transport::Connection;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

struct StreamTable {
    buffers: HashMap<u16, Arc<StreamBuffer>>,
    last_port: u16,
}

/// Read side of a session, handed to [`Session::spawn_read_loop`] once the
/// session is registered with its peer.
pub(crate) struct SessionReader(ReadHalf<SecureChannel>);

/// Live channel to a peer.
pub struct Session {
    id: u64,
    weak_self: Weak<Session>,
    peer: Weak<Peer>,
    network: Weak<MeshNetwork>,
    connection: Arc<dyn Connection>,
    remote_user_id: UserId,
    remote_endpoint: Endpoint,
    cipher: CipherSuite,
    is_client: bool,
    writer: tokio::sync::Mutex<Option<WriteHalf<SecureChannel>>>,
    fault: ChannelFault,
    streams: Mutex<StreamTable>,
    peer_exchange: RwLock<Vec<MeshNetworkPeerInfo>>,
    disposed: AtomicBool,
    read_timeout: Duration,
    feed_timeout: Duration,
    buffer_size: usize,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_user_id", &self.remote_user_id)
            .field("remote_endpoint", &self.remote_endpoint)
            .field("cipher", &self.cipher)
            .field("is_client", &self.is_client)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        peer: &Arc<Peer>,
        network: &Arc<MeshNetwork>,
        channel: SecureChannel,
        connection: Arc<dyn Connection>,
        is_client: bool,
    ) -> (Arc<Self>, SessionReader) {
        let config = network.context().config();
        let remote_endpoint = channel
            .remote_endpoint()
            .cloned()
            .unwrap_or_else(|| connection.remote_endpoint());
        let remote_user_id = channel.remote_user_id();
        let cipher = channel.selected_cipher();
        let fault = channel.fault();
        let (reader, writer) = tokio::io::split(channel);

        // Clients allocate odd ports, servers even ports. Both step by two
        // from here, so the first allocation is 1 or 2.
        let last_port = if is_client { u16::MAX } else { 0 };

        let session = Arc::new_cyclic(|weak_self| Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            weak_self: weak_self.clone(),
            peer: Arc::downgrade(peer),
            network: Arc::downgrade(network),
            connection,
            remote_user_id,
            remote_endpoint,
            cipher,
            is_client,
            writer: tokio::sync::Mutex::new(Some(writer)),
            fault,
            streams: Mutex::new(StreamTable {
                buffers: HashMap::new(),
                last_port,
            }),
            peer_exchange: RwLock::new(Vec::new()),
            disposed: AtomicBool::new(false),
            read_timeout: config.read_timeout(),
            feed_timeout: config.feed_timeout(),
            buffer_size: config.data_stream_buffer_size,
        });
        (session, SessionReader(reader))
    }

    pub(crate) fn spawn_read_loop(self: &Arc<Self>, reader: SessionReader) {
        tokio::spawn(self.clone().read_loop(reader.0));
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_user_id(&self) -> UserId {
        self.remote_user_id
    }

    pub fn remote_endpoint(&self) -> &Endpoint {
        &self.remote_endpoint
    }

    pub fn cipher(&self) -> CipherSuite {
        self.cipher
    }

    /// True for the side that opened the channel.
    pub fn is_client(&self) -> bool {
        self.is_client
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Peer list most recently received from the remote side.
    pub fn peer_exchange_list(&self) -> Vec<MeshNetworkPeerInfo> {
        self.peer_exchange.read().clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Sends one control packet.
    pub async fn send_packet(&self, packet: &MeshNetworkPacket) -> Result<(), MeshError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(MeshError::SessionClosed)?;
        frame::write_packet(writer, packet).await
    }

    pub(crate) async fn write_frame(&self, port: u16, payload: &[u8]) -> Result<(), MeshError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(MeshError::SessionClosed)?;
        frame::write_frame(writer, port, payload).await?;
        Ok(())
    }

    /// Opens a data sub-stream on the next free port of this side.
    pub fn open_data_stream(&self) -> Result<DataStream, MeshError> {
        let mut table = self.streams.lock();
        let port = next_free_port(&table.buffers, table.last_port)
            .ok_or_else(|| MeshError::InvalidOperation("no free data stream port".into()))?;
        table.last_port = port;
        Ok(self.register_port(&mut table, port))
    }

    /// Opens a data sub-stream on a port chosen by the remote side.
    pub(crate) fn open_data_stream_at(&self, port: u16) -> Result<DataStream, MeshError> {
        if port == CONTROL_PORT {
            return Err(MeshError::InvalidOperation("port 0 is the control channel".into()));
        }
        let mut table = self.streams.lock();
        if table.buffers.contains_key(&port) {
            return Err(MeshError::InvalidOperation(format!("port {} already in use", port)));
        }
        Ok(self.register_port(&mut table, port))
    }

    fn register_port(&self, table: &mut StreamTable, port: u16) -> DataStream {
        let buffer = StreamBuffer::new(self.buffer_size);
        table.buffers.insert(port, buffer.clone());
        if self.is_disposed() {
            buffer.set_eof();
        }
        DataStream::new(self.weak_self.clone(), port, buffer, self.read_timeout)
    }

    pub(crate) fn release_port(&self, port: u16) {
        self.streams.lock().buffers.remove(&port);
    }

    /// Ends the session gracefully. The remote side does not reconnect.
    pub async fn disconnect(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(session = self.id, peer = %self.remote_user_id.short(), "disconnecting");
        self.shutdown_writer(true).await;
    }

    async fn shutdown_writer(&self, send_close: bool) {
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            if send_close {
                let _ = frame::write_frame(&mut writer, CONTROL_PORT, &[]).await;
            }
            let _ = writer.shutdown().await;
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: ReadHalf<SecureChannel>) {
        let result = self.run(&mut reader).await;
        let graceful = match &result {
            Ok(()) => {
                debug!(session = self.id, peer = %self.remote_user_id.short(), "remote closed session");
                true
            }
            Err(e) => {
                debug!(session = self.id, peer = %self.remote_user_id.short(), error = %e, "session ended");
                false
            }
        };
        self.finish(graceful).await;
    }

    /// `Ok` only for a graceful close by the remote side: a zero-length
    /// control frame, or end of stream at a frame boundary on a channel that
    /// saw no transport or record error.
    async fn run(&self, reader: &mut ReadHalf<SecureChannel>) -> Result<(), MeshError> {
        let mut assembler = PacketAssembler::default();
        loop {
            let Some((port, payload)) = frame::read_frame(reader).await? else {
                if self.fault.is_set() || assembler.has_partial() {
                    return Err(MeshError::SessionClosed);
                }
                return Ok(());
            };

            if port == CONTROL_PORT {
                if payload.is_empty() {
                    return Ok(());
                }
                for packet in assembler.push(&payload)? {
                    self.handle_packet(packet).await?;
                }
                continue;
            }

            let buffer = self.streams.lock().buffers.get(&port).cloned();
            match buffer {
                Some(buffer) => {
                    match buffer.feed(&payload, self.feed_timeout).await {
                        Ok(()) => {}
                        Err(MeshError::StreamClosed) => {
                            trace!(session = self.id, port, "frame for closed port dropped");
                            self.release_port(port);
                        }
                        Err(e) => {
                            warn!(session = self.id, port, error = %e, "data stream stalled, closing port");
                            buffer.set_eof();
                            self.release_port(port);
                        }
                    }
                }
                None => trace!(session = self.id, port, "frame for unknown port dropped"),
            }
        }
    }

    async fn finish(&self, graceful: bool) {
        let disposed_locally = self.disposed.swap(true, Ordering::SeqCst);

        let buffers: Vec<_> = self.streams.lock().buffers.drain().map(|(_, b)| b).collect();
        for buffer in buffers {
            buffer.set_eof();
        }
        self.shutdown_writer(false).await;

        if let Some(peer) = self.peer.upgrade() {
            peer.remove_session(self.id);
        }

        if !graceful && !disposed_locally {
            if let Some(network) = self.network.upgrade() {
                debug!(endpoint = %self.remote_endpoint, "reconnecting after session loss");
                network.begin_make_connection(self.remote_endpoint.clone(), None);
            }
        }
    }

    async fn handle_packet(&self, packet: MeshNetworkPacket) -> Result<(), MeshError> {
        let network = self.network.upgrade().ok_or(MeshError::SessionClosed)?;
        let peer = self.peer.upgrade().ok_or(MeshError::SessionClosed)?;
        trace!(session = self.id, packet = packet.kind(), "control packet");

        match packet {
            MeshNetworkPacket::PingRequest => {
                self.send_packet(&MeshNetworkPacket::PingResponse).await?;
            }
            MeshNetworkPacket::PingResponse => {}
            MeshNetworkPacket::PeerExchange { peers } => {
                *self.peer_exchange.write() = peers.clone();
                network.update_connectivity_status();

                let local = network.local_user_id();
                for info in peers.into_iter().filter(|info| info.peer_user_id != local) {
                    for endpoint in info.endpoints {
                        network.begin_make_connection(endpoint, Some(self.connection.clone()));
                    }
                }
            }
            MeshNetworkPacket::LocalNetworkOnly { enabled, date_modified } => {
                network.receive_local_network_only(&peer, enabled, date_modified);
            }
            MeshNetworkPacket::Profile {
                display_name,
                status,
                status_message,
                date_modified,
            } => {
                peer.receive_profile(display_name, status, status_message, date_modified);
            }
            MeshNetworkPacket::ProfileDisplayImage { image, date_modified } => {
                peer.receive_display_image(image, date_modified);
            }
            MeshNetworkPacket::GroupDisplayImage { image, date_modified } => {
                network.receive_group_display_image(&peer, image, date_modified);
            }
            MeshNetworkPacket::GroupLockNetwork { locked, date_modified } => {
                network.receive_group_lock_network(&peer, locked, date_modified);
            }
            MeshNetworkPacket::MessageTypingNotification => {
                network.receive_typing_notification(&peer);
            }
            MeshNetworkPacket::Message(message) => {
                let message_number = message.message_number;
                match network.receive_message(&peer, message) {
                    Ok(()) => {
                        self.send_packet(&MeshNetworkPacket::MessageDeliveryNotification { message_number })
                            .await?;
                    }
                    Err(e) => warn!(peer = %peer.user_id().short(), error = %e, "failed to store message"),
                }
            }
            MeshNetworkPacket::MessageDeliveryNotification { message_number } => {
                if let Err(e) = network.receive_delivery_notification(&peer, message_number).await {
                    debug!(peer = %peer.user_id().short(), message_number, error = %e, "delivery notification ignored");
                }
            }
            MeshNetworkPacket::FileRequest {
                message_number,
                offset,
                port,
            } => {
                if let Some(session) = self.weak_self.upgrade() {
                    tokio::spawn(transfer::serve_file_request(session, network, message_number, offset, port));
                }
            }
        }
        Ok(())
    }
}

/// Next port after `last` with the same parity, skipping 0 and ports in use.
fn next_free_port<V>(in_use: &HashMap<u16, V>, last: u16) -> Option<u16> {
    let mut port = last;
    for _ in 0..=(u16::MAX / 2) {
        port = port.wrapping_add(2);
        if port != CONTROL_PORT && !in_use.contains_key(&port) {
            return Some(port);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::UserIdentity;
    use crate::mesh::channel::ChannelParams;
    use crate::mesh::config::MeshConfig;
    use crate::mesh::transport::{MemoryConnectionManager, MemoryHub};
    use crate::mesh::MeshContext;
    use tokio::sync::oneshot;

    struct Harness {
        network: Arc<MeshNetwork>,
        _hub: MemoryHub,
        _remote: MemoryConnectionManager,
    }

    fn harness() -> Harness {
        let hub = MemoryHub::new();
        let ctx = MeshContext::builder(UserIdentity::generate(), MeshConfig::default())
            .connections(Arc::new(hub.manager("10.0.0.1:9000".parse().unwrap())))
            .build()
            .unwrap();
        let network = MeshNetwork::create_group(ctx, "Friends", "pw", false).unwrap();
        let remote = hub.manager("10.0.0.2:9000".parse().unwrap());
        Harness {
            network,
            _hub: hub,
            _remote: remote,
        }
    }

    /// Local and remote channels joined through a forwarder. Firing the
    /// returned sender stops forwarding and writes an oversized record
    /// header toward the local side.
    async fn channel_pair(network: &Arc<MeshNetwork>) -> (SecureChannel, SecureChannel, oneshot::Sender<()>) {
        let (ours, mut near) = tokio::io::duplex(64 * 1024);
        let (mut far, theirs) = tokio::io::duplex(64 * 1024);
        let (cut_tx, cut_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::io::copy_bidirectional(&mut near, &mut far) => {}
                Ok(()) = cut_rx => {
                    let _ = near.write_all(&[0xFF; 8]).await;
                }
            }
        });

        let secret = network.state().network_secret.to_vec();
        let params = network.context().channel_params(secret.clone(), None);
        let (local, remote) = tokio::join!(
            SecureChannel::accept(Box::new(ours), params),
            SecureChannel::connect(Box::new(theirs), ChannelParams::new(UserIdentity::generate(), secret)),
        );
        (local.unwrap(), remote.unwrap(), cut_tx)
    }

    async fn run_session(network: &Arc<MeshNetwork>, channel: SecureChannel) -> Result<(), MeshError> {
        let endpoint = Endpoint::Ip("10.0.0.2:9000".parse().unwrap());
        let connection = network.context().connections().make_connection(&endpoint).await.unwrap();
        let (session, reader) = Session::new(network.self_peer(), network, channel, connection, false);
        let mut reader = reader.0;
        tokio::time::timeout(Duration::from_secs(5), session.run(&mut reader))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_end_of_stream_at_frame_boundary_is_graceful() {
        let h = harness();
        let (local, mut remote, _cut) = channel_pair(&h.network).await;

        frame::write_packet(&mut remote, &MeshNetworkPacket::PingResponse).await.unwrap();
        remote.shutdown().await.unwrap();

        assert!(run_session(&h.network, local).await.is_ok());
    }

    #[tokio::test]
    async fn test_broken_channel_is_not_graceful() {
        let h = harness();
        let (local, _remote_channel, cut) = channel_pair(&h.network).await;

        cut.send(()).unwrap();

        assert!(matches!(
            run_session(&h.network, local).await,
            Err(MeshError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_end_of_stream_inside_a_packet_is_not_graceful() {
        let h = harness();
        let (local, mut remote, _cut) = channel_pair(&h.network).await;

        // packet header announcing 100 bytes, followed by only 3
        let mut payload = 100u32.to_le_bytes().to_vec();
        payload.extend_from_slice(&[1, 2, 3]);
        frame::write_frame(&mut remote, CONTROL_PORT, &payload).await.unwrap();
        remote.shutdown().await.unwrap();

        assert!(matches!(
            run_session(&h.network, local).await,
            Err(MeshError::SessionClosed)
        ));
    }

    #[test]
    fn test_client_ports_are_odd() {
        let in_use: HashMap<u16, ()> = HashMap::new();
        assert_eq!(next_free_port(&in_use, u16::MAX), Some(1));
        assert_eq!(next_free_port(&in_use, 1), Some(3));
    }

    #[test]
    fn test_server_ports_are_even_and_skip_control() {
        let in_use: HashMap<u16, ()> = HashMap::new();
        assert_eq!(next_free_port(&in_use, 0), Some(2));
        assert_eq!(next_free_port(&in_use, u16::MAX - 1), Some(2));
    }

    #[test]
    fn test_ports_in_use_are_skipped() {
        let in_use: HashMap<u16, ()> = [(3, ()), (5, ())].into_iter().collect();
        assert_eq!(next_free_port(&in_use, 1), Some(7));
    }

    #[test]
    fn test_client_wraps_around() {
        let in_use: HashMap<u16, ()> = HashMap::new();
        assert_eq!(next_free_port(&in_use, u16::MAX - 2), Some(u16::MAX));
        assert_eq!(next_free_port(&in_use, u16::MAX), Some(1));
    }
}
