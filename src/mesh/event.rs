//! Events raised by networks for the UI.

use crate::crypto::{NetworkId, UserId};
use crate::mesh::store::MessageItem;
use crate::mesh::types::{MeshNetworkStatus, PeerConnectivityStatus};

/// Notification from a network. Subscribe with [`MeshNetwork::subscribe`] or
/// [`MeshNode::subscribe`].
///
/// [`MeshNetwork::subscribe`]: crate::mesh::MeshNetwork::subscribe
/// [`MeshNode::subscribe`]: crate::mesh::MeshNode::subscribe
#[derive(Debug, Clone)]
pub enum MeshEvent {
    NetworkStatusChanged {
        network_id: NetworkId,
        status: MeshNetworkStatus,
    },
    PeerAdded {
        network_id: NetworkId,
        peer_user_id: UserId,
    },
    PeerStateChanged {
        network_id: NetworkId,
        peer_user_id: UserId,
        online: bool,
    },
    PeerTyping {
        network_id: NetworkId,
        peer_user_id: UserId,
    },
    PeerProfileChanged {
        network_id: NetworkId,
        peer_user_id: UserId,
    },
    PeerDisplayImageChanged {
        network_id: NetworkId,
        peer_user_id: UserId,
    },
    PeerConnectivityChanged {
        network_id: NetworkId,
        peer_user_id: UserId,
        status: PeerConnectivityStatus,
    },
    /// A message (chat or informational) was appended to the store.
    MessageReceived {
        network_id: NetworkId,
        message: MessageItem,
    },
    MessageDeliveryNotification {
        network_id: NetworkId,
        peer_user_id: UserId,
        message: MessageItem,
    },
    GroupDisplayImageChanged {
        network_id: NetworkId,
    },
    GroupLockNetworkChanged {
        network_id: NetworkId,
        locked: bool,
    },
    LocalNetworkOnlyChanged {
        network_id: NetworkId,
        enabled: bool,
    },
    /// A private chat invitation created a new offline network.
    InvitationReceived {
        network_id: NetworkId,
        peer_user_id: UserId,
    },
}

impl MeshEvent {
    pub fn network_id(&self) -> NetworkId {
        match self {
            MeshEvent::NetworkStatusChanged { network_id, .. }
            | MeshEvent::PeerAdded { network_id, .. }
            | MeshEvent::PeerStateChanged { network_id, .. }
            | MeshEvent::PeerTyping { network_id, .. }
            | MeshEvent::PeerProfileChanged { network_id, .. }
            | MeshEvent::PeerDisplayImageChanged { network_id, .. }
            | MeshEvent::PeerConnectivityChanged { network_id, .. }
            | MeshEvent::MessageReceived { network_id, .. }
            | MeshEvent::MessageDeliveryNotification { network_id, .. }
            | MeshEvent::GroupDisplayImageChanged { network_id }
            | MeshEvent::GroupLockNetworkChanged { network_id, .. }
            | MeshEvent::LocalNetworkOnlyChanged { network_id, .. }
            | MeshEvent::InvitationReceived { network_id, .. } => *network_id,
        }
    }
}
