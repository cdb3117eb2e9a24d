//! Small enums shared by networks, peers and packets.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of chat a network carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkType {
    /// One-to-one chat.
    Private,
    /// Named group chat.
    Group,
}

/// Whether a network takes part in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MeshNetworkStatus {
    /// Timers stopped, no sessions.
    #[default]
    Offline,
    /// Announcing, connecting and accepting.
    Online,
}

/// How well a peer is connected to the rest of the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PeerConnectivityStatus {
    /// The peer has no connections.
    #[default]
    NoNetwork,
    /// The peer misses some peers the rest of the network can see.
    PartialMeshNetwork,
    /// The peer is connected to every known peer.
    FullMeshNetwork,
}

/// User-chosen availability shown next to the display name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProfileStatus {
    #[default]
    None,
    Active,
    Inactive,
    Busy,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkType::Private => write!(f, "private"),
            NetworkType::Group => write!(f, "group"),
        }
    }
}

impl fmt::Display for MeshNetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshNetworkStatus::Offline => write!(f, "offline"),
            MeshNetworkStatus::Online => write!(f, "online"),
        }
    }
}

impl fmt::Display for ProfileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileStatus::None => write!(f, "none"),
            ProfileStatus::Active => write!(f, "active"),
            ProfileStatus::Inactive => write!(f, "inactive"),
            ProfileStatus::Busy => write!(f, "busy"),
        }
    }
}
