//! Persisted network and node state.
//!
//! Both records are bincode-encoded and carry a version byte. The node
//! record holds the identity secret and is only written encrypted with a
//! passphrase.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::{decrypt_symmetric, encrypt_symmetric, NetworkId, UserId};
use crate::mesh::error::MeshError;
use crate::mesh::peer::{KnownPeer, PeerProfile};
use crate::mesh::types::{MeshNetworkStatus, NetworkType};

/// Current version of [`NetworkState`].
pub const NETWORK_STATE_VERSION: u8 = 1;

/// Current version of [`NodeState`].
pub const NODE_STATE_VERSION: u8 = 1;

/// Everything needed to bring a network back after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub version: u8,
    pub network_type: NetworkType,
    pub local_user_id: UserId,
    /// Group name. `None` for private networks.
    pub network_name: Option<String>,
    pub shared_secret: String,
    pub status: MeshNetworkStatus,
    pub network_id: NetworkId,
    pub network_secret: [u8; 32],
    pub store_id: String,
    pub store_key: [u8; 32],
    pub local_network_only: bool,
    pub local_network_only_date_modified: DateTime<Utc>,
    pub group_display_image: Vec<u8>,
    pub group_display_image_date_modified: DateTime<Utc>,
    pub group_lock_network: bool,
    pub group_lock_network_date_modified: DateTime<Utc>,
    pub mute: bool,
    /// The other peer of a private network, or every remote group member.
    pub known_peers: Vec<KnownPeer>,
}

impl NetworkState {
    pub fn to_bytes(&self) -> Result<Vec<u8>, MeshError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MeshError> {
        let state: Self = bincode::deserialize(bytes)?;
        state.validate()?;
        Ok(state)
    }

    /// Checks version and the per-type shape of the record.
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.version != NETWORK_STATE_VERSION {
            return Err(MeshError::VersionMismatch {
                expected: NETWORK_STATE_VERSION,
                got: self.version,
            });
        }
        match self.network_type {
            NetworkType::Private if self.known_peers.len() != 1 => Err(MeshError::SerializationFailed(
                format!("private network state has {} peers", self.known_peers.len()),
            )),
            NetworkType::Group if self.network_name.is_none() => {
                Err(MeshError::SerializationFailed("group network state has no name".into()))
            }
            _ => Ok(()),
        }
    }
}

/// A node's identity, profile and networks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub version: u8,
    pub identity_secret: [u8; 32],
    pub profile: PeerProfile,
    pub networks: Vec<NetworkState>,
}

impl NodeState {
    /// Encrypts the state with `passphrase` and writes it to `path`.
    pub fn save(&self, path: &Path, passphrase: &str) -> Result<(), MeshError> {
        let plain = bincode::serialize(self)?;
        let sealed = encrypt_symmetric(&plain, passphrase)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, sealed)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        debug!(path = %path.display(), networks = self.networks.len(), "node state saved");
        Ok(())
    }

    /// Reads and decrypts a state written by [`NodeState::save`].
    pub fn load(path: &Path, passphrase: &str) -> Result<Self, MeshError> {
        let sealed = fs::read(path)?;
        let plain = decrypt_symmetric(&sealed, passphrase)?;
        let state: Self = bincode::deserialize(&plain)?;
        if state.version != NODE_STATE_VERSION {
            return Err(MeshError::VersionMismatch {
                expected: NODE_STATE_VERSION,
                got: state.version,
            });
        }
        for network in &state.networks {
            network.validate()?;
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_group_network;
    use tempfile::tempdir;

    fn group_state() -> NetworkState {
        let keys = derive_group_network("friends", "secret");
        NetworkState {
            version: NETWORK_STATE_VERSION,
            network_type: NetworkType::Group,
            local_user_id: UserId([1; 32]),
            network_name: Some("friends".into()),
            shared_secret: "secret".into(),
            status: MeshNetworkStatus::Online,
            network_id: keys.network_id,
            network_secret: keys.network_secret,
            store_id: "abcd".into(),
            store_key: [7; 32],
            local_network_only: false,
            local_network_only_date_modified: DateTime::<Utc>::default(),
            group_display_image: Vec::new(),
            group_display_image_date_modified: DateTime::<Utc>::default(),
            group_lock_network: true,
            group_lock_network_date_modified: Utc::now(),
            mute: false,
            known_peers: vec![KnownPeer {
                user_id: UserId([2; 32]),
                profile: PeerProfile::default(),
                endpoints: vec!["192.168.1.5:9000".parse().unwrap()],
            }],
        }
    }

    #[test]
    fn test_network_state_bytes() {
        let state = group_state();
        let restored = NetworkState::from_bytes(&state.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut state = group_state();
        state.version = 9;
        let err = NetworkState::from_bytes(&state.to_bytes().unwrap()).unwrap_err();
        assert!(matches!(err, MeshError::VersionMismatch { expected: 1, got: 9 }));
    }

    #[test]
    fn test_private_state_needs_one_peer() {
        let mut state = group_state();
        state.network_type = NetworkType::Private;
        state.known_peers.clear();
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_node_state_requires_passphrase() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("profile.bin");
        let node = NodeState {
            version: NODE_STATE_VERSION,
            identity_secret: [3; 32],
            profile: PeerProfile::default(),
            networks: vec![group_state()],
        };

        node.save(&path, "correct horse").unwrap();
        assert_eq!(NodeState::load(&path, "correct horse").unwrap(), node);
        assert!(matches!(
            NodeState::load(&path, "wrong").unwrap_err(),
            MeshError::Symmetric(_)
        ));
    }
}
