//! Peer reachability snapshots.
//!
//! A [`MeshNetworkPeerInfo`] says "this peer is reachable at these endpoints".
//! It is persisted as a known peer and gossiped in peer exchange packets.
//! Equality and hashing only look at the user id, so the same peer seen over
//! different paths counts once.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::crypto::UserId;
use crate::mesh::endpoint::Endpoint;

/// Peer id, optional display name and known endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshNetworkPeerInfo {
    pub peer_user_id: UserId,
    pub display_name: Option<String>,
    pub endpoints: Vec<Endpoint>,
}

impl MeshNetworkPeerInfo {
    pub fn new(peer_user_id: UserId, display_name: Option<String>, endpoints: Vec<Endpoint>) -> Self {
        Self {
            peer_user_id,
            display_name,
            endpoints,
        }
    }
}

impl PartialEq for MeshNetworkPeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.peer_user_id == other.peer_user_id
    }
}

impl Eq for MeshNetworkPeerInfo {}

impl Hash for MeshNetworkPeerInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.peer_user_id.hash(state);
    }
}

/// Appends the entries of `items` whose peer is not yet in `list`.
pub fn merge_unique<I>(list: &mut Vec<MeshNetworkPeerInfo>, items: I)
where
    I: IntoIterator<Item = MeshNetworkPeerInfo>,
{
    for item in items {
        if !list.contains(&item) {
            list.push(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn id(b: u8) -> UserId {
        UserId([b; 32])
    }

    #[test]
    fn test_equality_ignores_endpoints_and_name() {
        let a = MeshNetworkPeerInfo::new(id(1), Some("alice".into()), vec!["10.0.0.1:1".parse().unwrap()]);
        let b = MeshNetworkPeerInfo::new(id(1), None, vec![]);
        let c = MeshNetworkPeerInfo::new(id(2), Some("alice".into()), a.endpoints.clone());

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_merge_unique_keeps_first() {
        let mut list = vec![MeshNetworkPeerInfo::new(id(1), Some("first".into()), vec![])];
        merge_unique(
            &mut list,
            vec![
                MeshNetworkPeerInfo::new(id(1), Some("second".into()), vec![]),
                MeshNetworkPeerInfo::new(id(2), None, vec![]),
            ],
        );

        assert_eq!(list.len(), 2);
        assert_eq!(list[0].display_name.as_deref(), Some("first"));
    }
}
