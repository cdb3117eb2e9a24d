//! Mesh connectivity classification.
//!
//! Every online peer contributes the list of peers it believes it is
//! connected to. The union of those lists is the network as a whole sees
//! it; a peer missing entries of the union (other than itself) only has a
//! partial view of the mesh.

use crate::crypto::UserId;
use crate::mesh::peer_info::{merge_unique, MeshNetworkPeerInfo};
use crate::mesh::types::PeerConnectivityStatus;

/// Union by user id of several connected-peer lists.
pub fn union_of<'a, I>(lists: I) -> Vec<MeshNetworkPeerInfo>
where
    I: IntoIterator<Item = &'a [MeshNetworkPeerInfo]>,
{
    let mut union = Vec::new();
    for list in lists {
        merge_unique(&mut union, list.iter().cloned());
    }
    union
}

/// Classifies one peer against the network-wide union.
///
/// Returns the status and the entries the peer is disconnected from.
pub fn classify(
    peer_user_id: &UserId,
    connected: &[MeshNetworkPeerInfo],
    union: &[MeshNetworkPeerInfo],
) -> (PeerConnectivityStatus, Vec<MeshNetworkPeerInfo>) {
    if connected.is_empty() {
        return (PeerConnectivityStatus::NoNetwork, Vec::new());
    }

    let disconnected: Vec<_> = union
        .iter()
        .filter(|info| info.peer_user_id != *peer_user_id && !connected.contains(info))
        .cloned()
        .collect();

    let status = if disconnected.is_empty() {
        PeerConnectivityStatus::FullMeshNetwork
    } else {
        PeerConnectivityStatus::PartialMeshNetwork
    };
    (status, disconnected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(b: u8) -> MeshNetworkPeerInfo {
        MeshNetworkPeerInfo::new(UserId([b; 32]), None, vec![])
    }

    fn id(b: u8) -> UserId {
        UserId([b; 32])
    }

    #[test]
    fn test_two_peers_reporting_each_other_are_full() {
        let a = vec![info(2)];
        let b = vec![info(1)];
        let union = union_of([a.as_slice(), b.as_slice()]);

        assert_eq!(classify(&id(1), &a, &union).0, PeerConnectivityStatus::FullMeshNetwork);
        assert_eq!(classify(&id(2), &b, &union).0, PeerConnectivityStatus::FullMeshNetwork);
    }

    #[test]
    fn test_peer_that_stops_reporting_becomes_partial() {
        // self (1) sees 2 and 3, 2 sees 1 and 3, 3 only sees 1
        let s = vec![info(2), info(3)];
        let two = vec![info(1), info(3)];
        let three = vec![info(1)];
        let union = union_of([s.as_slice(), two.as_slice(), three.as_slice()]);

        assert_eq!(classify(&id(1), &s, &union).0, PeerConnectivityStatus::FullMeshNetwork);
        assert_eq!(classify(&id(2), &two, &union).0, PeerConnectivityStatus::FullMeshNetwork);

        let (status, disconnected) = classify(&id(3), &three, &union);
        assert_eq!(status, PeerConnectivityStatus::PartialMeshNetwork);
        assert_eq!(disconnected, vec![info(2)]);
    }

    #[test]
    fn test_no_connections_is_no_network() {
        let union = vec![info(1), info(2)];
        let (status, disconnected) = classify(&id(3), &[], &union);
        assert_eq!(status, PeerConnectivityStatus::NoNetwork);
        assert!(disconnected.is_empty());
    }

    #[test]
    fn test_union_ignores_endpoints() {
        let a = vec![MeshNetworkPeerInfo::new(id(5), None, vec!["10.0.0.1:1".parse().unwrap()])];
        let b = vec![MeshNetworkPeerInfo::new(id(5), None, vec!["10.0.0.2:1".parse().unwrap()])];
        assert_eq!(union_of([a.as_slice(), b.as_slice()]).len(), 1);
    }
}
