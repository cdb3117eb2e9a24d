//! Peer discovery.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::crypto::ChannelId;
use crate::mesh::endpoint::{DhtNetworkType, Endpoint};

/// Receives endpoints found for a network or masked user id.
pub type DiscoveryCallback = Arc<dyn Fn(DhtNetworkType, Vec<Endpoint>) + Send + Sync>;

/// DHT / LAN / bootstrap discovery.
///
/// Both calls return immediately; results arrive through the callback,
/// possibly several times (once per network type).
pub trait PeerDiscovery: Send + Sync {
    /// Publishes `local_endpoint` under `id` and reports the other endpoints
    /// announced under it.
    fn begin_announce(
        &self,
        id: &ChannelId,
        local_only: bool,
        local_endpoint: Option<Endpoint>,
        callback: DiscoveryCallback,
    );

    /// Reports endpoints announced under `id` without publishing.
    fn begin_find_peers(&self, id: &ChannelId, local_only: bool, callback: DiscoveryCallback);
}

fn report(endpoints: Vec<Endpoint>, local_only: bool, callback: &DiscoveryCallback) {
    let mut by_type: HashMap<DhtNetworkType, Vec<Endpoint>> = HashMap::new();
    for endpoint in endpoints {
        if local_only && !endpoint.is_private() {
            continue;
        }
        by_type.entry(endpoint.network_type()).or_default().push(endpoint);
    }
    for (network_type, endpoints) in by_type {
        callback(network_type, endpoints);
    }
}

/// In-process DHT shared by every node that holds a clone.
#[derive(Clone, Default)]
pub struct MemoryDht {
    table: Arc<Mutex<HashMap<ChannelId, Vec<Endpoint>>>>,
}

impl MemoryDht {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoints announced under `id`.
    pub fn lookup(&self, id: &ChannelId) -> Vec<Endpoint> {
        self.table.lock().get(id).cloned().unwrap_or_default()
    }
}

impl PeerDiscovery for MemoryDht {
    fn begin_announce(
        &self,
        id: &ChannelId,
        local_only: bool,
        local_endpoint: Option<Endpoint>,
        callback: DiscoveryCallback,
    ) {
        let others = {
            let mut table = self.table.lock();
            let entry = table.entry(*id).or_default();
            if let Some(local) = &local_endpoint {
                if !entry.contains(local) {
                    entry.push(local.clone());
                }
            }
            entry
                .iter()
                .filter(|ep| Some(*ep) != local_endpoint.as_ref())
                .cloned()
                .collect::<Vec<_>>()
        };

        trace!(id = %id.short(), found = others.len(), "announce");
        report(others, local_only, &callback);
    }

    fn begin_find_peers(&self, id: &ChannelId, local_only: bool, callback: DiscoveryCallback) {
        report(self.lookup(id), local_only, &callback);
    }
}

/// Fixed list of bootstrap endpoints reported for every lookup.
#[derive(Clone, Debug, Default)]
pub struct StaticDiscovery {
    endpoints: Vec<Endpoint>,
}

impl StaticDiscovery {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }
}

impl PeerDiscovery for StaticDiscovery {
    fn begin_announce(
        &self,
        _id: &ChannelId,
        local_only: bool,
        local_endpoint: Option<Endpoint>,
        callback: DiscoveryCallback,
    ) {
        let endpoints = self
            .endpoints
            .iter()
            .filter(|ep| Some(*ep) != local_endpoint.as_ref())
            .cloned()
            .collect();
        report(endpoints, local_only, &callback);
    }

    fn begin_find_peers(&self, _id: &ChannelId, local_only: bool, callback: DiscoveryCallback) {
        report(self.endpoints.clone(), local_only, &callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (DiscoveryCallback, Arc<Mutex<Vec<(DhtNetworkType, Vec<Endpoint>)>>>) {
        let found = Arc::new(Mutex::new(Vec::new()));
        let sink = found.clone();
        let callback: DiscoveryCallback = Arc::new(move |t, eps| sink.lock().push((t, eps)));
        (callback, found)
    }

    #[test]
    fn test_announce_reports_other_nodes() {
        let dht = MemoryDht::new();
        let id = ChannelId([1; 32]);
        let a: Endpoint = "10.0.0.1:1".parse().unwrap();
        let b: Endpoint = "10.0.0.2:1".parse().unwrap();

        let (cb, found) = collector();
        dht.begin_announce(&id, false, Some(a.clone()), cb.clone());
        assert!(found.lock().is_empty());

        dht.begin_announce(&id, false, Some(b.clone()), cb);
        let found = found.lock();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0], (DhtNetworkType::LocalNetwork, vec![a.clone()]));
        assert_eq!(dht.lookup(&id), vec![a, b]);
    }

    #[test]
    fn test_local_only_filters_public() {
        let dht = MemoryDht::new();
        let id = ChannelId([2; 32]);
        dht.begin_announce(&id, false, Some("8.8.8.8:1".parse().unwrap()), Arc::new(|_, _| {}));
        dht.begin_announce(&id, false, Some("192.168.1.5:1".parse().unwrap()), Arc::new(|_, _| {}));

        let (cb, found) = collector();
        dht.begin_find_peers(&id, true, cb);
        let found = found.lock();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1, vec!["192.168.1.5:1".parse().unwrap()]);
    }

    #[test]
    fn test_static_discovery_groups_by_type() {
        let discovery = StaticDiscovery::new(vec![
            "8.8.8.8:1".parse().unwrap(),
            "10.0.0.1:1".parse().unwrap(),
        ]);

        let (cb, found) = collector();
        discovery.begin_find_peers(&ChannelId([0; 32]), false, cb);
        let mut types: Vec<_> = found.lock().iter().map(|(t, _)| *t).collect();
        types.sort_by_key(|t| format!("{:?}", t));
        assert_eq!(types, vec![DhtNetworkType::IPv4Internet, DhtNetworkType::LocalNetwork]);
    }
}
