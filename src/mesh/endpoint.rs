//! Network endpoints.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of network an endpoint was discovered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DhtNetworkType {
    /// Public IPv4 internet.
    IPv4Internet,
    /// Public IPv6 internet.
    IPv6Internet,
    /// Local network (private addresses).
    LocalNetwork,
    /// Tor hidden services.
    TorNetwork,
}

/// Where a peer can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    /// IP socket address.
    Ip(SocketAddr),
    /// Tor hidden service.
    Onion {
        /// `.onion` host name.
        host: String,
        /// Service port.
        port: u16,
    },
}

impl Endpoint {
    /// True for loopback, private and link-local addresses.
    pub fn is_private(&self) -> bool {
        match self {
            Endpoint::Ip(addr) => is_private_ip(&addr.ip()),
            Endpoint::Onion { .. } => false,
        }
    }

    /// The discovery network this endpoint belongs to.
    pub fn network_type(&self) -> DhtNetworkType {
        match self {
            Endpoint::Onion { .. } => DhtNetworkType::TorNetwork,
            Endpoint::Ip(_) if self.is_private() => DhtNetworkType::LocalNetwork,
            Endpoint::Ip(SocketAddr::V4(_)) => DhtNetworkType::IPv4Internet,
            Endpoint::Ip(SocketAddr::V6(_)) => DhtNetworkType::IPv6Internet,
        }
    }

    /// Service port.
    pub fn port(&self) -> u16 {
        match self {
            Endpoint::Ip(addr) => addr.port(),
            Endpoint::Onion { port, .. } => *port,
        }
    }

    /// Socket address, when this is an IP endpoint.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::Ip(addr) => Some(*addr),
            Endpoint::Onion { .. } => None,
        }
    }
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_ip(&IpAddr::V4(v4));
            }
            v6.is_loopback() || is_unique_local(v6) || is_unicast_link_local(v6)
        }
    }
}

// fc00::/7
fn is_unique_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

// fe80::/10
fn is_unicast_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ip(addr) => write!(f, "{}", addr),
            Endpoint::Onion { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Ip(addr)
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Endpoint::Ip(addr));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("Missing port in endpoint: {}", s))?;
        if !host.ends_with(".onion") {
            return Err(format!("Invalid endpoint: {}", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("Invalid port in endpoint {}: {}", s, e))?;

        Ok(Endpoint::Onion {
            host: host.to_string(),
            port,
        })
    }
}
