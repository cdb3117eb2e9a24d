//! # meshchat - peer-to-peer encrypted chat mesh
//!
//! Independent nodes discover each other (DHT, LAN, TCP relay), establish
//! mutually authenticated encrypted channels keyed by a shared network secret,
//! and exchange chat messages, profile data and files.
//!
//! ## Overview
//!
//! - A **network** is one logical chat, private (1:1) or group, identified by a
//!   network id derived from the participants and a shared secret
//! - Every participant is a **peer**; a peer is online while it has at least one
//!   **session** (one authenticated channel, possibly several per peer)
//! - Sessions multiplex a control channel (port 0) and numbered **data
//!   sub-streams** used for file transfer
//! - Peers periodically gossip who they are connected to (**peer exchange**),
//!   which heals the topology and classifies connectivity as full or partial
//! - Messages are stored locally and acknowledged per message number
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use meshchat::crypto::UserIdentity;
//! use meshchat::mesh::transport::{MemoryDht, MemoryHub};
//! use meshchat::mesh::{MeshConfig, MeshContext, MeshNode};
//!
//! # async fn run() -> Result<(), meshchat::mesh::MeshError> {
//! let hub = MemoryHub::new();
//! let dht = MemoryDht::new();
//! let ctx = MeshContext::builder(UserIdentity::generate(), MeshConfig::default())
//!     .connections(Arc::new(hub.manager("10.0.0.1:9000".parse().unwrap())))
//!     .discovery(Arc::new(dht.clone()))
//!     .build()?;
//!
//! let node = MeshNode::new(ctx);
//! let network = node.create_group_network("friends", "shared secret", false)?;
//! network.send_text_message("hello everyone").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: identities, key derivation, symmetric encryption
//! - [`mesh`]: networks, peers, sessions, transports, stores
//! - [`logging`]: tracing subscriber setup for binaries

/// Mesh protocol version carried in the secure channel handshake.
pub const PROTOCOL_VERSION: u8 = 1;

pub mod crypto;
pub mod logging;
pub mod mesh;

pub use crypto::{UserId, UserIdentity};
pub use mesh::{MeshConfig, MeshContext, MeshError, MeshEvent, MeshNetwork, MeshNode};
