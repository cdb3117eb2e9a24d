//! Mesh error types.

use std::time::Duration;

use thiserror::Error;

use crate::crypto::{IdentityError, SymmetricError, UserId};
use crate::mesh::channel::SecureChannelError;
use crate::mesh::endpoint::Endpoint;
use crate::mesh::store::StoreError;

/// Errors that can occur during mesh operations.
#[derive(Error, Debug)]
pub enum MeshError {
    /// Connection could not be made or broke.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Secure channel handshake or authentication failed.
    #[error("Secure channel error: {0}")]
    SecureChannel(#[from] SecureChannelError),

    /// Message store failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization failed.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Out-of-protocol data on an established session.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The network is offline.
    #[error("Network is offline")]
    NetworkOffline,

    /// The session was disposed.
    #[error("Session closed")]
    SessionClosed,

    /// No data arrived on a data stream in time.
    #[error("Data stream read timed out after {0:?}")]
    ReadTimeout(Duration),

    /// The consumer of a data stream did not drain its buffer in time.
    #[error("Data stream feed timed out after {0:?}")]
    FeedTimeout(Duration),

    /// The remote peer closed the data stream.
    #[error("Data stream closed by remote peer")]
    StreamClosed,

    /// Pending invitation lookup found no matching message.
    #[error("Invitation message not found: {0}")]
    InvitationNotFound(String),

    /// Message number not present in the store.
    #[error("Message {0} not found")]
    MessageNotFound(u32),

    /// Peer not part of the network.
    #[error("Peer not found: {0}")]
    PeerNotFound(UserId),

    /// Remote endpoint is not allowed while the network is local-only.
    #[error("Endpoint {0} is not on the local network")]
    NotLocalEndpoint(Endpoint),

    /// Operation not valid in the current state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Identity error.
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Encryption error.
    #[error("Encryption error: {0}")]
    Symmetric(#[from] SymmetricError),

    /// Persisted state has an unknown version.
    #[error("State version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Supported version.
        expected: u8,
        /// Version found.
        got: u8,
    },

    /// Configuration could not be read or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for MeshError {
    fn from(e: bincode::Error) -> Self {
        MeshError::SerializationFailed(e.to_string())
    }
}
