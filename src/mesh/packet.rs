//! Control channel packets.
//!
//! Packets travel on port 0 of a session, serialized with bincode and prefixed
//! with a 4-byte little-endian length so a packet can span several frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mesh::error::MeshError;
use crate::mesh::peer_info::MeshNetworkPeerInfo;
use crate::mesh::store::{MessageItem, MessageType};
use crate::mesh::types::ProfileStatus;

/// Largest control packet accepted from a peer.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Message body as it travels between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePacket {
    /// Sender's store index of the message.
    pub message_number: u32,
    pub message_type: MessageType,
    pub message_date: DateTime<Utc>,
    pub message_text: String,
    pub file: Option<FileInfo>,
}

/// File attachment metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_name: String,
    pub file_size: u64,
}

/// Wire messages exchanged on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeshNetworkPacket {
    PingRequest,
    PingResponse,
    PeerExchange {
        peers: Vec<MeshNetworkPeerInfo>,
    },
    LocalNetworkOnly {
        enabled: bool,
        date_modified: DateTime<Utc>,
    },
    Profile {
        display_name: String,
        status: ProfileStatus,
        status_message: String,
        date_modified: DateTime<Utc>,
    },
    ProfileDisplayImage {
        image: Vec<u8>,
        date_modified: DateTime<Utc>,
    },
    GroupDisplayImage {
        image: Vec<u8>,
        date_modified: DateTime<Utc>,
    },
    GroupLockNetwork {
        locked: bool,
        date_modified: DateTime<Utc>,
    },
    MessageTypingNotification,
    Message(MessagePacket),
    MessageDeliveryNotification {
        message_number: u32,
    },
    FileRequest {
        message_number: u32,
        offset: u64,
        port: u16,
    },
}

impl MeshNetworkPacket {
    pub fn to_bytes(&self) -> Result<Vec<u8>, MeshError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MeshError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PingRequest => "PingRequest",
            Self::PingResponse => "PingResponse",
            Self::PeerExchange { .. } => "PeerExchange",
            Self::LocalNetworkOnly { .. } => "LocalNetworkOnly",
            Self::Profile { .. } => "Profile",
            Self::ProfileDisplayImage { .. } => "ProfileDisplayImage",
            Self::GroupDisplayImage { .. } => "GroupDisplayImage",
            Self::GroupLockNetwork { .. } => "GroupLockNetwork",
            Self::MessageTypingNotification => "MessageTypingNotification",
            Self::Message(_) => "Message",
            Self::MessageDeliveryNotification { .. } => "MessageDeliveryNotification",
            Self::FileRequest { .. } => "FileRequest",
        }
    }
}

impl From<&MessageItem> for MessagePacket {
    fn from(item: &MessageItem) -> Self {
        Self {
            message_number: item.message_number,
            message_type: item.message_type,
            message_date: item.message_date,
            message_text: item.message_text.clone(),
            file: item.file_attachment.as_ref().map(|f| FileInfo {
                file_name: f.file_name.clone(),
                file_size: f.file_size,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::UserId;

    #[test]
    fn test_peer_exchange_roundtrip() {
        let packet = MeshNetworkPacket::PeerExchange {
            peers: vec![MeshNetworkPeerInfo::new(
                UserId([3; 32]),
                Some("carol".into()),
                vec!["10.0.0.3:9000".parse().unwrap()],
            )],
        };

        let decoded = MeshNetworkPacket::from_bytes(&packet.to_bytes().unwrap()).unwrap();
        match decoded {
            MeshNetworkPacket::PeerExchange { peers } => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].display_name.as_deref(), Some("carol"));
                assert_eq!(peers[0].endpoints, vec!["10.0.0.3:9000".parse().unwrap()]);
            }
            other => panic!("unexpected packet {}", other.kind()),
        }
    }

    #[test]
    fn test_message_packet_from_item() {
        let item = MessageItem::text(UserId([1; 32]), "hello", [UserId([2; 32])]);
        let packet = MessagePacket::from(&item);
        assert_eq!(packet.message_type, MessageType::TextMessage);
        assert_eq!(packet.message_text, "hello");
        assert!(packet.file.is_none());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(MeshNetworkPacket::from_bytes(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
    }
}
