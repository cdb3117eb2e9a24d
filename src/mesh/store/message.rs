//! Stored chat messages.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MessageStore, StoreError};
use crate::crypto::UserId;
use crate::mesh::error::MeshError;
use crate::mesh::packet::MessagePacket;

/// Kind of stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Synthetic line generated by the node ("alice is online").
    Info,
    TextMessage,
    FileAttachment,
}

/// Delivery state of a message for one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Undelivered,
    Delivered,
}

/// One recipient of an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecipient {
    pub user_id: UserId,
    pub status: DeliveryStatus,
    pub delivered_on: Option<DateTime<Utc>>,
}

/// File attached to a message. `local_path` is set on the sending side and
/// once a download completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub file_name: String,
    pub file_size: u64,
    pub local_path: Option<PathBuf>,
}

/// A message as kept in the network's store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageItem {
    /// Store index, assigned on append.
    #[serde(skip)]
    pub message_number: u32,
    pub message_type: MessageType,
    pub message_date: DateTime<Utc>,
    /// `None` for info messages.
    pub sender_user_id: Option<UserId>,
    pub message_text: String,
    /// Recipients of a message sent by the local user.
    pub recipients: Vec<MessageRecipient>,
    /// Sender's message number, for received messages.
    pub remote_message_number: Option<u32>,
    pub file_attachment: Option<FileAttachment>,
}

impl MessageItem {
    /// Informational message.
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            message_number: 0,
            message_type: MessageType::Info,
            message_date: Utc::now(),
            sender_user_id: None,
            message_text: text.into(),
            recipients: Vec::new(),
            remote_message_number: None,
            file_attachment: None,
        }
    }

    /// Outgoing text message, undelivered to every recipient.
    pub fn text<I>(sender: UserId, text: impl Into<String>, recipients: I) -> Self
    where
        I: IntoIterator<Item = UserId>,
    {
        Self {
            message_type: MessageType::TextMessage,
            sender_user_id: Some(sender),
            message_text: text.into(),
            recipients: recipients
                .into_iter()
                .map(|user_id| MessageRecipient {
                    user_id,
                    status: DeliveryStatus::Undelivered,
                    delivered_on: None,
                })
                .collect(),
            ..Self::info("")
        }
    }

    /// Outgoing file attachment.
    pub fn file<I>(sender: UserId, attachment: FileAttachment, text: impl Into<String>, recipients: I) -> Self
    where
        I: IntoIterator<Item = UserId>,
    {
        Self {
            message_type: MessageType::FileAttachment,
            file_attachment: Some(attachment),
            ..Self::text(sender, text, recipients)
        }
    }

    /// Message received from `sender`.
    pub fn received(sender: UserId, packet: &MessagePacket) -> Self {
        Self {
            message_number: 0,
            message_type: packet.message_type,
            message_date: packet.message_date,
            sender_user_id: Some(sender),
            message_text: packet.message_text.clone(),
            recipients: Vec::new(),
            remote_message_number: Some(packet.message_number),
            file_attachment: packet.file.as_ref().map(|f| FileAttachment {
                file_name: f.file_name.clone(),
                file_size: f.file_size,
                local_path: None,
            }),
        }
    }

    /// True when every recipient acknowledged the message.
    pub fn is_delivered(&self) -> bool {
        self.recipients
            .iter()
            .all(|r| r.status == DeliveryStatus::Delivered)
    }

    /// Marks `user_id` delivered. Returns false if it is not a recipient.
    /// Re-marking keeps the first delivery time.
    pub fn mark_delivered(&mut self, user_id: &UserId) -> bool {
        match self.recipients.iter_mut().find(|r| r.user_id == *user_id) {
            Some(recipient) => {
                if recipient.status != DeliveryStatus::Delivered {
                    recipient.status = DeliveryStatus::Delivered;
                    recipient.delivered_on = Some(Utc::now());
                }
                true
            }
            None => false,
        }
    }

    pub fn is_sent_by(&self, user_id: &UserId) -> bool {
        self.sender_user_id.as_ref() == Some(user_id)
    }

    /// Appends the message and sets its message number.
    pub fn append_to(&mut self, store: &dyn MessageStore) -> Result<u32, MeshError> {
        let bytes = bincode::serialize(self)?;
        self.message_number = store.append(&bytes)?;
        Ok(self.message_number)
    }

    /// Reads message `number`.
    pub fn read_from(store: &dyn MessageStore, number: u32) -> Result<Self, MeshError> {
        let bytes = store.read(number).map_err(|e| match e {
            StoreError::IndexOutOfRange { .. } => MeshError::MessageNotFound(number),
            other => MeshError::Store(other),
        })?;
        let mut item: Self = bincode::deserialize(&bytes)?;
        item.message_number = number;
        Ok(item)
    }

    /// Rewrites the message in place.
    pub fn update_in(&self, store: &dyn MessageStore) -> Result<(), MeshError> {
        let bytes = bincode::serialize(self)?;
        store.update(self.message_number, &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::store::MemoryMessageStore;

    #[test]
    fn test_store_assigns_message_numbers() {
        let store = MemoryMessageStore::new();
        let mut info = MessageItem::info("alice is online");
        let mut text = MessageItem::text(UserId([1; 32]), "hi", [UserId([2; 32])]);

        assert_eq!(info.append_to(&store).unwrap(), 0);
        assert_eq!(text.append_to(&store).unwrap(), 1);

        let loaded = MessageItem::read_from(&store, 1).unwrap();
        assert_eq!(loaded, text);
        assert_eq!(loaded.message_number, 1);
    }

    #[test]
    fn test_mark_delivered_is_idempotent() {
        let bob = UserId([2; 32]);
        let mut item = MessageItem::text(UserId([1; 32]), "hi", [bob]);
        assert!(!item.is_delivered());

        assert!(item.mark_delivered(&bob));
        let first = item.recipients[0].delivered_on;
        assert!(item.is_delivered());

        assert!(item.mark_delivered(&bob));
        assert_eq!(item.recipients[0].delivered_on, first);
        assert!(!item.mark_delivered(&UserId([9; 32])));
    }

    #[test]
    fn test_missing_message() {
        let store = MemoryMessageStore::new();
        assert!(matches!(
            MessageItem::read_from(&store, 4),
            Err(MeshError::MessageNotFound(4))
        ));
    }
}
