//! Message storage.
//!
//! A [`MessageStore`] is an append-only list of opaque records addressed by
//! index. Networks store serialized [`MessageItem`]s in it; the index of a
//! record is the message number.

mod file;
mod memory;
mod message;

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::crypto::SymmetricError;

pub use file::FileMessageStore;
pub use memory::MemoryMessageStore;
pub use message::{DeliveryStatus, FileAttachment, MessageItem, MessageRecipient, MessageType};

/// Errors that can occur in a message store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Record encryption failed: {0}")]
    Encryption(#[from] SymmetricError),

    #[error("Record {index} out of range (count {count})")]
    IndexOutOfRange { index: u32, count: u32 },

    #[error("Corrupt store: {0}")]
    Corrupt(String),

    #[error("Store has been deleted")]
    Deleted,
}

/// Append-only record storage with in-place update.
///
/// Callers serialize concurrent read-modify-write sequences themselves.
pub trait MessageStore: Send + Sync {
    /// Appends a record and returns its index.
    fn append(&self, record: &[u8]) -> Result<u32, StoreError>;

    /// Reads the record at `index`.
    fn read(&self, index: u32) -> Result<Vec<u8>, StoreError>;

    /// Replaces the record at `index`.
    fn update(&self, index: u32, record: &[u8]) -> Result<(), StoreError>;

    /// Number of records.
    fn count(&self) -> u32;

    /// Removes all records and any backing files.
    fn delete(&self) -> Result<(), StoreError>;
}

/// Opens the store for a network: a file store under `dir` when given,
/// otherwise an in-memory store.
pub fn open_message_store(
    dir: Option<&Path>,
    store_id: &str,
    key: &[u8; 32],
) -> Result<Arc<dyn MessageStore>, StoreError> {
    match dir {
        Some(dir) => Ok(Arc::new(FileMessageStore::open(dir, store_id, *key)?)),
        None => Ok(Arc::new(MemoryMessageStore::new())),
    }
}
