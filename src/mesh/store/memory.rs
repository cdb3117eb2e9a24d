//! In-memory message store.

use parking_lot::RwLock;

use super::{MessageStore, StoreError};

/// Message store that keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    records: RwLock<Vec<Vec<u8>>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for MemoryMessageStore {
    fn append(&self, record: &[u8]) -> Result<u32, StoreError> {
        let mut records = self.records.write();
        records.push(record.to_vec());
        Ok((records.len() - 1) as u32)
    }

    fn read(&self, index: u32) -> Result<Vec<u8>, StoreError> {
        let records = self.records.read();
        records
            .get(index as usize)
            .cloned()
            .ok_or(StoreError::IndexOutOfRange {
                index,
                count: records.len() as u32,
            })
    }

    fn update(&self, index: u32, record: &[u8]) -> Result<(), StoreError> {
        let mut records = self.records.write();
        let count = records.len() as u32;
        let slot = records
            .get_mut(index as usize)
            .ok_or(StoreError::IndexOutOfRange { index, count })?;
        *slot = record.to_vec();
        Ok(())
    }

    fn count(&self) -> u32 {
        self.records.read().len() as u32
    }

    fn delete(&self) -> Result<(), StoreError> {
        self.records.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_read_update() {
        let store = MemoryMessageStore::new();
        assert_eq!(store.append(b"first").unwrap(), 0);
        assert_eq!(store.append(b"second").unwrap(), 1);
        assert_eq!(store.count(), 2);

        store.update(0, b"changed").unwrap();
        assert_eq!(store.read(0).unwrap(), b"changed");
        assert_eq!(store.read(1).unwrap(), b"second");
    }

    #[test]
    fn test_out_of_range() {
        let store = MemoryMessageStore::new();
        assert!(matches!(
            store.read(0),
            Err(StoreError::IndexOutOfRange { index: 0, count: 0 })
        ));
        assert!(store.update(3, b"x").is_err());
    }
}
