//! Encrypted append-only file store.
//!
//! Two files per store:
//! - `<id>.data`: records as `[u32 LE length][nonce || ciphertext]`
//! - `<id>.index`: one u64 LE offset into the data file per record
//!
//! An update appends the new record and rewrites its index slot, so the data
//! file only ever grows.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use zeroize::Zeroize;

use super::{MessageStore, StoreError};
use crate::crypto::{decrypt_with_key, encrypt_with_key};

/// Largest encrypted record accepted when reading.
const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

struct OpenFiles {
    index: File,
    data: File,
    offsets: Vec<u64>,
}

/// Message store backed by an index file and a data file.
pub struct FileMessageStore {
    index_path: PathBuf,
    data_path: PathBuf,
    key: [u8; 32],
    files: Mutex<Option<OpenFiles>>,
}

impl FileMessageStore {
    /// Opens or creates the store `store_id` under `dir`.
    pub fn open(dir: &Path, store_id: &str, key: [u8; 32]) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let index_path = dir.join(format!("{}.index", store_id));
        let data_path = dir.join(format!("{}.data", store_id));

        let mut index = open_rw(&index_path)?;
        let data = open_rw(&data_path)?;

        let mut raw = Vec::new();
        index.read_to_end(&mut raw)?;
        if raw.len() % 8 != 0 {
            return Err(StoreError::Corrupt(format!(
                "index file {} has a partial entry",
                index_path.display()
            )));
        }
        let offsets = raw
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();

        Ok(Self {
            index_path,
            data_path,
            key,
            files: Mutex::new(Some(OpenFiles {
                index,
                data,
                offsets,
            })),
        })
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    fn write_record(&self, data: &mut File, record: &[u8]) -> Result<u64, StoreError> {
        let encrypted = encrypt_with_key(record, &self.key)?;
        let offset = data.seek(SeekFrom::End(0))?;
        data.write_all(&(encrypted.len() as u32).to_le_bytes())?;
        data.write_all(&encrypted)?;
        data.flush()?;
        Ok(offset)
    }
}

impl MessageStore for FileMessageStore {
    fn append(&self, record: &[u8]) -> Result<u32, StoreError> {
        let mut guard = self.files.lock();
        let files = guard.as_mut().ok_or(StoreError::Deleted)?;

        let offset = self.write_record(&mut files.data, record)?;
        files.index.seek(SeekFrom::End(0))?;
        files.index.write_all(&offset.to_le_bytes())?;
        files.index.flush()?;
        files.offsets.push(offset);

        Ok((files.offsets.len() - 1) as u32)
    }

    fn read(&self, index: u32) -> Result<Vec<u8>, StoreError> {
        let mut guard = self.files.lock();
        let files = guard.as_mut().ok_or(StoreError::Deleted)?;

        let offset = *files
            .offsets
            .get(index as usize)
            .ok_or(StoreError::IndexOutOfRange {
                index,
                count: files.offsets.len() as u32,
            })?;

        files.data.seek(SeekFrom::Start(offset))?;
        let mut len_bytes = [0u8; 4];
        files.data.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes);
        if len > MAX_RECORD_SIZE {
            return Err(StoreError::Corrupt(format!("record {} too large: {}", index, len)));
        }

        let mut encrypted = vec![0u8; len as usize];
        files.data.read_exact(&mut encrypted)?;
        Ok(decrypt_with_key(&encrypted, &self.key)?)
    }

    fn update(&self, index: u32, record: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.files.lock();
        let files = guard.as_mut().ok_or(StoreError::Deleted)?;

        let count = files.offsets.len() as u32;
        if index >= count {
            return Err(StoreError::IndexOutOfRange { index, count });
        }

        let offset = self.write_record(&mut files.data, record)?;
        files.index.seek(SeekFrom::Start(u64::from(index) * 8))?;
        files.index.write_all(&offset.to_le_bytes())?;
        files.index.flush()?;
        files.offsets[index as usize] = offset;

        Ok(())
    }

    fn count(&self) -> u32 {
        self.files
            .lock()
            .as_ref()
            .map(|f| f.offsets.len() as u32)
            .unwrap_or(0)
    }

    fn delete(&self) -> Result<(), StoreError> {
        // close handles before removing the files
        self.files.lock().take();
        for path in [&self.index_path, &self.data_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Drop for FileMessageStore {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

fn open_rw(path: &Path) -> Result<File, StoreError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.metadata()?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)?;
    }

    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY: [u8; 32] = [0x42; 32];

    #[test]
    fn test_append_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileMessageStore::open(dir.path(), "net", KEY).unwrap();
            assert_eq!(store.append(b"one").unwrap(), 0);
            assert_eq!(store.append(b"two").unwrap(), 1);
        }

        let store = FileMessageStore::open(dir.path(), "net", KEY).unwrap();
        assert_eq!(store.count(), 2);
        assert_eq!(store.read(0).unwrap(), b"one");
        assert_eq!(store.read(1).unwrap(), b"two");
    }

    #[test]
    fn test_update_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileMessageStore::open(dir.path(), "net", KEY).unwrap();
            store.append(b"undelivered").unwrap();
            store.append(b"other").unwrap();
            store.update(0, b"delivered").unwrap();
            assert_eq!(store.read(0).unwrap(), b"delivered");
        }

        let store = FileMessageStore::open(dir.path(), "net", KEY).unwrap();
        assert_eq!(store.count(), 2);
        assert_eq!(store.read(0).unwrap(), b"delivered");
        assert_eq!(store.read(1).unwrap(), b"other");
    }

    #[test]
    fn test_records_are_encrypted() {
        let dir = TempDir::new().unwrap();
        let store = FileMessageStore::open(dir.path(), "net", KEY).unwrap();
        store.append(b"secret message text").unwrap();

        let raw = fs::read(store.data_path()).unwrap();
        assert!(!raw.windows(6).any(|w| w == b"secret"));
    }

    #[test]
    fn test_wrong_key_fails() {
        let dir = TempDir::new().unwrap();
        FileMessageStore::open(dir.path(), "net", KEY)
            .unwrap()
            .append(b"data")
            .unwrap();

        let store = FileMessageStore::open(dir.path(), "net", [0x43; 32]).unwrap();
        assert!(matches!(store.read(0), Err(StoreError::Encryption(_))));
    }

    #[test]
    fn test_delete_removes_files() {
        let dir = TempDir::new().unwrap();
        let store = FileMessageStore::open(dir.path(), "net", KEY).unwrap();
        store.append(b"data").unwrap();

        store.delete().unwrap();
        assert!(!store.index_path().exists());
        assert!(!store.data_path().exists());
        assert_eq!(store.count(), 0);
        assert!(matches!(store.append(b"more"), Err(StoreError::Deleted)));
    }
}
