//! Mesh configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mesh::channel::CipherSuite;
use crate::mesh::error::MeshError;

/// Default interval between ping / peer exchange rounds in seconds.
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 15;

/// Default interval between DHT announcements in seconds.
pub const DEFAULT_ANNOUNCE_INTERVAL_SECS: u64 = 60;

/// Default delay before the first DHT announcement in seconds.
pub const DEFAULT_ANNOUNCE_INITIAL_DELAY_SECS: u64 = 5;

/// Default data sub-stream read timeout in seconds.
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;

/// Default time the session read loop waits for a sub-stream to drain.
pub const DEFAULT_FEED_TIMEOUT_SECS: u64 = 30;

/// Default data sub-stream buffer size in bytes.
pub const DEFAULT_DATA_STREAM_BUFFER_SIZE: usize = 8 * 1024;

/// Default secure channel handshake timeout in seconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Default number of bytes after which channel keys are ratcheted.
pub const DEFAULT_RENEGOTIATE_AFTER_BYTES: u64 = 100 * 1024 * 1024;

/// Default number of seconds after which channel keys are ratcheted.
pub const DEFAULT_RENEGOTIATE_AFTER_SECS: u64 = 3600;

/// Configuration shared by every network of a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MeshConfig {
    /// Interval between ping / peer exchange rounds.
    pub ping_interval_secs: u64,

    /// Interval between DHT announcements.
    pub announce_interval_secs: u64,

    /// Delay before the first DHT announcement after going online.
    pub announce_initial_delay_secs: u64,

    /// Data sub-stream read timeout.
    pub read_timeout_secs: u64,

    /// Time the read loop waits for a data sub-stream to be drained.
    pub feed_timeout_secs: u64,

    /// Data sub-stream buffer size.
    pub data_stream_buffer_size: usize,

    /// Secure channel handshake timeout.
    pub handshake_timeout_secs: u64,

    /// Ratchet channel keys after this many bytes.
    pub renegotiate_after_bytes: u64,

    /// Ratchet channel keys after this many seconds.
    pub renegotiate_after_secs: u64,

    /// Cipher suites offered in the handshake, most preferred first.
    pub supported_ciphers: Vec<CipherSuite>,

    /// Accept private chat invitations from unknown users.
    pub allow_invitations: bool,

    /// Directory for message stores. `None` keeps messages in memory.
    pub store_dir: Option<PathBuf>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: DEFAULT_PING_INTERVAL_SECS,
            announce_interval_secs: DEFAULT_ANNOUNCE_INTERVAL_SECS,
            announce_initial_delay_secs: DEFAULT_ANNOUNCE_INITIAL_DELAY_SECS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            feed_timeout_secs: DEFAULT_FEED_TIMEOUT_SECS,
            data_stream_buffer_size: DEFAULT_DATA_STREAM_BUFFER_SIZE,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            renegotiate_after_bytes: DEFAULT_RENEGOTIATE_AFTER_BYTES,
            renegotiate_after_secs: DEFAULT_RENEGOTIATE_AFTER_SECS,
            supported_ciphers: CipherSuite::all(),
            allow_invitations: true,
            store_dir: None,
        }
    }
}

impl MeshConfig {
    /// Default config file location: `<config dir>/meshchat/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("meshchat").join("config.toml"))
    }

    /// Loads the config from the default location, falling back to defaults
    /// when the file does not exist.
    pub fn load_default() -> Result<Self, MeshError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Loads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self, MeshError> {
        let text = fs::read_to_string(path)
            .map_err(|e| MeshError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| MeshError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the config as TOML.
    pub fn save(&self, path: &Path) -> Result<(), MeshError> {
        let text = toml::to_string_pretty(self).map_err(|e| MeshError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, text)?;
        Ok(())
    }

    /// Rejects values the mesh cannot run with.
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.ping_interval_secs == 0 || self.announce_interval_secs == 0 {
            return Err(MeshError::Config("timer intervals must be positive".into()));
        }
        if self.data_stream_buffer_size == 0 {
            return Err(MeshError::Config("data stream buffer size must be positive".into()));
        }
        if self.supported_ciphers.is_empty() {
            return Err(MeshError::Config("at least one cipher suite is required".into()));
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs)
    }

    pub fn announce_initial_delay(&self) -> Duration {
        Duration::from_secs(self.announce_initial_delay_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn feed_timeout(&self) -> Duration {
        Duration::from_secs(self.feed_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert_eq!(config.ping_interval(), Duration::from_secs(15));
        assert_eq!(config.announce_interval(), Duration::from_secs(60));
        assert_eq!(config.announce_initial_delay(), Duration::from_secs(5));
        assert_eq!(config.read_timeout(), Duration::from_secs(60));
        assert_eq!(config.feed_timeout(), Duration::from_secs(30));
        assert_eq!(config.data_stream_buffer_size, 8192);
        assert_eq!(config.renegotiate_after_bytes, 100 * 1024 * 1024);
        assert_eq!(config.renegotiate_after_secs, 3600);
        assert!(config.allow_invitations);
        assert!(config.store_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: MeshConfig = toml::from_str("ping_interval_secs = 5\n").unwrap();
        assert_eq!(config.ping_interval_secs, 5);
        assert_eq!(config.announce_interval_secs, DEFAULT_ANNOUNCE_INTERVAL_SECS);
        assert_eq!(config.supported_ciphers, CipherSuite::all());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = MeshConfig {
            read_timeout_secs: 10,
            supported_ciphers: vec![CipherSuite::XChaCha20Poly1305],
            store_dir: Some(dir.path().join("store")),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = MeshConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "supported_ciphers = []\n").unwrap();

        assert!(matches!(MeshConfig::load(&path), Err(MeshError::Config(_))));
    }
}
