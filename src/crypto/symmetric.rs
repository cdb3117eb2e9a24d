//! Authenticated symmetric encryption.
//!
//! Two layouts, both ChaCha20-Poly1305:
//! - keyed: `nonce[12] || ciphertext`, used for message store records
//! - passphrase: `salt[16] || nonce[12] || ciphertext`, the key being
//!   PBKDF2-HMAC-SHA256 over the passphrase with the random salt. Used for
//!   the node profile file.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

/// PBKDF2 iterations for passphrase keys.
const PASSPHRASE_KDF_ROUNDS: u32 = 100_000;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum SymmetricError {
    #[error("Encryption failed")]
    Seal,

    #[error("Decryption failed (wrong key or corrupted data)")]
    Open,

    #[error("Ciphertext too short: {0} bytes")]
    Truncated(usize),
}

fn passphrase_key(passphrase: &str, salt: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PASSPHRASE_KDF_ROUNDS, &mut key[..]);
    key
}

/// Encrypts `plaintext` under a raw 256-bit key with a fresh nonce.
pub fn encrypt_with_key(plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, SymmetricError> {
    let mut out = vec![0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut out);
    let sealed = ChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(Nonce::from_slice(&out), plaintext)
        .map_err(|_| SymmetricError::Seal)?;
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypts data produced by [`encrypt_with_key`].
pub fn decrypt_with_key(data: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, SymmetricError> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(SymmetricError::Truncated(data.len()));
    }
    let (nonce, sealed) = data.split_at(NONCE_LEN);
    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| SymmetricError::Open)
}

/// Encrypts `plaintext` with a key derived from `passphrase` and a random salt.
pub fn encrypt_symmetric(plaintext: &[u8], passphrase: &str) -> Result<Vec<u8>, SymmetricError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let key = passphrase_key(passphrase, &salt);

    let mut out = salt.to_vec();
    out.extend(encrypt_with_key(plaintext, &key)?);
    Ok(out)
}

/// Decrypts data produced by [`encrypt_symmetric`].
pub fn decrypt_symmetric(data: &[u8], passphrase: &str) -> Result<Vec<u8>, SymmetricError> {
    if data.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
        return Err(SymmetricError::Truncated(data.len()));
    }
    let (salt, rest) = data.split_at(SALT_LEN);
    let key = passphrase_key(passphrase, salt);
    decrypt_with_key(rest, &key)
}
