//! Cryptographic building blocks for meshchat.
//!
//! This module provides:
//! - The local user identity (Ed25519) and 256-bit identifiers
//! - Network id / network secret derivation and masked user ids (HKDF-SHA256)
//! - Key- and passphrase-based authenticated encryption (ChaCha20-Poly1305)

pub mod identity;
pub mod kdf;
pub mod symmetric;

pub use identity::{
    user_id_from_verifying_key, verify_signature, ChannelId, IdentityError, NetworkId, UserId,
    UserIdentity,
};
pub use kdf::{derive_group_network, derive_private_network, masked_user_id, NetworkKeys};
pub use symmetric::{
    decrypt_symmetric, decrypt_with_key, encrypt_symmetric, encrypt_with_key, SymmetricError,
};
