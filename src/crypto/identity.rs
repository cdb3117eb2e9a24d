//! Local user identity and 256-bit identifiers.
//!
//! A user is identified by the SHA-256 hash of their Ed25519 verifying key.
//! The signing key never leaves the node; it authenticates the user during the
//! secure channel handshake.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors that can occur while handling identities and identifiers.
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Invalid signature format")]
    InvalidSignature,

    #[error("Invalid identifier: {0}")]
    InvalidId(String),
}

macro_rules! binary_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// Wraps raw bytes.
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Returns the raw bytes.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Lower-case hex encoding.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parses a 64-character hex string.
            pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
                let bytes = hex::decode(s.trim())
                    .map_err(|e| IdentityError::InvalidId(e.to_string()))?;
                let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
                    IdentityError::InvalidKeyLength {
                        expected: 32,
                        got: v.len(),
                    }
                })?;
                Ok(Self(bytes))
            }

            /// First four bytes in hex, for log lines and info messages.
            pub fn short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

binary_id!(
    /// 256-bit user identity: SHA-256 of the user's Ed25519 verifying key.
    UserId
);

binary_id!(
    /// 256-bit network identifier derived from the network seed and shared secret.
    NetworkId
);

binary_id!(
    /// Rendezvous identifier a mesh channel is opened on: a network id, or a
    /// masked user id while a private invitation is pending.
    ChannelId
);

impl From<NetworkId> for ChannelId {
    fn from(id: NetworkId) -> Self {
        Self(id.0)
    }
}

impl UserId {
    /// XOR of two user ids. Symmetric, so both ends of a private chat compute
    /// the same value.
    pub fn xor(&self, other: &UserId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }
}

/// Computes the user id for a verifying key.
pub fn user_id_from_verifying_key(key: &VerifyingKey) -> UserId {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    UserId(hasher.finalize().into())
}

/// Verifies an Ed25519 signature.
pub fn verify_signature(
    message: &[u8],
    signature_bytes: &[u8],
    verifying_key: &VerifyingKey,
) -> Result<(), IdentityError> {
    let sig_array: [u8; 64] = signature_bytes
        .try_into()
        .map_err(|_| IdentityError::InvalidSignature)?;

    let signature = Signature::from_bytes(&sig_array);

    verifying_key
        .verify(message, &signature)
        .map_err(|_| IdentityError::VerificationFailed)
}

/// The local user's long-term identity.
#[derive(Clone)]
pub struct UserIdentity {
    signing_key: SigningKey,
    user_id: UserId,
}

impl fmt::Debug for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserIdentity")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl UserIdentity {
    /// Generates a new random identity.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Restores an identity from its 32 secret bytes.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let user_id = user_id_from_verifying_key(&signing_key.verifying_key());
        Self {
            signing_key,
            user_id,
        }
    }

    /// The user id derived from the verifying key.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// The Ed25519 verifying (public) key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// The 32 secret bytes (for persistence).
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Signs a message and returns the signature bytes.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_is_hash_of_verifying_key() {
        let identity = UserIdentity::generate();
        assert_eq!(
            identity.user_id(),
            user_id_from_verifying_key(&identity.verifying_key())
        );
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = UserIdentity::generate();
        let signature = identity.sign(b"transcript");

        assert!(verify_signature(b"transcript", &signature, &identity.verifying_key()).is_ok());
        assert!(matches!(
            verify_signature(b"other", &signature, &identity.verifying_key()),
            Err(IdentityError::VerificationFailed)
        ));
        assert!(matches!(
            verify_signature(b"transcript", &signature[..10], &identity.verifying_key()),
            Err(IdentityError::InvalidSignature)
        ));
    }

    #[test]
    fn test_secret_bytes_restore_same_user() {
        let identity = UserIdentity::generate();
        let restored = UserIdentity::from_secret_bytes(&identity.secret_bytes());

        assert_eq!(identity.user_id(), restored.user_id());
        assert_eq!(identity.verifying_key(), restored.verifying_key());
    }

    #[test]
    fn test_hex_roundtrip_and_errors() {
        let id = UserIdentity::generate().user_id();
        assert_eq!(UserId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(UserId::from_hex("zz").is_err());
        assert!(matches!(
            UserId::from_hex("abcd"),
            Err(IdentityError::InvalidKeyLength { expected: 32, got: 2 })
        ));
    }

    #[test]
    fn test_xor_is_symmetric() {
        let a = UserIdentity::generate().user_id();
        let b = UserIdentity::generate().user_id();
        assert_eq!(a.xor(&b), b.xor(&a));
        assert_eq!(a.xor(&a), [0u8; 32]);
    }
}
