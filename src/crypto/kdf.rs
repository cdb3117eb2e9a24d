//! Network key derivation.
//!
//! Two nodes that agree on the network seed and the shared secret derive the
//! same network id and network secret; no key exchange happens out of band.
//!
//! - Round 1: `secret = PBKDF2-HMAC-SHA256(password = shared_secret, salt = seed)`
//! - Round 2: `id = PBKDF2-HMAC-SHA256(password = secret, salt = seed)`
//!
//! The private chat seed is the XOR of both user ids, the group seed is the
//! lower-cased group name. The network id is published to discovery; the
//! iteration count bounds offline guessing of the shared secret.

use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use super::identity::{ChannelId, NetworkId, UserId};

/// PBKDF2 iterations of each derivation round.
pub const NETWORK_KDF_ROUNDS: u32 = 50_000;

/// Salt and info for masked user ids.
const MASKED_USER_ID_LABEL: &[u8] = b"meshchat/masked-user-id";

/// Derived network keys.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NetworkKeys {
    /// Public rendezvous identifier of the network.
    pub network_id: NetworkId,
    /// Pre-shared key used for the secure channel handshake.
    pub network_secret: [u8; 32],
}

/// Derives keys for a private chat between two users.
pub fn derive_private_network(
    user_id1: &UserId,
    user_id2: &UserId,
    shared_secret: &str,
) -> NetworkKeys {
    derive(&user_id1.xor(user_id2), shared_secret)
}

/// Derives keys for a group chat.
pub fn derive_group_network(network_name: &str, shared_secret: &str) -> NetworkKeys {
    derive(network_name.to_lowercase().as_bytes(), shared_secret)
}

/// HMAC-based pseudonym for a user id, used to find a user for an invitation
/// without publishing the real id.
pub fn masked_user_id(user_id: &UserId) -> ChannelId {
    ChannelId(expand(MASKED_USER_ID_LABEL, user_id.as_bytes(), MASKED_USER_ID_LABEL))
}

fn derive(seed: &[u8], shared_secret: &str) -> NetworkKeys {
    let mut network_secret = [0u8; 32];
    pbkdf2_hmac::<Sha256>(shared_secret.as_bytes(), seed, NETWORK_KDF_ROUNDS, &mut network_secret);

    let mut network_id = [0u8; 32];
    pbkdf2_hmac::<Sha256>(&network_secret, seed, NETWORK_KDF_ROUNDS, &mut network_id);
    let network_id = NetworkId(network_id);

    NetworkKeys {
        network_id,
        network_secret,
    }
}

fn expand(salt: &[u8], ikm: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; 32];
    // 32 bytes is always a valid HKDF-SHA256 output length
    if hk.expand(info, &mut okm).is_err() {
        unreachable!("HKDF-SHA256 accepts 32-byte outputs");
    }
    okm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::UserIdentity;

    #[test]
    fn test_private_network_is_symmetric() {
        let a = UserIdentity::generate().user_id();
        let b = UserIdentity::generate().user_id();

        let ab = derive_private_network(&a, &b, "secret");
        let ba = derive_private_network(&b, &a, "secret");

        assert_eq!(ab, ba);
    }

    #[test]
    fn test_private_network_depends_on_secret() {
        let a = UserIdentity::generate().user_id();
        let b = UserIdentity::generate().user_id();

        let one = derive_private_network(&a, &b, "secret");
        let two = derive_private_network(&a, &b, "Secret");
        let empty = derive_private_network(&a, &b, "");

        assert_ne!(one.network_id, two.network_id);
        assert_ne!(one.network_secret, two.network_secret);
        assert_ne!(one.network_id, empty.network_id);
    }

    #[test]
    fn test_group_name_is_case_insensitive() {
        let lower = derive_group_network("friends", "pw");
        let mixed = derive_group_network("FrIeNdS", "pw");
        let other = derive_group_network("family", "pw");

        assert_eq!(lower, mixed);
        assert_ne!(lower.network_id, other.network_id);
    }

    #[test]
    fn test_network_id_differs_from_secret() {
        let keys = derive_group_network("friends", "pw");
        assert_ne!(keys.network_id.0, keys.network_secret);
    }

    #[test]
    fn test_rounds_chain_through_network_secret() {
        let seed = b"friends";
        let keys = derive_group_network("Friends", "pw");

        let mut secret = [0u8; 32];
        pbkdf2_hmac::<Sha256>(b"pw", seed, NETWORK_KDF_ROUNDS, &mut secret);
        let mut id = [0u8; 32];
        pbkdf2_hmac::<Sha256>(&secret, seed, NETWORK_KDF_ROUNDS, &mut id);

        assert_eq!(keys.network_secret, secret);
        assert_eq!(keys.network_id.0, id);
    }

    #[test]
    fn test_masked_user_id_is_stable_and_hides_id() {
        let id = UserIdentity::generate().user_id();
        assert_eq!(masked_user_id(&id), masked_user_id(&id));
        assert_ne!(masked_user_id(&id).0, id.0);
    }
}
