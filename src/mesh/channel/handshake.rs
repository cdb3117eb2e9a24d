//! Handshake messages and the client / server flows.

use std::io;
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use super::record::{RecordCipher, RekeyLimits};
use super::{ChannelParams, CipherSuite, SecureChannelError, SecureChannelErrorCode};
use crate::crypto::{user_id_from_verifying_key, verify_signature, UserId, UserIdentity};
use crate::mesh::transport::{read_length_prefixed, write_length_prefixed, BoxedStream};
use crate::PROTOCOL_VERSION;

const MAX_HANDSHAKE_MESSAGE: usize = 64 * 1024;

const CLIENT_AUTH_LABEL: &[u8] = b"meshchat client auth";
const SERVER_AUTH_LABEL: &[u8] = b"meshchat server auth";
const CLIENT_KEY_INFO: &[u8] = b"meshchat/channel client-to-server";
const SERVER_KEY_INFO: &[u8] = b"meshchat/channel server-to-client";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

#[derive(Debug, Serialize, Deserialize)]
enum HandshakeMessage {
    ClientHello {
        version: u8,
        ephemeral_public: [u8; 32],
        nonce: [u8; 32],
        ciphers: Vec<CipherSuite>,
    },
    ServerHello {
        version: u8,
        ephemeral_public: [u8; 32],
        nonce: [u8; 32],
        cipher: CipherSuite,
    },
    Auth {
        epoch: u8,
        sealed: Vec<u8>,
    },
    Alert {
        code: SecureChannelErrorCode,
    },
}

#[derive(Serialize, Deserialize)]
struct AuthPayload {
    verifying_key: [u8; 32],
    signature: Vec<u8>,
}

pub(crate) struct Outcome {
    pub remote_user_id: UserId,
    pub cipher: CipherSuite,
    pub write_cipher: RecordCipher,
    pub read_cipher: RecordCipher,
}

pub(crate) async fn run(
    raw: &mut BoxedStream,
    params: &ChannelParams,
    role: Role,
) -> Result<Outcome, SecureChannelError> {
    match role {
        Role::Client => client(raw, params).await,
        Role::Server => server(raw, params).await,
    }
}

async fn client(raw: &mut BoxedStream, params: &ChannelParams) -> Result<Outcome, SecureChannelError> {
    let secret = StaticSecret::random_from_rng(OsRng);
    let hello = HandshakeMessage::ClientHello {
        version: PROTOCOL_VERSION,
        ephemeral_public: PublicKey::from(&secret).to_bytes(),
        nonce: random_nonce(),
        ciphers: params.supported_ciphers.clone(),
    };
    let hello_bytes = send(raw, &hello).await?;

    let (reply, reply_bytes) = receive(raw).await?;
    let (server_public, cipher) = match reply {
        HandshakeMessage::ServerHello {
            version,
            ephemeral_public,
            cipher,
            ..
        } => {
            if version != PROTOCOL_VERSION {
                return Err(SecureChannelError::new(SecureChannelErrorCode::UnsupportedVersion));
            }
            if !params.supported_ciphers.contains(&cipher) {
                return Err(SecureChannelError::new(SecureChannelErrorCode::NoMatchingCipher));
            }
            (ephemeral_public, cipher)
        }
        HandshakeMessage::Alert { code } => return Err(SecureChannelError::new(code)),
        _ => return Err(SecureChannelError::new(SecureChannelErrorCode::ProtocolError)),
    };

    let transcript = transcript_hash(&hello_bytes, &reply_bytes);
    let (client_key, server_key) = derive_keys(&params.psk, &secret, &server_public, &transcript)?;
    let limits = rekey_limits(params);
    let mut write_cipher = RecordCipher::new(cipher, client_key, limits);
    let mut read_cipher = RecordCipher::new(cipher, server_key, limits);

    send_auth(raw, &mut write_cipher, &params.identity, CLIENT_AUTH_LABEL, &transcript).await?;

    let remote_user_id = match receive(raw).await?.0 {
        HandshakeMessage::Auth { epoch, sealed } => {
            open_auth(&mut read_cipher, epoch, &sealed, SERVER_AUTH_LABEL, &transcript)?
        }
        HandshakeMessage::Alert { code } => return Err(SecureChannelError::new(code)),
        _ => return Err(SecureChannelError::new(SecureChannelErrorCode::ProtocolError)),
    };

    if !is_trusted(params, &remote_user_id) {
        let mut err = SecureChannelError::new(SecureChannelErrorCode::UntrustedRemotePeer);
        err.peer_user_id = Some(remote_user_id);
        return Err(err);
    }

    Ok(Outcome {
        remote_user_id,
        cipher,
        write_cipher,
        read_cipher,
    })
}

async fn server(raw: &mut BoxedStream, params: &ChannelParams) -> Result<Outcome, SecureChannelError> {
    let (hello, hello_bytes) = receive(raw).await?;
    let (client_public, offered) = match hello {
        HandshakeMessage::ClientHello {
            version,
            ephemeral_public,
            ciphers,
            ..
        } => {
            if version != PROTOCOL_VERSION {
                return Err(alert(raw, SecureChannelErrorCode::UnsupportedVersion).await);
            }
            (ephemeral_public, ciphers)
        }
        _ => return Err(alert(raw, SecureChannelErrorCode::ProtocolError).await),
    };

    // client preference order, restricted to what we support
    let cipher = match offered
        .iter()
        .copied()
        .find(|c| params.supported_ciphers.contains(c))
    {
        Some(cipher) => cipher,
        None => return Err(alert(raw, SecureChannelErrorCode::NoMatchingCipher).await),
    };

    let secret = StaticSecret::random_from_rng(OsRng);
    let reply = HandshakeMessage::ServerHello {
        version: PROTOCOL_VERSION,
        ephemeral_public: PublicKey::from(&secret).to_bytes(),
        nonce: random_nonce(),
        cipher,
    };
    let reply_bytes = send(raw, &reply).await?;

    let transcript = transcript_hash(&hello_bytes, &reply_bytes);
    let (client_key, server_key) = derive_keys(&params.psk, &secret, &client_public, &transcript)?;
    let limits = rekey_limits(params);
    let mut read_cipher = RecordCipher::new(cipher, client_key, limits);
    let mut write_cipher = RecordCipher::new(cipher, server_key, limits);

    let (epoch, sealed) = match receive(raw).await?.0 {
        HandshakeMessage::Auth { epoch, sealed } => (epoch, sealed),
        HandshakeMessage::Alert { code } => return Err(SecureChannelError::new(code)),
        _ => return Err(alert(raw, SecureChannelErrorCode::ProtocolError).await),
    };

    let remote_user_id = match open_auth(&mut read_cipher, epoch, &sealed, CLIENT_AUTH_LABEL, &transcript) {
        Ok(id) => id,
        Err(e) => {
            let _ = send(raw, &HandshakeMessage::Alert { code: e.code }).await;
            return Err(e);
        }
    };

    if !is_trusted(params, &remote_user_id) {
        let mut err = alert(raw, SecureChannelErrorCode::UntrustedRemotePeer).await;
        err.peer_user_id = Some(remote_user_id);
        return Err(err);
    }

    send_auth(raw, &mut write_cipher, &params.identity, SERVER_AUTH_LABEL, &transcript).await?;

    Ok(Outcome {
        remote_user_id,
        cipher,
        write_cipher,
        read_cipher,
    })
}

fn is_trusted(params: &ChannelParams, user_id: &UserId) -> bool {
    match &params.trusted_user_ids {
        Some(trusted) => trusted.contains(user_id),
        None => true,
    }
}

fn rekey_limits(params: &ChannelParams) -> RekeyLimits {
    RekeyLimits {
        bytes: params.renegotiate_after_bytes,
        interval: Duration::from_secs(params.renegotiate_after_secs),
    }
}

fn random_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn transcript_hash(client_hello: &[u8], server_hello: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(client_hello);
    hasher.update(server_hello);
    hasher.finalize().into()
}

/// Returns (client-to-server key, server-to-client key).
fn derive_keys(
    psk: &[u8],
    secret: &StaticSecret,
    remote_public: &[u8; 32],
    transcript: &[u8; 32],
) -> Result<([u8; 32], [u8; 32]), SecureChannelError> {
    let shared = secret.diffie_hellman(&PublicKey::from(*remote_public));
    if !shared.was_contributory() {
        return Err(SecureChannelError::new(SecureChannelErrorCode::ProtocolError));
    }

    let mut ikm = Vec::with_capacity(64);
    ikm.extend_from_slice(shared.as_bytes());
    ikm.extend_from_slice(transcript);
    let hk = Hkdf::<Sha256>::new(Some(psk), &ikm);
    ikm.zeroize();

    let mut client_key = [0u8; 32];
    let mut server_key = [0u8; 32];
    hk.expand(CLIENT_KEY_INFO, &mut client_key)
        .and_then(|_| hk.expand(SERVER_KEY_INFO, &mut server_key))
        .map_err(|_| SecureChannelError::new(SecureChannelErrorCode::ProtocolError))?;

    Ok((client_key, server_key))
}

async fn send_auth(
    raw: &mut BoxedStream,
    cipher: &mut RecordCipher,
    identity: &UserIdentity,
    label: &[u8],
    transcript: &[u8; 32],
) -> Result<(), SecureChannelError> {
    let payload = AuthPayload {
        verifying_key: identity.verifying_key().to_bytes(),
        signature: identity.sign(&signed_data(label, transcript)),
    };
    let bytes = bincode::serialize(&payload)
        .map_err(|e| SecureChannelError::with_source(SecureChannelErrorCode::ProtocolError, e))?;
    let (epoch, sealed) = cipher
        .seal(&bytes)
        .map_err(|e| SecureChannelError::with_source(SecureChannelErrorCode::ProtocolError, e))?;
    send(raw, &HandshakeMessage::Auth { epoch, sealed }).await?;
    Ok(())
}

fn open_auth(
    cipher: &mut RecordCipher,
    epoch: u8,
    sealed: &[u8],
    label: &[u8],
    transcript: &[u8; 32],
) -> Result<UserId, SecureChannelError> {
    // only a peer holding the same PSK derives the same keys
    let bytes = cipher
        .open(epoch, sealed)
        .map_err(|e| SecureChannelError::with_source(SecureChannelErrorCode::PskMismatch, e))?;
    let payload: AuthPayload = bincode::deserialize(&bytes)
        .map_err(|e| SecureChannelError::with_source(SecureChannelErrorCode::ProtocolError, e))?;

    let verifying_key = VerifyingKey::from_bytes(&payload.verifying_key).map_err(|e| {
        SecureChannelError::with_source(SecureChannelErrorCode::PeerAuthenticationFailed, e)
    })?;
    let user_id = user_id_from_verifying_key(&verifying_key);

    verify_signature(&signed_data(label, transcript), &payload.signature, &verifying_key).map_err(|e| {
        let mut err = SecureChannelError::with_source(SecureChannelErrorCode::PeerAuthenticationFailed, e);
        err.peer_user_id = Some(user_id);
        err
    })?;

    Ok(user_id)
}

fn signed_data(label: &[u8], transcript: &[u8; 32]) -> Vec<u8> {
    let mut data = Vec::with_capacity(label.len() + 32);
    data.extend_from_slice(label);
    data.extend_from_slice(transcript);
    data
}

async fn send(raw: &mut BoxedStream, message: &HandshakeMessage) -> Result<Vec<u8>, SecureChannelError> {
    let bytes = bincode::serialize(message)
        .map_err(|e| SecureChannelError::with_source(SecureChannelErrorCode::ProtocolError, e))?;
    write_length_prefixed(raw, &bytes).await.map_err(closed)?;
    Ok(bytes)
}

async fn receive(raw: &mut BoxedStream) -> Result<(HandshakeMessage, Vec<u8>), SecureChannelError> {
    let bytes = read_length_prefixed(raw, MAX_HANDSHAKE_MESSAGE)
        .await
        .map_err(closed)?;
    let message = bincode::deserialize(&bytes)
        .map_err(|e| SecureChannelError::with_source(SecureChannelErrorCode::ProtocolError, e))?;
    Ok((message, bytes))
}

/// Sends an alert best-effort and returns the matching error.
async fn alert(raw: &mut BoxedStream, code: SecureChannelErrorCode) -> SecureChannelError {
    let _ = send(raw, &HandshakeMessage::Alert { code }).await;
    SecureChannelError::new(code)
}

fn closed(e: io::Error) -> SecureChannelError {
    let code = match e.kind() {
        io::ErrorKind::InvalidData => SecureChannelErrorCode::ProtocolError,
        _ => SecureChannelErrorCode::ConnectionClosed,
    };
    SecureChannelError::with_source(code, e)
}
