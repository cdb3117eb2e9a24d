//! Authenticated encrypted channel.
//!
//! A [`SecureChannel`] turns a raw byte stream into a mutually authenticated,
//! encrypted duplex stream:
//!
//! 1. Client sends `ClientHello` (version, X25519 ephemeral key, nonce, ciphers)
//! 2. Server answers `ServerHello` (ephemeral key, nonce, selected cipher) or `Alert`
//! 3. Both derive directional keys from the pre-shared key, the DH output and
//!    the transcript hash
//! 4. Both send an encrypted `Auth` with their Ed25519 verifying key and a
//!    signature over the transcript. A wrong PSK fails decryption here.
//!
//! Afterwards data flows as `[u32 len][epoch][ciphertext]` records; keys are
//! ratcheted forward after a byte or time limit.

mod handshake;
mod record;

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use crate::crypto::{UserId, UserIdentity};
use crate::mesh::config::{
    DEFAULT_HANDSHAKE_TIMEOUT_SECS, DEFAULT_RENEGOTIATE_AFTER_BYTES, DEFAULT_RENEGOTIATE_AFTER_SECS,
};
use crate::mesh::endpoint::Endpoint;
use crate::mesh::transport::BoxedStream;

pub(crate) use record::ChannelFault;

/// AEAD used for channel records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherSuite {
    ChaCha20Poly1305,
    XChaCha20Poly1305,
}

impl CipherSuite {
    /// Every supported suite, most preferred first.
    pub fn all() -> Vec<Self> {
        vec![Self::ChaCha20Poly1305, Self::XChaCha20Poly1305]
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherSuite::ChaCha20Poly1305 => write!(f, "CHACHA20_POLY1305"),
            CipherSuite::XChaCha20Poly1305 => write!(f, "XCHACHA20_POLY1305"),
        }
    }
}

/// Why a handshake failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecureChannelErrorCode {
    UnsupportedVersion,
    NoMatchingCipher,
    PskRequired,
    PskMismatch,
    PeerAuthenticationFailed,
    UntrustedRemotePeer,
    ProtocolError,
    ConnectionClosed,
    Timeout,
}

impl fmt::Display for SecureChannelErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Handshake failure with whatever is known about the remote side.
#[derive(Error, Debug)]
#[error("{code}{}", describe_peer(.peer_user_id, .peer_endpoint))]
pub struct SecureChannelError {
    pub peer_user_id: Option<UserId>,
    pub peer_endpoint: Option<Endpoint>,
    pub code: SecureChannelErrorCode,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

fn describe_peer(user_id: &Option<UserId>, endpoint: &Option<Endpoint>) -> String {
    match (user_id, endpoint) {
        (Some(id), Some(ep)) => format!(" (peer {} at {})", id.short(), ep),
        (Some(id), None) => format!(" (peer {})", id.short()),
        (None, Some(ep)) => format!(" (endpoint {})", ep),
        (None, None) => String::new(),
    }
}

impl SecureChannelError {
    pub(crate) fn new(code: SecureChannelErrorCode) -> Self {
        Self {
            peer_user_id: None,
            peer_endpoint: None,
            code,
            source: None,
        }
    }

    pub(crate) fn with_source(code: SecureChannelErrorCode, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            source: Some(Box::new(source)),
            ..Self::new(code)
        }
    }
}

/// Handshake parameters for one channel.
#[derive(Clone, Debug)]
pub struct ChannelParams {
    pub remote_endpoint: Option<Endpoint>,
    pub via_endpoint: Option<Endpoint>,
    pub renegotiate_after_bytes: u64,
    pub renegotiate_after_secs: u64,
    pub supported_ciphers: Vec<CipherSuite>,
    /// Pre-shared key. Mandatory.
    pub psk: Vec<u8>,
    pub identity: UserIdentity,
    /// Accepted remote user ids. `None` trusts any authenticated peer.
    pub trusted_user_ids: Option<Vec<UserId>>,
    pub handshake_timeout: Duration,
}

impl ChannelParams {
    pub fn new(identity: UserIdentity, psk: impl Into<Vec<u8>>) -> Self {
        Self {
            remote_endpoint: None,
            via_endpoint: None,
            renegotiate_after_bytes: DEFAULT_RENEGOTIATE_AFTER_BYTES,
            renegotiate_after_secs: DEFAULT_RENEGOTIATE_AFTER_SECS,
            supported_ciphers: CipherSuite::all(),
            psk: psk.into(),
            identity,
            trusted_user_ids: None,
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
        }
    }

    pub fn with_trusted(mut self, trusted: Option<Vec<UserId>>) -> Self {
        self.trusted_user_ids = trusted;
        self
    }

    pub fn with_endpoints(mut self, remote: Option<Endpoint>, via: Option<Endpoint>) -> Self {
        self.remote_endpoint = remote;
        self.via_endpoint = via;
        self
    }
}

/// Established channel. Reads and writes plaintext.
pub struct SecureChannel {
    stream: DuplexStream,
    remote_user_id: UserId,
    cipher: CipherSuite,
    remote_endpoint: Option<Endpoint>,
    via_endpoint: Option<Endpoint>,
    fault: ChannelFault,
}

impl fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannel")
            .field("remote_user_id", &self.remote_user_id)
            .field("cipher", &self.cipher)
            .field("remote_endpoint", &self.remote_endpoint)
            .finish_non_exhaustive()
    }
}

impl SecureChannel {
    /// Runs the client side of the handshake.
    pub async fn connect(raw: BoxedStream, params: ChannelParams) -> Result<Self, SecureChannelError> {
        Self::establish(raw, params, handshake::Role::Client).await
    }

    /// Runs the server side of the handshake.
    pub async fn accept(raw: BoxedStream, params: ChannelParams) -> Result<Self, SecureChannelError> {
        Self::establish(raw, params, handshake::Role::Server).await
    }

    async fn establish(
        mut raw: BoxedStream,
        params: ChannelParams,
        role: handshake::Role,
    ) -> Result<Self, SecureChannelError> {
        let remote_endpoint = params.remote_endpoint.clone();
        let with_endpoint = |mut e: SecureChannelError| {
            e.peer_endpoint = e.peer_endpoint.or_else(|| remote_endpoint.clone());
            e
        };

        if params.psk.is_empty() {
            return Err(with_endpoint(SecureChannelError::new(SecureChannelErrorCode::PskRequired)));
        }

        let outcome = tokio::time::timeout(params.handshake_timeout, handshake::run(&mut raw, &params, role))
            .await
            .map_err(|_| SecureChannelError::new(SecureChannelErrorCode::Timeout))
            .and_then(|r| r)
            .map_err(with_endpoint)?;

        let (stream, fault) = record::spawn_pumps(raw, outcome.write_cipher, outcome.read_cipher);

        Ok(Self {
            stream,
            fault,
            remote_user_id: outcome.remote_user_id,
            cipher: outcome.cipher,
            remote_endpoint: params.remote_endpoint,
            via_endpoint: params.via_endpoint,
        })
    }

    pub fn remote_user_id(&self) -> UserId {
        self.remote_user_id
    }

    pub fn selected_cipher(&self) -> CipherSuite {
        self.cipher
    }

    pub fn remote_endpoint(&self) -> Option<&Endpoint> {
        self.remote_endpoint.as_ref()
    }

    pub fn via_endpoint(&self) -> Option<&Endpoint> {
        self.via_endpoint.as_ref()
    }

    /// Handle that stays readable after the channel is split.
    pub(crate) fn fault(&self) -> ChannelFault {
        self.fault.clone()
    }
}

impl AsyncRead for SecureChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for SecureChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (BoxedStream, BoxedStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Box::new(a), Box::new(b))
    }

    async fn handshake(
        client: ChannelParams,
        server: ChannelParams,
    ) -> (
        Result<SecureChannel, SecureChannelError>,
        Result<SecureChannel, SecureChannelError>,
    ) {
        let (a, b) = pair();
        let server_task = tokio::spawn(SecureChannel::accept(b, server));
        let client_result = SecureChannel::connect(a, client).await;
        (client_result, server_task.await.unwrap())
    }

    #[tokio::test]
    async fn test_handshake_and_data() {
        let alice = UserIdentity::generate();
        let bob = UserIdentity::generate();

        let (client, server) = handshake(
            ChannelParams::new(alice.clone(), b"psk".to_vec()),
            ChannelParams::new(bob.clone(), b"psk".to_vec()),
        )
        .await;
        let mut client = client.unwrap();
        let mut server = server.unwrap();

        assert_eq!(client.remote_user_id(), bob.user_id());
        assert_eq!(server.remote_user_id(), alice.user_id());
        assert_eq!(client.selected_cipher(), CipherSuite::ChaCha20Poly1305);

        client.write_all(b"hello bob").await.unwrap();
        let mut buf = [0u8; 9];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello bob");

        server.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_psk_mismatch() {
        let (client, server) = handshake(
            ChannelParams::new(UserIdentity::generate(), b"one".to_vec()),
            ChannelParams::new(UserIdentity::generate(), b"two".to_vec()),
        )
        .await;

        assert_eq!(server.unwrap_err().code, SecureChannelErrorCode::PskMismatch);
        assert_eq!(client.unwrap_err().code, SecureChannelErrorCode::PskMismatch);
    }

    #[tokio::test]
    async fn test_untrusted_client_rejected() {
        let allowed = UserIdentity::generate();
        let (client, server) = handshake(
            ChannelParams::new(UserIdentity::generate(), b"psk".to_vec()),
            ChannelParams::new(UserIdentity::generate(), b"psk".to_vec())
                .with_trusted(Some(vec![allowed.user_id()])),
        )
        .await;

        let server_err = server.unwrap_err();
        assert_eq!(server_err.code, SecureChannelErrorCode::UntrustedRemotePeer);
        assert!(server_err.peer_user_id.is_some());
        assert_eq!(client.unwrap_err().code, SecureChannelErrorCode::UntrustedRemotePeer);
    }

    #[tokio::test]
    async fn test_untrusted_server_rejected() {
        let (client, server) = handshake(
            ChannelParams::new(UserIdentity::generate(), b"psk".to_vec())
                .with_trusted(Some(vec![UserId([1; 32])])),
            ChannelParams::new(UserIdentity::generate(), b"psk".to_vec()),
        )
        .await;

        assert_eq!(client.unwrap_err().code, SecureChannelErrorCode::UntrustedRemotePeer);

        // the server finished its side; the client hanging up shows as EOF
        let mut server = server.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_no_matching_cipher() {
        let mut client = ChannelParams::new(UserIdentity::generate(), b"psk".to_vec());
        client.supported_ciphers = vec![CipherSuite::XChaCha20Poly1305];
        let mut server = ChannelParams::new(UserIdentity::generate(), b"psk".to_vec());
        server.supported_ciphers = vec![CipherSuite::ChaCha20Poly1305];

        let (client, server) = handshake(client, server).await;
        assert_eq!(client.unwrap_err().code, SecureChannelErrorCode::NoMatchingCipher);
        assert_eq!(server.unwrap_err().code, SecureChannelErrorCode::NoMatchingCipher);
    }

    #[tokio::test]
    async fn test_empty_psk_rejected() {
        let (a, _b) = pair();
        let err = SecureChannel::connect(a, ChannelParams::new(UserIdentity::generate(), Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err.code, SecureChannelErrorCode::PskRequired);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (a, _b) = pair();
        let mut params = ChannelParams::new(UserIdentity::generate(), b"psk".to_vec());
        params.handshake_timeout = Duration::from_millis(50);
        params.remote_endpoint = Some("10.0.0.5:1".parse().unwrap());

        let err = SecureChannel::connect(a, params).await.unwrap_err();
        assert_eq!(err.code, SecureChannelErrorCode::Timeout);
        assert_eq!(err.peer_endpoint, Some("10.0.0.5:1".parse().unwrap()));
        assert!(err.to_string().contains("10.0.0.5:1"));
    }

    #[tokio::test]
    async fn test_xchacha_selected_when_only_common_suite() {
        let mut client = ChannelParams::new(UserIdentity::generate(), b"psk".to_vec());
        client.supported_ciphers = vec![CipherSuite::XChaCha20Poly1305];

        let (client, server) =
            handshake(client, ChannelParams::new(UserIdentity::generate(), b"psk".to_vec())).await;
        let mut client = client.unwrap();
        let mut server = server.unwrap();
        assert_eq!(server.selected_cipher(), CipherSuite::XChaCha20Poly1305);

        client.write_all(&[7u8; 40_000]).await.unwrap();
        let mut buf = vec![0u8; 40_000];
        server.read_exact(&mut buf).await.unwrap();
        assert!(buf.iter().all(|b| *b == 7));
    }
}
