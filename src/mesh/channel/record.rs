//! Channel records and the pump tasks that encrypt and decrypt them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use zeroize::Zeroize;

use super::CipherSuite;
use crate::mesh::transport::BoxedStream;

/// Largest plaintext sealed into one record.
const MAX_RECORD_PLAINTEXT: usize = 16 * 1024;

/// Largest ciphertext accepted from the wire.
const MAX_RECORD_CIPHERTEXT: usize = MAX_RECORD_PLAINTEXT + 64;

/// Buffer between the application side and the pumps.
const PUMP_BUFFER_SIZE: usize = 64 * 1024;

const REKEY_INFO: &[u8] = b"meshchat/channel-rekey";

#[derive(Error, Debug)]
pub(crate) enum RecordError {
    #[error("record authentication failed")]
    Authentication,

    #[error("unexpected record epoch {0}")]
    UnexpectedEpoch(u8),
}

/// When to ratchet the sending key.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RekeyLimits {
    pub bytes: u64,
    pub interval: Duration,
}

/// One direction of a channel: AEAD key, epoch and record counter.
pub(crate) struct RecordCipher {
    suite: CipherSuite,
    key: [u8; 32],
    epoch: u8,
    counter: u64,
    bytes_since_rekey: u64,
    rekeyed_at: Instant,
    limits: RekeyLimits,
}

impl RecordCipher {
    pub(crate) fn new(suite: CipherSuite, key: [u8; 32], limits: RekeyLimits) -> Self {
        Self {
            suite,
            key,
            epoch: 0,
            counter: 0,
            bytes_since_rekey: 0,
            rekeyed_at: Instant::now(),
            limits,
        }
    }

    pub(crate) fn seal(&mut self, plaintext: &[u8]) -> Result<(u8, Vec<u8>), RecordError> {
        if self.needs_rekey() {
            self.ratchet();
        }

        let aad = [self.epoch];
        let ciphertext = match self.suite {
            CipherSuite::ChaCha20Poly1305 => {
                let nonce = self.nonce12();
                ChaCha20Poly1305::new(Key::from_slice(&self.key))
                    .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
            }
            CipherSuite::XChaCha20Poly1305 => {
                let nonce = self.nonce24();
                XChaCha20Poly1305::new(Key::from_slice(&self.key))
                    .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
            }
        }
        .map_err(|_| RecordError::Authentication)?;

        self.counter += 1;
        self.bytes_since_rekey += plaintext.len() as u64;
        Ok((self.epoch, ciphertext))
    }

    pub(crate) fn open(&mut self, epoch: u8, ciphertext: &[u8]) -> Result<Vec<u8>, RecordError> {
        if epoch != self.epoch {
            if epoch == self.epoch.wrapping_add(1) {
                self.ratchet();
            } else {
                return Err(RecordError::UnexpectedEpoch(epoch));
            }
        }

        let aad = [self.epoch];
        let plaintext = match self.suite {
            CipherSuite::ChaCha20Poly1305 => {
                let nonce = self.nonce12();
                ChaCha20Poly1305::new(Key::from_slice(&self.key))
                    .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad: &aad })
            }
            CipherSuite::XChaCha20Poly1305 => {
                let nonce = self.nonce24();
                XChaCha20Poly1305::new(Key::from_slice(&self.key))
                    .decrypt(XNonce::from_slice(&nonce), Payload { msg: ciphertext, aad: &aad })
            }
        }
        .map_err(|_| RecordError::Authentication)?;

        self.counter += 1;
        Ok(plaintext)
    }

    // The first record of an epoch never triggers a ratchet.
    fn needs_rekey(&self) -> bool {
        self.counter > 0
            && (self.bytes_since_rekey >= self.limits.bytes
                || self.rekeyed_at.elapsed() >= self.limits.interval)
    }

    fn ratchet(&mut self) {
        let hk = Hkdf::<Sha256>::new(None, &self.key);
        let mut next = [0u8; 32];
        if hk.expand(REKEY_INFO, &mut next).is_err() {
            unreachable!("HKDF-SHA256 accepts 32-byte outputs");
        }
        self.key.zeroize();
        self.key = next;
        self.epoch = self.epoch.wrapping_add(1);
        self.counter = 0;
        self.bytes_since_rekey = 0;
        self.rekeyed_at = Instant::now();
        trace!(epoch = self.epoch, "channel key ratcheted");
    }

    fn nonce12(&self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.counter.to_le_bytes());
        nonce
    }

    fn nonce24(&self) -> [u8; 24] {
        let mut nonce = [0u8; 24];
        nonce[16..].copy_from_slice(&self.counter.to_le_bytes());
        nonce
    }
}

impl Drop for RecordCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

async fn write_record<W: AsyncWrite + Unpin>(writer: &mut W, epoch: u8, ciphertext: &[u8]) -> std::io::Result<()> {
    writer.write_all(&(ciphertext.len() as u32).to_le_bytes()).await?;
    writer.write_all(&[epoch]).await?;
    writer.write_all(ciphertext).await?;
    writer.flush().await
}

/// Reads one record. `None` on a clean end of stream.
async fn read_record<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut header = [0u8; 5];
    match reader.read_exact(&mut header[..1]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    reader.read_exact(&mut header[1..]).await?;

    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > MAX_RECORD_CIPHERTEXT {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("record too large: {} bytes", len),
        ));
    }

    let mut ciphertext = vec![0u8; len];
    reader.read_exact(&mut ciphertext).await?;
    Ok(Some((header[4], ciphertext)))
}

/// Set once either pump stops on a transport or record error. The plaintext
/// side only ever sees end of stream, so this is how it tells a clean close
/// from a broken one.
#[derive(Debug, Clone, Default)]
pub(crate) struct ChannelFault(Arc<AtomicBool>);

impl ChannelFault {
    pub(crate) fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Starts the encrypt and decrypt pumps and returns the plaintext side.
pub(crate) fn spawn_pumps(
    raw: BoxedStream,
    write_cipher: RecordCipher,
    read_cipher: RecordCipher,
) -> (DuplexStream, ChannelFault) {
    let (app, pump) = tokio::io::duplex(PUMP_BUFFER_SIZE);
    let (raw_read, raw_write) = tokio::io::split(raw);
    let (pump_read, pump_write) = tokio::io::split(pump);
    let closed = CancellationToken::new();
    let fault = ChannelFault::default();

    tokio::spawn(inbound_pump(raw_read, pump_write, read_cipher, closed.clone(), fault.clone()));
    tokio::spawn(outbound_pump(pump_read, raw_write, write_cipher, closed, fault.clone()));

    (app, fault)
}

async fn inbound_pump(
    mut raw: ReadHalf<BoxedStream>,
    mut app: WriteHalf<DuplexStream>,
    mut cipher: RecordCipher,
    closed: CancellationToken,
    fault: ChannelFault,
) {
    loop {
        let record = tokio::select! {
            _ = closed.cancelled() => break,
            record = read_record(&mut raw) => record,
        };
        let (epoch, ciphertext) = match record {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "channel read failed");
                fault.set();
                break;
            }
        };
        let plaintext = match cipher.open(epoch, &ciphertext) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "dropping channel");
                fault.set();
                break;
            }
        };
        if app.write_all(&plaintext).await.is_err() {
            break;
        }
    }
    let _ = app.shutdown().await;
}

async fn outbound_pump(
    mut app: ReadHalf<DuplexStream>,
    mut raw: WriteHalf<BoxedStream>,
    mut cipher: RecordCipher,
    closed: CancellationToken,
    fault: ChannelFault,
) {
    let mut buf = vec![0u8; MAX_RECORD_PLAINTEXT];
    loop {
        let n = match app.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let (epoch, ciphertext) = match cipher.seal(&buf[..n]) {
            Ok(sealed) => sealed,
            Err(_) => {
                fault.set();
                break;
            }
        };
        if let Err(e) = write_record(&mut raw, epoch, &ciphertext).await {
            debug!(error = %e, "channel write failed");
            fault.set();
            break;
        }
    }
    let _ = raw.shutdown().await;
    closed.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(bytes: u64) -> RekeyLimits {
        RekeyLimits {
            bytes,
            interval: Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_seal_open_in_order() {
        for suite in CipherSuite::all() {
            let mut tx = RecordCipher::new(suite, [1; 32], limits(1 << 20));
            let mut rx = RecordCipher::new(suite, [1; 32], limits(1 << 20));

            for msg in [&b"one"[..], b"two", b"three"] {
                let (epoch, ct) = tx.seal(msg).unwrap();
                assert_eq!(rx.open(epoch, &ct).unwrap(), msg);
            }
        }
    }

    #[test]
    fn test_ratchet_after_byte_limit() {
        let mut tx = RecordCipher::new(CipherSuite::ChaCha20Poly1305, [2; 32], limits(10));
        let mut rx = RecordCipher::new(CipherSuite::ChaCha20Poly1305, [2; 32], limits(10));

        let (e0, c0) = tx.seal(&[0u8; 16]).unwrap();
        let (e1, c1) = tx.seal(b"after").unwrap();
        assert_eq!(e0, 0);
        assert_eq!(e1, 1);

        assert_eq!(rx.open(e0, &c0).unwrap(), vec![0u8; 16]);
        assert_eq!(rx.open(e1, &c1).unwrap(), b"after");
    }

    #[test]
    fn test_replay_rejected() {
        let mut tx = RecordCipher::new(CipherSuite::ChaCha20Poly1305, [3; 32], limits(1 << 20));
        let mut rx = RecordCipher::new(CipherSuite::ChaCha20Poly1305, [3; 32], limits(1 << 20));

        let (epoch, ct) = tx.seal(b"once").unwrap();
        rx.open(epoch, &ct).unwrap();
        assert!(matches!(rx.open(epoch, &ct), Err(RecordError::Authentication)));
    }

    #[test]
    fn test_epoch_skip_rejected() {
        let mut rx = RecordCipher::new(CipherSuite::ChaCha20Poly1305, [4; 32], limits(1 << 20));
        assert!(matches!(rx.open(5, b"junk"), Err(RecordError::UnexpectedEpoch(5))));
    }

    #[tokio::test]
    async fn test_record_framing() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_record(&mut a, 3, b"ciphertext").await.unwrap();
        drop(a);

        assert_eq!(read_record(&mut b).await.unwrap(), Some((3, b"ciphertext".to_vec())));
        assert_eq!(read_record(&mut b).await.unwrap(), None);
    }

    fn pumped(raw: tokio::io::DuplexStream, key: u8) -> (DuplexStream, ChannelFault) {
        let suite = CipherSuite::ChaCha20Poly1305;
        spawn_pumps(
            Box::new(raw),
            RecordCipher::new(suite, [key; 32], limits(1 << 20)),
            RecordCipher::new(suite, [key; 32], limits(1 << 20)),
        )
    }

    #[tokio::test]
    async fn test_clean_close_is_not_a_fault() {
        let (a, b) = tokio::io::duplex(4096);
        let (mut left, left_fault) = pumped(a, 5);
        let (mut right, right_fault) = pumped(b, 5);

        left.write_all(b"bye").await.unwrap();
        left.shutdown().await.unwrap();

        let mut got = Vec::new();
        right.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"bye");
        assert!(!right_fault.is_set());
        assert!(!left_fault.is_set());
    }

    #[tokio::test]
    async fn test_garbage_record_sets_fault() {
        let (mut raw, b) = tokio::io::duplex(4096);
        let (mut right, fault) = pumped(b, 6);

        write_record(&mut raw, 0, &[0xAB; 40]).await.unwrap();

        let mut got = Vec::new();
        right.read_to_end(&mut got).await.unwrap();
        assert!(got.is_empty());
        assert!(fault.is_set());
    }

    #[tokio::test]
    async fn test_truncated_record_sets_fault() {
        let (mut raw, b) = tokio::io::duplex(4096);
        let (mut right, fault) = pumped(b, 7);

        raw.write_all(&[10, 0, 0, 0]).await.unwrap();
        drop(raw);

        let mut got = Vec::new();
        right.read_to_end(&mut got).await.unwrap();
        assert!(fault.is_set());
    }
}
