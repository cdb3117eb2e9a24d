//! Session framing: `[port u16 LE][length u16 LE][payload]`.
//!
//! Port 0 carries control packets, each prefixed with its u32 LE length and
//! split over as many frames as needed. A zero-length frame closes a port; on
//! port 0 it ends the session gracefully.

use std::collections::VecDeque;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::mesh::error::MeshError;
use crate::mesh::packet::{MeshNetworkPacket, MAX_PACKET_SIZE};

pub(crate) const CONTROL_PORT: u16 = 0;

/// Largest payload of one frame.
pub(crate) const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    port: u16,
    payload: &[u8],
) -> io::Result<()> {
    debug_assert!(payload.len() <= MAX_FRAME_PAYLOAD);
    let mut header = [0u8; 4];
    header[..2].copy_from_slice(&port.to_le_bytes());
    header[2..].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Writes one control packet, split into port 0 frames.
pub(crate) async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &MeshNetworkPacket,
) -> Result<(), MeshError> {
    let body = packet.to_bytes()?;
    let mut bytes = Vec::with_capacity(body.len() + 4);
    bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&body);

    for chunk in bytes.chunks(MAX_FRAME_PAYLOAD) {
        write_frame(writer, CONTROL_PORT, chunk).await?;
    }
    Ok(())
}

/// Reads one frame. `None` on end of stream at a frame boundary.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<(u16, Vec<u8>)>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header[..1]).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    reader.read_exact(&mut header[1..]).await?;

    let port = u16::from_le_bytes([header[0], header[1]]);
    let len = u16::from_le_bytes([header[2], header[3]]) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some((port, payload)))
}

/// Reassembles control packets from port 0 frame payloads.
#[derive(Debug, Default)]
pub(crate) struct PacketAssembler {
    buf: Vec<u8>,
    /// Packets completed but not yet taken by [`read_packet`].
    ready: VecDeque<MeshNetworkPacket>,
}

impl PacketAssembler {
    /// Adds a payload and returns every packet it completed.
    pub(crate) fn push(&mut self, payload: &[u8]) -> Result<Vec<MeshNetworkPacket>, MeshError> {
        self.buf.extend_from_slice(payload);

        let mut packets = Vec::new();
        loop {
            if self.buf.len() < 4 {
                break;
            }
            let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            if len > MAX_PACKET_SIZE {
                return Err(MeshError::ProtocolError(format!("control packet too large: {} bytes", len)));
            }
            if self.buf.len() < 4 + len {
                break;
            }
            packets.push(MeshNetworkPacket::from_bytes(&self.buf[4..4 + len])?);
            self.buf.drain(..4 + len);
        }
        Ok(packets)
    }

    /// True while a control packet is only partly received.
    pub(crate) fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

/// Reads control frames until one packet is complete. Data frames are
/// skipped. `None` when the stream ends or the remote closes the control
/// channel.
pub(crate) async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    assembler: &mut PacketAssembler,
) -> Result<Option<MeshNetworkPacket>, MeshError> {
    loop {
        if let Some(packet) = assembler.ready.pop_front() {
            return Ok(Some(packet));
        }
        let Some((port, payload)) = read_frame(reader).await? else {
            return Ok(None);
        };
        if port != CONTROL_PORT {
            continue;
        }
        if payload.is_empty() {
            return Ok(None);
        }
        let packets = assembler.push(&payload)?;
        assembler.ready.extend(packets);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::UserId;
    use crate::mesh::peer_info::MeshNetworkPeerInfo;

    #[tokio::test]
    async fn test_large_packet_spans_frames() {
        let (mut a, mut b) = tokio::io::duplex(1 << 20);
        let packet = MeshNetworkPacket::ProfileDisplayImage {
            image: vec![0xAB; 150_000],
            date_modified: chrono::Utc::now(),
        };
        write_packet(&mut a, &packet).await.unwrap();
        drop(a);

        let mut assembler = PacketAssembler::default();
        let mut frames = 0;
        let mut received = Vec::new();
        while let Some((port, payload)) = read_frame(&mut b).await.unwrap() {
            assert_eq!(port, CONTROL_PORT);
            frames += 1;
            received.extend(assembler.push(&payload).unwrap());
        }

        assert_eq!(frames, 3);
        assert_eq!(received, vec![packet]);
    }

    #[test]
    fn test_assembler_handles_packets_sharing_a_frame() {
        let mut bytes = Vec::new();
        for packet in [
            MeshNetworkPacket::PingRequest,
            MeshNetworkPacket::PeerExchange {
                peers: vec![MeshNetworkPeerInfo::new(UserId([1; 32]), None, vec![])],
            },
        ] {
            let body = packet.to_bytes().unwrap();
            bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&body);
        }

        let mut assembler = PacketAssembler::default();
        let (head, tail) = bytes.split_at(3);
        assert!(assembler.push(head).unwrap().is_empty());
        let packets = assembler.push(tail).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], MeshNetworkPacket::PingRequest);
    }

    #[tokio::test]
    async fn test_read_packet_stops_at_close_frame() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(&mut a, 5, b"data").await.unwrap();
        write_packet(&mut a, &MeshNetworkPacket::PingRequest).await.unwrap();
        write_packet(&mut a, &MeshNetworkPacket::PingResponse).await.unwrap();
        write_frame(&mut a, CONTROL_PORT, &[]).await.unwrap();

        let mut assembler = PacketAssembler::default();
        let first = read_packet(&mut b, &mut assembler).await.unwrap();
        assert_eq!(first, Some(MeshNetworkPacket::PingRequest));
        let second = read_packet(&mut b, &mut assembler).await.unwrap();
        assert_eq!(second, Some(MeshNetworkPacket::PingResponse));
        assert_eq!(read_packet(&mut b, &mut assembler).await.unwrap(), None);
    }

    #[test]
    fn test_oversized_length_is_protocol_error() {
        let mut assembler = PacketAssembler::default();
        let err = assembler.push(&u32::MAX.to_le_bytes()).unwrap_err();
        assert!(matches!(err, MeshError::ProtocolError(_)));
    }
}
