//! Data sub-streams multiplexed over a session.
//!
//! Each open port has a bounded single-slot buffer. The session read loop
//! feeds it and waits until the consumer drained it, which pushes back on
//! the sender. Writes go straight to the session's frame writer.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

use crate::mesh::error::MeshError;
use crate::mesh::frame::MAX_FRAME_PAYLOAD;
use crate::mesh::session::Session;

#[derive(Debug, Default)]
struct BufferState {
    data: Vec<u8>,
    read_pos: usize,
    /// Remote sent EOF or the session ended.
    eof: bool,
}

/// Receive side of one port.
#[derive(Debug)]
pub(crate) struct StreamBuffer {
    state: StdMutex<BufferState>,
    capacity: usize,
    data_available: Notify,
    drained: Notify,
}

impl StreamBuffer {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: StdMutex::new(BufferState::default()),
            capacity,
            data_available: Notify::new(),
            drained: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hands `payload` to the reader, one buffer-full at a time. An empty
    /// payload marks end of stream.
    pub(crate) async fn feed(&self, payload: &[u8], timeout: Duration) -> Result<(), MeshError> {
        if payload.is_empty() {
            self.set_eof();
            return Ok(());
        }

        for chunk in payload.chunks(self.capacity) {
            tokio::time::timeout(timeout, self.wait_empty())
                .await
                .map_err(|_| MeshError::FeedTimeout(timeout))?;

            let mut state = self.lock();
            if state.eof {
                return Err(MeshError::StreamClosed);
            }
            state.data.clear();
            state.data.extend_from_slice(chunk);
            state.read_pos = 0;
            drop(state);
            self.data_available.notify_one();
        }
        Ok(())
    }

    async fn wait_empty(&self) {
        loop {
            {
                let state = self.lock();
                if state.read_pos >= state.data.len() || state.eof {
                    return;
                }
            }
            self.drained.notified().await;
        }
    }

    pub(crate) fn set_eof(&self) {
        self.lock().eof = true;
        self.data_available.notify_one();
        self.drained.notify_one();
    }

    pub(crate) fn is_eof(&self) -> bool {
        self.lock().eof
    }

    async fn read(&self, buf: &mut [u8], timeout: Duration, consume: bool) -> Result<usize, MeshError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut state = self.lock();
                let available = state.data.len() - state.read_pos;
                if available > 0 {
                    let n = available.min(buf.len());
                    let start = state.read_pos;
                    buf[..n].copy_from_slice(&state.data[start..start + n]);
                    if consume {
                        state.read_pos += n;
                        if state.read_pos == state.data.len() {
                            state.data.clear();
                            state.read_pos = 0;
                            drop(state);
                            self.drained.notify_one();
                        }
                    }
                    return Ok(n);
                }
                if state.eof {
                    return Ok(0);
                }
            }

            if tokio::time::timeout_at(deadline, self.data_available.notified())
                .await
                .is_err()
            {
                return Err(MeshError::ReadTimeout(timeout));
            }
        }
    }
}

/// One data sub-stream of a session.
pub struct DataStream {
    session: Weak<Session>,
    port: u16,
    buffer: Arc<StreamBuffer>,
    read_timeout: Duration,
    closed: bool,
}

impl std::fmt::Debug for DataStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStream")
            .field("port", &self.port)
            .field("closed", &self.closed)
            .finish()
    }
}

impl DataStream {
    pub(crate) fn new(session: Weak<Session>, port: u16, buffer: Arc<StreamBuffer>, read_timeout: Duration) -> Self {
        Self {
            session,
            port,
            buffer,
            read_timeout,
            closed: false,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    /// Reads available bytes. Returns 0 at end of stream, or a
    /// [`MeshError::ReadTimeout`] when nothing arrived in time.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, MeshError> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.buffer.read(buf, self.read_timeout, true).await
    }

    /// Fills `buf` completely or fails with [`MeshError::StreamClosed`].
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), MeshError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]).await? {
                0 => return Err(MeshError::StreamClosed),
                n => filled += n,
            }
        }
        Ok(())
    }

    /// Returns the next byte without consuming it, `None` at end of stream.
    pub async fn peek_byte(&mut self) -> Result<Option<u8>, MeshError> {
        let mut byte = [0u8; 1];
        match self.buffer.read(&mut byte, self.read_timeout, false).await? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    /// Sends bytes to the remote side of the port.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), MeshError> {
        if self.closed || self.buffer.is_eof() {
            return Err(MeshError::StreamClosed);
        }
        let session = self.session.upgrade().ok_or(MeshError::SessionClosed)?;
        for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
            session.write_frame(self.port, chunk).await?;
        }
        Ok(())
    }

    /// Sends EOF and releases the port.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.buffer.set_eof();
        if let Some(session) = self.session.upgrade() {
            if let Err(e) = session.write_frame(self.port, &[]).await {
                trace!(port = self.port, error = %e, "EOF not sent");
            }
            session.release_port(self.port);
        }
    }
}

impl Drop for DataStream {
    fn drop(&mut self) {
        self.buffer.set_eof();
        if self.closed {
            return;
        }
        let Some(session) = self.session.upgrade() else {
            return;
        };
        session.release_port(self.port);

        let port = self.port;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = session.write_frame(port, &[]).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached(buffer: Arc<StreamBuffer>, timeout: Duration) -> DataStream {
        DataStream::new(Weak::new(), 3, buffer, timeout)
    }

    #[tokio::test]
    async fn test_read_times_out_without_data() {
        let buffer = StreamBuffer::new(8192);
        let mut stream = detached(buffer, Duration::from_millis(50));

        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, MeshError::ReadTimeout(_)));
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let buffer = StreamBuffer::new(8192);
        buffer.feed(b"xyz", Duration::from_secs(1)).await.unwrap();
        let mut stream = detached(buffer, Duration::from_secs(1));

        assert_eq!(stream.peek_byte().await.unwrap(), Some(b'x'));
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 1);
        assert_eq!(buf[0], b'x');

        let mut rest = [0u8; 2];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"yz");
    }

    #[tokio::test]
    async fn test_eof_after_data() {
        let buffer = StreamBuffer::new(8192);
        buffer.feed(b"ab", Duration::from_secs(1)).await.unwrap();
        let mut stream = detached(buffer.clone(), Duration::from_secs(1));

        let feeder = tokio::spawn(async move { buffer.feed(&[], Duration::from_secs(1)).await });

        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 2);
        feeder.await.unwrap().unwrap();
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert_eq!(stream.peek_byte().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_feed_blocks_until_drained() {
        let buffer = StreamBuffer::new(4);
        let mut stream = detached(buffer.clone(), Duration::from_secs(1));

        let feeder = tokio::spawn(async move { buffer.feed(b"abcdefgh", Duration::from_secs(5)).await });

        let mut out = [0u8; 8];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"abcdefgh");
        feeder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_feed_times_out_when_not_drained() {
        let buffer = StreamBuffer::new(4);
        buffer.feed(b"full", Duration::from_secs(1)).await.unwrap();

        let err = buffer.feed(b"more", Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, MeshError::FeedTimeout(_)));
    }

    #[tokio::test]
    async fn test_close_releases_blocked_feed() {
        let buffer = StreamBuffer::new(4);
        buffer.feed(b"full", Duration::from_secs(1)).await.unwrap();
        let mut stream = detached(buffer.clone(), Duration::from_secs(1));

        let feeder = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.feed(b"more", Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), feeder).await.unwrap().unwrap();
        assert!(matches!(result, Err(MeshError::StreamClosed)));
        assert!(buffer.is_eof());
    }

    #[tokio::test]
    async fn test_drop_releases_blocked_feed() {
        let buffer = StreamBuffer::new(4);
        buffer.feed(b"full", Duration::from_secs(1)).await.unwrap();
        let stream = detached(buffer.clone(), Duration::from_secs(1));

        let feeder = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.feed(b"more", Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(stream);

        let result = tokio::time::timeout(Duration::from_secs(1), feeder).await.unwrap().unwrap();
        assert!(matches!(result, Err(MeshError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_write_on_detached_stream_fails() {
        let mut stream = detached(StreamBuffer::new(16), Duration::from_secs(1));
        assert!(matches!(stream.write(b"x").await, Err(MeshError::SessionClosed)));
    }
}
