//! File transfer over data sub-streams.
//!
//! The downloader opens a sub-stream and asks the sender, on the control
//! channel, to serve message `n` from a byte offset into that port. The
//! sender answers with the 8-byte little-endian total file length followed by
//! the file body from the offset, then closes the port. Closing the port
//! without writing anything declines the request.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mesh::data_stream::DataStream;
use crate::mesh::error::MeshError;
use crate::mesh::network::MeshNetwork;
use crate::mesh::packet::MeshNetworkPacket;
use crate::mesh::session::Session;
use crate::mesh::store::MessageItem;

const CHUNK_SIZE: usize = 16 * 1024;

/// State of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileTransferStatus {
    Starting,
    Downloading,
    Complete,
    Canceled,
    /// The sender declined or the stream ended early.
    Failed,
    /// Local I/O or protocol error.
    Error,
}

impl FileTransferStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Starting | Self::Downloading)
    }
}

/// Snapshot published while a download runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub status: FileTransferStatus,
    /// Bytes present in the target file, including a resumed prefix.
    pub bytes_received: u64,
    /// Total file size once the sender reported it.
    pub total: Option<u64>,
}

/// Handle to a running download.
#[derive(Debug)]
pub struct FileTransfer {
    progress: watch::Receiver<TransferProgress>,
    cancel: CancellationToken,
    handle: JoinHandle<TransferProgress>,
}

impl FileTransfer {
    pub fn progress(&self) -> TransferProgress {
        *self.progress.borrow()
    }

    /// Receiver that changes with every progress update.
    pub fn subscribe(&self) -> watch::Receiver<TransferProgress> {
        self.progress.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the download to finish.
    pub async fn wait(self) -> TransferProgress {
        let last = *self.progress.borrow();
        match self.handle.await {
            Ok(progress) => progress,
            Err(e) => {
                warn!(error = %e, "file transfer task failed");
                TransferProgress {
                    status: FileTransferStatus::Error,
                    ..last
                }
            }
        }
    }
}

/// Starts downloading the attachment of local message `message_number`
/// (numbered `remote_number` by the sender) into `path`.
pub(crate) async fn download(
    network: Arc<MeshNetwork>,
    session: Arc<Session>,
    message_number: u32,
    remote_number: u32,
    path: PathBuf,
) -> Result<FileTransfer, MeshError> {
    let file = OpenOptions::new().create(true).append(true).open(&path).await?;
    let offset = file.metadata().await?.len();
    let stream = session.open_data_stream()?;

    let (tx, rx) = watch::channel(TransferProgress {
        status: FileTransferStatus::Starting,
        bytes_received: offset,
        total: None,
    });
    let cancel = CancellationToken::new();
    let job = Download {
        network,
        session,
        stream,
        file,
        path,
        message_number,
        remote_number,
        offset,
        progress: tx,
    };
    let handle = tokio::spawn(job.run(cancel.clone()));

    Ok(FileTransfer {
        progress: rx,
        cancel,
        handle,
    })
}

struct Download {
    network: Arc<MeshNetwork>,
    session: Arc<Session>,
    stream: DataStream,
    file: File,
    path: PathBuf,
    message_number: u32,
    remote_number: u32,
    offset: u64,
    progress: watch::Sender<TransferProgress>,
}

impl Download {
    async fn run(mut self, cancel: CancellationToken) -> TransferProgress {
        let status = tokio::select! {
            _ = cancel.cancelled() => FileTransferStatus::Canceled,
            result = self.receive() => match result {
                Ok(status) => status,
                Err(e) => {
                    debug!(error = %e, "download failed");
                    FileTransferStatus::Error
                }
            },
        };

        let _ = self.file.flush().await;
        self.stream.close().await;

        if status == FileTransferStatus::Complete {
            if let Err(e) = self.record_local_path().await {
                warn!(message_number = self.message_number, error = %e, "failed to record downloaded file");
            }
            info!(path = %self.path.display(), "file downloaded");
        }

        self.progress.send_modify(|p| p.status = status);
        *self.progress.borrow()
    }

    async fn receive(&mut self) -> Result<FileTransferStatus, MeshError> {
        self.session
            .send_packet(&MeshNetworkPacket::FileRequest {
                message_number: self.remote_number,
                offset: self.offset,
                port: self.stream.port(),
            })
            .await?;

        if self.stream.peek_byte().await?.is_none() {
            return Ok(FileTransferStatus::Failed);
        }
        let mut header = [0u8; 8];
        self.stream.read_exact(&mut header).await?;
        let total = u64::from_le_bytes(header);
        self.progress.send_modify(|p| {
            p.status = FileTransferStatus::Downloading;
            p.total = Some(total);
        });

        let mut received = self.offset;
        let mut buf = vec![0u8; CHUNK_SIZE];
        while received < total {
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(FileTransferStatus::Failed);
            }
            self.file.write_all(&buf[..n]).await?;
            received += n as u64;
            self.progress.send_modify(|p| p.bytes_received = received);
        }
        Ok(FileTransferStatus::Complete)
    }

    async fn record_local_path(&self) -> Result<(), MeshError> {
        let _guard = self.network.store_lock().lock().await;
        let store = self.network.store();
        let mut item = MessageItem::read_from(store.as_ref(), self.message_number)?;
        if let Some(attachment) = item.file_attachment.as_mut() {
            attachment.local_path = Some(self.path.clone());
        }
        item.update_in(store.as_ref())
    }
}

/// Serves a peer's request for the attachment of message `message_number`.
pub(crate) async fn serve_file_request(
    session: Arc<Session>,
    network: Arc<MeshNetwork>,
    message_number: u32,
    offset: u64,
    port: u16,
) {
    let mut stream = match session.open_data_stream_at(port) {
        Ok(stream) => stream,
        Err(e) => {
            debug!(port, error = %e, "cannot serve file request");
            return;
        }
    };

    match local_attachment(&network, message_number) {
        Some(path) => {
            debug!(message_number, offset, port, "serving file");
            if let Err(e) = send_file(&mut stream, &path, offset).await {
                debug!(message_number, error = %e, "file upload interrupted");
            }
        }
        None => debug!(message_number, "declining file request"),
    }
    stream.close().await;
}

/// Path of a file the local user attached to `message_number`.
fn local_attachment(network: &MeshNetwork, message_number: u32) -> Option<PathBuf> {
    let item = network.get_message(message_number).ok()?;
    if !item.is_sent_by(&network.local_user_id()) {
        return None;
    }
    item.file_attachment?.local_path
}

async fn send_file(stream: &mut DataStream, path: &Path, offset: u64) -> Result<(), MeshError> {
    let mut file = File::open(path).await?;
    let total = file.metadata().await?.len();
    stream.write(&total.to_le_bytes()).await?;
    file.seek(SeekFrom::Start(offset.min(total))).await?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        stream.write(&buf[..n]).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finished_states() {
        assert!(!FileTransferStatus::Starting.is_finished());
        assert!(!FileTransferStatus::Downloading.is_finished());
        assert!(FileTransferStatus::Complete.is_finished());
        assert!(FileTransferStatus::Canceled.is_finished());
        assert!(FileTransferStatus::Failed.is_finished());
        assert!(FileTransferStatus::Error.is_finished());
    }
}
