//! Receive path: reassembles a chunk stream into a file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::frame::FileMetadata;
use super::progress::{TransferDirection, TransferId, TransferProgress};

/// Violations of the metadata, chunks, completion ordering.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("chunk received before metadata")]
    ChunkBeforeMetadata,

    #[error("completion received before metadata")]
    CompleteBeforeMetadata,

    #[error("size mismatch: expected {expected} bytes, received {received}")]
    SizeMismatch { expected: u64, received: u64 },

    #[error("chunk overruns advertised size: expected {expected} bytes, would have {received}")]
    Overflow { expected: u64, received: u64 },

    #[error("unexpected message while not receiving: {0}")]
    Unexpected(&'static str),
}

/// A fully received file, ready for the caller to persist.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub transfer_id: TransferId,
    pub metadata: FileMetadata,
    pub data: Bytes,
    pub received_at: Instant,
}

impl ReceivedFile {
    #[inline]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// File name safe to join onto a directory: the final path component
    /// of the advertised name, or `unknown`.
    pub fn safe_file_name(&self) -> String {
        Path::new(&self.metadata.name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Writes the file into `dir`, creating the directory if needed.
    pub async fn persist(&self, dir: impl AsRef<Path>) -> std::io::Result<PathBuf> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let dest = dir.join(self.safe_file_name());
        tokio::fs::write(&dest, &self.data).await?;
        info!(file_name = %self.metadata.name, size = self.size(), dest = %dest.display(), "Received file persisted");
        Ok(dest)
    }
}

#[derive(Debug)]
struct IncomingTransfer {
    metadata: FileMetadata,
    chunks: Vec<Bytes>,
    progress: TransferProgress,
}

/// Receive-side state of the transfer protocol.
///
/// Holds at most one in-flight transfer. A new metadata message discards
/// whatever was partially received before it.
#[derive(Debug, Default)]
pub struct TransferReceiver {
    active: Option<IncomingTransfer>,
}

impl TransferReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while a transfer has started and not yet finished.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn progress(&self) -> Option<&TransferProgress> {
        self.active.as_ref().map(|t| &t.progress)
    }

    /// Starts a new transfer, dropping any partial one.
    pub fn on_metadata(&mut self, metadata: FileMetadata) -> TransferProgress {
        if let Some(prev) = self.active.take() {
            warn!(
                transfer_id = %prev.progress.transfer_id,
                received = prev.progress.transferred_bytes,
                "New metadata replaces partial transfer"
            );
        }

        let progress = TransferProgress::new(
            TransferId::new(),
            TransferDirection::Receive,
            Arc::from(metadata.name.as_str()),
            metadata.size,
        );
        info!(
            transfer_id = %progress.transfer_id,
            file_name = %metadata.name,
            size = metadata.size,
            mime_type = %metadata.mime_type,
            "Receiving file"
        );

        self.active = Some(IncomingTransfer {
            metadata,
            chunks: Vec::new(),
            progress: progress.clone(),
        });
        progress
    }

    /// Appends a chunk in arrival order and returns updated progress.
    ///
    /// A chunk that would take the total past the advertised size discards
    /// the transfer.
    pub fn on_chunk(&mut self, chunk: Bytes) -> Result<TransferProgress, ProtocolViolation> {
        let transfer = self
            .active
            .as_mut()
            .ok_or(ProtocolViolation::ChunkBeforeMetadata)?;

        let expected = transfer.metadata.size;
        let received = transfer.progress.transferred_bytes.saturating_add(chunk.len() as u64);
        if received > expected {
            warn!(
                transfer_id = %transfer.progress.transfer_id,
                expected,
                received,
                "Chunk overruns advertised size, discarding transfer"
            );
            self.active = None;
            return Err(ProtocolViolation::Overflow { expected, received });
        }

        transfer.progress.advance(chunk.len() as u64);
        transfer.chunks.push(chunk);
        Ok(transfer.progress.clone())
    }

    /// Finishes the transfer.
    ///
    /// The received byte count must equal the advertised size; otherwise
    /// the partial data is discarded and a violation is returned.
    pub fn on_complete(&mut self) -> Result<ReceivedFile, ProtocolViolation> {
        let transfer = self
            .active
            .take()
            .ok_or(ProtocolViolation::CompleteBeforeMetadata)?;

        let expected = transfer.metadata.size;
        let received = transfer.progress.transferred_bytes;
        if received != expected {
            warn!(
                transfer_id = %transfer.progress.transfer_id,
                expected,
                received,
                "Completion with mismatched size, discarding transfer"
            );
            return Err(ProtocolViolation::SizeMismatch { expected, received });
        }

        let mut buf = BytesMut::with_capacity(received as usize);
        for chunk in &transfer.chunks {
            buf.extend_from_slice(chunk);
        }

        info!(
            transfer_id = %transfer.progress.transfer_id,
            file_name = %transfer.metadata.name,
            size = received,
            chunks = transfer.chunks.len(),
            "File reassembled"
        );

        Ok(ReceivedFile {
            transfer_id: transfer.progress.transfer_id,
            metadata: transfer.metadata,
            data: buf.freeze(),
            received_at: Instant::now(),
        })
    }

    /// Drops any partial transfer. Returns true if one was discarded.
    pub fn abandon(&mut self) -> bool {
        match self.active.take() {
            Some(transfer) => {
                debug!(
                    transfer_id = %transfer.progress.transfer_id,
                    received = transfer.progress.transferred_bytes,
                    "Partial transfer abandoned"
                );
                true
            }
            None => false,
        }
    }
}
