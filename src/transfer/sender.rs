//! Send path: turns a file source into metadata, chunks and completion.
//!
//! Chunks are produced one at a time. The caller hands each chunk to the
//! channel before asking for the next, so at most one chunk is ever in
//! flight and memory stays bounded by [`CHUNK_SIZE`].

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use super::frame::{FileMetadata, Frame, CHUNK_SIZE};
use super::progress::{TransferDirection, TransferId, TransferProgress};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Fallback MIME type when nothing better is known.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Best-effort MIME type from a file extension.
pub fn guess_mime_type(path: impl AsRef<Path>) -> &'static str {
    let ext = path
        .as_ref()
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());

    match ext.as_deref() {
        Some("txt") | Some("log") => "text/plain",
        Some("md") => "text/markdown",
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        _ => DEFAULT_MIME_TYPE,
    }
}

/// A file the user chose to send: its metadata plus a byte source.
pub struct FileOffer {
    metadata: FileMetadata,
    reader: BoxedReader,
}

impl std::fmt::Debug for FileOffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileOffer")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl FileOffer {
    pub fn new(metadata: FileMetadata, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            metadata,
            reader: Box::new(reader),
        }
    }

    /// Offers an in-memory buffer.
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, data: Bytes) -> Self {
        let metadata = FileMetadata {
            name: name.into(),
            size: data.len() as u64,
            mime_type: mime_type.into(),
        };
        Self::new(metadata, std::io::Cursor::new(data))
    }

    /// Opens a file on disk for streaming.
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let size = file
            .metadata()
            .await
            .context("failed to read file metadata")?
            .len();

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Self::new(
            FileMetadata {
                name,
                size,
                mime_type: guess_mime_type(path).to_string(),
            },
            file,
        ))
    }

    #[inline]
    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }
}

/// Sequential chunk producer for one outgoing file.
pub struct TransferSender {
    metadata: FileMetadata,
    reader: tokio::io::Take<BoxedReader>,
    progress: TransferProgress,
    exhausted: bool,
}

impl TransferSender {
    pub fn new(offer: FileOffer) -> Self {
        let FileOffer { metadata, reader } = offer;
        let progress = TransferProgress::new(
            TransferId::new(),
            TransferDirection::Send,
            Arc::from(metadata.name.as_str()),
            metadata.size,
        );
        info!(
            transfer_id = %progress.transfer_id,
            file_name = %metadata.name,
            size = metadata.size,
            "Starting file send"
        );
        // Never send more than advertised.
        let reader = reader.take(metadata.size);
        Self {
            metadata,
            reader,
            progress,
            exhausted: false,
        }
    }

    #[inline]
    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    #[inline]
    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }

    /// The message that must precede every chunk.
    pub fn metadata_frame(&self) -> Frame {
        Frame::metadata(self.metadata.clone())
    }

    /// Reads the next chunk of up to [`CHUNK_SIZE`] bytes.
    ///
    /// Returns `None` once the source is exhausted.
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut buf = BytesMut::zeroed(CHUNK_SIZE);
        let mut filled = 0;
        while filled < CHUNK_SIZE {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                self.exhausted = true;
                break;
            }
            filled += n;
        }

        if filled == 0 {
            if self.progress.transferred_bytes != self.metadata.size {
                warn!(
                    transfer_id = %self.progress.transfer_id,
                    expected = self.metadata.size,
                    read = self.progress.transferred_bytes,
                    "Source ended before advertised size"
                );
            }
            return Ok(None);
        }

        buf.truncate(filled);
        Ok(Some(buf.freeze()))
    }

    /// Records that a chunk of `len` bytes was handed to the channel.
    pub fn record_sent(&mut self, len: usize) -> TransferProgress {
        self.progress.advance(len as u64);
        debug!(
            transfer_id = %self.progress.transfer_id,
            sent = self.progress.transferred_bytes,
            total = self.progress.total_bytes,
            "Chunk sent"
        );
        self.progress.clone()
    }
}
