//! Channel message framing.
//!
//! Every message on the direct channel starts with a one-byte kind tag.
//! The kind is never inferred from the body, so a chunk whose bytes
//! happen to look like JSON is still a chunk.
//!
//! | tag    | kind      | body                                  |
//! |--------|-----------|---------------------------------------|
//! | `0x00` | heartbeat | empty                                 |
//! | `0x01` | control   | JSON `{"type":"metadata",...}` etc.   |
//! | `0x02` | chunk     | raw file bytes                        |

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

/// Maximum payload of a single chunk message (16 KiB).
pub const CHUNK_SIZE: usize = 16 * 1024;

const TAG_HEARTBEAT: u8 = 0x00;
const TAG_CONTROL: u8 = 0x01;
const TAG_CHUNK: u8 = 0x02;

/// Errors produced while decoding a channel message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("unknown frame tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("malformed control message: {0}")]
    MalformedControl(String),
}

/// Description of the file about to be streamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

/// JSON control messages that delimit a file's chunk stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Metadata(FileMetadata),
    Complete,
}

/// A decoded channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Heartbeat,
    Control(ControlMessage),
    Chunk(Bytes),
}

impl Frame {
    #[inline]
    pub fn metadata(metadata: FileMetadata) -> Self {
        Frame::Control(ControlMessage::Metadata(metadata))
    }

    #[inline]
    pub fn complete() -> Self {
        Frame::Control(ControlMessage::Complete)
    }

    /// Encodes the frame into a single channel message.
    pub fn encode(&self) -> Bytes {
        match self {
            Frame::Heartbeat => Bytes::from_static(&[TAG_HEARTBEAT]),
            Frame::Control(msg) => {
                let mut buf = BytesMut::with_capacity(128);
                buf.put_u8(TAG_CONTROL);
                let mut writer = buf.writer();
                // A failed body leaves malformed JSON that the peer rejects.
                if let Err(e) = serde_json::to_writer(&mut writer, msg) {
                    error!(error = %e, "Failed to encode control message");
                }
                writer.into_inner().freeze()
            }
            Frame::Chunk(data) => {
                let mut buf = BytesMut::with_capacity(1 + data.len());
                buf.put_u8(TAG_CHUNK);
                buf.put_slice(data);
                buf.freeze()
            }
        }
    }

    /// Decodes one channel message.
    pub fn decode(mut message: Bytes) -> Result<Self, FrameError> {
        if message.is_empty() {
            return Err(FrameError::Empty);
        }
        let tag = message[0];
        let body = message.split_off(1);

        match tag {
            TAG_HEARTBEAT => Ok(Frame::Heartbeat),
            TAG_CONTROL => serde_json::from_slice(&body)
                .map(Frame::Control)
                .map_err(|e| FrameError::MalformedControl(e.to_string())),
            TAG_CHUNK => Ok(Frame::Chunk(body)),
            other => Err(FrameError::UnknownTag(other)),
        }
    }
}
