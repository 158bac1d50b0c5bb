//! Transfer protocol engine.
//!
//! Runs on top of an open direct channel. A transfer is one metadata
//! message, zero or more chunk messages in send order, then one completion
//! message:
//!
//! - [`frame`]: tagged message encoding
//! - [`sender`]: sequential chunking of a file source
//! - [`receiver`]: reassembly and size verification
//! - [`progress`]: progress snapshots shared by both directions

pub mod frame;
pub mod progress;
pub mod receiver;
pub mod sender;

pub use frame::{ControlMessage, FileMetadata, Frame, FrameError, CHUNK_SIZE};
pub use progress::{TransferDirection, TransferId, TransferProgress};
pub use receiver::{ProtocolViolation, ReceivedFile, TransferReceiver};
pub use sender::{guess_mime_type, FileOffer, TransferSender, DEFAULT_MIME_TYPE};
