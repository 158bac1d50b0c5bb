//! Transport adapter seam.
//!
//! The session controller never negotiates a direct channel itself. It
//! asks a [`TransportFactory`] for a fresh [`TransportAdapter`], forwards
//! the adapter's opaque signals through the relay, feeds the counterpart's
//! signals back in, and waits for [`TransportEvent::Open`].
//!
//! Requirements on implementations:
//! - messages are delivered whole and in send order
//! - dropping an adapter closes its channel

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::session::Role;

pub mod memory;

pub use memory::{MemoryTransport, MemoryTransportFactory};

/// Errors reported by a transport adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("channel is not open")]
    NotOpen,

    #[error("invalid signal: {0}")]
    InvalidSignal(Arc<str>),

    #[error("transport failure: {0}")]
    Failed(Arc<str>),
}

/// Events emitted by an adapter over its lifetime.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local signal payload that must reach the counterpart.
    Signal(Value),
    /// The direct channel is usable.
    Open,
    /// One message from the counterpart.
    Data(Bytes),
    /// The channel closed.
    Closed,
    /// The adapter failed.
    Error(Arc<str>),
}

/// Sink an adapter reports its events into.
pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// One point-to-point negotiation attempt and, once open, its channel.
#[async_trait]
pub trait TransportAdapter: Send {
    /// Consumes a signal payload produced by the counterpart's adapter.
    fn signal(&mut self, payload: Value) -> Result<(), TransportError>;

    /// Hands one message to the channel.
    ///
    /// Resolves once the message has been accepted by the channel.
    async fn send(&mut self, message: Bytes) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    /// Tears the channel down. Idempotent.
    fn close(&mut self);
}

/// Builds adapters for a session.
pub trait TransportFactory: Send + Sync {
    fn create(&self, role: Role, events: TransportEvents) -> Box<dyn TransportAdapter>;
}
