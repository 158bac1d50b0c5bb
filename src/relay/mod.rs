//! Rendezvous relay.
//!
//! Lets two anonymous endpoints find each other through a short room code
//! and pass opaque connection-setup signals until they have a direct
//! channel. The relay knows nothing about files.
//!
//! - [`protocol`]: JSON wire messages
//! - [`registry`]: room membership bookkeeping
//! - [`service`]: connection outboxes around the registry
//! - [`server`]: axum WebSocket server, reaper and startup banner

pub mod protocol;
pub mod registry;
pub mod server;
pub mod service;

pub use protocol::{ClientMessage, ConnectionId, RelayedSignal, RoomId, ServerMessage, SignalEnvelope, Welcome};
pub use registry::{Delivery, JoinOutcome, Reaped, RoomRegistry, DEFAULT_MAX_MEMBERS};
pub use server::{local_ipv4_addresses, router, RelayError, RelayServer, HEALTH_TEXT};
pub use service::{Outbox, RelayService};
