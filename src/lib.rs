//! relaydrop - direct two-party file transfer bootstrapped by a tiny relay
//!
//! Two devices that cannot address each other meet in a short-lived room on
//! an always-on relay, trade opaque connection-setup signals through it, and
//! then move a file over the direct channel those signals produced. The
//! relay never sees file data.
//!
//! # Architecture
//!
//! - [`relay`]: rendezvous service, room registry and its WebSocket server
//! - [`session`]: per-endpoint state machine driving join, negotiation,
//!   liveness and timeouts
//! - [`transfer`]: framed metadata/chunk/completion protocol with progress
//! - [`transport`]: the seam to the direct-channel primitive, plus an
//!   in-memory implementation
//! - [`config`]: relay and session settings
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use relaydrop::config::SessionConfig;
//! use relaydrop::session::{SessionController, SessionEvent};
//! use relaydrop::transport::MemoryTransportFactory;
//!
//! let controller = SessionController::new(
//!     SessionConfig::with_relay_url("ws://192.168.1.20:3001/ws"),
//!     Arc::new(MemoryTransportFactory::new()),
//! );
//!
//! // Sender: show the code, wait for the channel, send.
//! let mut session = controller.create_room();
//! println!("Share this code: {}", session.code());
//! while let Some(event) = session.next_event().await {
//!     if let SessionEvent::StateChanged(state) = event {
//!         if state.can_transfer() {
//!             session.send_path("photo.jpg").await?;
//!         }
//!     }
//! }
//! ```

pub mod config;
pub mod relay;
pub mod session;
pub mod transfer;
pub mod transport;

pub use config::{RelayConfig, SessionConfig};
pub use relay::{RelayServer, RelayService};
pub use session::{SessionController, SessionError, SessionEvent, SessionHandle};
