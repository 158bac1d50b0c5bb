//! Peer sessions.
//!
//! A session is one endpoint's state machine from room join to finished
//! transfer. The initiator creates a room and sends; the responder joins
//! with the code and receives. Both sides exchange transport signals
//! through the relay until their adapter reports the direct channel open,
//! then confirm liveness with heartbeats and run the transfer protocol
//! over the channel.
//!
//! ```text
//! initiator: idle -> awaitingPeer -> negotiating -> connected -> transferring -> completed
//! responder: idle -> negotiating -> connected -> transferring -> completed
//! ```
//!
//! Failures before completion fall back to the role's waiting state
//! (`awaitingPeer` or `idle`). `completed` is terminal.

pub mod code;
pub mod controller;
pub mod error;
pub mod signaling;
pub mod state;
mod timer;

pub use code::{RoomCode, CODE_LEN};
pub use controller::{SessionController, SessionEvent, SessionHandle};
pub use error::SessionError;
pub use signaling::{connect_with_retry, LocalConnector, RelayConnector, RelayLink, WsConnector};
pub use state::{Role, SessionState};
