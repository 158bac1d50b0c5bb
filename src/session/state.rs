//! Session roles and states.

use std::fmt;

/// Which side of a transfer this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Creates the room and sends the file.
    Initiator,
    /// Joins with a code and receives the file.
    Responder,
}

impl Role {
    /// State the session falls back to when a connection attempt fails.
    #[inline]
    #[must_use]
    pub const fn waiting_state(self) -> SessionState {
        match self {
            Role::Initiator => SessionState::AwaitingPeer,
            Role::Responder => SessionState::Idle,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_initiator(self) -> bool {
        matches!(self, Role::Initiator)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// Not in a room, or fell back after a failure.
    #[default]
    Idle,
    /// In a room, waiting for the counterpart to join.
    AwaitingPeer,
    /// A transport adapter is exchanging signals.
    Negotiating,
    /// The direct channel is open.
    Connected,
    /// A file is moving over the channel.
    Transferring,
    /// The file arrived or was fully sent. Terminal.
    Completed,
}

impl SessionState {
    /// Returns true once the direct channel has been established.
    #[inline]
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::Transferring | SessionState::Completed
        )
    }

    /// Returns true if a new transfer may start.
    #[inline]
    #[must_use]
    pub const fn can_transfer(self) -> bool {
        matches!(self, SessionState::Connected)
    }

    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::AwaitingPeer => "awaitingPeer",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Transferring => "transferring",
            SessionState::Completed => "completed",
        };
        f.write_str(name)
    }
}
