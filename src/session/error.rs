//! Session error taxonomy.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::state::SessionState;
use crate::transfer::ProtocolViolation;
use crate::transport::TransportError;

/// Errors surfaced by a session.
///
/// Cheap to clone so they can travel inside [`SessionEvent`]s.
///
/// [`SessionEvent`]: super::SessionEvent
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The relay could not be reached, the join retry ran out, or the
    /// room refused us.
    #[error("discovery failed: {0}")]
    Discovery(Arc<str>),

    /// No channel opened in time.
    #[error("no direct channel within {}s", .0.as_secs())]
    NegotiationTimeout(Duration),

    /// The transport adapter reported a failure.
    #[error("transport error: {0}")]
    Transport(Arc<str>),

    /// The channel closed outside a terminal state.
    #[error("channel closed unexpectedly")]
    ChannelClosed,

    /// The counterpart broke the transfer protocol. Only the current
    /// transfer is aborted.
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),

    /// The counterpart left the room before the channel opened.
    #[error("peer left the room")]
    PeerLeft,

    /// The request does not fit the current state.
    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: SessionState,
    },

    #[error("invalid room code: {0:?}")]
    InvalidRoomCode(Arc<str>),

    /// Reading the outgoing file failed.
    #[error("i/o error: {0}")]
    Io(Arc<str>),

    /// The session task is gone.
    #[error("session has shut down")]
    Shutdown,
}

impl SessionError {
    #[inline]
    pub(crate) fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(Arc::from(msg.into()))
    }

    #[inline]
    pub(crate) fn invalid_room_code(raw: &str) -> Self {
        Self::InvalidRoomCode(Arc::from(raw))
    }

    #[inline]
    pub(crate) fn io(msg: impl Into<String>) -> Self {
        Self::Io(Arc::from(msg.into()))
    }

    /// Returns true if the session fell back to a waiting state and the
    /// user may simply try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::Discovery(_)
                | SessionError::NegotiationTimeout(_)
                | SessionError::Transport(_)
                | SessionError::ChannelClosed
                | SessionError::PeerLeft
        )
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotOpen => SessionError::ChannelClosed,
            other => SessionError::Transport(Arc::from(other.to_string())),
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            SessionError::NegotiationTimeout(Duration::from_secs(60)).to_string(),
            "no direct channel within 60s"
        );
        assert_eq!(
            SessionError::InvalidState {
                action: "send a file",
                state: SessionState::Negotiating
            }
            .to_string(),
            "cannot send a file while negotiating"
        );
        let err: SessionError = ProtocolViolation::ChunkBeforeMetadata.into();
        assert_eq!(err.to_string(), "protocol violation: chunk received before metadata");
    }

    #[test]
    fn test_transport_conversion() {
        assert_eq!(SessionError::from(TransportError::NotOpen), SessionError::ChannelClosed);
        assert!(matches!(
            SessionError::from(TransportError::Failed(Arc::from("boom"))),
            SessionError::Transport(msg) if msg.contains("boom")
        ));
    }

    #[test]
    fn test_retryable() {
        assert!(SessionError::discovery("x").is_retryable());
        assert!(SessionError::ChannelClosed.is_retryable());
        assert!(!SessionError::Shutdown.is_retryable());
        assert!(!SessionError::from(ProtocolViolation::CompleteBeforeMetadata).is_retryable());
    }
}
