//! Relay wire messages.
//!
//! Every WebSocket frame is a JSON text frame of the form
//! `{"event": "<kind>", "data": <payload>}`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier the relay assigns to each connected endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Case-normalized room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Longest room id the relay accepts.
    pub const MAX_LEN: usize = 64;

    /// Trims and upper-cases `raw`. Returns `None` for empty or
    /// overlong ids.
    pub fn normalize(raw: &str) -> Option<Self> {
        let id = raw.trim().to_uppercase();
        if id.is_empty() || id.len() > Self::MAX_LEN {
            return None;
        }
        Some(Self(id))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A signal payload addressed to a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub target: String,
    pub signal: Value,
    pub caller_id: ConnectionId,
}

/// A signal payload as delivered to a room member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedSignal {
    pub signal: Value,
    pub caller_id: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub id: ConnectionId,
}

/// Client to relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    JoinRoom(String),
    Signal(SignalEnvelope),
}

/// Relay to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    Welcome(Welcome),
    UserConnected(ConnectionId),
    Signal(RelayedSignal),
    PeerLeft(ConnectionId),
    RoomFull(RoomId),
    /// The room was dropped after sitting idle.
    RoomExpired(RoomId),
    Error(String),
}

impl ClientMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_room_id_normalize() {
        assert_eq!(RoomId::normalize("  ab12c3 ").unwrap().as_str(), "AB12C3");
        assert!(RoomId::normalize("").is_none());
        assert!(RoomId::normalize("   ").is_none());
        assert!(RoomId::normalize(&"x".repeat(65)).is_none());
        assert!(RoomId::normalize(&"x".repeat(64)).is_some());
    }

    #[test]
    fn test_join_room_wire_format() {
        let msg = ClientMessage::JoinRoom("AB12C3".to_string());
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"event": "join-room", "data": "AB12C3"}));
    }

    #[test]
    fn test_signal_wire_format() {
        let caller = ConnectionId::new();
        let msg = ClientMessage::Signal(SignalEnvelope {
            target: "AB12C3".to_string(),
            signal: json!({"type": "offer"}),
            caller_id: caller,
        });
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["event"], "signal");
        assert_eq!(value["data"]["target"], "AB12C3");
        assert_eq!(value["data"]["callerId"], caller.to_string());
        assert_eq!(value["data"]["signal"]["type"], "offer");
    }

    #[test]
    fn test_server_messages_parse() {
        let id = ConnectionId::new();
        let text = format!(r#"{{"event":"user-connected","data":"{id}"}}"#);
        assert_eq!(
            ServerMessage::from_json(&text).unwrap(),
            ServerMessage::UserConnected(id)
        );

        let text = format!(r#"{{"event":"welcome","data":{{"id":"{id}"}}}}"#);
        assert_eq!(
            ServerMessage::from_json(&text).unwrap(),
            ServerMessage::Welcome(Welcome { id })
        );

        let full = ServerMessage::RoomFull(RoomId::normalize("abc").unwrap());
        let parsed = ServerMessage::from_json(&full.to_json().unwrap()).unwrap();
        assert_eq!(parsed, full);

        assert_eq!(
            ServerMessage::from_json(r#"{"event":"room-expired","data":"AB12C3"}"#).unwrap(),
            ServerMessage::RoomExpired(RoomId::normalize("AB12C3").unwrap())
        );
    }

    #[test]
    fn test_unknown_event_rejected() {
        assert!(ClientMessage::from_json(r#"{"event":"explode","data":1}"#).is_err());
        assert!(ClientMessage::from_json("not json").is_err());
    }
}
