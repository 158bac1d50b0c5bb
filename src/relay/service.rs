//! Relay service: room registry plus per-connection outboxes.
//!
//! Transport-agnostic. The WebSocket server and in-process links both drive
//! the same service; each connection gets an unbounded outbox so delivery
//! never blocks while the registry lock is held.

use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::protocol::{ClientMessage, ConnectionId, RoomId, ServerMessage, SignalEnvelope, Welcome};
use super::registry::{Delivery, JoinOutcome, RoomRegistry};

/// Outbox half handed to whoever owns a connection's wire.
pub type Outbox = mpsc::UnboundedReceiver<ServerMessage>;

/// The rendezvous service shared by all connections.
#[derive(Debug)]
pub struct RelayService {
    registry: Mutex<RoomRegistry>,
    connections: DashMap<ConnectionId, mpsc::UnboundedSender<ServerMessage>>,
}

impl Default for RelayService {
    fn default() -> Self {
        Self::new(super::registry::DEFAULT_MAX_MEMBERS)
    }
}

impl RelayService {
    pub fn new(max_members: usize) -> Self {
        Self {
            registry: Mutex::new(RoomRegistry::new(max_members)),
            connections: DashMap::new(),
        }
    }

    #[inline]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[inline]
    pub fn room_count(&self) -> usize {
        self.registry.lock().room_count()
    }

    /// Members of a room, if it exists.
    pub fn members(&self, room: &str) -> Option<Vec<ConnectionId>> {
        let room = RoomId::normalize(room)?;
        self.registry.lock().members(&room).map(<[_]>::to_vec)
    }

    /// Registers a new connection and greets it with its id.
    pub fn connect(&self) -> (ConnectionId, Outbox) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ServerMessage::Welcome(Welcome { id }));
        self.connections.insert(id, tx);
        info!(conn = %id, "User connected");
        (id, rx)
    }

    /// Dispatches one message received from `from`.
    pub fn handle(&self, from: ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::JoinRoom(room) => self.join(from, &room),
            ClientMessage::Signal(envelope) => self.relay(from, envelope),
        }
    }

    /// Adds `from` to a room and announces it to the other members.
    #[instrument(skip(self), fields(conn = %from))]
    pub fn join(&self, from: ConnectionId, room: &str) {
        let Some(room) = RoomId::normalize(room) else {
            warn!(raw = %room, "Rejected join with invalid room id");
            self.send(from, ServerMessage::Error(format!("invalid room id: {room:?}")));
            return;
        };

        let outcome = self.registry.lock().join(from, room.clone());
        match outcome {
            JoinOutcome::Joined { notify, rejoined } => {
                info!(%room, rejoined, notified = notify.len(), "User joined room");
                self.deliver(notify);
            }
            JoinOutcome::Full => {
                self.send(from, ServerMessage::RoomFull(room));
            }
        }
    }

    /// Forwards a signal to the other members of its target room.
    ///
    /// `callerId` is stamped with the real sender so the exclusion rule
    /// cannot be bypassed by a client.
    pub fn relay(&self, from: ConnectionId, envelope: SignalEnvelope) {
        if envelope.caller_id != from {
            warn!(conn = %from, claimed = %envelope.caller_id, "Signal callerId does not match sender, overwriting");
        }

        let Some(room) = RoomId::normalize(&envelope.target) else {
            debug!(conn = %from, "Signal with empty target dropped");
            return;
        };

        let deliveries = self.registry.lock().relay(&room, from, envelope.signal);
        match deliveries {
            Some(deliveries) => {
                debug!(conn = %from, %room, recipients = deliveries.len(), "Relaying signal");
                self.deliver(deliveries);
            }
            None => {
                debug!(conn = %from, %room, "Room not found or empty, signal dropped");
            }
        }
    }

    /// Forgets a connection and tells its room-mates it left.
    pub fn disconnect(&self, id: ConnectionId) {
        self.connections.remove(&id);
        let notify = self.registry.lock().disconnect(id);
        info!(conn = %id, notified = notify.len(), "User disconnected");
        self.deliver(notify);
    }

    /// Drops rooms idle for longer than `max_idle` and tells their
    /// remaining members. Returns the number of rooms removed.
    pub fn reap_idle(&self, max_idle: Duration) -> usize {
        let reaped = self.registry.lock().reap_idle(max_idle);
        self.deliver(reaped.notify);
        reaped.rooms.len()
    }

    fn deliver(&self, deliveries: Vec<Delivery>) {
        for Delivery { to, message } in deliveries {
            self.send(to, message);
        }
    }

    /// Queues one message for a connection. Unknown or closed
    /// connections are ignored.
    pub fn send(&self, to: ConnectionId, message: ServerMessage) {
        let Some(tx) = self.connections.get(&to).map(|entry| entry.value().clone()) else {
            debug!(conn = %to, "Delivery to unknown connection dropped");
            return;
        };
        if tx.send(message).is_err() {
            debug!(conn = %to, "Outbox closed, delivery dropped");
        }
    }
}
