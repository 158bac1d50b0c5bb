//! Room registry.
//!
//! Pure bookkeeping: every operation computes who must be told what and
//! returns it as a list of [`Delivery`] values. Nothing here performs I/O,
//! so callers can run each operation as one short critical section and
//! deliver after releasing the lock.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info};

use super::protocol::{ConnectionId, RelayedSignal, RoomId, ServerMessage};

/// Default member cap per room.
pub const DEFAULT_MAX_MEMBERS: usize = 2;

/// A message bound for one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: ConnectionId,
    pub message: ServerMessage,
}

impl Delivery {
    #[inline]
    fn new(to: ConnectionId, message: ServerMessage) -> Self {
        Self { to, message }
    }
}

/// Result of a join attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    /// The connection is a member; `notify` tells the other members.
    Joined {
        notify: Vec<Delivery>,
        rejoined: bool,
    },
    /// The room is at its member cap.
    Full,
}

/// Rooms removed by an idle sweep, and the notices owed to their members.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reaped {
    pub rooms: Vec<RoomId>,
    pub notify: Vec<Delivery>,
}

#[derive(Debug)]
struct Room {
    /// Members in join order.
    members: Vec<ConnectionId>,
    last_activity: Instant,
}

impl Room {
    fn new(now: Instant) -> Self {
        Self {
            members: Vec::with_capacity(DEFAULT_MAX_MEMBERS),
            last_activity: now,
        }
    }

    #[inline]
    fn contains(&self, id: &ConnectionId) -> bool {
        self.members.contains(id)
    }
}

/// In-memory map of rooms to connected members.
#[derive(Debug)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Room>,
    memberships: HashMap<ConnectionId, HashSet<RoomId>>,
    max_members: usize,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MEMBERS)
    }
}

impl RoomRegistry {
    pub fn new(max_members: usize) -> Self {
        Self {
            rooms: HashMap::new(),
            memberships: HashMap::new(),
            max_members: max_members.max(1),
        }
    }

    #[inline]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Members of `room` in join order.
    pub fn members(&self, room: &RoomId) -> Option<&[ConnectionId]> {
        self.rooms.get(room).map(|r| r.members.as_slice())
    }

    /// Rooms `id` currently belongs to.
    pub fn rooms_of(&self, id: &ConnectionId) -> Vec<RoomId> {
        self.memberships
            .get(id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Adds `id` to `room`, creating the room if needed.
    ///
    /// Joining again is a no-op for membership but still announces the
    /// joiner to everyone else, so a returning peer restarts negotiation.
    pub fn join(&mut self, id: ConnectionId, room: RoomId) -> JoinOutcome {
        let now = Instant::now();
        let max_members = self.max_members;
        let entry = self.rooms.entry(room.clone()).or_insert_with(|| Room::new(now));

        let rejoined = entry.contains(&id);
        if !rejoined {
            if entry.members.len() >= max_members {
                info!(%room, conn = %id, "Join rejected, room is full");
                return JoinOutcome::Full;
            }
            entry.members.push(id);
        }
        entry.last_activity = now;

        let notify = entry
            .members
            .iter()
            .filter(|member| **member != id)
            .map(|member| Delivery::new(*member, ServerMessage::UserConnected(id)))
            .collect();

        self.memberships.entry(id).or_default().insert(room.clone());
        debug!(%room, conn = %id, members = entry.members.len(), rejoined, "Joined room");

        JoinOutcome::Joined { notify, rejoined }
    }

    /// Routes a signal to every member of `room` except `caller`.
    ///
    /// Returns `None` when the room does not exist.
    pub fn relay(&mut self, room: &RoomId, caller: ConnectionId, signal: Value) -> Option<Vec<Delivery>> {
        let entry = self.rooms.get_mut(room)?;
        entry.last_activity = Instant::now();

        let deliveries = entry
            .members
            .iter()
            .filter(|member| **member != caller)
            .map(|member| {
                Delivery::new(
                    *member,
                    ServerMessage::Signal(RelayedSignal {
                        signal: signal.clone(),
                        caller_id: caller,
                    }),
                )
            })
            .collect();
        Some(deliveries)
    }

    /// Removes `id` from every room and tells the remaining members.
    /// Rooms left empty are deleted.
    pub fn disconnect(&mut self, id: ConnectionId) -> Vec<Delivery> {
        let Some(rooms) = self.memberships.remove(&id) else {
            return Vec::new();
        };

        let mut notify = Vec::new();
        for room in rooms {
            let Some(entry) = self.rooms.get_mut(&room) else {
                continue;
            };
            entry.members.retain(|member| *member != id);
            if entry.members.is_empty() {
                self.rooms.remove(&room);
                debug!(%room, "Room removed, last member left");
                continue;
            }
            notify.extend(
                entry
                    .members
                    .iter()
                    .map(|member| Delivery::new(*member, ServerMessage::PeerLeft(id))),
            );
        }
        notify
    }

    /// Removes rooms with no join or relay activity for longer than
    /// `max_idle`. Members still connected are told with `room-expired`,
    /// since nobody else can reach them through that room any more.
    pub fn reap_idle(&mut self, max_idle: Duration) -> Reaped {
        self.reap_idle_at(Instant::now(), max_idle)
    }

    fn reap_idle_at(&mut self, now: Instant, max_idle: Duration) -> Reaped {
        let expired: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, room)| now.saturating_duration_since(room.last_activity) > max_idle)
            .map(|(id, _)| id.clone())
            .collect();

        let mut notify = Vec::new();
        for room_id in &expired {
            let Some(room) = self.rooms.remove(room_id) else {
                continue;
            };
            for member in room.members {
                if let Some(rooms) = self.memberships.get_mut(&member) {
                    rooms.remove(room_id);
                    if rooms.is_empty() {
                        self.memberships.remove(&member);
                    }
                }
                notify.push(Delivery::new(member, ServerMessage::RoomExpired(room_id.clone())));
            }
            info!(room = %room_id, "Reaped idle room");
        }

        Reaped { rooms: expired, notify }
    }
}
