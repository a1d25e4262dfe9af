use crate::protocol::{ConnectionHandle, Outbound, ServerEvent};
use dashmap::DashMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
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
        self.0.fmt(f)
    }
}

/// The two broadcast groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    Sensors,
    Dashboards,
}

impl Room {
    pub fn name(&self) -> &'static str {
        match self {
            Room::Sensors => "sensors",
            Room::Dashboards => "dashboards",
        }
    }
}

struct Member {
    room: Room,
    handle: ConnectionHandle,
}

/// In-process room membership, keyed by connection.
///
/// Each connection only ever writes its own entry; broadcasts take a
/// snapshot of the room and queue a copy of the event to every member in it.
#[derive(Default)]
pub struct RoomRegistry {
    members: DashMap<ConnectionId, Member>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts `conn` in `room`, replacing any earlier membership. Returns the
    /// room it was in before, if any.
    pub fn join(&self, conn: ConnectionId, room: Room, handle: ConnectionHandle) -> Option<Room> {
        self.members
            .insert(conn, Member { room, handle })
            .map(|previous| previous.room)
    }

    pub fn leave(&self, conn: ConnectionId) -> Option<Room> {
        self.members.remove(&conn).map(|(_, member)| member.room)
    }

    #[cfg(test)]
    pub fn member_count(&self, room: Room) -> usize {
        self.members.iter().filter(|m| m.room == room).count()
    }

    /// Best-effort fan-out to everyone in `room` right now. Returns how many
    /// members the event was queued for.
    pub fn broadcast(&self, room: Room, event: &ServerEvent) -> usize {
        let targets: Vec<ConnectionHandle> = self
            .members
            .iter()
            .filter(|m| m.room == room)
            .map(|m| m.handle.clone())
            .collect();

        targets
            .iter()
            .filter(|handle| handle.send(Outbound::Event(event.clone())).is_ok())
            .count()
    }

    pub fn unicast(&self, conn: ConnectionId, event: ServerEvent) -> bool {
        let handle = match self.members.get(&conn) {
            Some(member) => member.handle.clone(),
            None => return false,
        };
        handle.send(Outbound::Event(event)).is_ok()
    }
}
