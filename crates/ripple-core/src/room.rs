//! Room registry for Ripple.
//!
//! Tracks which connections belong to which rooms and performs targeted
//! fan-out. The registry holds handles to sockets for delivery only; it never
//! closes a connection.

use crate::socket::{Args, Socket};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ripple_protocol::{codec, BusMessage, Envelope};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// Validate a room name.
///
/// # Errors
///
/// Returns a description of the problem if the name is empty, too long or
/// contains characters outside printable ASCII.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

/// Room registry errors.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidRoom(&'static str),

    /// The connection is not registered.
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// Maximum number of rooms reached.
    #[error("Maximum rooms reached")]
    MaxRoomsReached,

    /// Maximum rooms per connection reached.
    #[error("Maximum memberships reached")]
    MaxMembershipsReached,
}

/// Registry limits.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Maximum number of rooms.
    pub max_rooms: usize,
    /// Maximum rooms a single connection may join.
    pub max_rooms_per_connection: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_rooms: 10_000,
            max_rooms_per_connection: 100,
        }
    }
}

/// Members of one room. Never empty while stored in the registry.
#[derive(Debug, Default)]
struct Room {
    members: HashSet<String>,
}

impl Room {
    fn len(&self) -> usize {
        self.members.len()
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Connection and room membership registry.
///
/// Membership changes and fan-out over the same room are serialized by the
/// room's map entry: a fan-out holds a read guard for its whole delivery
/// pass, so a concurrent leave or disconnect waits for it to finish and is
/// never delivered to after it returns.
pub struct RoomRegistry {
    /// Live connections by id.
    connections: DashMap<String, Socket>,
    /// Rooms by name.
    rooms: DashMap<String, Room>,
    /// Rooms joined per connection.
    memberships: DashMap<String, HashSet<String>>,
    config: RoomConfig,
}

impl RoomRegistry {
    /// Create a registry with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RoomConfig::default())
    }

    /// Create a registry with custom limits.
    #[must_use]
    pub fn with_config(config: RoomConfig) -> Self {
        info!("Creating room registry with config: {:?}", config);
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            config,
        }
    }

    /// Register a connection so it can join rooms and receive broadcasts.
    pub fn register(&self, socket: Socket) {
        debug!(connection = %socket.id(), "Connection registered");
        self.connections.insert(socket.id().to_string(), socket);
    }

    /// Forget a connection and remove it from every room.
    ///
    /// Returns the rooms it left.
    pub fn unregister(&self, connection_id: &str) -> Vec<String> {
        self.connections.remove(connection_id);
        let left = self.on_disconnect(connection_id);
        debug!(connection = %connection_id, rooms = left.len(), "Connection unregistered");
        left
    }

    /// Add a connection to a room, creating the room if absent.
    ///
    /// Idempotent: returns `false` if the connection already was a member.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid, the connection is unknown or
    /// a limit is exceeded.
    pub fn join(&self, connection_id: &str, room: &str) -> Result<bool, RoomError> {
        validate_room_name(room).map_err(RoomError::InvalidRoom)?;

        if !self.connections.contains_key(connection_id) {
            return Err(RoomError::UnknownConnection(connection_id.to_string()));
        }

        {
            // the entry guard serializes joins of one connection
            let mut joined = match self.memberships.entry(connection_id.to_string()) {
                Entry::Occupied(occupied) => {
                    let joined = occupied.into_ref();
                    if joined.contains(room) {
                        return Ok(false);
                    }
                    self.check_limits(joined.len(), room)?;
                    joined
                }
                Entry::Vacant(vacant) => {
                    self.check_limits(0, room)?;
                    vacant.insert(HashSet::new())
                }
            };

            let mut entry = self.rooms.entry(room.to_string()).or_insert_with(|| {
                debug!(room = %room, "Creating room");
                Room::default()
            });
            entry.members.insert(connection_id.to_string());
            joined.insert(room.to_string());

            debug!(
                room = %room,
                connection = %connection_id,
                members = entry.len(),
                "Joined room"
            );
        }

        // Unregistered while joining: its cleanup may already have run.
        if !self.connections.contains_key(connection_id) {
            self.leave(connection_id, room);
            return Err(RoomError::UnknownConnection(connection_id.to_string()));
        }

        Ok(true)
    }

    fn check_limits(&self, joined: usize, room: &str) -> Result<(), RoomError> {
        if joined >= self.config.max_rooms_per_connection {
            return Err(RoomError::MaxMembershipsReached);
        }
        if !self.rooms.contains_key(room) && self.rooms.len() >= self.config.max_rooms {
            return Err(RoomError::MaxRoomsReached);
        }
        Ok(())
    }

    /// Remove a connection from a room, deleting the room once empty.
    ///
    /// Returns `true` if the connection was a member.
    pub fn leave(&self, connection_id: &str, room: &str) -> bool {
        let was_member = self
            .memberships
            .get_mut(connection_id)
            .is_some_and(|mut joined| joined.remove(room));

        let removed = self
            .rooms
            .get_mut(room)
            .is_some_and(|mut entry| entry.members.remove(connection_id));

        self.prune(room);

        if was_member || removed {
            debug!(room = %room, connection = %connection_id, "Left room");
        }
        was_member || removed
    }

    /// Remove a connection from every room it belonged to.
    ///
    /// Safe to call for a connection without memberships. Returns the rooms
    /// it left, sorted.
    pub fn on_disconnect(&self, connection_id: &str) -> Vec<String> {
        let Some((_, joined)) = self.memberships.remove(connection_id) else {
            return Vec::new();
        };

        let mut left: Vec<String> = joined.into_iter().collect();
        left.sort();

        for room in &left {
            if let Some(mut entry) = self.rooms.get_mut(room) {
                entry.members.remove(connection_id);
            }
            self.prune(room);
        }

        left
    }

    fn prune(&self, room: &str) {
        if self.rooms.remove_if(room, |_, r| r.is_empty()).is_some() {
            debug!(room = %room, "Deleted empty room");
        }
    }

    /// Deliver an event to every member of a room. An absent room is a no-op.
    ///
    /// Returns the number of recipients.
    pub fn emit_to_room(&self, room: &str, event: &str, args: Args) -> usize {
        self.fan_out_room(room, &Envelope::new(event, args), None)
    }

    /// Deliver an event to every member of a room except `except`.
    pub fn broadcast_to_room(&self, room: &str, event: &str, except: &str, args: Args) -> usize {
        self.fan_out_room(room, &Envelope::new(event, args), Some(except))
    }

    /// Deliver an event to every registered connection.
    pub fn emit_to_all(&self, event: &str, args: Args) -> usize {
        self.fan_out_all(&Envelope::new(event, args), None)
    }

    /// Deliver an event to every registered connection except `except`.
    pub fn broadcast_to_all(&self, event: &str, except: &str, args: Args) -> usize {
        self.fan_out_all(&Envelope::new(event, args), Some(except))
    }

    /// Deliver an event to one connection. An absent id is a no-op.
    ///
    /// Returns `true` if the event was queued.
    pub fn emit_to_connection(&self, connection_id: &str, event: &str, args: Args) -> bool {
        match self.connections.get(connection_id) {
            Some(socket) => socket.emit(event, args).is_ok(),
            None => {
                trace!(connection = %connection_id, "Emit to unknown connection");
                false
            }
        }
    }

    /// Deliver a relayed bus message to the local recipients.
    pub fn deliver(&self, message: &BusMessage) -> usize {
        let envelope = Envelope::new(message.event_name.clone(), message.data.clone());
        let except = message.except_id.as_deref();
        match &message.room_id {
            Some(room) => self.fan_out_room(room, &envelope, except),
            None => self.fan_out_all(&envelope, except),
        }
    }

    fn fan_out_room(&self, room: &str, envelope: &Envelope, except: Option<&str>) -> usize {
        let Some(entry) = self.rooms.get(room) else {
            trace!(room = %room, event = %envelope.event, "Emit to absent room");
            return 0;
        };
        let Some(text) = encode(envelope) else {
            return 0;
        };

        let mut delivered = 0;
        for member in entry.members.iter() {
            if except == Some(member.as_str()) {
                continue;
            }
            if let Some(socket) = self.connections.get(member) {
                if socket.send_text(text.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }

        trace!(room = %room, event = %envelope.event, recipients = delivered, "Room fan-out");
        delivered
    }

    fn fan_out_all(&self, envelope: &Envelope, except: Option<&str>) -> usize {
        let Some(text) = encode(envelope) else {
            return 0;
        };

        let mut delivered = 0;
        for socket in self.connections.iter() {
            if except == Some(socket.key().as_str()) {
                continue;
            }
            if socket.send_text(text.clone()).is_ok() {
                delivered += 1;
            }
        }

        trace!(event = %envelope.event, recipients = delivered, "Global fan-out");
        delivered
    }

    /// Check if a room exists.
    #[must_use]
    pub fn room_exists(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    /// Get the member count of a room.
    #[must_use]
    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map(|r| r.len()).unwrap_or(0)
    }

    /// Snapshot of a room's members, sorted.
    #[must_use]
    pub fn members(&self, room: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .rooms
            .get(room)
            .map(|r| r.members.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Rooms a connection belongs to, sorted.
    #[must_use]
    pub fn rooms_of(&self, connection_id: &str) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .memberships
            .get(connection_id)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    /// Look up a registered connection.
    #[must_use]
    pub fn socket(&self, connection_id: &str) -> Option<Socket> {
        self.connections.get(connection_id).map(|s| s.value().clone())
    }

    /// Handles to every registered connection.
    #[must_use]
    pub fn sockets(&self) -> Vec<Socket> {
        self.connections.iter().map(|s| s.value().clone()).collect()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RoomStats {
        RoomStats {
            room_count: self.rooms.len(),
            connection_count: self.connections.len(),
            total_memberships: self.memberships.iter().map(|m| m.len()).sum(),
        }
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(envelope: &Envelope) -> Option<String> {
    match codec::encode(envelope) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(event = %envelope.event, error = %e, "Dropping unencodable fan-out");
            None
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone)]
pub struct RoomStats {
    /// Number of non-empty rooms.
    pub room_count: usize,
    /// Number of registered connections.
    pub connection_count: usize,
    /// Total number of memberships.
    pub total_memberships: usize,
}
