use dashmap::DashMap;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chatrelay_core::models::{ConnectionId, RoomName};

use super::events::ServerEvent;

/// Delivery capability for one client connection.
pub type ClientSender = mpsc::UnboundedSender<ServerEvent>;

#[derive(Debug, Clone)]
struct RoomMember {
    connection_id: ConnectionId,
    sender: ClientSender,
}

#[derive(Debug)]
struct ConnectionEntry {
    sender: ClientSender,
    rooms: HashSet<RoomName>,
}

/// In-memory registry of which local connections belong to which rooms.
///
/// Purely process-local state, rebuilt from scratch on restart; clients
/// re-join after reconnecting. A connection may be joined to any number of
/// rooms at once. Per-room DashMap entries give fine-grained locking so a
/// concurrent join and broadcast never observe a torn member set.
#[derive(Default)]
pub struct RoomRegistry {
    /// Map of room -> current members
    rooms: DashMap<RoomName, Vec<RoomMember>>,

    /// Map of connection -> sender and joined rooms, for direct delivery
    /// and disconnect cleanup
    connections: DashMap<ConnectionId, ConnectionEntry>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's delivery channel. Must precede any join so
    /// errors and history snapshots can reach connections that are not in
    /// any room yet.
    pub fn register(&self, connection_id: ConnectionId, sender: ClientSender) {
        self.connections.insert(
            connection_id.clone(),
            ConnectionEntry {
                sender,
                rooms: HashSet::new(),
            },
        );
        debug!(connection_id = %connection_id, "Connection registered");
    }

    /// Add a connection to a room's member set. Idempotent; joining an
    /// unregistered connection is a no-op.
    pub fn join(&self, room: &RoomName, connection_id: &ConnectionId) {
        let Some(mut entry) = self.connections.get_mut(connection_id) else {
            warn!(
                connection_id = %connection_id,
                room = %room,
                "Attempted to join with unknown connection"
            );
            return;
        };

        if !entry.rooms.insert(room.clone()) {
            return; // already a member
        }
        let sender = entry.sender.clone();
        drop(entry);

        self.rooms
            .entry(room.clone())
            .or_default()
            .push(RoomMember {
                connection_id: connection_id.clone(),
                sender,
            });

        info!(
            room = %room,
            connection_id = %connection_id,
            "Connection joined room"
        );
    }

    /// Remove a connection from one room. Idempotent.
    pub fn leave(&self, room: &RoomName, connection_id: &ConnectionId) {
        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            entry.rooms.remove(room);
        }
        self.remove_member(room, connection_id);
    }

    /// Remove a connection from every room it joined and drop its delivery
    /// channel. Used on disconnect; idempotent.
    pub fn leave_all(&self, connection_id: &ConnectionId) {
        let Some((_, entry)) = self.connections.remove(connection_id) else {
            return;
        };

        for room in &entry.rooms {
            self.remove_member(room, connection_id);
        }

        info!(
            connection_id = %connection_id,
            rooms = entry.rooms.len(),
            "Connection unregistered"
        );
    }

    fn remove_member(&self, room: &RoomName, connection_id: &ConnectionId) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.retain(|m| &m.connection_id != connection_id);
        }
        self.remove_room_if_empty(room);
    }

    /// Atomic check-and-remove; a join that races in between keeps the
    /// entry, along with the member it just pushed.
    fn remove_room_if_empty(&self, room: &RoomName) {
        if self
            .rooms
            .remove_if(room, |_, members| members.is_empty())
            .is_some()
        {
            debug!(room = %room, "Room has no more members, removed");
        }
    }

    /// Deliver an event to every member of a room. Members whose channel
    /// is closed are pruned. Returns the number of deliveries.
    pub fn broadcast(&self, room: &RoomName, event: ServerEvent) -> usize {
        self.broadcast_filtered(room, event, None)
    }

    /// Deliver an event to every member of a room except one (the typing
    /// relay path, which never echoes to the originator).
    pub fn broadcast_except(
        &self,
        room: &RoomName,
        excluded: &ConnectionId,
        event: ServerEvent,
    ) -> usize {
        self.broadcast_filtered(room, event, Some(excluded))
    }

    fn broadcast_filtered(
        &self,
        room: &RoomName,
        event: ServerEvent,
        excluded: Option<&ConnectionId>,
    ) -> usize {
        let mut sent_count = 0;
        let mut failed_connections = Vec::new();

        if let Some(members) = self.rooms.get(room) {
            for member in members.iter() {
                if excluded == Some(&member.connection_id) {
                    continue;
                }
                if member.sender.send(event.clone()).is_ok() {
                    sent_count += 1;
                } else {
                    warn!(
                        room = %room,
                        connection_id = %member.connection_id,
                        "Failed to deliver event, marking connection for cleanup"
                    );
                    failed_connections.push(member.connection_id.clone());
                }
            }
        }

        if !failed_connections.is_empty() {
            // Drop the dead members from this room directly; leave_all
            // cannot reach a member whose connection entry is already gone.
            if let Some(mut members) = self.rooms.get_mut(room) {
                members.retain(|m| !failed_connections.contains(&m.connection_id));
            }
            for connection_id in &failed_connections {
                self.leave_all(connection_id);
            }
            self.remove_room_if_empty(room);
        }

        if sent_count > 0 {
            debug!(
                room = %room,
                sent_count = sent_count,
                event_type = %event.event_type(),
                "Broadcast complete"
            );
        }

        sent_count
    }

    /// Deliver an event directly to one connection (history snapshots and
    /// error reports). Silently drops if the connection is gone.
    pub fn send_to(&self, connection_id: &ConnectionId, event: ServerEvent) {
        if let Some(entry) = self.connections.get(connection_id) {
            if entry.sender.send(event).is_err() {
                drop(entry);
                self.leave_all(connection_id);
            }
        }
    }

    /// Current member connections of a room; empty if the room has none.
    #[must_use]
    pub fn members_of(&self, room: &RoomName) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().map(|m| m.connection_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of live registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of rooms with at least one member.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(registry: &RoomRegistry) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let connection_id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(connection_id.clone(), tx);
        (connection_id, rx)
    }

    fn typing_event(room: &str) -> ServerEvent {
        ServerEvent::UserTyping {
            user: "alice".to_string(),
            room: RoomName::from(room),
        }
    }

    #[tokio::test]
    async fn test_join_and_broadcast() {
        let registry = RoomRegistry::new();
        let room = RoomName::from("general");
        let (conn, mut rx) = connect(&registry);

        registry.join(&room, &conn);
        assert_eq!(registry.members_of(&room).len(), 1);
        assert_eq!(registry.connection_count(), 1);

        let sent = registry.broadcast(&room, typing_event("general"));
        assert_eq!(sent, 1);

        let received = rx.recv().await.expect("event");
        assert_eq!(received.event_type(), "user_typing");
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let registry = RoomRegistry::new();
        let room = RoomName::from("general");
        let (conn, mut rx) = connect(&registry);

        registry.join(&room, &conn);
        registry.join(&room, &conn);
        assert_eq!(registry.members_of(&room).len(), 1);

        let sent = registry.broadcast(&room, typing_event("general"));
        assert_eq!(sent, 1);
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_multi_room_membership() {
        let registry = RoomRegistry::new();
        let (conn, mut rx) = connect(&registry);

        registry.join(&RoomName::from("general"), &conn);
        registry.join(&RoomName::from("random"), &conn);
        assert_eq!(registry.room_count(), 2);

        registry.broadcast(&RoomName::from("general"), typing_event("general"));
        registry.broadcast(&RoomName::from("random"), typing_event("random"));
        assert_eq!(rx.recv().await.map(|e| e.event_type()), Some("user_typing"));
        assert_eq!(rx.recv().await.map(|e| e.event_type()), Some("user_typing"));
    }

    #[tokio::test]
    async fn test_leave_all_removes_every_membership() {
        let registry = RoomRegistry::new();
        let (conn, mut rx) = connect(&registry);

        registry.join(&RoomName::from("general"), &conn);
        registry.join(&RoomName::from("random"), &conn);

        registry.leave_all(&conn);
        registry.leave_all(&conn); // idempotent

        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.room_count(), 0);

        let sent = registry.broadcast(&RoomName::from("general"), typing_event("general"));
        assert_eq!(sent, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_except_skips_originator() {
        let registry = RoomRegistry::new();
        let room = RoomName::from("general");
        let (conn_a, mut rx_a) = connect(&registry);
        let (conn_b, mut rx_b) = connect(&registry);
        registry.join(&room, &conn_a);
        registry.join(&room, &conn_b);

        let sent = registry.broadcast_except(&room, &conn_a, typing_event("general"));
        assert_eq!(sent, 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_closed_receiver_is_pruned() {
        let registry = RoomRegistry::new();
        let room = RoomName::from("general");
        let (conn_a, rx_a) = connect(&registry);
        let (conn_b, mut rx_b) = connect(&registry);
        registry.join(&room, &conn_a);
        registry.join(&room, &conn_b);

        drop(rx_a);
        let sent = registry.broadcast(&room, typing_event("general"));
        assert_eq!(sent, 1);
        assert_eq!(registry.members_of(&room), vec![conn_b.clone()]);
        assert!(rx_b.recv().await.is_some());
        let _ = conn_a;
    }

    #[tokio::test]
    async fn test_pruning_sole_member_removes_the_room() {
        let registry = RoomRegistry::new();
        let room = RoomName::from("general");
        let (conn, rx) = connect(&registry);
        registry.join(&room, &conn);

        drop(rx);
        let sent = registry.broadcast(&room, typing_event("general"));
        assert_eq!(sent, 0);
        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_join_racing_last_leave_keeps_membership() {
        for _ in 0..200 {
            let registry = std::sync::Arc::new(RoomRegistry::new());
            let room = RoomName::from("general");
            let (leaver, _leaver_rx) = connect(&registry);
            registry.join(&room, &leaver);
            let (joiner, mut joiner_rx) = connect(&registry);

            let leave_registry = std::sync::Arc::clone(&registry);
            let leave_conn = leaver.clone();
            let leave_room = room.clone();
            let leave = std::thread::spawn(move || {
                leave_registry.leave(&leave_room, &leave_conn);
            });

            let join_registry = std::sync::Arc::clone(&registry);
            let join_conn = joiner.clone();
            let join_room = room.clone();
            let join = std::thread::spawn(move || {
                join_registry.join(&join_room, &join_conn);
            });

            leave.join().expect("leave thread");
            join.join().expect("join thread");

            // The joiner's membership must be deliverable no matter how the
            // leave's empty-room cleanup interleaved with the join.
            assert_eq!(registry.members_of(&room), vec![joiner.clone()]);
            let sent = registry.broadcast(&room, typing_event("general"));
            assert_eq!(sent, 1);
            assert!(joiner_rx.try_recv().is_ok());
        }
    }

    #[tokio::test]
    async fn test_send_to_reaches_unjoined_connection() {
        let registry = RoomRegistry::new();
        let (conn, mut rx) = connect(&registry);

        registry.send_to(
            &conn,
            ServerEvent::Error {
                message: "Failed to send message".to_string(),
            },
        );
        assert_eq!(rx.recv().await.map(|e| e.event_type()), Some("error"));
    }
}
