//! Fan-out coordination: persist, publish, deliver
//!
//! Every chat message follows the same path regardless of where its sender
//! is connected: append to the store, publish to the bus, and deliver to
//! local room members from the bus subscription. The sending instance does
//! not relay locally on the send path; its own bus echo is the delivery.
//! Only when the publish itself fails does the coordinator fall back to a
//! direct local relay. The fallback first waits for echoes of earlier
//! publishes to land, so local members still see messages in persistence
//! order, and marks the message id so a late echo cannot deliver it twice.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use chatrelay_core::models::{ConnectionId, Message, RoomName, SendRequest};
use chatrelay_core::store::{MessageStore, HISTORY_LIMIT};

use super::bus::BroadcastBus;
use super::dedup::MessageDeduplicator;
use super::events::{ClientCommand, ServerEvent};
use super::registry::RoomRegistry;

/// Error text sent to a client when persistence fails. Internal detail
/// stays in the logs.
const SEND_FAILED: &str = "Failed to send message";

/// Error text sent to a client when the history load fails on join.
const HISTORY_FAILED: &str = "Failed to load message history";

/// How long the fallback relay waits for in-flight echoes of earlier
/// publishes, and how long an unechoed publish is tracked at all.
const ECHO_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Coordinates message flow between local connections, the store, and the
/// broadcast bus. One per instance.
pub struct FanoutCoordinator {
    registry: Arc<RoomRegistry>,
    store: Arc<dyn MessageStore>,
    bus: Arc<dyn BroadcastBus>,
    deduplicator: MessageDeduplicator,

    /// Ids of messages this instance published whose echoes have not come
    /// back yet. The fallback relay drains this before delivering, so a
    /// direct relay never overtakes an echo already in flight.
    pending_echoes: DashMap<String, Instant>,
    echo_flush: Notify,
}

impl FanoutCoordinator {
    #[must_use]
    pub fn new(
        registry: Arc<RoomRegistry>,
        store: Arc<dyn MessageStore>,
        bus: Arc<dyn BroadcastBus>,
        deduplicator: MessageDeduplicator,
    ) -> Self {
        Self {
            registry,
            store,
            bus,
            deduplicator,
            pending_echoes: DashMap::new(),
            echo_flush: Notify::new(),
        }
    }

    /// Subscribe to the bus. Must be called once before serving traffic;
    /// without it no messages reach local members, not even local sends.
    pub fn start(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        self.bus.subscribe(Arc::new(move |message: Message| {
            coordinator.handle_remote(message);
        }));
        info!("Fan-out coordinator subscribed to bus");
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Dispatch one parsed client command.
    pub async fn handle_command(&self, connection_id: &ConnectionId, command: ClientCommand) {
        match command {
            ClientCommand::JoinRoom { room } => self.handle_join(connection_id, room).await,
            ClientCommand::SendMessage {
                sender,
                content,
                room,
            } => {
                self.handle_send(
                    connection_id,
                    SendRequest {
                        sender,
                        content,
                        room,
                    },
                )
                .await;
            }
            ClientCommand::Typing { sender, room } => {
                self.handle_typing(connection_id, &sender, &RoomName::from(room), true);
            }
            ClientCommand::StopTyping { sender, room } => {
                self.handle_typing(connection_id, &sender, &RoomName::from(room), false);
            }
        }
    }

    /// Persist and publish one message. Validation and persistence failures
    /// go back to the originating connection only; other members see
    /// nothing. On publish failure the message is relayed to local members
    /// directly, so a reachable store with an unreachable bus still serves
    /// single-instance traffic.
    pub async fn handle_send(&self, connection_id: &ConnectionId, request: SendRequest) {
        if let Err(e) = request.validate() {
            self.registry.send_to(
                connection_id,
                ServerEvent::Error {
                    message: e.to_string(),
                },
            );
            return;
        }

        let message = match self.store.append(request.into()).await {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, connection_id = %connection_id, "Failed to persist message");
                self.registry.send_to(
                    connection_id,
                    ServerEvent::Error {
                        message: SEND_FAILED.to_string(),
                    },
                );
                return;
            }
        };

        debug!(
            message_id = %message.id,
            room = %message.room,
            sender = %message.sender,
            "Message persisted"
        );

        // Track the publish before it happens; the echo may arrive on the
        // subscriber task before publish() even returns.
        self.pending_echoes
            .retain(|_, published_at| published_at.elapsed() < ECHO_FLUSH_TIMEOUT);
        self.pending_echoes.insert(message.id.clone(), Instant::now());

        if let Err(e) = self.bus.publish(&message).await {
            self.pending_echoes.remove(&message.id);
            warn!(
                error = %e,
                message_id = %message.id,
                "Publish failed, relaying to local members directly"
            );
            // Let echoes of earlier publishes land first so local members
            // still see messages in persistence order, then mark the id so
            // a late echo of this attempt cannot deliver it a second time.
            self.flush_pending_echoes().await;
            self.deduplicator.mark_processed(&message.id);
            let room = message.room.clone();
            self.registry
                .broadcast(&room, ServerEvent::ReceiveMessage { message });
        }
    }

    /// Wait until every tracked publish has echoed back or aged out. The
    /// deadline bounds the wait so a dead bus cannot stall the send path.
    async fn flush_pending_echoes(&self) {
        let deadline = tokio::time::Instant::now() + ECHO_FLUSH_TIMEOUT;
        loop {
            self.pending_echoes
                .retain(|_, published_at| published_at.elapsed() < ECHO_FLUSH_TIMEOUT);
            if self.pending_echoes.is_empty() {
                return;
            }

            let notified = self.echo_flush.notified();
            if self.pending_echoes.is_empty() {
                return;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline
                || tokio::time::timeout(deadline - now, notified).await.is_err()
            {
                warn!(
                    outstanding = self.pending_echoes.len(),
                    "Timed out waiting for in-flight echoes, relaying anyway"
                );
                return;
            }
        }
    }

    /// Deliver a message received from the bus to local room members.
    /// Duplicates within the dedup window are dropped.
    pub fn handle_remote(&self, message: Message) {
        let message_id = message.id.clone();

        if self.deduplicator.should_process(&message_id) {
            let room = message.room.clone();
            let sent = self
                .registry
                .broadcast(&room, ServerEvent::ReceiveMessage { message });
            debug!(room = %room, local_members = sent, "Delivered bus message locally");
        } else {
            debug!(message_id = %message_id, "Skipping duplicate message from bus");
        }

        // Settle the echo only after delivery, so a fallback relay waiting
        // on it cannot slip in front of this message.
        if self.pending_echoes.remove(&message_id).is_some() {
            self.echo_flush.notify_waiters();
        }
    }

    /// Join a room and send the history snapshot. A failed history load is
    /// reported to the joiner but does not undo the membership; live
    /// messages still arrive.
    pub async fn handle_join(&self, connection_id: &ConnectionId, room: String) {
        if room.trim().is_empty() {
            self.registry.send_to(
                connection_id,
                ServerEvent::Error {
                    message: "missing required field: room".to_string(),
                },
            );
            return;
        }

        let room = RoomName::from(room);
        self.registry.join(&room, connection_id);

        match self.store.recent(&room, HISTORY_LIMIT).await {
            Ok(messages) => {
                self.registry
                    .send_to(connection_id, ServerEvent::RoomHistory { messages });
            }
            Err(e) => {
                warn!(error = %e, room = %room, "Failed to load room history");
                self.registry.send_to(
                    connection_id,
                    ServerEvent::Error {
                        message: HISTORY_FAILED.to_string(),
                    },
                );
            }
        }
    }

    /// Relay a typing indicator to other local room members. Never
    /// persisted, never published, never echoed to the originator.
    pub fn handle_typing(
        &self,
        connection_id: &ConnectionId,
        sender: &str,
        room: &RoomName,
        typing: bool,
    ) {
        let event = if typing {
            ServerEvent::UserTyping {
                user: sender.to_string(),
                room: room.clone(),
            }
        } else {
            ServerEvent::UserStopTyping {
                user: sender.to_string(),
                room: room.clone(),
            }
        };
        self.registry.broadcast_except(room, connection_id, event);
    }

    /// Clean up all state for a disconnected client.
    pub fn handle_disconnect(&self, connection_id: &ConnectionId) {
        self.registry.leave_all(connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_core::store::MemoryMessageStore;
    use std::time::Duration;
    use tokio::sync::mpsc;

    use crate::sync::bus::LoopbackBus;

    struct TestInstance {
        coordinator: Arc<FanoutCoordinator>,
        store: Arc<MemoryMessageStore>,
        bus: Arc<LoopbackBus>,
    }

    fn instance_on(bus: Arc<LoopbackBus>) -> TestInstance {
        let store = Arc::new(MemoryMessageStore::new());
        let coordinator = Arc::new(FanoutCoordinator::new(
            Arc::new(RoomRegistry::new()),
            store.clone() as Arc<dyn MessageStore>,
            bus.clone() as Arc<dyn BroadcastBus>,
            MessageDeduplicator::with_defaults(),
        ));
        coordinator.start();
        TestInstance {
            coordinator,
            store,
            bus,
        }
    }

    fn instance() -> TestInstance {
        instance_on(Arc::new(LoopbackBus::new()))
    }

    fn connect(
        instance: &TestInstance,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let connection_id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        instance
            .coordinator
            .registry()
            .register(connection_id.clone(), tx);
        (connection_id, rx)
    }

    fn send_request(sender: &str, content: &str, room: &str) -> SendRequest {
        SendRequest {
            sender: sender.to_string(),
            content: content.to_string(),
            room: room.to_string(),
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    async fn join(instance: &TestInstance, conn: &ConnectionId, room: &str) {
        instance
            .coordinator
            .handle_join(conn, room.to_string())
            .await;
    }

    #[tokio::test]
    async fn test_send_persists_and_echoes_to_sender() {
        let inst = instance();
        let (conn, mut rx) = connect(&inst);
        join(&inst, &conn, "general").await;
        assert!(matches!(recv(&mut rx).await, ServerEvent::RoomHistory { messages } if messages.is_empty()));

        inst.coordinator
            .handle_send(&conn, send_request("alice", "hello", "general"))
            .await;

        // Delivery arrives through the bus echo
        match recv(&mut rx).await {
            ServerEvent::ReceiveMessage { message } => {
                assert_eq!(message.sender, "alice");
                assert_eq!(message.content, "hello");
                assert!(!message.id.is_empty());
            }
            other => panic!("unexpected event: {}", other.event_type()),
        }
        assert_eq!(inst.store.len(), 1);
    }

    #[tokio::test]
    async fn test_sender_receives_message_exactly_once() {
        let inst = instance();
        let (conn, mut rx) = connect(&inst);
        join(&inst, &conn, "general").await;
        let _ = recv(&mut rx).await; // history

        inst.coordinator
            .handle_send(&conn, send_request("alice", "only once", "general"))
            .await;

        let _ = recv(&mut rx).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err(), "message was delivered twice");
    }

    #[tokio::test]
    async fn test_delivery_is_scoped_to_the_room() {
        let inst = instance();
        let (conn_a, mut rx_a) = connect(&inst);
        let (conn_b, mut rx_b) = connect(&inst);
        join(&inst, &conn_a, "general").await;
        join(&inst, &conn_b, "random").await;
        let _ = recv(&mut rx_a).await;
        let _ = recv(&mut rx_b).await;

        inst.coordinator
            .handle_send(&conn_a, send_request("alice", "hello general", "general"))
            .await;

        assert!(matches!(
            recv(&mut rx_a).await,
            ServerEvent::ReceiveMessage { .. }
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx_b.try_recv().is_err(), "message leaked to another room");
    }

    #[tokio::test]
    async fn test_invalid_send_reports_to_originator_only() {
        let inst = instance();
        let (conn_a, mut rx_a) = connect(&inst);
        let (conn_b, mut rx_b) = connect(&inst);
        join(&inst, &conn_a, "general").await;
        join(&inst, &conn_b, "general").await;
        let _ = recv(&mut rx_a).await;
        let _ = recv(&mut rx_b).await;

        inst.coordinator
            .handle_send(&conn_a, send_request("alice", "   ", "general"))
            .await;

        match recv(&mut rx_a).await {
            ServerEvent::Error { message } => {
                assert!(message.contains("content"), "got: {message}");
            }
            other => panic!("unexpected event: {}", other.event_type()),
        }
        assert!(rx_b.try_recv().is_err());
        assert!(inst.store.is_empty(), "invalid message was persisted");
    }

    #[tokio::test]
    async fn test_store_failure_reports_generic_error_and_skips_publish() {
        let inst = instance();
        let (conn, mut rx) = connect(&inst);
        join(&inst, &conn, "general").await;
        let _ = recv(&mut rx).await;

        inst.store.set_fail_appends(true);
        inst.coordinator
            .handle_send(&conn, send_request("alice", "doomed", "general"))
            .await;

        match recv(&mut rx).await {
            ServerEvent::Error { message } => assert_eq!(message, "Failed to send message"),
            other => panic!("unexpected event: {}", other.event_type()),
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err(), "unpersisted message was delivered");
    }

    #[tokio::test]
    async fn test_publish_failure_falls_back_to_local_relay() {
        let inst = instance();
        let (conn_a, mut rx_a) = connect(&inst);
        let (conn_b, mut rx_b) = connect(&inst);
        join(&inst, &conn_a, "general").await;
        join(&inst, &conn_b, "general").await;
        let _ = recv(&mut rx_a).await;
        let _ = recv(&mut rx_b).await;

        inst.bus.set_fail_publishes(true);
        inst.coordinator
            .handle_send(&conn_a, send_request("alice", "still delivered", "general"))
            .await;

        for rx in [&mut rx_a, &mut rx_b] {
            match recv(rx).await {
                ServerEvent::ReceiveMessage { message } => {
                    assert_eq!(message.content, "still delivered");
                }
                other => panic!("unexpected event: {}", other.event_type()),
            }
        }
        // Persisted even though the bus was down
        assert_eq!(inst.store.len(), 1);

        // No second copy arrives later
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fallback_preserves_send_order() {
        let inst = instance();
        let (conn, mut rx) = connect(&inst);
        join(&inst, &conn, "general").await;
        let _ = recv(&mut rx).await; // history

        // First send publishes fine; its echo is still queued on the
        // subscriber task when the bus goes down for the second send.
        inst.coordinator
            .handle_send(&conn, send_request("alice", "first", "general"))
            .await;
        inst.bus.set_fail_publishes(true);
        inst.coordinator
            .handle_send(&conn, send_request("alice", "second", "general"))
            .await;

        let mut contents = Vec::new();
        for _ in 0..2 {
            match recv(&mut rx).await {
                ServerEvent::ReceiveMessage { message } => contents.push(message.content),
                other => panic!("unexpected event: {}", other.event_type()),
            }
        }
        assert_eq!(contents, vec!["first", "second"]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err(), "message was delivered twice");
    }

    #[tokio::test]
    async fn test_join_returns_history_oldest_first() {
        let inst = instance();
        let (writer, mut writer_rx) = connect(&inst);
        join(&inst, &writer, "general").await;
        let _ = recv(&mut writer_rx).await;

        for i in 0..3 {
            inst.coordinator
                .handle_send(&writer, send_request("alice", &format!("msg {i}"), "general"))
                .await;
            let _ = recv(&mut writer_rx).await;
        }

        let (reader, mut reader_rx) = connect(&inst);
        join(&inst, &reader, "general").await;

        match recv(&mut reader_rx).await {
            ServerEvent::RoomHistory { messages } => {
                let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
                assert_eq!(contents, vec!["msg 0", "msg 1", "msg 2"]);
            }
            other => panic!("unexpected event: {}", other.event_type()),
        }
    }

    #[tokio::test]
    async fn test_join_survives_history_failure() {
        let inst = instance();
        let (conn, mut rx) = connect(&inst);

        inst.store.set_fail_reads(true);
        join(&inst, &conn, "general").await;
        match recv(&mut rx).await {
            ServerEvent::Error { message } => {
                assert_eq!(message, "Failed to load message history");
            }
            other => panic!("unexpected event: {}", other.event_type()),
        }

        // Membership stands: live messages still arrive
        inst.store.set_fail_reads(false);
        let (other, mut other_rx) = connect(&inst);
        join(&inst, &other, "general").await;
        let _ = recv(&mut other_rx).await;

        inst.coordinator
            .handle_send(&other, send_request("bob", "live", "general"))
            .await;
        assert!(matches!(
            recv(&mut rx).await,
            ServerEvent::ReceiveMessage { .. }
        ));
    }

    #[tokio::test]
    async fn test_join_rejects_empty_room_name() {
        let inst = instance();
        let (conn, mut rx) = connect(&inst);

        join(&inst, &conn, "   ").await;
        match recv(&mut rx).await {
            ServerEvent::Error { message } => assert!(message.contains("room")),
            other => panic!("unexpected event: {}", other.event_type()),
        }
        assert_eq!(inst.coordinator.registry().room_count(), 0);
    }

    #[tokio::test]
    async fn test_typing_excludes_originator() {
        let inst = instance();
        let (conn_a, mut rx_a) = connect(&inst);
        let (conn_b, mut rx_b) = connect(&inst);
        join(&inst, &conn_a, "general").await;
        join(&inst, &conn_b, "general").await;
        let _ = recv(&mut rx_a).await;
        let _ = recv(&mut rx_b).await;

        let room = RoomName::from("general");
        inst.coordinator
            .handle_typing(&conn_a, "alice", &room, true);
        inst.coordinator
            .handle_typing(&conn_a, "alice", &room, false);

        assert_eq!(recv(&mut rx_b).await.event_type(), "user_typing");
        assert_eq!(recv(&mut rx_b).await.event_type(), "user_stop_typing");
        assert!(rx_a.try_recv().is_err());
        // Typing never touches the store
        assert!(inst.store.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_stops_delivery() {
        let inst = instance();
        let (conn_a, mut rx_a) = connect(&inst);
        let (conn_b, mut rx_b) = connect(&inst);
        join(&inst, &conn_a, "general").await;
        join(&inst, &conn_b, "general").await;
        let _ = recv(&mut rx_a).await;
        let _ = recv(&mut rx_b).await;

        inst.coordinator.handle_disconnect(&conn_a);
        assert_eq!(inst.coordinator.registry().connection_count(), 1);

        inst.coordinator
            .handle_send(&conn_b, send_request("bob", "after leave", "general"))
            .await;
        assert!(matches!(
            recv(&mut rx_b).await,
            ServerEvent::ReceiveMessage { .. }
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_two_member_room_lifecycle() {
        let inst = instance();
        let (alice, mut alice_rx) = connect(&inst);
        let (bob, mut bob_rx) = connect(&inst);

        join(&inst, &alice, "general").await;
        assert!(matches!(
            recv(&mut alice_rx).await,
            ServerEvent::RoomHistory { messages } if messages.is_empty()
        ));
        join(&inst, &bob, "general").await;
        let _ = recv(&mut bob_rx).await;

        inst.coordinator
            .handle_send(&alice, send_request("alice", "hi", "general"))
            .await;

        for rx in [&mut alice_rx, &mut bob_rx] {
            match recv(rx).await {
                ServerEvent::ReceiveMessage { message } => {
                    assert_eq!(message.sender, "alice");
                    assert_eq!(message.content, "hi");
                    assert_eq!(message.room.as_str(), "general");
                }
                other => panic!("unexpected event: {}", other.event_type()),
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(alice_rx.try_recv().is_err());
        assert!(bob_rx.try_recv().is_err());

        let history = inst
            .store
            .recent(&RoomName::from("general"), 50)
            .await
            .expect("recent");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hi");
    }

    #[tokio::test]
    async fn test_handle_command_dispatch() {
        let inst = instance();
        let (conn, mut rx) = connect(&inst);

        inst.coordinator
            .handle_command(
                &conn,
                ClientCommand::JoinRoom {
                    room: "general".to_string(),
                },
            )
            .await;
        assert!(matches!(recv(&mut rx).await, ServerEvent::RoomHistory { .. }));

        inst.coordinator
            .handle_command(
                &conn,
                ClientCommand::SendMessage {
                    sender: "alice".to_string(),
                    content: "via command".to_string(),
                    room: "general".to_string(),
                },
            )
            .await;
        assert!(matches!(
            recv(&mut rx).await,
            ServerEvent::ReceiveMessage { .. }
        ));
    }
}
