//! WebSocket endpoint for the real-time chat flow
//!
//! Clients exchange JSON text frames: inbound frames parse as
//! `ClientCommand`, outbound frames are serialized `ServerEvent`s. A
//! writer task owns the socket sink so fan-out deliveries never block the
//! read loop.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use chatrelay_cluster::sync::{ClientCommand, ServerEvent};
use chatrelay_core::models::ConnectionId;

use crate::http::AppState;

/// Limit frame size well below axum's default; chat messages are small
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = ConnectionId::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ServerEvent>();
    state
        .coordinator
        .registry()
        .register(connection_id.clone(), tx);

    info!(connection_id = %connection_id, "WebSocket connection established");

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Writer task: drains the delivery channel and owns the sink. Exits
    // when the registry drops the sender on disconnect.
    let writer_conn = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let payload = match serde_json::to_string(&event) {
                Ok(p) => p,
                Err(e) => {
                    warn!(
                        connection_id = %writer_conn,
                        error = %e,
                        "Failed to serialize event, dropping"
                    );
                    continue;
                }
            };
            if ws_sink.send(WsMessage::Text(payload.into())).await.is_err() {
                debug!(connection_id = %writer_conn, "WebSocket send failed, stopping writer");
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    // Read loop: parse commands and dispatch
    while let Some(frame) = ws_stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(command) => {
                    state
                        .coordinator
                        .handle_command(&connection_id, command)
                        .await;
                }
                Err(e) => {
                    debug!(connection_id = %connection_id, error = %e, "Unparseable command");
                    state.coordinator.registry().send_to(
                        &connection_id,
                        ServerEvent::Error {
                            message: "Invalid command".to_string(),
                        },
                    );
                }
            },
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {} // ping/pong handled by axum, binary ignored
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket read error");
                break;
            }
        }
    }

    // Disconnect cleanup drops the delivery sender, which ends the writer
    state.coordinator.handle_disconnect(&connection_id);
    let _ = writer.await;

    info!(connection_id = %connection_id, "WebSocket connection closed");
}
