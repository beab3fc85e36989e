//! REST endpoints for message history and room discovery
//!
//! These mirror what the WebSocket flow already provides on join, for
//! clients that want history without holding a connection open.

use axum::{
    extract::{Path, State},
    Json,
};

use chatrelay_core::models::{Message, RoomName};
use chatrelay_core::store::{MessageStore, HISTORY_LIMIT};

use crate::http::{AppError, AppResult, AppState};

/// GET /api/messages/{room}
///
/// Most recent messages of one room, oldest first, capped at the same
/// limit the join snapshot uses.
pub async fn get_room_messages(
    State(state): State<AppState>,
    Path(room): Path<String>,
) -> AppResult<Json<Vec<Message>>> {
    if room.trim().is_empty() {
        return Err(AppError::bad_request("missing required field: room"));
    }

    let room = RoomName::from(room);
    let messages = state.coordinator.store().recent(&room, HISTORY_LIMIT).await?;
    Ok(Json(messages))
}

/// GET /api/rooms
///
/// Names of every room with at least one persisted message.
pub async fn list_rooms(State(state): State<AppState>) -> AppResult<Json<Vec<String>>> {
    let rooms = state.coordinator.store().room_names().await?;
    Ok(Json(rooms))
}
