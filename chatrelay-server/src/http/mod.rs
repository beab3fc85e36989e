// Module: http
// HTTP/JSON REST API plus the WebSocket chat endpoint

pub mod error;
pub mod health;
pub mod messages;
pub mod websocket;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use chatrelay_cluster::sync::FanoutCoordinator;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<FanoutCoordinator>,
}

/// Create the HTTP router with all routes
pub fn create_router(coordinator: Arc<FanoutCoordinator>) -> Router {
    let state = AppState { coordinator };

    let router = Router::new()
        // Health check endpoint (for monitoring probes)
        .route("/health", get(health::health_check))
        // History and room discovery
        .route("/api/messages/{room}", get(messages::get_room_messages))
        .route("/api/rooms", get(messages::list_rooms))
        // WebSocket endpoint for real-time messaging
        .route("/ws", get(websocket::websocket_handler));

    // Apply layers before state
    let router = router
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Apply state to all routes (must be last)
    router.with_state(state)
}
