mod http;
mod server;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use chatrelay_cluster::sync::{
    BroadcastBus, FanoutCoordinator, LoopbackBus, MessageDeduplicator, RedisBus, RoomRegistry,
};
use chatrelay_core::store::{MemoryMessageStore, MessageStore, PgMessageStore};
use chatrelay_core::{logging, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration
    let config = Config::load();

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("ChatRelay server starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Initialize the message store
    let store: Arc<dyn MessageStore> = if config.database.url.is_empty() {
        warn!("Database not configured, messages will not survive restarts");
        Arc::new(MemoryMessageStore::new())
    } else {
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .min_connections(config.database.min_connections)
            .acquire_timeout(Duration::from_secs(config.database.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.database.idle_timeout_seconds))
            .connect(&config.database.url)
            .await?;

        info!("Running database migrations...");
        sqlx::migrate!("../migrations").run(&pool).await?;
        info!("Migrations completed");

        Arc::new(PgMessageStore::new(pool))
    };

    // 4. Initialize the broadcast bus
    let bus: Arc<dyn BroadcastBus> = if config.redis.url.is_empty() {
        info!("Redis not configured, running single-instance on loopback bus");
        Arc::new(LoopbackBus::new())
    } else {
        let bus = RedisBus::connect(&config.redis.url).await?;
        Arc::new(bus)
    };

    // 5. Wire up the fan-out coordinator
    let coordinator = Arc::new(FanoutCoordinator::new(
        Arc::new(RoomRegistry::new()),
        store,
        bus.clone(),
        MessageDeduplicator::with_defaults(),
    ));
    coordinator.start();

    // 6. Serve HTTP and WebSocket traffic until shutdown
    let router = http::create_router(coordinator);
    let result = server::serve(router, &config.http_address()).await;

    // 7. Stop the bus subscriber once the listener has drained
    bus.shutdown();
    result
}
