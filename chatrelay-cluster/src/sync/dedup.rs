//! Message deduplication for cross-instance fan-out
//!
//! Prevents duplicate local delivery when:
//! - The bus redelivers a message (at-least-once transports)
//! - A message was already relayed locally via the publish-failure fallback

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Deduplication entry with expiration time
#[derive(Clone)]
struct DedupEntry {
    expires_at: Instant,
}

/// Message deduplicator keyed by message id, with automatic cleanup.
#[derive(Clone)]
pub struct MessageDeduplicator {
    /// Map of message ids to expiration times
    entries: Arc<DashMap<String, DedupEntry>>,
    /// Dedup window duration (ids older than this are accepted again)
    dedup_window: Duration,
    /// Cleanup interval
    cleanup_interval: Duration,
}

impl MessageDeduplicator {
    /// Create a new deduplicator and start its cleanup task.
    ///
    /// # Arguments
    /// * `dedup_window` - How long to remember message ids
    /// * `cleanup_interval` - How often to clean expired entries
    #[must_use]
    pub fn new(dedup_window: Duration, cleanup_interval: Duration) -> Self {
        let dedup = Self {
            entries: Arc::new(DashMap::new()),
            dedup_window,
            cleanup_interval,
        };

        let dedup_clone = dedup.clone();
        tokio::spawn(async move {
            dedup_clone.run_cleanup().await;
        });

        dedup
    }

    /// Create with default settings (30 second window, 60 second cleanup)
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(60))
    }

    /// Check if a message should be delivered (not a duplicate).
    ///
    /// Records the id as seen when it was not already tracked.
    #[must_use]
    pub fn should_process(&self, message_id: &str) -> bool {
        let now = Instant::now();

        if let Some(entry) = self.entries.get(message_id) {
            if entry.expires_at > now {
                return false;
            }
            // Expired, remove and process
            drop(entry);
            self.entries.remove(message_id);
        }

        self.entries.insert(
            message_id.to_string(),
            DedupEntry {
                expires_at: now + self.dedup_window,
            },
        );

        true
    }

    /// Mark a message id as already delivered so a later bus echo is skipped.
    pub fn mark_processed(&self, message_id: &str) {
        self.entries.insert(
            message_id.to_string(),
            DedupEntry {
                expires_at: Instant::now() + self.dedup_window,
            },
        );
    }

    async fn run_cleanup(&self) {
        let mut interval = tokio::time::interval(self.cleanup_interval);
        loop {
            interval.tick().await;
            self.cleanup_expired();
        }
    }

    fn cleanup_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_id, entry| entry.expires_at > now);
    }

    /// Get the number of tracked message ids
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are any tracked message ids
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear all tracked ids (for testing)
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for MessageDeduplicator {
    fn default() -> Self {
        Self::with_defaults()
    }
}
