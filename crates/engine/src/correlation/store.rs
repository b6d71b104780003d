//! Pending reply storage.
//!
//! Replies land here before the monitor matches them to a waiter. The store
//! is a plain key/value seam; per-id read-modify-write is serialized by the
//! caller's lock stripes, not by the store.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use moka::notification::RemovalCause;
use tracing::warn;

use crate::config::ReplyStoreConfig;
use crate::error::Result;
use crate::types::{CorrelationId, WorkItem};

/// Replies collected so far for one correlation id, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingReplyGroup {
    correlation_id: CorrelationId,
    replies: VecDeque<WorkItem>,
    created_at: DateTime<Utc>,
}

impl PendingReplyGroup {
    #[must_use]
    pub fn new(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            replies: VecDeque::new(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_reply(mut self, reply: WorkItem) -> Self {
        self.push(reply);
        self
    }

    #[must_use]
    pub const fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Append at the tail.
    pub fn push(&mut self, reply: WorkItem) {
        self.replies.push_back(reply);
    }

    /// Pop the oldest unconsumed reply.
    pub fn pop_front(&mut self) -> Option<WorkItem> {
        self.replies.pop_front()
    }

    /// Take every remaining reply in arrival order.
    pub fn drain(&mut self) -> Vec<WorkItem> {
        self.replies.drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.replies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time since the first reply arrived.
    #[must_use]
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Key/value store of pending reply groups.
#[async_trait]
pub trait ReplyStore: Send + Sync {
    /// Insert or replace the group under its correlation id.
    async fn store(&self, group: PendingReplyGroup) -> Result<()>;

    async fn retrieve(&self, id: &CorrelationId) -> Result<Option<PendingReplyGroup>>;

    /// Remove and return the group, if any.
    async fn remove(&self, id: &CorrelationId) -> Result<Option<PendingReplyGroup>>;

    async fn all_keys(&self) -> Result<Vec<CorrelationId>>;

    async fn contains(&self, id: &CorrelationId) -> Result<bool>;
}

/// In-memory [`ReplyStore`] backed by a moka cache.
///
/// Capacity and TTL bound memory; a group evicted by either is logged and lost.
pub struct InMemoryReplyStore {
    cache: Cache<CorrelationId, PendingReplyGroup>,
}

impl InMemoryReplyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&ReplyStoreConfig::default())
    }

    #[must_use]
    pub fn with_config(config: &ReplyStoreConfig) -> Self {
        let mut builder = Cache::builder()
            .max_capacity(config.max_capacity)
            .eviction_listener(
                |id: Arc<CorrelationId>, group: PendingReplyGroup, cause: RemovalCause| {
                    if cause.was_evicted() {
                        warn!(
                            correlation_id = %id,
                            replies = group.len(),
                            cause = ?cause,
                            "Pending reply group evicted before it was matched"
                        );
                    }
                },
            );
        if let Some(ttl) = config.ttl() {
            builder = builder.time_to_live(ttl);
        }
        Self {
            cache: builder.build(),
        }
    }

    /// Approximate number of stored groups.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Run pending maintenance tasks (eviction, expiry).
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

impl Default for InMemoryReplyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplyStore for InMemoryReplyStore {
    async fn store(&self, group: PendingReplyGroup) -> Result<()> {
        self.cache
            .insert(group.correlation_id().clone(), group)
            .await;
        Ok(())
    }

    async fn retrieve(&self, id: &CorrelationId) -> Result<Option<PendingReplyGroup>> {
        Ok(self.cache.get(id).await)
    }

    async fn remove(&self, id: &CorrelationId) -> Result<Option<PendingReplyGroup>> {
        Ok(self.cache.remove(id).await)
    }

    async fn all_keys(&self) -> Result<Vec<CorrelationId>> {
        let mut keys: Vec<CorrelationId> = self
            .cache
            .iter()
            .map(|(id, _)| CorrelationId::clone(&id))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn contains(&self, id: &CorrelationId) -> Result<bool> {
        Ok(self.cache.contains_key(id))
    }
}
