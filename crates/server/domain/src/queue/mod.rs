//! Persisted retry work items.
//!
//! The retry scheduler keeps its in-flight set in memory; these rows make
//! the backlog survive a restart. Each item is a copy of the outbound
//! payload plus the schedule bookkeeping.

use crate::shared_kernel::{DeliveryId, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    Pending,
    Done,
    Dead,
}

/// One unit of retryable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub delivery_id: DeliveryId,
    /// Serialized outbound payload, frozen at enqueue time.
    pub payload: Value,
    pub status: QueueItemStatus,
    pub retry_count: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn new(delivery_id: DeliveryId, payload: Value, next_attempt_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            delivery_id,
            payload,
            status: QueueItemStatus::Pending,
            retry_count: 0,
            next_attempt_at,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn reschedule(&mut self, next_attempt_at: DateTime<Utc>) {
        self.retry_count += 1;
        self.next_attempt_at = next_attempt_at;
        self.updated_at = Utc::now();
    }

    pub fn mark_done(&mut self) {
        self.status = QueueItemStatus::Done;
        self.updated_at = Utc::now();
    }

    pub fn mark_dead(&mut self) {
        self.status = QueueItemStatus::Dead;
        self.updated_at = Utc::now();
    }
}

/// Persistence port for the retry queue.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    async fn enqueue(&self, item: &QueueItem) -> Result<()>;

    /// Pending items whose `next_attempt_at` has passed.
    async fn due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<QueueItem>>;

    async fn update(&self, item: &QueueItem) -> Result<()>;

    /// Drops finished and dead rows older than the cutoff; returns how many
    /// were removed.
    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
