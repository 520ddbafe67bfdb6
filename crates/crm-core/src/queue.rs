// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable task queue.
//!
//! Tasks live in the `queue_tasks` table. Delivery is at-least-once:
//!
//! - A consumer claims a batch, which marks the tasks `running` and starts a lease.
//! - `ack` deletes the task.
//! - `nack` puts it back to `pending` with exponential backoff, or parks it as
//!   `dead` once `max_attempts` deliveries have been used.
//! - A task whose lease expires (the consumer crashed) is claimed again, until
//!   it has used `max_attempts` deliveries; then it is parked as `dead`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::{CrmError, Result};
use crate::persistence::{Persistence, QueueTaskRecord};

/// Task name for webhook execution.
pub const WEBHOOK_EXECUTE: &str = "webhook.execute";

/// Task name for notification delivery.
pub const SEND_NOTIFICATION: &str = "send-notification";

const BASE_BACKOFF_SECS: i64 = 5;
const MAX_BACKOFF_SECS: i64 = 3_600;

/// A named unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Routing key for the consumer.
    pub name: String,
    /// JSON payload.
    pub payload: Value,
}

impl Task {
    /// Build a task from any serializable payload.
    pub fn new(name: impl Into<String>, payload: &impl Serialize) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            payload: serde_json::to_value(payload)?,
        })
    }
}

/// A claimed task, delivered to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Queue row id, used for ack/nack.
    pub id: i64,
    /// The task.
    pub task: Task,
    /// Deliveries so far, including this one.
    pub attempt: i32,
}

/// Publishing side of the queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Durably enqueue a task. Returns the queue id.
    async fn publish(&self, task: Task) -> Result<i64>;
}

/// What happened to a task after `nack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Re-queued, claimable again at this unix time.
    Retrying {
        /// When the next delivery may happen.
        available_at: i64,
    },
    /// Out of attempts.
    Dead,
}

/// Backoff before the next delivery after `attempts` failed deliveries.
///
/// 5s, 10s, 20s, ... capped at one hour.
pub fn backoff_secs(attempts: i32) -> i64 {
    let exp = attempts.saturating_sub(1).clamp(0, 30) as u32;
    BASE_BACKOFF_SECS
        .saturating_mul(1_i64 << exp)
        .min(MAX_BACKOFF_SECS)
}

/// Queue backed by the persistence layer.
#[derive(Clone)]
pub struct StoreQueue {
    persistence: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

impl StoreQueue {
    /// Create a queue over `persistence`.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Self {
        Self {
            persistence,
            clock,
            config,
        }
    }

    /// Queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Claim up to `batch_size` tasks.
    ///
    /// Tasks whose stored payload is not valid JSON can never succeed and are
    /// dead-lettered here instead of being handed out. So are tasks that
    /// already used `max_attempts` deliveries without an ack or nack, which
    /// happens when processing them keeps crashing the consumer.
    pub async fn claim(&self) -> Result<Vec<Delivery>> {
        let now = self.clock.now();
        let lease_expired_before = now - self.config.lease.as_secs() as i64;

        let records = self
            .persistence
            .claim_tasks(now, lease_expired_before, self.config.batch_size)
            .await?;

        let mut deliveries = Vec::with_capacity(records.len());
        for record in records {
            // Only reachable through lease expiry: nack dead-letters at the limit.
            if record.attempts > self.config.max_attempts {
                let reason = format!(
                    "lease expired on {} deliveries, max_attempts is {}",
                    record.attempts - 1,
                    self.config.max_attempts
                );
                warn!(task_id = record.id, name = %record.name, %reason, "Dead-lettering abandoned task");
                self.persistence
                    .dead_letter_task(record.id, &reason, now)
                    .await?;
                continue;
            }

            match Self::decode(&record) {
                Ok(delivery) => deliveries.push(delivery),
                Err(e) => {
                    warn!(task_id = record.id, name = %record.name, error = %e, "Dead-lettering undecodable task");
                    self.persistence
                        .dead_letter_task(record.id, &e.to_string(), now)
                        .await?;
                }
            }
        }

        if !deliveries.is_empty() {
            debug!(count = deliveries.len(), "Claimed tasks");
        }
        Ok(deliveries)
    }

    fn decode(record: &QueueTaskRecord) -> Result<Delivery> {
        Ok(Delivery {
            id: record.id,
            task: Task {
                name: record.name.clone(),
                payload: serde_json::from_str(&record.payload)?,
            },
            attempt: record.attempts,
        })
    }

    /// Acknowledge successful processing.
    pub async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.persistence.ack_task(delivery.id).await
    }

    /// Report a failed delivery.
    pub async fn nack(&self, delivery: &Delivery, error: &str) -> Result<NackOutcome> {
        let now = self.clock.now();

        if delivery.attempt >= self.config.max_attempts {
            self.persistence
                .dead_letter_task(delivery.id, error, now)
                .await?;
            return Ok(NackOutcome::Dead);
        }

        let available_at = now + backoff_secs(delivery.attempt);
        self.persistence
            .retry_task(delivery.id, available_at, error, now)
            .await?;
        Ok(NackOutcome::Retrying { available_at })
    }

    /// Dead-letter a task that can never succeed, without using up retries.
    pub async fn reject(&self, delivery: &Delivery, error: &str) -> Result<()> {
        self.persistence
            .dead_letter_task(delivery.id, error, self.clock.now())
            .await
    }

    /// Tasks parked as dead, newest first.
    pub async fn dead_letters(&self, limit: i64) -> Result<Vec<QueueTaskRecord>> {
        self.persistence.list_dead_tasks(limit).await
    }
}

#[async_trait]
impl TaskQueue for StoreQueue {
    async fn publish(&self, task: Task) -> Result<i64> {
        let payload = serde_json::to_string(&task.payload)?;
        self.persistence
            .enqueue_task(&task.name, &payload, self.clock.now())
            .await
            .map_err(|e| CrmError::Queue {
                task: task.name.clone(),
                reason: e.to_string(),
            })
    }
}
