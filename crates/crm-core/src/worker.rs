// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue consumer.
//!
//! Polls the task queue and dispatches by task name:
//! - `webhook.execute` goes to the [`WebhookWorker`]
//! - `send-notification` goes to the [`Notifier`]
//!
//! Store failures are retried through the queue's backoff. Tasks that can
//! never succeed (unknown name, malformed payload, invalid input) are
//! dead-lettered immediately.

use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{CrmError, Result};
use crate::notifications::{NewNotification, Notifier};
use crate::queue::{Delivery, NackOutcome, SEND_NOTIFICATION, StoreQueue, WEBHOOK_EXECUTE};
use crate::webhooks::{WebhookTask, WebhookWorker};

enum Failure {
    /// Retrying cannot help.
    Permanent(String),
    /// Worth another delivery.
    Transient(CrmError),
}

impl From<CrmError> for Failure {
    fn from(err: CrmError) -> Self {
        if err.is_domain_error() {
            Failure::Permanent(err.to_string())
        } else {
            Failure::Transient(err)
        }
    }
}

/// Per-poll counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Tasks acknowledged.
    pub acked: usize,
    /// Tasks put back for another attempt.
    pub retried: usize,
    /// Tasks dead-lettered.
    pub dead: usize,
}

impl BatchStats {
    /// Tasks handled in this poll.
    pub fn total(&self) -> usize {
        self.acked + self.retried + self.dead
    }
}

/// Queue consumer that runs as a background task.
#[derive(Clone)]
pub struct QueueConsumer {
    queue: StoreQueue,
    webhooks: WebhookWorker,
    notifier: Notifier,
    shutdown: Arc<Notify>,
}

impl QueueConsumer {
    /// Create a consumer.
    pub fn new(queue: StoreQueue, webhooks: WebhookWorker, notifier: Notifier) -> Self {
        Self {
            queue,
            webhooks,
            notifier,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the consumer loop until shutdown.
    pub async fn run(self) {
        let config = self.queue.config().clone();
        info!(
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            batch_size = config.batch_size,
            max_attempts = config.max_attempts,
            "Queue consumer started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Queue consumer shutting down");
                    break;
                }
                _ = tokio::time::sleep(config.poll_interval) => {
                    // Drain without sleeping while full batches keep coming.
                    loop {
                        match self.run_once().await {
                            Ok(stats) if stats.total() as i64 >= config.batch_size => continue,
                            Ok(_) => break,
                            Err(e) => {
                                error!(error = %e, "Failed to poll task queue");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Claim and process one batch.
    pub async fn run_once(&self) -> Result<BatchStats> {
        let deliveries = self.queue.claim().await?;
        let mut stats = BatchStats::default();

        for delivery in &deliveries {
            match self.dispatch(delivery).await {
                Ok(()) => {
                    if let Err(e) = self.queue.ack(delivery).await {
                        // Lease expiry will redeliver it.
                        error!(task_id = delivery.id, error = %e, "Failed to ack task");
                        continue;
                    }
                    stats.acked += 1;
                }
                Err(Failure::Permanent(reason)) => {
                    warn!(
                        task_id = delivery.id,
                        name = %delivery.task.name,
                        reason = %reason,
                        "Rejecting task"
                    );
                    if let Err(e) = self.queue.reject(delivery, &reason).await {
                        error!(task_id = delivery.id, error = %e, "Failed to dead-letter task");
                        continue;
                    }
                    stats.dead += 1;
                }
                Err(Failure::Transient(err)) => {
                    match self.queue.nack(delivery, &err.to_string()).await {
                        Ok(NackOutcome::Retrying { available_at }) => {
                            warn!(
                                task_id = delivery.id,
                                attempt = delivery.attempt,
                                available_at,
                                error = %err,
                                "Task failed, will retry"
                            );
                            stats.retried += 1;
                        }
                        Ok(NackOutcome::Dead) => {
                            error!(
                                task_id = delivery.id,
                                attempt = delivery.attempt,
                                error = %err,
                                "Task out of attempts, dead-lettered"
                            );
                            stats.dead += 1;
                        }
                        Err(e) => {
                            error!(task_id = delivery.id, error = %e, "Failed to nack task");
                        }
                    }
                }
            }
        }

        if stats.total() > 0 {
            debug!(
                acked = stats.acked,
                retried = stats.retried,
                dead = stats.dead,
                "Processed task batch"
            );
        }
        Ok(stats)
    }

    async fn dispatch(&self, delivery: &Delivery) -> std::result::Result<(), Failure> {
        let payload = delivery.task.payload.clone();

        match delivery.task.name.as_str() {
            WEBHOOK_EXECUTE => {
                let task: WebhookTask = serde_json::from_value(payload)
                    .map_err(|e| Failure::Permanent(format!("malformed webhook task: {e}")))?;
                // Handler failures are recorded on the row; the task is done.
                self.webhooks.process(&task).await?;
                Ok(())
            }
            SEND_NOTIFICATION => {
                let new: NewNotification = serde_json::from_value(payload)
                    .map_err(|e| Failure::Permanent(format!("malformed notification task: {e}")))?;
                self.notifier.create(&new).await?;
                Ok(())
            }
            other => Err(Failure::Permanent(format!("unknown task name: {other}"))),
        }
    }
}
