// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for crm-core.
//!
//! [`CrmRuntime`] wires persistence, the task queue and the webhook handlers
//! together, then runs the queue consumer and the daily reminder scheduler as
//! background tasks inside an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use crm_core::persistence::SqlitePersistence;
//! use crm_core::runtime::CrmRuntime;
//! use crm_core::webhooks::{HandlerRegistry, NewWebhook};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path(".data/crm.db").await?);
//!
//!     let mut handlers = HandlerRegistry::new();
//!     handlers.register_fn("stripe", "invoice.paid", |webhook, payload| async move {
//!         // ... provider-specific side effect ...
//!         Ok(())
//!     });
//!
//!     let runtime = CrmRuntime::builder()
//!         .persistence(persistence)
//!         .handlers(handlers)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime
//!         .intake()
//!         .ingest(NewWebhook::new("stripe", "invoice.paid", serde_json::json!({})))
//!         .await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, QueueConfig, ReminderConfig};
use crate::followups::{FollowUpService, ReminderScheduler, ReminderSweep};
use crate::notifications::Notifier;
use crate::persistence::Persistence;
use crate::queue::StoreQueue;
use crate::webhooks::{HandlerRegistry, WebhookIntake, WebhookWorker};
use crate::worker::QueueConsumer;

/// Builder for creating a [`CrmRuntime`].
pub struct CrmRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    handlers: HandlerRegistry,
    clock: Arc<dyn Clock>,
    webhook_stale_after: Duration,
    queue: QueueConfig,
    reminder: ReminderConfig,
}

impl Default for CrmRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            handlers: HandlerRegistry::new(),
            clock: Arc::new(SystemClock),
            webhook_stale_after: Duration::from_secs(300),
            queue: QueueConfig::default(),
            reminder: ReminderConfig::default(),
        }
    }
}

impl CrmRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence backend (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the webhook handlers.
    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Override the time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Apply the tunables from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.webhook_stale_after = config.webhook_stale_after;
        self.queue = config.queue.clone();
        self.reminder = config.reminder.clone();
        self
    }

    /// Set the webhook staleness window.
    pub fn webhook_stale_after(mut self, window: Duration) -> Self {
        self.webhook_stale_after = window;
        self
    }

    /// Set the queue consumer configuration.
    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.queue = config;
        self
    }

    /// Set the reminder schedule.
    pub fn reminder_config(mut self, config: ReminderConfig) -> Self {
        self.reminder = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<CrmRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;

        if self.queue.batch_size <= 0 {
            anyhow::bail!("queue batch_size must be positive");
        }
        if self.queue.max_attempts <= 0 {
            anyhow::bail!("queue max_attempts must be positive");
        }

        Ok(CrmRuntimeConfig {
            persistence,
            handlers: Arc::new(self.handlers),
            clock: self.clock,
            webhook_stale_after: self.webhook_stale_after,
            queue: self.queue,
            reminder: self.reminder,
        })
    }
}

/// Configuration for a [`CrmRuntime`].
pub struct CrmRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    handlers: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    webhook_stale_after: Duration,
    queue: QueueConfig,
    reminder: ReminderConfig,
}

impl CrmRuntimeConfig {
    /// Start the runtime, spawning the queue consumer and reminder scheduler.
    pub async fn start(self) -> Result<CrmRuntime> {
        if !self.persistence.health_check_db().await? {
            anyhow::bail!("database health check failed");
        }

        let queue = StoreQueue::new(
            self.persistence.clone(),
            self.clock.clone(),
            self.queue.clone(),
        );

        let intake = WebhookIntake::new(
            self.persistence.clone(),
            Arc::new(queue.clone()),
            self.clock.clone(),
            self.webhook_stale_after,
        );
        let notifier = Notifier::new(self.persistence.clone(), self.clock.clone());
        let follow_ups = FollowUpService::new(
            self.persistence.clone(),
            self.clock.clone(),
            self.reminder.utc_offset,
        );

        let consumer = QueueConsumer::new(
            queue.clone(),
            WebhookWorker::new(
                self.persistence.clone(),
                self.handlers.clone(),
                self.clock.clone(),
            ),
            notifier.clone(),
        );
        let consumer_shutdown = consumer.shutdown_handle();

        let scheduler = ReminderScheduler::new(
            ReminderSweep::new(
                self.persistence.clone(),
                self.clock.clone(),
                self.reminder.utc_offset,
            ),
            self.clock.clone(),
            self.reminder.clone(),
        );
        let scheduler_shutdown = scheduler.shutdown_handle();

        info!(handlers = self.handlers.len(), "Starting CrmRuntime");
        let consumer_handle = tokio::spawn(consumer.run());
        let scheduler_handle = tokio::spawn(scheduler.clone().run());

        Ok(CrmRuntime {
            intake,
            follow_ups,
            notifier,
            queue,
            scheduler,
            consumer_handle,
            scheduler_handle,
            consumer_shutdown,
            scheduler_shutdown,
        })
    }
}

/// A running crm-core instance.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct CrmRuntime {
    intake: WebhookIntake,
    follow_ups: FollowUpService,
    notifier: Notifier,
    queue: StoreQueue,
    scheduler: ReminderScheduler,
    consumer_handle: JoinHandle<()>,
    scheduler_handle: JoinHandle<()>,
    consumer_shutdown: Arc<Notify>,
    scheduler_shutdown: Arc<Notify>,
}

impl CrmRuntime {
    /// Create a new builder.
    pub fn builder() -> CrmRuntimeBuilder {
        CrmRuntimeBuilder::new()
    }

    /// Webhook intake.
    pub fn intake(&self) -> &WebhookIntake {
        &self.intake
    }

    /// Follow-up operations.
    pub fn follow_ups(&self) -> &FollowUpService {
        &self.follow_ups
    }

    /// Notification reads and writes.
    pub fn notifications(&self) -> &Notifier {
        &self.notifier
    }

    /// The task queue, for dead-letter inspection.
    pub fn queue(&self) -> &StoreQueue {
        &self.queue
    }

    /// The reminder scheduler, for on-demand or backfill sweeps.
    pub fn reminders(&self) -> &ReminderScheduler {
        &self.scheduler
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals the queue consumer and the reminder scheduler to stop, then
    /// waits for them. A batch in progress is finished first.
    pub async fn shutdown(self) -> Result<()> {
        info!("CrmRuntime shutting down...");

        self.consumer_shutdown.notify_one();
        self.scheduler_shutdown.notify_one();

        let mut panicked = false;
        if let Err(e) = self.consumer_handle.await {
            error!("Queue consumer task panicked: {}", e);
            panicked = true;
        }
        if let Err(e) = self.scheduler_handle.await {
            error!("Reminder scheduler task panicked: {}", e);
            panicked = true;
        }

        if panicked {
            anyhow::bail!("background task panicked");
        }
        info!("CrmRuntime shutdown complete");
        Ok(())
    }

    /// Check if the background tasks are still running.
    pub fn is_running(&self) -> bool {
        !self.consumer_handle.is_finished() && !self.scheduler_handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;
    use sqlx::sqlite::SqlitePoolOptions;

    #[test]
    fn test_build_requires_persistence() {
        let err = CrmRuntime::builder().build().err().unwrap();
        assert_eq!(err.to_string(), "persistence is required");
    }

    #[tokio::test]
    async fn test_build_rejects_bad_queue_config() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let err = CrmRuntime::builder()
            .persistence(Arc::new(SqlitePersistence::new(pool)))
            .queue_config(QueueConfig {
                batch_size: 0,
                ..Default::default()
            })
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("batch_size"));
    }
}
