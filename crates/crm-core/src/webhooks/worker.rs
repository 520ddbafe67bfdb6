// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executes `webhook.execute` tasks.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::error::{CrmError, Result};
use crate::persistence::{Persistence, WebhookRecord};

use super::{HandlerRegistry, WebhookStatus, WebhookTask};

/// Result of processing one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Handler succeeded; row is `processed`.
    Processed,
    /// Handler failed or was missing; row is `failed` with this error.
    Failed {
        /// Error recorded on the row.
        error: String,
    },
    /// Nothing to do: the row was already claimed (duplicate delivery) or
    /// no longer exists.
    Skipped,
}

/// Drives webhook rows from `pending` to a terminal status.
#[derive(Clone)]
pub struct WebhookWorker {
    persistence: Arc<dyn Persistence>,
    handlers: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
}

impl WebhookWorker {
    /// Create a worker.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        handlers: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            persistence,
            handlers,
            clock,
        }
    }

    /// Process one task.
    ///
    /// Handler failures are recorded on the row and reported as
    /// [`ProcessOutcome::Failed`]. Only store failures are returned as `Err`,
    /// so the queue can redeliver.
    #[instrument(skip(self, task), fields(webhook_id = %task.webhook.id, trigger = task.trigger.as_str()))]
    pub async fn process(&self, task: &WebhookTask) -> Result<ProcessOutcome> {
        let id = &task.webhook.id;

        let claimed = self
            .persistence
            .claim_webhook(id, task.trigger.only_pending(), self.clock.now())
            .await?;

        let Some(webhook) = claimed else {
            if task.trigger.only_pending() {
                debug!("Webhook no longer pending, skipping duplicate delivery");
            } else {
                warn!("Webhook not found for manual retry");
            }
            return Ok(ProcessOutcome::Skipped);
        };

        match self.execute(&webhook).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Put the row back so a redelivery can claim it again.
                if let Err(release_err) = self
                    .persistence
                    .finish_webhook(
                        id,
                        WebhookStatus::Pending,
                        Some(&e.to_string()),
                        self.clock.now(),
                    )
                    .await
                {
                    warn!(error = %release_err, "Failed to release webhook claim");
                }
                Err(e)
            }
        }
    }

    async fn execute(&self, webhook: &WebhookRecord) -> Result<ProcessOutcome> {
        let payload = match webhook.payload() {
            Ok(payload) => payload,
            Err(e) => {
                return self
                    .fail(webhook, format!("stored payload is not valid JSON: {e}"))
                    .await;
            }
        };

        let Some(handler) = self.handlers.get(&webhook.provider, &webhook.event) else {
            return self
                .fail(
                    webhook,
                    format!(
                        "no handler registered for {}/{}",
                        webhook.provider, webhook.event
                    ),
                )
                .await;
        };

        let result = AssertUnwindSafe(handler.handle(webhook, &payload))
            .catch_unwind()
            .await;

        match result {
            Err(panic) => {
                self.fail(webhook, format!("handler panicked: {}", panic_message(&*panic)))
                    .await
            }
            Ok(Ok(())) => {
                self.persistence
                    .finish_webhook(
                        &webhook.id,
                        WebhookStatus::Processed,
                        None,
                        self.clock.now(),
                    )
                    .await?;
                info!(attempts = webhook.attempts, "Webhook processed");
                Ok(ProcessOutcome::Processed)
            }
            Ok(Err(e)) => {
                let err = CrmError::Handler {
                    provider: webhook.provider.clone(),
                    event: webhook.event.clone(),
                    reason: format!("{e:#}"),
                };
                self.fail(webhook, err.to_string()).await
            }
        }
    }

    async fn fail(&self, webhook: &WebhookRecord, error: String) -> Result<ProcessOutcome> {
        self.persistence
            .finish_webhook(
                &webhook.id,
                WebhookStatus::Failed,
                Some(&error),
                self.clock.now(),
            )
            .await?;
        error!(attempts = webhook.attempts, error = %error, "Webhook failed");
        Ok(ProcessOutcome::Failed { error })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}
