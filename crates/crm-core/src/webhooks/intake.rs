// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Webhook intake: dedup, store, enqueue.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{CrmError, Result};
use crate::persistence::{ListWebhooksFilter, Persistence, WebhookRecord};
use crate::queue::{Task, TaskQueue, WEBHOOK_EXECUTE};

use super::{NewWebhook, Trigger, WebhookStatus, WebhookTask, derive_reference};

/// What `ingest` did with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestDisposition {
    /// First sighting: row inserted and a task enqueued.
    Created,
    /// Known key: existing row returned, nothing enqueued.
    Duplicate,
    /// Known key stuck in `pending` past the staleness window: re-enqueued.
    Requeued,
}

/// Result of `WebhookIntake::ingest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestOutcome {
    /// The stored row (new or existing).
    pub webhook: WebhookRecord,
    /// What happened.
    pub disposition: IngestDisposition,
    /// Set when the row is stored but the task could not be published.
    /// The row stays `pending` and is recovered by a later stale duplicate
    /// or a manual retry.
    pub enqueue_error: Option<String>,
}

/// Accepts webhook deliveries.
#[derive(Clone)]
pub struct WebhookIntake {
    persistence: Arc<dyn Persistence>,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
}

impl WebhookIntake {
    /// Create an intake.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        stale_after: Duration,
    ) -> Self {
        Self {
            persistence,
            queue,
            clock,
            stale_after,
        }
    }

    /// Store a delivery once per `(provider, event, reference)` and enqueue it
    /// for processing.
    #[instrument(skip(self, new), fields(provider = %new.provider, event = %new.event))]
    pub async fn ingest(&self, new: NewWebhook) -> Result<IngestOutcome> {
        validate(&new)?;

        let NewWebhook {
            provider,
            event,
            reference,
            data,
        } = new;
        let reference = reference.unwrap_or_else(|| derive_reference(&data));

        if let Some(existing) = self
            .persistence
            .find_webhook(&provider, &event, &reference)
            .await?
        {
            return self.on_existing(existing).await;
        }

        let now = self.clock.now();
        let record = WebhookRecord {
            id: Uuid::new_v4().to_string(),
            provider,
            event,
            reference,
            status: WebhookStatus::Pending.as_str().to_string(),
            data: serde_json::to_string(&data)?,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        if !self.persistence.insert_webhook(&record).await? {
            // Lost the race against a concurrent delivery of the same key.
            debug!(reference = %record.reference, "Concurrent insert won, re-reading");
            let existing = self
                .persistence
                .find_webhook(&record.provider, &record.event, &record.reference)
                .await?
                .ok_or_else(|| CrmError::Database {
                    operation: "ingest".to_string(),
                    details: format!(
                        "webhook {}/{}/{} conflicted but could not be read back",
                        record.provider, record.event, record.reference
                    ),
                })?;
            return self.on_existing(existing).await;
        }

        info!(webhook_id = %record.id, reference = %record.reference, "Webhook stored");
        let enqueue_error = self.publish_logged(&record, Trigger::Ingest).await;

        Ok(IngestOutcome {
            webhook: record,
            disposition: IngestDisposition::Created,
            enqueue_error,
        })
    }

    async fn on_existing(&self, existing: WebhookRecord) -> Result<IngestOutcome> {
        let age = self.clock.now() - existing.created_at;
        let stale = existing.status() == Some(WebhookStatus::Pending)
            && age > self.stale_after.as_secs() as i64;

        if !stale {
            debug!(webhook_id = %existing.id, status = %existing.status, "Duplicate delivery");
            return Ok(IngestOutcome {
                webhook: existing,
                disposition: IngestDisposition::Duplicate,
                enqueue_error: None,
            });
        }

        warn!(webhook_id = %existing.id, age_secs = age, "Webhook still pending, re-enqueueing");
        let enqueue_error = self.publish_logged(&existing, Trigger::Stale).await;

        Ok(IngestOutcome {
            webhook: existing,
            disposition: IngestDisposition::Requeued,
            enqueue_error,
        })
    }

    /// Publish failures after a committed insert are logged and reported in
    /// the outcome, never returned as errors.
    async fn publish_logged(&self, webhook: &WebhookRecord, trigger: Trigger) -> Option<String> {
        match self.publish(webhook, trigger).await {
            Ok(task_id) => {
                debug!(webhook_id = %webhook.id, task_id, trigger = trigger.as_str(), "Enqueued webhook task");
                None
            }
            Err(e) => {
                error!(
                    webhook_id = %webhook.id,
                    trigger = trigger.as_str(),
                    error = %e,
                    "Failed to enqueue webhook task; row left pending"
                );
                Some(e.to_string())
            }
        }
    }

    async fn publish(&self, webhook: &WebhookRecord, trigger: Trigger) -> Result<i64> {
        let payload = WebhookTask {
            webhook: webhook.clone(),
            trigger,
        };
        self.queue
            .publish(Task::new(WEBHOOK_EXECUTE, &payload)?)
            .await
    }

    /// Re-enqueue a webhook regardless of its status.
    #[instrument(skip(self))]
    pub async fn retry(&self, id: Uuid) -> Result<()> {
        let webhook = self.get(id).await?;

        self.publish(&webhook, Trigger::Manual)
            .await
            .map_err(|e| match e {
                CrmError::Queue { .. } => e,
                other => CrmError::Queue {
                    task: WEBHOOK_EXECUTE.to_string(),
                    reason: other.to_string(),
                },
            })?;

        info!(webhook_id = %webhook.id, status = %webhook.status, "Manual retry enqueued");
        Ok(())
    }

    /// Fetch a webhook by id.
    pub async fn get(&self, id: Uuid) -> Result<WebhookRecord> {
        self.persistence
            .get_webhook(&id.to_string())
            .await?
            .ok_or_else(|| CrmError::not_found("webhook", id.to_string()))
    }

    /// List webhooks, newest first.
    pub async fn list(&self, filter: &ListWebhooksFilter) -> Result<Vec<WebhookRecord>> {
        self.persistence.list_webhooks(filter).await
    }
}

fn validate(new: &NewWebhook) -> Result<()> {
    if new.provider.trim().is_empty() {
        return Err(CrmError::validation("provider", "must not be empty"));
    }
    if new.event.trim().is_empty() {
        return Err(CrmError::validation("event", "must not be empty"));
    }
    if let Some(reference) = &new.reference
        && reference.trim().is_empty()
    {
        return Err(CrmError::validation(
            "reference",
            "must not be empty when provided",
        ));
    }
    Ok(())
}
