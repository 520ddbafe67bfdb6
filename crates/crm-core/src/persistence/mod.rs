//! Persistence interfaces and backends for crm-core.
//!
//! This module defines the persistence abstraction and backend implementations.
//! Unique constraints in the schema are the only concurrency-correctness
//! mechanism: duplicate inserts are absorbed with `ON CONFLICT`, and claims
//! are conditional updates whose row count tells the caller whether it won.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

use crate::error::CrmError;
use crate::migrations;
use crate::followups::{ResourceKind, ResourceRef};
use crate::webhooks::WebhookStatus;

/// Webhook record from the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookRecord {
    /// Unique identifier (UUID text).
    pub id: String,
    /// Sending system (e.g. "stripe").
    pub provider: String,
    /// Event name as reported by the provider.
    pub event: String,
    /// Caller- or payload-derived token identifying the logical event.
    pub reference: String,
    /// Current status (pending, processing, processed, failed).
    pub status: String,
    /// Serialized JSON payload.
    pub data: String,
    /// How many times a worker has claimed this webhook.
    pub attempts: i32,
    /// Last handler error, kept for operator inspection.
    pub last_error: Option<String>,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds.
    pub updated_at: i64,
}

impl WebhookRecord {
    /// Parsed status, `None` if the stored value is unknown.
    pub fn status(&self) -> Option<WebhookStatus> {
        self.status.parse().ok()
    }

    /// Deserialize the stored payload.
    pub fn payload(&self) -> Result<serde_json::Value, CrmError> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// Filter options for listing webhooks.
#[derive(Debug, Clone, Default)]
pub struct ListWebhooksFilter {
    /// Only webhooks in this status.
    pub status: Option<WebhookStatus>,
    /// Maximum rows returned (newest first).
    pub limit: Option<i64>,
}

/// Lead or client row. Both tables share the same shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContactRecord {
    /// Unique identifier.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// First name.
    pub first_name: String,
    /// Last name.
    pub last_name: String,
    /// Unix seconds.
    pub created_at: i64,
}

/// Follow-up record from the persistence layer.
///
/// The derived status is not stored; see [`crate::followups::derive_status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowUpRecord {
    /// Unique identifier.
    pub id: String,
    /// User to notify.
    pub user_id: String,
    /// Id of the referenced lead or client.
    pub resource_id: String,
    /// Table of the referenced resource ("leads" or "clients").
    pub resource_name: String,
    /// Whether the follow-up was completed.
    pub is_done: bool,
    /// When the reminder should fire (unix seconds).
    pub follow_up_at: i64,
    /// When the last reminder was emitted (unix seconds).
    pub last_reminded_at: Option<i64>,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds.
    pub updated_at: i64,
}

impl FollowUpRecord {
    /// Typed resource reference, `None` if `resource_name` is unknown.
    pub fn resource(&self) -> Option<ResourceRef> {
        let kind: ResourceKind = self.resource_name.parse().ok()?;
        Some(ResourceRef::new(kind, self.resource_id.clone()))
    }
}

/// Due follow-up joined with both possible resource associations.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DueFollowUpRow {
    /// The follow-up itself.
    #[sqlx(flatten)]
    pub follow_up: FollowUpRecord,
    /// First name of the lead, if the lead join matched.
    pub lead_first_name: Option<String>,
    /// Last name of the lead, if the lead join matched.
    pub lead_last_name: Option<String>,
    /// First name of the client, if the client join matched.
    pub client_first_name: Option<String>,
    /// Last name of the client, if the client join matched.
    pub client_last_name: Option<String>,
}

/// In-app notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationRecord {
    /// Unique identifier.
    pub id: String,
    /// Recipient.
    pub user_id: String,
    /// Short title.
    pub title: String,
    /// Body text.
    pub message: String,
    /// Whether the user has read it.
    pub is_read: bool,
    /// Unix seconds.
    pub created_at: i64,
}

/// Durable queue task.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueTaskRecord {
    /// Database primary key.
    pub id: i64,
    /// Task name (e.g. "webhook.execute").
    pub name: String,
    /// Serialized JSON payload.
    pub payload: String,
    /// pending, running or dead.
    pub status: String,
    /// Deliveries so far, incremented on every claim.
    pub attempts: i32,
    /// Earliest time the task may be claimed (unix seconds).
    pub available_at: i64,
    /// Error from the last failed delivery.
    pub last_error: Option<String>,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds. For running tasks this is the claim time.
    pub updated_at: i64,
}

/// Persistence interface used by intake, worker, follow-ups and the queue.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------
    // Webhooks
    // ------------------------------------------------------------------

    /// Insert a webhook unless its dedup key already exists.
    ///
    /// Returns true if the row was inserted, false if another row with the
    /// same (provider, event, reference) won.
    async fn insert_webhook(&self, webhook: &WebhookRecord) -> Result<bool, CrmError>;

    async fn find_webhook(
        &self,
        provider: &str,
        event: &str,
        reference: &str,
    ) -> Result<Option<WebhookRecord>, CrmError>;

    async fn get_webhook(&self, id: &str) -> Result<Option<WebhookRecord>, CrmError>;

    async fn list_webhooks(
        &self,
        filter: &ListWebhooksFilter,
    ) -> Result<Vec<WebhookRecord>, CrmError>;

    /// Move a webhook to `processing` and bump `attempts`.
    ///
    /// With `only_pending` the update applies only to rows still `pending`,
    /// so at most one worker claims a given delivery. Returns the updated row
    /// when the claim succeeded.
    async fn claim_webhook(
        &self,
        id: &str,
        only_pending: bool,
        now: i64,
    ) -> Result<Option<WebhookRecord>, CrmError>;

    /// Set a terminal status (processed or failed) and the last error.
    async fn finish_webhook(
        &self,
        id: &str,
        status: WebhookStatus,
        error: Option<&str>,
        now: i64,
    ) -> Result<(), CrmError>;

    // ------------------------------------------------------------------
    // Leads and clients
    // ------------------------------------------------------------------

    async fn insert_contact(
        &self,
        kind: ResourceKind,
        contact: &ContactRecord,
    ) -> Result<(), CrmError>;

    async fn get_contact(
        &self,
        kind: ResourceKind,
        id: &str,
    ) -> Result<Option<ContactRecord>, CrmError>;

    /// Returns true if a row was deleted.
    async fn delete_contact(&self, kind: ResourceKind, id: &str) -> Result<bool, CrmError>;

    // ------------------------------------------------------------------
    // Follow-ups
    // ------------------------------------------------------------------

    /// Insert or update the follow-up for `follow_up.resource_*`.
    ///
    /// On conflict the existing row keeps its id; `user_id` and
    /// `follow_up_at` are overwritten, `is_done` is reset and the reminder
    /// marker cleared. Returns the stored row.
    async fn upsert_follow_up(&self, follow_up: &FollowUpRecord)
    -> Result<FollowUpRecord, CrmError>;

    async fn get_follow_up(&self, id: &str) -> Result<Option<FollowUpRecord>, CrmError>;

    async fn list_follow_ups_for_user(&self, user_id: &str)
    -> Result<Vec<FollowUpRecord>, CrmError>;

    async fn set_follow_up_done(
        &self,
        id: &str,
        is_done: bool,
        now: i64,
    ) -> Result<Option<FollowUpRecord>, CrmError>;

    /// Move `follow_up_at` and clear the reminder marker.
    async fn reschedule_follow_up(
        &self,
        id: &str,
        follow_up_at: i64,
        now: i64,
    ) -> Result<Option<FollowUpRecord>, CrmError>;

    /// Not-done follow-ups with `follow_up_at` in `[start, end]`, joined with
    /// the lead and client they may refer to.
    async fn list_due_follow_ups(
        &self,
        start: i64,
        end: i64,
    ) -> Result<Vec<DueFollowUpRow>, CrmError>;

    /// Claim the reminder for a follow-up for the day starting at `day_start`.
    ///
    /// Succeeds only if the follow-up is not done and no reminder was
    /// recorded at or after `day_start`. The marker is set to `reminded_at`,
    /// which callers keep inside the day window so reruns for the same day
    /// find it.
    async fn claim_follow_up_reminder(
        &self,
        id: &str,
        day_start: i64,
        reminded_at: i64,
    ) -> Result<bool, CrmError>;

    /// Undo a reminder claim, restoring the previous marker.
    async fn release_follow_up_reminder(
        &self,
        id: &str,
        previous: Option<i64>,
    ) -> Result<(), CrmError>;

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    async fn insert_notification(&self, notification: &NotificationRecord)
    -> Result<(), CrmError>;

    async fn list_notifications_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<NotificationRecord>, CrmError>;

    // ------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------

    /// Append a task. Returns its id.
    async fn enqueue_task(&self, name: &str, payload: &str, now: i64) -> Result<i64, CrmError>;

    /// Claim up to `limit` tasks that are pending and available, or running
    /// with a claim older than `lease_expired_before`.
    async fn claim_tasks(
        &self,
        now: i64,
        lease_expired_before: i64,
        limit: i64,
    ) -> Result<Vec<QueueTaskRecord>, CrmError>;

    /// Remove a successfully delivered task.
    async fn ack_task(&self, id: i64) -> Result<(), CrmError>;

    /// Return a task to pending, claimable again at `available_at`.
    async fn retry_task(
        &self,
        id: i64,
        available_at: i64,
        error: &str,
        now: i64,
    ) -> Result<(), CrmError>;

    /// Park a task as dead so it is never claimed again.
    async fn dead_letter_task(&self, id: i64, error: &str, now: i64) -> Result<(), CrmError>;

    async fn get_task(&self, id: i64) -> Result<Option<QueueTaskRecord>, CrmError>;

    /// Count tasks with the given name that are pending or running.
    async fn count_live_tasks(&self, name: &str) -> Result<i64, CrmError>;

    async fn list_dead_tasks(&self, limit: i64) -> Result<Vec<QueueTaskRecord>, CrmError>;

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    async fn health_check_db(&self) -> Result<bool, CrmError>;
}

/// Connect to the backend named by the URL scheme and run its migrations.
///
/// `sqlite:` URLs create the database file if it does not exist yet; every
/// other URL is treated as PostgreSQL.
pub async fn connect(database_url: &str) -> Result<Arc<dyn Persistence>, CrmError> {
    if database_url.starts_with("sqlite:") {
        info!("Connecting to SQLite...");
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        info!("Running database migrations...");
        migrations::run_sqlite(&pool)
            .await
            .map_err(|e| CrmError::Database {
                operation: "migrate".to_string(),
                details: e.to_string(),
            })?;
        info!("Migrations completed");

        return Ok(Arc::new(SqlitePersistence::new(pool)));
    }

    info!("Connecting to PostgreSQL...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    info!("Running database migrations...");
    migrations::run_postgres(&pool)
        .await
        .map_err(|e| CrmError::Database {
            operation: "migrate".to_string(),
            details: e.to_string(),
        })?;
    info!("Migrations completed");

    Ok(Arc::new(PostgresPersistence::new(pool)))
}
