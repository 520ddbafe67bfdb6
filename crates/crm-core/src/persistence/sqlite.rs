//! SQLite-backed persistence implementation.

use std::path::Path;

use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::CrmError;
use crate::followups::ResourceKind;
use crate::migrations;
use crate::webhooks::WebhookStatus;

use super::{
    ContactRecord, DueFollowUpRow, FollowUpRecord, ListWebhooksFilter, NotificationRecord,
    Persistence, QueueTaskRecord, WebhookRecord,
};

const WEBHOOK_COLUMNS: &str = "id, provider, event, reference, status, data, attempts, \
                               last_error, created_at, updated_at";

const FOLLOW_UP_COLUMNS: &str = "id, user_id, resource_id, resource_name, is_done, \
                                 follow_up_at, last_reminded_at, created_at, updated_at";

const TASK_COLUMNS: &str =
    "id, name, payload, status, attempts, available_at, last_error, created_at, updated_at";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, connects,
    /// and runs all migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/crm.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CrmError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CrmError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CrmError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        migrations::run_sqlite(&pool)
            .await
            .map_err(|e| CrmError::Database {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_webhook(&self, webhook: &WebhookRecord) -> Result<bool, CrmError> {
        let result = sqlx::query(
            r#"
            INSERT INTO webhooks (id, provider, event, reference, status, data, attempts,
                                  last_error, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT (provider, event, reference) DO NOTHING
            "#,
        )
        .bind(&webhook.id)
        .bind(&webhook.provider)
        .bind(&webhook.event)
        .bind(&webhook.reference)
        .bind(&webhook.status)
        .bind(&webhook.data)
        .bind(webhook.attempts)
        .bind(&webhook.last_error)
        .bind(webhook.created_at)
        .bind(webhook.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_webhook(
        &self,
        provider: &str,
        event: &str,
        reference: &str,
    ) -> Result<Option<WebhookRecord>, CrmError> {
        let record = sqlx::query_as::<_, WebhookRecord>(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks \
             WHERE provider = ?1 AND event = ?2 AND reference = ?3"
        ))
        .bind(provider)
        .bind(event)
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_webhook(&self, id: &str) -> Result<Option<WebhookRecord>, CrmError> {
        let record = sqlx::query_as::<_, WebhookRecord>(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_webhooks(
        &self,
        filter: &ListWebhooksFilter,
    ) -> Result<Vec<WebhookRecord>, CrmError> {
        // SQLite treats a negative LIMIT as "no limit".
        let records = sqlx::query_as::<_, WebhookRecord>(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks \
             WHERE (?1 IS NULL OR status = ?1) \
             ORDER BY created_at DESC, id \
             LIMIT ?2"
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn claim_webhook(
        &self,
        id: &str,
        only_pending: bool,
        now: i64,
    ) -> Result<Option<WebhookRecord>, CrmError> {
        let record = sqlx::query_as::<_, WebhookRecord>(&format!(
            "UPDATE webhooks \
             SET status = 'processing', attempts = attempts + 1, updated_at = ?2 \
             WHERE id = ?1 AND (?3 = 0 OR status = 'pending') \
             RETURNING {WEBHOOK_COLUMNS}"
        ))
        .bind(id)
        .bind(now)
        .bind(only_pending)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn finish_webhook(
        &self,
        id: &str,
        status: WebhookStatus,
        error: Option<&str>,
        now: i64,
    ) -> Result<(), CrmError> {
        sqlx::query(
            r#"
            UPDATE webhooks
            SET status = ?2, last_error = ?3, updated_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_contact(
        &self,
        kind: ResourceKind,
        contact: &ContactRecord,
    ) -> Result<(), CrmError> {
        sqlx::query(&format!(
            "INSERT INTO {} (id, user_id, first_name, last_name, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            kind.table()
        ))
        .bind(&contact.id)
        .bind(&contact.user_id)
        .bind(&contact.first_name)
        .bind(&contact.last_name)
        .bind(contact.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_contact(
        &self,
        kind: ResourceKind,
        id: &str,
    ) -> Result<Option<ContactRecord>, CrmError> {
        let record = sqlx::query_as::<_, ContactRecord>(&format!(
            "SELECT id, user_id, first_name, last_name, created_at FROM {} WHERE id = ?1",
            kind.table()
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn delete_contact(&self, kind: ResourceKind, id: &str) -> Result<bool, CrmError> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = ?1", kind.table()))
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn upsert_follow_up(
        &self,
        follow_up: &FollowUpRecord,
    ) -> Result<FollowUpRecord, CrmError> {
        let record = sqlx::query_as::<_, FollowUpRecord>(&format!(
            "INSERT INTO follow_ups (id, user_id, resource_id, resource_name, is_done, \
                                     follow_up_at, last_reminded_at, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, 0, ?5, NULL, ?6, ?7) \
             ON CONFLICT (resource_id, resource_name) DO UPDATE SET \
                 user_id = excluded.user_id, \
                 follow_up_at = excluded.follow_up_at, \
                 is_done = 0, \
                 last_reminded_at = NULL, \
                 updated_at = excluded.updated_at \
             RETURNING {FOLLOW_UP_COLUMNS}"
        ))
        .bind(&follow_up.id)
        .bind(&follow_up.user_id)
        .bind(&follow_up.resource_id)
        .bind(&follow_up.resource_name)
        .bind(follow_up.follow_up_at)
        .bind(follow_up.created_at)
        .bind(follow_up.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_follow_up(&self, id: &str) -> Result<Option<FollowUpRecord>, CrmError> {
        let record = sqlx::query_as::<_, FollowUpRecord>(&format!(
            "SELECT {FOLLOW_UP_COLUMNS} FROM follow_ups WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_follow_ups_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<FollowUpRecord>, CrmError> {
        let records = sqlx::query_as::<_, FollowUpRecord>(&format!(
            "SELECT {FOLLOW_UP_COLUMNS} FROM follow_ups \
             WHERE user_id = ?1 \
             ORDER BY follow_up_at, id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn set_follow_up_done(
        &self,
        id: &str,
        is_done: bool,
        now: i64,
    ) -> Result<Option<FollowUpRecord>, CrmError> {
        let record = sqlx::query_as::<_, FollowUpRecord>(&format!(
            "UPDATE follow_ups SET is_done = ?2, updated_at = ?3 \
             WHERE id = ?1 \
             RETURNING {FOLLOW_UP_COLUMNS}"
        ))
        .bind(id)
        .bind(is_done)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn reschedule_follow_up(
        &self,
        id: &str,
        follow_up_at: i64,
        now: i64,
    ) -> Result<Option<FollowUpRecord>, CrmError> {
        let record = sqlx::query_as::<_, FollowUpRecord>(&format!(
            "UPDATE follow_ups \
             SET follow_up_at = ?2, last_reminded_at = NULL, updated_at = ?3 \
             WHERE id = ?1 \
             RETURNING {FOLLOW_UP_COLUMNS}"
        ))
        .bind(id)
        .bind(follow_up_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_due_follow_ups(
        &self,
        start: i64,
        end: i64,
    ) -> Result<Vec<DueFollowUpRow>, CrmError> {
        let rows = sqlx::query_as::<_, DueFollowUpRow>(
            r#"
            SELECT f.id, f.user_id, f.resource_id, f.resource_name, f.is_done,
                   f.follow_up_at, f.last_reminded_at, f.created_at, f.updated_at,
                   l.first_name AS lead_first_name, l.last_name AS lead_last_name,
                   c.first_name AS client_first_name, c.last_name AS client_last_name
            FROM follow_ups f
            LEFT JOIN leads l ON f.resource_name = 'leads' AND l.id = f.resource_id
            LEFT JOIN clients c ON f.resource_name = 'clients' AND c.id = f.resource_id
            WHERE f.is_done = 0
              AND f.follow_up_at BETWEEN ?1 AND ?2
            ORDER BY f.follow_up_at, f.id
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn claim_follow_up_reminder(
        &self,
        id: &str,
        day_start: i64,
        reminded_at: i64,
    ) -> Result<bool, CrmError> {
        let result = sqlx::query(
            r#"
            UPDATE follow_ups
            SET last_reminded_at = ?3
            WHERE id = ?1
              AND is_done = 0
              AND (last_reminded_at IS NULL OR last_reminded_at < ?2)
            "#,
        )
        .bind(id)
        .bind(day_start)
        .bind(reminded_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_follow_up_reminder(
        &self,
        id: &str,
        previous: Option<i64>,
    ) -> Result<(), CrmError> {
        sqlx::query("UPDATE follow_ups SET last_reminded_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(previous)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn insert_notification(
        &self,
        notification: &NotificationRecord,
    ) -> Result<(), CrmError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, user_id, title, message, is_read, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&notification.id)
        .bind(&notification.user_id)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.is_read)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_notifications_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<NotificationRecord>, CrmError> {
        let records = sqlx::query_as::<_, NotificationRecord>(
            r#"
            SELECT id, user_id, title, message, is_read, created_at
            FROM notifications
            WHERE user_id = ?1
            ORDER BY created_at, id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn enqueue_task(&self, name: &str, payload: &str, now: i64) -> Result<i64, CrmError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO queue_tasks (name, payload, status, attempts, available_at,
                                     created_at, updated_at)
            VALUES (?1, ?2, 'pending', 0, ?3, ?3, ?3)
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(payload)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn claim_tasks(
        &self,
        now: i64,
        lease_expired_before: i64,
        limit: i64,
    ) -> Result<Vec<QueueTaskRecord>, CrmError> {
        let mut tasks = sqlx::query_as::<_, QueueTaskRecord>(&format!(
            "UPDATE queue_tasks \
             SET status = 'running', attempts = attempts + 1, updated_at = ?1 \
             WHERE id IN ( \
                 SELECT id FROM queue_tasks \
                 WHERE (status = 'pending' AND available_at <= ?1) \
                    OR (status = 'running' AND updated_at < ?2) \
                 ORDER BY available_at, id \
                 LIMIT ?3 \
             ) \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(now)
        .bind(lease_expired_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        // RETURNING order is unspecified
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn ack_task(&self, id: i64) -> Result<(), CrmError> {
        sqlx::query("DELETE FROM queue_tasks WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn retry_task(
        &self,
        id: i64,
        available_at: i64,
        error: &str,
        now: i64,
    ) -> Result<(), CrmError> {
        sqlx::query(
            r#"
            UPDATE queue_tasks
            SET status = 'pending', available_at = ?2, last_error = ?3, updated_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(available_at)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn dead_letter_task(&self, id: i64, error: &str, now: i64) -> Result<(), CrmError> {
        sqlx::query(
            r#"
            UPDATE queue_tasks
            SET status = 'dead', last_error = ?2, updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_task(&self, id: i64) -> Result<Option<QueueTaskRecord>, CrmError> {
        let record = sqlx::query_as::<_, QueueTaskRecord>(&format!(
            "SELECT {TASK_COLUMNS} FROM queue_tasks WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn count_live_tasks(&self, name: &str) -> Result<i64, CrmError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM queue_tasks
            WHERE name = ?1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn list_dead_tasks(&self, limit: i64) -> Result<Vec<QueueTaskRecord>, CrmError> {
        let records = sqlx::query_as::<_, QueueTaskRecord>(&format!(
            "SELECT {TASK_COLUMNS} FROM queue_tasks \
             WHERE status = 'dead' \
             ORDER BY updated_at DESC, id \
             LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn health_check_db(&self) -> Result<bool, CrmError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}
