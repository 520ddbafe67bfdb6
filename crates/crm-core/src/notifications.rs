// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-app notifications.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{CrmError, Result};
use crate::persistence::{NotificationRecord, Persistence};
use crate::queue::{SEND_NOTIFICATION, Task, TaskQueue};

/// Payload of a `send-notification` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNotification {
    /// Recipient.
    pub user_id: String,
    /// Short title.
    pub title: String,
    /// Body text.
    pub message: String,
}

/// Writes notifications.
#[derive(Clone)]
pub struct Notifier {
    persistence: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
}

impl Notifier {
    /// Create a notifier.
    pub fn new(persistence: Arc<dyn Persistence>, clock: Arc<dyn Clock>) -> Self {
        Self { persistence, clock }
    }

    /// Store an unread notification.
    pub async fn create(&self, new: &NewNotification) -> Result<NotificationRecord> {
        if new.user_id.trim().is_empty() {
            return Err(CrmError::validation("user_id", "must not be empty"));
        }

        let record = NotificationRecord {
            id: Uuid::new_v4().to_string(),
            user_id: new.user_id.clone(),
            title: new.title.clone(),
            message: new.message.clone(),
            is_read: false,
            created_at: self.clock.now(),
        };
        self.persistence.insert_notification(&record).await?;

        debug!(notification_id = %record.id, user_id = %record.user_id, "Notification created");
        Ok(record)
    }

    /// Notifications for a user, oldest first.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<NotificationRecord>> {
        self.persistence.list_notifications_for_user(user_id).await
    }
}

/// Publish a `send-notification` task instead of writing directly.
pub async fn enqueue(queue: &dyn TaskQueue, new: &NewNotification) -> Result<i64> {
    queue.publish(Task::new(SEND_NOTIFICATION, new)?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::SqlitePersistence;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn notifier() -> Notifier {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        crate::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");
        Notifier::new(
            Arc::new(SqlitePersistence::new(pool)),
            Arc::new(ManualClock::new(42)),
        )
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let notifier = notifier().await;
        let created = notifier
            .create(&NewNotification {
                user_id: "user-1".to_string(),
                title: "Hello".to_string(),
                message: "World".to_string(),
            })
            .await
            .unwrap();

        assert!(!created.is_read);
        assert_eq!(created.created_at, 42);
        assert_eq!(notifier.list_for_user("user-1").await.unwrap(), vec![created]);
    }

    #[tokio::test]
    async fn test_empty_recipient_rejected() {
        let notifier = notifier().await;
        let err = notifier
            .create(&NewNotification {
                user_id: "".to_string(),
                title: "t".to_string(),
                message: "m".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }
}
