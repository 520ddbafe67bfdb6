// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Daily reminder sweep.
//!
//! Finds follow-ups due on the reference day and sends one notification per
//! follow-up to its owner. Each row is claimed by setting `last_reminded_at`
//! before the notification is written, so repeated or overlapping sweeps for
//! the same day notify once.

use std::sync::Arc;

use chrono::FixedOffset;
use futures::future::join_all;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::notifications::{NewNotification, Notifier};
use crate::persistence::{DueFollowUpRow, NotificationRecord, Persistence};

use super::{ResourceKind, day_window};

/// Title of reminder notifications.
pub const REMINDER_TITLE: &str = "Follow Up Reminder";

/// Reminder sweep.
#[derive(Clone)]
pub struct ReminderSweep {
    persistence: Arc<dyn Persistence>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
}

impl ReminderSweep {
    /// Create a sweep. `offset` defines the calendar day.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        clock: Arc<dyn Clock>,
        offset: FixedOffset,
    ) -> Self {
        Self {
            notifier: Notifier::new(persistence.clone(), clock.clone()),
            persistence,
            clock,
            offset,
        }
    }

    /// Notify owners of follow-ups due on the day containing `reference`
    /// (defaults to now). Returns the notifications created by this run.
    ///
    /// Failing to load due follow-ups is an error. A failure on a single row
    /// is logged and does not affect the others.
    #[instrument(skip(self))]
    pub async fn run(&self, reference: Option<i64>) -> Result<Vec<NotificationRecord>> {
        let at = reference.unwrap_or_else(|| self.clock.now());
        let (day_start, day_end) = day_window(at, self.offset);

        let due = self
            .persistence
            .list_due_follow_ups(day_start, day_end)
            .await?;

        let results = join_all(due.iter().map(|row| self.remind(row, day_start, at))).await;
        let created: Vec<NotificationRecord> = results.into_iter().flatten().collect();

        info!(
            day_start,
            due = due.len(),
            notified = created.len(),
            "Reminder sweep finished"
        );
        Ok(created)
    }

    async fn remind(
        &self,
        row: &DueFollowUpRow,
        day_start: i64,
        at: i64,
    ) -> Option<NotificationRecord> {
        let follow_up = &row.follow_up;

        let Some(name) = display_name(row) else {
            warn!(
                follow_up_id = %follow_up.id,
                resource_name = %follow_up.resource_name,
                resource_id = %follow_up.resource_id,
                "Follow-up references a missing resource, skipping"
            );
            return None;
        };

        match self
            .persistence
            .claim_follow_up_reminder(&follow_up.id, day_start, at)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(follow_up_id = %follow_up.id, "Already reminded today");
                return None;
            }
            Err(e) => {
                error!(follow_up_id = %follow_up.id, error = %e, "Failed to claim reminder");
                return None;
            }
        }

        let new = NewNotification {
            user_id: follow_up.user_id.clone(),
            title: REMINDER_TITLE.to_string(),
            message: format!("{name} is due for a follow-up"),
        };

        match self.notifier.create(&new).await {
            Ok(notification) => Some(notification),
            Err(e) => {
                error!(follow_up_id = %follow_up.id, error = %e, "Failed to create reminder notification");
                if let Err(e) = self
                    .persistence
                    .release_follow_up_reminder(&follow_up.id, follow_up.last_reminded_at)
                    .await
                {
                    error!(follow_up_id = %follow_up.id, error = %e, "Failed to release reminder claim");
                }
                None
            }
        }
    }
}

/// "First Last" of whichever association matches `resource_name`.
fn display_name(row: &DueFollowUpRow) -> Option<String> {
    let (first, last) = match row.follow_up.resource_name.parse::<ResourceKind>().ok()? {
        ResourceKind::Lead => (&row.lead_first_name, &row.lead_last_name),
        ResourceKind::Client => (&row.client_first_name, &row.client_last_name),
    };
    Some(format!("{} {}", first.as_deref()?, last.as_deref()?))
}
