// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Follow-ups on leads and clients.
//!
//! A resource has at most one follow-up; creating another one for the same
//! resource updates the existing row. The status shown to users is derived
//! from `is_done` and `follow_up_at` on every read and never stored.

pub mod reminder;
pub mod scheduler;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{CrmError, Result};
use crate::persistence::{FollowUpRecord, Persistence};

pub use reminder::ReminderSweep;
pub use scheduler::{ReminderScheduler, next_run_delay};

const SECS_PER_DAY: i64 = 86_400;

/// Which table a follow-up points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// `leads`
    Lead,
    /// `clients`
    Client,
}

impl ResourceKind {
    /// Table name, also stored as `follow_ups.resource_name`.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Lead => "leads",
            Self::Client => "clients",
        }
    }

    /// Singular name used in errors and logs.
    pub fn entity(&self) -> &'static str {
        match self {
            Self::Lead => "lead",
            Self::Client => "client",
        }
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "leads" => Ok(Self::Lead),
            "clients" => Ok(Self::Client),
            other => Err(format!("unknown resource table: {other}")),
        }
    }
}

/// Reference to the lead or client a follow-up belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum ResourceRef {
    /// A lead id.
    Lead(String),
    /// A client id.
    Client(String),
}

impl ResourceRef {
    /// Build from a kind and id.
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        match kind {
            ResourceKind::Lead => Self::Lead(id.into()),
            ResourceKind::Client => Self::Client(id.into()),
        }
    }

    /// The kind.
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Lead(_) => ResourceKind::Lead,
            Self::Client(_) => ResourceKind::Client,
        }
    }

    /// The id.
    pub fn id(&self) -> &str {
        match self {
            Self::Lead(id) | Self::Client(id) => id,
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind().entity(), self.id())
    }
}

/// Status shown for a follow-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FollowUpStatus {
    /// Marked done.
    #[serde(rename = "Complete")]
    Complete,
    /// Due within today's window.
    #[serde(rename = "Due Today")]
    DueToday,
    /// Due before today.
    #[serde(rename = "Overdue")]
    Overdue,
    /// Due after today.
    #[serde(rename = "Upcoming")]
    Upcoming,
}

impl FollowUpStatus {
    /// Display label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "Complete",
            Self::DueToday => "Due Today",
            Self::Overdue => "Overdue",
            Self::Upcoming => "Upcoming",
        }
    }
}

impl fmt::Display for FollowUpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive `[start, end]` unix-seconds bounds of the calendar day
/// containing `ts` in `offset`.
pub fn day_window(ts: i64, offset: FixedOffset) -> (i64, i64) {
    let shift = offset.local_minus_utc() as i64;
    let start = ts
        .saturating_add(shift)
        .div_euclid(SECS_PER_DAY)
        .saturating_mul(SECS_PER_DAY)
        .saturating_sub(shift);
    (start, start.saturating_add(SECS_PER_DAY - 1))
}

/// Derive the status of a follow-up relative to `now`.
pub fn derive_status(
    is_done: bool,
    follow_up_at: i64,
    now: i64,
    offset: FixedOffset,
) -> FollowUpStatus {
    if is_done {
        return FollowUpStatus::Complete;
    }

    let (start, end) = day_window(now, offset);
    if (start..=end).contains(&follow_up_at) {
        FollowUpStatus::DueToday
    } else if follow_up_at < start {
        FollowUpStatus::Overdue
    } else {
        FollowUpStatus::Upcoming
    }
}

/// A follow-up together with its derived status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpView {
    /// Stored row.
    #[serde(flatten)]
    pub follow_up: FollowUpRecord,
    /// Status at read time.
    pub status: FollowUpStatus,
}

/// Follow-up operations.
#[derive(Clone)]
pub struct FollowUpService {
    persistence: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
}

impl FollowUpService {
    /// Create a service. `offset` defines calendar days for status derivation.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        clock: Arc<dyn Clock>,
        offset: FixedOffset,
    ) -> Self {
        Self {
            persistence,
            clock,
            offset,
        }
    }

    fn view(&self, follow_up: FollowUpRecord) -> FollowUpView {
        let status = derive_status(
            follow_up.is_done,
            follow_up.follow_up_at,
            self.clock.now(),
            self.offset,
        );
        FollowUpView { follow_up, status }
    }

    /// Create or update the follow-up for `resource`, owned by `actor_user_id`.
    ///
    /// The resource must exist. An existing follow-up keeps its id, takes the
    /// new `follow_up_at`, and becomes not-done again.
    #[instrument(skip(self), fields(resource = %resource))]
    pub async fn upsert(
        &self,
        actor_user_id: &str,
        resource: &ResourceRef,
        follow_up_at: i64,
    ) -> Result<FollowUpView> {
        if actor_user_id.trim().is_empty() {
            return Err(CrmError::validation("user_id", "must not be empty"));
        }

        let kind = resource.kind();
        if self
            .persistence
            .get_contact(kind, resource.id())
            .await?
            .is_none()
        {
            return Err(CrmError::not_found(kind.entity(), resource.id()));
        }

        let now = self.clock.now();
        let stored = self
            .persistence
            .upsert_follow_up(&FollowUpRecord {
                id: Uuid::new_v4().to_string(),
                user_id: actor_user_id.to_string(),
                resource_id: resource.id().to_string(),
                resource_name: kind.table().to_string(),
                is_done: false,
                follow_up_at,
                last_reminded_at: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        info!(follow_up_id = %stored.id, follow_up_at, "Follow-up scheduled");
        Ok(self.view(stored))
    }

    /// Mark a follow-up done.
    pub async fn mark_done(&self, id: &str) -> Result<FollowUpView> {
        self.persistence
            .set_follow_up_done(id, true, self.clock.now())
            .await?
            .map(|r| self.view(r))
            .ok_or_else(|| CrmError::not_found("follow_up", id))
    }

    /// Move a follow-up to a new time. A reminder fires again for the new day.
    pub async fn reschedule(&self, id: &str, follow_up_at: i64) -> Result<FollowUpView> {
        self.persistence
            .reschedule_follow_up(id, follow_up_at, self.clock.now())
            .await?
            .map(|r| self.view(r))
            .ok_or_else(|| CrmError::not_found("follow_up", id))
    }

    /// Fetch one follow-up.
    pub async fn get(&self, id: &str) -> Result<FollowUpView> {
        self.persistence
            .get_follow_up(id)
            .await?
            .map(|r| self.view(r))
            .ok_or_else(|| CrmError::not_found("follow_up", id))
    }

    /// All follow-ups owned by a user, soonest first.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<FollowUpView>> {
        Ok(self
            .persistence
            .list_follow_ups_for_user(user_id)
            .await?
            .into_iter()
            .map(|r| self.view(r))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Offset, Utc};

    // 2025-03-10T12:00:00Z
    const NOON: i64 = 1_741_608_000;

    fn utc() -> FixedOffset {
        Utc.fix()
    }

    #[test]
    fn test_day_window_utc() {
        let (start, end) = day_window(NOON, utc());
        assert_eq!(start, 1_741_564_800);
        assert_eq!(end, 1_741_651_199);
        assert_eq!(day_window(start, utc()), (start, end));
        assert_eq!(day_window(end, utc()), (start, end));
    }

    #[test]
    fn test_day_window_with_offset() {
        // 23:30 UTC is already the next day at +02:00
        let late = 1_741_564_800 + 23 * 3_600 + 1_800;
        let plus_two = FixedOffset::east_opt(2 * 3_600).unwrap();
        let (start, end) = day_window(late, plus_two);
        assert_eq!(start, 1_741_651_200 - 2 * 3_600);
        assert_eq!(end - start, SECS_PER_DAY - 1);

        // Negative offsets and pre-epoch timestamps floor correctly
        let minus_five = FixedOffset::west_opt(5 * 3_600).unwrap();
        let (start, _) = day_window(-1, minus_five);
        assert!(start <= -1);
        assert_eq!((start - 5 * 3_600).rem_euclid(SECS_PER_DAY), 0);
    }

    #[test]
    fn test_day_window_extreme_timestamps() {
        let plus_two = FixedOffset::east_opt(2 * 3_600).unwrap();
        let minus_five = FixedOffset::west_opt(5 * 3_600).unwrap();

        for (ts, offset) in [
            (i64::MAX, plus_two),
            (i64::MAX, minus_five),
            (i64::MIN, plus_two),
            (i64::MIN, minus_five),
        ] {
            let (start, end) = day_window(ts, offset);
            assert!(start <= end, "window for {ts} at {offset} is inverted");
        }

        let (start, end) = day_window(i64::MAX, utc());
        assert_eq!(end, i64::MAX);
        assert!(i64::MAX - start < SECS_PER_DAY);
    }

    #[test]
    fn test_derive_status() {
        let day = SECS_PER_DAY;
        assert_eq!(derive_status(false, NOON, NOON, utc()), FollowUpStatus::DueToday);
        assert_eq!(derive_status(false, NOON - day, NOON, utc()), FollowUpStatus::Overdue);
        assert_eq!(derive_status(false, NOON + day, NOON, utc()), FollowUpStatus::Upcoming);
        for at in [NOON - day, NOON, NOON + day] {
            assert_eq!(derive_status(true, at, NOON, utc()), FollowUpStatus::Complete);
        }
    }

    #[test]
    fn test_derive_status_day_edges() {
        let (start, end) = day_window(NOON, utc());
        assert_eq!(derive_status(false, start, NOON, utc()), FollowUpStatus::DueToday);
        assert_eq!(derive_status(false, end, NOON, utc()), FollowUpStatus::DueToday);
        assert_eq!(derive_status(false, start - 1, NOON, utc()), FollowUpStatus::Overdue);
        assert_eq!(derive_status(false, end + 1, NOON, utc()), FollowUpStatus::Upcoming);
    }

    #[test]
    fn test_resource_ref() {
        let lead = ResourceRef::new(ResourceKind::Lead, "l-1");
        assert_eq!(lead, ResourceRef::Lead("l-1".to_string()));
        assert_eq!(lead.kind().table(), "leads");
        assert_eq!(lead.to_string(), "lead:l-1");

        assert_eq!("clients".parse::<ResourceKind>(), Ok(ResourceKind::Client));
        assert!("client".parse::<ResourceKind>().is_err());

        let json = serde_json::to_value(&lead).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "lead", "id": "l-1"}));
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(FollowUpStatus::DueToday.to_string(), "Due Today");
        assert_eq!(
            serde_json::to_value(FollowUpStatus::DueToday).unwrap(),
            "Due Today"
        );
    }
}
