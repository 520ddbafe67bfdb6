// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Follow-up upsert and derived status.

mod common;

use common::*;

use crm_core::followups::{FollowUpStatus, ResourceKind, ResourceRef};

fn lead(id: &str) -> ResourceRef {
    ResourceRef::new(ResourceKind::Lead, id)
}

#[tokio::test]
async fn test_upsert_keeps_one_row_per_resource() {
    let ctx = TestContext::new().await;
    ctx.seed_lead("lead-1", "user-1", "Ada", "Lovelace").await;

    let first = ctx
        .follow_ups
        .upsert("user-1", &lead("lead-1"), NOW + DAY)
        .await
        .unwrap();
    let second = ctx
        .follow_ups
        .upsert("user-2", &lead("lead-1"), NOW + 2 * DAY)
        .await
        .unwrap();

    assert_eq!(second.follow_up.id, first.follow_up.id);
    assert_eq!(second.follow_up.follow_up_at, NOW + 2 * DAY);
    assert_eq!(second.follow_up.user_id, "user-2");
    assert_eq!(second.follow_up.resource_name, "leads");

    assert!(ctx.follow_ups.list_for_user("user-1").await.unwrap().is_empty());
    assert_eq!(ctx.follow_ups.list_for_user("user-2").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_same_id_on_lead_and_client_are_distinct() {
    let ctx = TestContext::new().await;
    ctx.seed_lead("c-1", "user-1", "Ada", "Lovelace").await;
    ctx.seed_client("c-1", "user-1", "Grace", "Hopper").await;

    let on_lead = ctx.follow_ups.upsert("user-1", &lead("c-1"), NOW).await.unwrap();
    let on_client = ctx
        .follow_ups
        .upsert("user-1", &ResourceRef::new(ResourceKind::Client, "c-1"), NOW)
        .await
        .unwrap();

    assert_ne!(on_lead.follow_up.id, on_client.follow_up.id);
    assert_eq!(
        on_client.follow_up.resource(),
        Some(ResourceRef::Client("c-1".to_string()))
    );
}

#[tokio::test]
async fn test_upsert_rejects_unknown_resource_and_empty_user() {
    let ctx = TestContext::new().await;
    ctx.seed_lead("lead-1", "user-1", "Ada", "Lovelace").await;

    let err = ctx
        .follow_ups
        .upsert("user-1", &lead("missing"), NOW)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");
    assert_eq!(err.to_string(), "lead 'missing' not found");

    let err = ctx
        .follow_ups
        .upsert("  ", &lead("lead-1"), NOW)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_derived_status_follows_clock() {
    let ctx = TestContext::new().await;
    ctx.seed_lead("lead-1", "user-1", "Ada", "Lovelace").await;

    let view = ctx
        .follow_ups
        .upsert("user-1", &lead("lead-1"), NOW + 3_600)
        .await
        .unwrap();
    assert_eq!(view.status, FollowUpStatus::DueToday);

    let id = view.follow_up.id.clone();

    ctx.clock.set(NOW - DAY);
    assert_eq!(ctx.follow_ups.get(&id).await.unwrap().status, FollowUpStatus::Upcoming);

    ctx.clock.set(NOW + DAY);
    assert_eq!(ctx.follow_ups.get(&id).await.unwrap().status, FollowUpStatus::Overdue);

    let done = ctx.follow_ups.mark_done(&id).await.unwrap();
    assert!(done.follow_up.is_done);
    assert_eq!(done.status, FollowUpStatus::Complete);
}

#[tokio::test]
async fn test_reschedule_reopens_follow_up() {
    let ctx = TestContext::new().await;
    ctx.seed_lead("lead-1", "user-1", "Ada", "Lovelace").await;
    let view = ctx
        .follow_ups
        .upsert("user-1", &lead("lead-1"), NOW - DAY)
        .await
        .unwrap();
    assert_eq!(view.status, FollowUpStatus::Overdue);

    let moved = ctx
        .follow_ups
        .reschedule(&view.follow_up.id, NOW + 2 * DAY)
        .await
        .unwrap();
    assert_eq!(moved.follow_up.follow_up_at, NOW + 2 * DAY);
    assert_eq!(moved.status, FollowUpStatus::Upcoming);
}

#[tokio::test]
async fn test_unknown_follow_up_is_not_found() {
    let ctx = TestContext::new().await;

    for err in [
        ctx.follow_ups.get("nope").await.unwrap_err(),
        ctx.follow_ups.mark_done("nope").await.unwrap_err(),
        ctx.follow_ups.reschedule("nope", NOW).await.unwrap_err(),
    ] {
        assert_eq!(err.error_code(), "NOT_FOUND");
    }
}

#[tokio::test]
async fn test_list_for_user_is_soonest_first() {
    let ctx = TestContext::new().await;
    ctx.seed_lead("lead-1", "user-1", "Ada", "Lovelace").await;
    ctx.seed_lead("lead-2", "user-1", "Alan", "Turing").await;
    ctx.seed_client("client-1", "user-1", "Grace", "Hopper").await;

    ctx.follow_ups
        .upsert("user-1", &lead("lead-1"), NOW + 2 * DAY)
        .await
        .unwrap();
    ctx.follow_ups
        .upsert("user-1", &lead("lead-2"), NOW - DAY)
        .await
        .unwrap();
    ctx.follow_ups
        .upsert("user-1", &ResourceRef::new(ResourceKind::Client, "client-1"), NOW)
        .await
        .unwrap();

    let statuses: Vec<_> = ctx
        .follow_ups
        .list_for_user("user-1")
        .await
        .unwrap()
        .into_iter()
        .map(|v| v.status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            FollowUpStatus::Overdue,
            FollowUpStatus::DueToday,
            FollowUpStatus::Upcoming
        ]
    );
}
