// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for crm-core integration tests.
//!
//! Provides TestContext, which wires every component against an in-memory
//! SQLite database and a manually driven clock.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use sqlx::sqlite::SqlitePoolOptions;

use crm_core::clock::{Clock, ManualClock};
use crm_core::config::QueueConfig;
use crm_core::followups::{FollowUpService, ReminderSweep, ResourceKind};
use crm_core::migrations;
use crm_core::notifications::Notifier;
use crm_core::persistence::{ContactRecord, Persistence, PostgresPersistence, SqlitePersistence};
use crm_core::queue::StoreQueue;
use crm_core::webhooks::{HandlerRegistry, WebhookIntake, WebhookWorker};
use crm_core::worker::QueueConsumer;

/// 2025-03-10T12:00:00Z
pub const NOW: i64 = 1_741_608_000;

pub const DAY: i64 = 86_400;

pub const STALE_AFTER_SECS: u64 = 300;

/// Test context with every component sharing one database and clock.
pub struct TestContext {
    pub persistence: Arc<SqlitePersistence>,
    pub clock: Arc<ManualClock>,
    pub queue: StoreQueue,
    pub intake: WebhookIntake,
    pub follow_ups: FollowUpService,
    pub sweep: ReminderSweep,
    pub notifier: Notifier,
}

impl TestContext {
    pub async fn new() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");

        let persistence = Arc::new(SqlitePersistence::new(pool));
        let clock = Arc::new(ManualClock::new(NOW));
        let dyn_persistence: Arc<dyn Persistence> = persistence.clone();
        let dyn_clock: Arc<dyn Clock> = clock.clone();

        let queue = StoreQueue::new(
            dyn_persistence.clone(),
            dyn_clock.clone(),
            QueueConfig {
                max_attempts: 3,
                lease: Duration::from_secs(60),
                ..Default::default()
            },
        );
        let intake = WebhookIntake::new(
            dyn_persistence.clone(),
            Arc::new(queue.clone()),
            dyn_clock.clone(),
            Duration::from_secs(STALE_AFTER_SECS),
        );

        Self {
            follow_ups: FollowUpService::new(dyn_persistence.clone(), dyn_clock.clone(), utc()),
            sweep: ReminderSweep::new(dyn_persistence.clone(), dyn_clock.clone(), utc()),
            notifier: Notifier::new(dyn_persistence, dyn_clock),
            persistence,
            clock,
            queue,
            intake,
        }
    }

    /// Queue consumer using the given handlers.
    pub fn consumer(&self, handlers: HandlerRegistry) -> QueueConsumer {
        let worker = WebhookWorker::new(
            self.persistence.clone(),
            Arc::new(handlers),
            self.clock.clone(),
        );
        QueueConsumer::new(self.queue.clone(), worker, self.notifier.clone())
    }

    pub async fn seed_contact(
        &self,
        kind: ResourceKind,
        id: &str,
        user_id: &str,
        first_name: &str,
        last_name: &str,
    ) {
        self.persistence
            .insert_contact(
                kind,
                &ContactRecord {
                    id: id.to_string(),
                    user_id: user_id.to_string(),
                    first_name: first_name.to_string(),
                    last_name: last_name.to_string(),
                    created_at: NOW,
                },
            )
            .await
            .expect("Failed to seed contact");
    }

    pub async fn seed_lead(&self, id: &str, user_id: &str, first_name: &str, last_name: &str) {
        self.seed_contact(ResourceKind::Lead, id, user_id, first_name, last_name)
            .await;
    }

    pub async fn seed_client(&self, id: &str, user_id: &str, first_name: &str, last_name: &str) {
        self.seed_contact(ResourceKind::Client, id, user_id, first_name, last_name)
            .await;
    }

    /// Pending or running tasks with this name.
    pub async fn live_tasks(&self, name: &str) -> i64 {
        self.persistence
            .count_live_tasks(name)
            .await
            .expect("Failed to count tasks")
    }
}

pub fn utc() -> FixedOffset {
    Utc.fix()
}

/// PostgreSQL persistence from TEST_CRM_DATABASE_URL, with migrations applied.
pub async fn postgres_persistence() -> Option<PostgresPersistence> {
    let database_url = std::env::var("TEST_CRM_DATABASE_URL").ok()?;
    let pool = sqlx::PgPool::connect(&database_url).await.ok()?;
    migrations::run_postgres(&pool).await.ok()?;
    Some(PostgresPersistence::new(pool))
}

/// Helper macro to skip tests if TEST_CRM_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_CRM_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_CRM_DATABASE_URL not set");
            return;
        }
    };
}
