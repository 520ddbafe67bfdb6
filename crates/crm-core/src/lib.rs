// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! crm-core - CRM backend core
//!
//! Two workflows on top of a relational store:
//!
//! 1. **Webhook ingestion.** Deliveries are deduplicated on
//!    `(provider, event, reference)`, stored as `pending`, and processed
//!    asynchronously through a durable task queue by handlers keyed on
//!    `(provider, event)`.
//! 2. **Follow-up reminders.** Each lead or client has at most one follow-up.
//!    A daily sweep sends one in-app notification per follow-up due that day.
//!
//! # Architecture
//!
//! ```text
//! external event
//!       │
//!       ▼
//! ┌──────────────┐  insert / find   ┌──────────────────────────────┐
//! │ WebhookIntake│─────────────────►│                              │
//! └──────────────┘                  │                              │
//!       │ publish webhook.execute   │   Persistence                │
//!       ▼                           │   (SQLite or PostgreSQL)     │
//! ┌──────────────┐  claim / ack     │                              │
//! │  StoreQueue  │─────────────────►│   webhooks, follow_ups,      │
//! └──────────────┘                  │   notifications, leads,      │
//!       │                           │   clients, queue_tasks       │
//!       ▼                           │                              │
//! ┌──────────────┐  claim row       │                              │
//! │ QueueConsumer│─► WebhookWorker ►│                              │
//! └──────────────┘   (handlers)     │                              │
//!                                   │                              │
//! ┌──────────────────┐  due rows    │                              │
//! │ReminderScheduler │─► Sweep ────►│                              │
//! └──────────────────┘              └──────────────────────────────┘
//! ```
//!
//! # Idempotency
//!
//! | Guard | Mechanism |
//! |-------|-----------|
//! | One row per delivery | `UNIQUE (provider, event, reference)` + `ON CONFLICT DO NOTHING` |
//! | One handler run per automatic task | `UPDATE .. WHERE status = 'pending'` claim |
//! | One follow-up per resource | `UNIQUE (resource_id, resource_name)` upsert |
//! | One reminder per follow-up per day | `last_reminded_at` conditional claim |
//!
//! # Configuration
//!
//! See [`config::Config::from_env`] for the `CRM_*` environment variables.

#![deny(missing_docs)]

pub mod clock;
pub mod config;
pub mod error;
pub mod followups;
pub mod migrations;
pub mod notifications;
pub mod persistence;
pub mod queue;
pub mod runtime;
pub mod webhooks;
pub mod worker;

pub use error::{CrmError, Result};
