// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Webhook ingestion and processing.
//!
//! Deliveries are deduplicated on `(provider, event, reference)`. The first
//! sighting creates a `pending` row and enqueues a `webhook.execute` task; the
//! worker then drives the row to `processed` or `failed`:
//!
//! ```text
//! pending --claim--> processing --ok--> processed
//!                               \--err--> failed
//! processed | failed --manual retry--> processing
//! ```

pub mod handlers;
pub mod intake;
pub mod worker;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::persistence::WebhookRecord;

pub use handlers::{HandlerError, HandlerRegistry, WebhookHandler};
pub use intake::{IngestDisposition, IngestOutcome, WebhookIntake};
pub use worker::{ProcessOutcome, WebhookWorker};

/// Webhook processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    /// Stored, waiting for a worker.
    Pending,
    /// Claimed by a worker.
    Processing,
    /// Handler succeeded.
    Processed,
    /// Handler failed. Recoverable only by manual retry.
    Failed,
}

impl WebhookStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown webhook status: {other}")),
        }
    }
}

/// An incoming webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWebhook {
    /// Sending system.
    pub provider: String,
    /// Event name.
    pub event: String,
    /// Dedup token. Derived from `data` when absent.
    pub reference: Option<String>,
    /// Opaque payload.
    pub data: Value,
}

impl NewWebhook {
    /// Delivery without an explicit reference.
    pub fn new(provider: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self {
            provider: provider.into(),
            event: event.into(),
            reference: None,
            data,
        }
    }

    /// Set the dedup reference.
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

/// SHA-256 hex digest of the serialized payload.
///
/// `serde_json::Value` objects serialize with sorted keys, so equal payloads
/// map to the same reference regardless of the sender's key order.
pub fn derive_reference(data: &Value) -> String {
    let digest = Sha256::digest(data.to_string().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Why a `webhook.execute` task was published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// First sighting.
    Ingest,
    /// Duplicate delivery of a row stuck in `pending`.
    Stale,
    /// Operator retry.
    Manual,
}

impl Trigger {
    /// Automatic triggers only claim rows that are still pending.
    pub fn only_pending(&self) -> bool {
        !matches!(self, Self::Manual)
    }

    /// Label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Stale => "stale",
            Self::Manual => "manual",
        }
    }
}

/// Payload of a `webhook.execute` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookTask {
    /// The full row at publish time.
    pub webhook: WebhookRecord,
    /// What caused the publish.
    pub trigger: Trigger,
}
