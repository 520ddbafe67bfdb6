// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fires the reminder sweep once a day at a fixed wall-clock time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, NaiveTime, Timelike};
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::ReminderConfig;
use crate::error::Result;
use crate::persistence::NotificationRecord;

use super::{ReminderSweep, SECS_PER_DAY};

/// Time from `now` until the next `run_at` in `offset`.
///
/// Exactly at `run_at` the next run is a full day away, so a sweep that
/// finishes within the same second is not fired twice.
pub fn next_run_delay(now: i64, run_at: NaiveTime, offset: FixedOffset) -> Duration {
    let local_secs = now
        .saturating_add(offset.local_minus_utc() as i64)
        .rem_euclid(SECS_PER_DAY);
    let target = run_at.num_seconds_from_midnight() as i64;

    let mut delay = (target - local_secs).rem_euclid(SECS_PER_DAY);
    if delay == 0 {
        delay = SECS_PER_DAY;
    }
    Duration::from_secs(delay as u64)
}

/// Daily reminder scheduler that runs as a background task.
#[derive(Clone)]
pub struct ReminderScheduler {
    sweep: ReminderSweep,
    clock: Arc<dyn Clock>,
    config: ReminderConfig,
    in_flight: Arc<Mutex<()>>,
    shutdown: Arc<Notify>,
}

impl ReminderScheduler {
    /// Create a scheduler.
    pub fn new(sweep: ReminderSweep, clock: Arc<dyn Clock>, config: ReminderConfig) -> Self {
        Self {
            sweep,
            clock,
            config,
            in_flight: Arc::new(Mutex::new(())),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep now unless another run is in progress.
    ///
    /// Returns `None` when skipped.
    pub async fn run_once(&self, reference: Option<i64>) -> Result<Option<Vec<NotificationRecord>>> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            warn!("Reminder sweep still running, skipping this cycle");
            return Ok(None);
        };

        self.sweep.run(reference).await.map(Some)
    }

    /// Run the scheduler loop until shutdown.
    pub async fn run(self) {
        info!(
            run_at = %self.config.run_at,
            utc_offset = %self.config.utc_offset,
            "Reminder scheduler started"
        );

        loop {
            let delay = next_run_delay(
                self.clock.now(),
                self.config.run_at,
                self.config.utc_offset,
            );
            info!(next_run_in_secs = delay.as_secs(), "Next reminder sweep scheduled");

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Reminder scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = self.run_once(None).await {
                        error!(error = %e, "Reminder sweep failed");
                    }
                }
            }
        }
    }
}
