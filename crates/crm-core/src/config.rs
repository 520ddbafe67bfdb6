// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use chrono::{FixedOffset, NaiveTime, Offset, Utc};

/// crm-core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Age after which a still-pending webhook is re-enqueued on a duplicate delivery
    pub webhook_stale_after: Duration,
    /// Queue consumer settings
    pub queue: QueueConfig,
    /// Daily reminder sweep settings
    pub reminder: ReminderConfig,
}

/// Queue consumer configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How often the consumer polls for claimable tasks
    pub poll_interval: Duration,
    /// Maximum tasks claimed per poll
    pub batch_size: i64,
    /// Deliveries before a task is dead-lettered
    pub max_attempts: i32,
    /// How long a claimed task stays invisible to other consumers
    pub lease: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            batch_size: 10,
            max_attempts: 5,
            lease: Duration::from_secs(300),
        }
    }
}

/// Reminder sweep configuration.
#[derive(Debug, Clone)]
pub struct ReminderConfig {
    /// Wall-clock time at which the sweep fires every day
    pub run_at: NaiveTime,
    /// Offset used to compute "today" and the wall-clock fire time
    pub utc_offset: FixedOffset,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            run_at: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            utc_offset: Utc.fix(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CRM_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `CRM_WEBHOOK_STALE_AFTER_SECS`: staleness window (default: 300)
    /// - `CRM_QUEUE_POLL_INTERVAL_MS`: queue poll interval (default: 1000)
    /// - `CRM_QUEUE_BATCH_SIZE`: tasks claimed per poll (default: 10)
    /// - `CRM_QUEUE_MAX_ATTEMPTS`: deliveries before dead-lettering (default: 5)
    /// - `CRM_QUEUE_LEASE_SECS`: claim lease (default: 300)
    /// - `CRM_REMINDER_AT`: daily sweep time as `HH:MM` (default: 09:00)
    /// - `CRM_REMINDER_UTC_OFFSET_MINUTES`: offset for day boundaries (default: 0)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CRM_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("CRM_DATABASE_URL"))?;

        let stale_secs: u64 = parse_var(
            "CRM_WEBHOOK_STALE_AFTER_SECS",
            "300",
            "must be a non-negative integer",
        )?;

        let poll_interval_ms: u64 = parse_var(
            "CRM_QUEUE_POLL_INTERVAL_MS",
            "1000",
            "must be a non-negative integer",
        )?;

        let batch_size: i64 = parse_var("CRM_QUEUE_BATCH_SIZE", "10", "must be a positive integer")?;
        if batch_size <= 0 {
            return Err(ConfigError::Invalid(
                "CRM_QUEUE_BATCH_SIZE",
                "must be a positive integer",
            ));
        }

        let max_attempts: i32 =
            parse_var("CRM_QUEUE_MAX_ATTEMPTS", "5", "must be a positive integer")?;
        if max_attempts <= 0 {
            return Err(ConfigError::Invalid(
                "CRM_QUEUE_MAX_ATTEMPTS",
                "must be a positive integer",
            ));
        }

        let lease_secs: u64 =
            parse_var("CRM_QUEUE_LEASE_SECS", "300", "must be a non-negative integer")?;

        let run_at = std::env::var("CRM_REMINDER_AT").unwrap_or_else(|_| "09:00".to_string());
        let run_at = NaiveTime::parse_from_str(&run_at, "%H:%M")
            .map_err(|_| ConfigError::Invalid("CRM_REMINDER_AT", "must be a time as HH:MM"))?;

        let offset_minutes: i32 = parse_var(
            "CRM_REMINDER_UTC_OFFSET_MINUTES",
            "0",
            "must be an integer number of minutes",
        )?;
        let utc_offset = offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or(ConfigError::Invalid(
                "CRM_REMINDER_UTC_OFFSET_MINUTES",
                "must be within +/- 24 hours",
            ))?;

        Ok(Self {
            database_url,
            webhook_stale_after: Duration::from_secs(stale_secs),
            queue: QueueConfig {
                poll_interval: Duration::from_millis(poll_interval_ms),
                batch_size,
                max_attempts,
                lease: Duration::from_secs(lease_secs),
            },
            reminder: ReminderConfig { run_at, utc_offset },
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    default: &str,
    reason: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(name, reason))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const OPTIONAL_VARS: &[&str] = &[
        "CRM_WEBHOOK_STALE_AFTER_SECS",
        "CRM_QUEUE_POLL_INTERVAL_MS",
        "CRM_QUEUE_BATCH_SIZE",
        "CRM_QUEUE_MAX_ATTEMPTS",
        "CRM_QUEUE_LEASE_SECS",
        "CRM_REMINDER_AT",
        "CRM_REMINDER_UTC_OFFSET_MINUTES",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }

        fn clear_optional(&mut self) {
            for key in OPTIONAL_VARS {
                self.remove(key);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CRM_DATABASE_URL", "postgres://localhost/crm");
        guard.clear_optional();

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/crm");
        assert_eq!(config.webhook_stale_after, Duration::from_secs(300));
        assert_eq!(config.queue.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.queue.batch_size, 10);
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.queue.lease, Duration::from_secs(300));
        assert_eq!(
            config.reminder.run_at,
            NaiveTime::from_hms_opt(9, 0, 0).unwrap()
        );
        assert_eq!(config.reminder.utc_offset.local_minus_utc(), 0);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CRM_DATABASE_URL", "sqlite:crm.db");
        guard.set("CRM_WEBHOOK_STALE_AFTER_SECS", "60");
        guard.set("CRM_QUEUE_POLL_INTERVAL_MS", "250");
        guard.set("CRM_QUEUE_BATCH_SIZE", "50");
        guard.set("CRM_QUEUE_MAX_ATTEMPTS", "3");
        guard.set("CRM_QUEUE_LEASE_SECS", "30");
        guard.set("CRM_REMINDER_AT", "07:30");
        guard.set("CRM_REMINDER_UTC_OFFSET_MINUTES", "120");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite:crm.db");
        assert_eq!(config.webhook_stale_after, Duration::from_secs(60));
        assert_eq!(config.queue.poll_interval, Duration::from_millis(250));
        assert_eq!(config.queue.batch_size, 50);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.lease, Duration::from_secs(30));
        assert_eq!(
            config.reminder.run_at,
            NaiveTime::from_hms_opt(7, 30, 0).unwrap()
        );
        assert_eq!(config.reminder.utc_offset.local_minus_utc(), 7200);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("CRM_DATABASE_URL");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("CRM_DATABASE_URL")));
        assert!(err.to_string().contains("CRM_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_stale_window() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CRM_DATABASE_URL", "postgres://localhost/crm");
        guard.clear_optional();
        guard.set("CRM_WEBHOOK_STALE_AFTER_SECS", "-1");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("CRM_WEBHOOK_STALE_AFTER_SECS", _)
        ));
    }

    #[test]
    fn test_config_zero_batch_size_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CRM_DATABASE_URL", "postgres://localhost/crm");
        guard.clear_optional();
        guard.set("CRM_QUEUE_BATCH_SIZE", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("CRM_QUEUE_BATCH_SIZE", _)));
    }

    #[test]
    fn test_config_zero_max_attempts_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CRM_DATABASE_URL", "postgres://localhost/crm");
        guard.clear_optional();
        guard.set("CRM_QUEUE_MAX_ATTEMPTS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("CRM_QUEUE_MAX_ATTEMPTS", _)
        ));
    }

    #[test]
    fn test_config_invalid_reminder_time() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CRM_DATABASE_URL", "postgres://localhost/crm");
        guard.clear_optional();
        guard.set("CRM_REMINDER_AT", "25:00");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("CRM_REMINDER_AT", _)));
    }

    #[test]
    fn test_config_offset_out_of_range() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CRM_DATABASE_URL", "postgres://localhost/crm");
        guard.clear_optional();
        guard.set("CRM_REMINDER_UTC_OFFSET_MINUTES", "2000");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("CRM_REMINDER_UTC_OFFSET_MINUTES", _)
        ));
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }

    #[test]
    fn test_queue_config_default() {
        let config = QueueConfig::default();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_attempts, 5);
    }
}
