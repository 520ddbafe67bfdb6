// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for crm-core.
//!
//! Domain errors (`NotFound`, `Validation`) are meant to reach the caller.
//! Infrastructure errors (`Database`, `Queue`) are caught at component
//! boundaries where unrelated work must keep going.

use thiserror::Error;

/// Result type using CrmError
pub type Result<T> = std::result::Result<T, CrmError>;

/// Errors that can occur in crm-core operations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CrmError {
    /// The referenced row does not exist.
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// Kind of entity (webhook, follow_up, lead, client).
        entity: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Publishing to or acknowledging on the task queue failed.
    #[error("Queue error for task '{task}': {reason}")]
    Queue {
        /// Task name.
        task: String,
        /// The reason for failure.
        reason: String,
    },

    /// A webhook handler returned an error.
    #[error("Handler for {provider}/{event} failed: {reason}")]
    Handler {
        /// Webhook provider.
        provider: String,
        /// Webhook event.
        event: String,
        /// Error reported by the handler.
        reason: String,
    },
}

impl CrmError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Queue { .. } => "QUEUE_ERROR",
            Self::Handler { .. } => "HANDLER_ERROR",
        }
    }

    /// Whether the caller can act on this error (as opposed to an infrastructure fault).
    pub fn is_domain_error(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Validation { .. })
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for CrmError {
    fn from(err: sqlx::Error) -> Self {
        CrmError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CrmError {
    fn from(err: serde_json::Error) -> Self {
        CrmError::Database {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (CrmError::not_found("webhook", "abc"), "NOT_FOUND"),
            (
                CrmError::validation("provider", "must not be empty"),
                "VALIDATION_ERROR",
            ),
            (
                CrmError::Database {
                    operation: "insert".to_string(),
                    details: "connection refused".to_string(),
                },
                "DATABASE_ERROR",
            ),
            (
                CrmError::Queue {
                    task: "webhook.execute".to_string(),
                    reason: "pool closed".to_string(),
                },
                "QUEUE_ERROR",
            ),
            (
                CrmError::Handler {
                    provider: "stripe".to_string(),
                    event: "invoice.paid".to_string(),
                    reason: "boom".to_string(),
                },
                "HANDLER_ERROR",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_error_display() {
        let err = CrmError::not_found("webhook", "abc-123");
        assert_eq!(err.to_string(), "webhook 'abc-123' not found");

        let err = CrmError::validation("event", "must not be empty");
        assert_eq!(
            err.to_string(),
            "Validation error for 'event': must not be empty"
        );

        let err = CrmError::Queue {
            task: "webhook.execute".to_string(),
            reason: "disk full".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Queue error for task 'webhook.execute': disk full"
        );

        let err = CrmError::Handler {
            provider: "stripe".to_string(),
            event: "invoice.paid".to_string(),
            reason: "timeout".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Handler for stripe/invoice.paid failed: timeout"
        );
    }

    #[test]
    fn test_domain_errors() {
        assert!(CrmError::not_found("lead", "x").is_domain_error());
        assert!(CrmError::validation("x", "y").is_domain_error());
        assert!(
            !CrmError::Database {
                operation: "query".to_string(),
                details: "gone".to_string()
            }
            .is_domain_error()
        );
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: CrmError = json_err.into();
        assert_eq!(err.error_code(), "DATABASE_ERROR");
    }
}
