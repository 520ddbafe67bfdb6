// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pluggable webhook handlers keyed by `(provider, event)`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::persistence::WebhookRecord;

/// Error returned by handlers. Any error type can be returned with `?`.
pub type HandlerError = anyhow::Error;

/// Provider-specific side effect for one kind of webhook.
///
/// Handlers may be invoked more than once for the same row (manual retry,
/// redelivery after a crash), so they should be idempotent.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    /// Process the webhook. `payload` is the decoded `data` column.
    async fn handle(&self, webhook: &WebhookRecord, payload: &Value) -> Result<(), HandlerError>;
}

/// Adapter so plain async closures can be registered.
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> WebhookHandler for FnHandler<F>
where
    F: Fn(WebhookRecord, Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, webhook: &WebhookRecord, payload: &Value) -> Result<(), HandlerError> {
        (self.0)(webhook.clone(), payload.clone()).await
    }
}

/// Registry of handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), Arc<dyn WebhookHandler>>,
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same key.
    pub fn register(
        &mut self,
        provider: impl Into<String>,
        event: impl Into<String>,
        handler: Arc<dyn WebhookHandler>,
    ) -> &mut Self {
        self.handlers
            .insert((provider.into(), event.into()), handler);
        self
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(
        &mut self,
        provider: impl Into<String>,
        event: impl Into<String>,
        f: F,
    ) -> &mut Self
    where
        F: Fn(WebhookRecord, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(provider, event, Arc::new(FnHandler(f)))
    }

    /// Look up the handler for a webhook.
    pub fn get(&self, provider: &str, event: &str) -> Option<Arc<dyn WebhookHandler>> {
        self.handlers
            .get(&(provider.to_string(), event.to_string()))
            .cloned()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.handlers.keys().collect();
        keys.sort();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &keys)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record() -> WebhookRecord {
        WebhookRecord {
            id: "wh-1".to_string(),
            provider: "stripe".to_string(),
            event: "invoice.paid".to_string(),
            reference: "ref".to_string(),
            status: "processing".to_string(),
            data: "{}".to_string(),
            attempts: 1,
            last_error: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl WebhookHandler for Counting {
        async fn handle(&self, _: &WebhookRecord, _: &Value) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lookup_is_keyed_by_provider_and_event() {
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let mut registry = HandlerRegistry::new();
        registry.register("stripe", "invoice.paid", counting.clone());

        assert!(registry.get("stripe", "invoice.failed").is_none());
        assert!(registry.get("paypal", "invoice.paid").is_none());

        let handler = registry.get("stripe", "invoice.paid").unwrap();
        handler.handle(&record(), &Value::Null).await.unwrap();
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_register_fn() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("stripe", "invoice.paid", |webhook, payload| async move {
            anyhow::ensure!(payload["ok"] == true, "payload for {} not ok", webhook.id);
            Ok(())
        });
        assert_eq!(registry.len(), 1);

        let handler = registry.get("stripe", "invoice.paid").unwrap();
        assert!(
            handler
                .handle(&record(), &serde_json::json!({"ok": true}))
                .await
                .is_ok()
        );
        let err = handler
            .handle(&record(), &serde_json::json!({"ok": false}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "payload for wh-1 not ok");
    }
}
