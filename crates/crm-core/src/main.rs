// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! crm-core worker process.
//!
//! Runs the queue consumer and the daily reminder scheduler against the
//! configured database. Products that need webhook handlers embed
//! [`crm_core::runtime::CrmRuntime`] and register them there.

use anyhow::Result;
use tracing::{error, info, warn};

use crm_core::config::Config;
use crm_core::persistence;
use crm_core::runtime::CrmRuntime;
use crm_core::webhooks::HandlerRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("crm_core=info".parse()?),
        )
        .init();

    info!("Starting crm-core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        stale_after_secs = config.webhook_stale_after.as_secs(),
        batch_size = config.queue.batch_size,
        max_attempts = config.queue.max_attempts,
        reminder_at = %config.reminder.run_at,
        "Configuration loaded"
    );

    let persistence = persistence::connect(&config.database_url).await?;

    let runtime = CrmRuntime::builder()
        .persistence(persistence)
        .handlers(HandlerRegistry::new())
        .config(&config)
        .build()?
        .start()
        .await?;

    warn!("No webhook handlers registered; webhooks will be marked failed until retried");
    info!("crm-core initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
