//! wacast - Campaign dispatch server entry point

mod trigger;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wacast_api::AppState;
use wacast_common::config::{Config, LoggingConfig};
use wacast_core::{CampaignManager, DispatchMetrics, Dispatcher, GreenApiGateway, MessageRenderer};
use wacast_storage::{DatabasePool, MemoryStore, Stores};

use crate::trigger::ScheduleTrigger;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting wacast dispatch server...");

    // Initialize storage
    let (stores, db_pool) = match config.database.backend.as_str() {
        "memory" => {
            warn!("Using the in-memory store, campaigns will not survive a restart");
            (Stores::memory(Arc::new(MemoryStore::new())), None)
        }
        _ => {
            let db_pool = DatabasePool::connect(&config.database).await?;
            db_pool.migrate().await?;

            (Stores::postgres(db_pool.clone()), Some(db_pool))
        }
    };

    // Initialize gateway client
    let gateway = GreenApiGateway::new(&config.gateway).context("Invalid gateway configuration")?;

    // Initialize dispatcher
    let metrics = Arc::new(DispatchMetrics::new()?);
    let manager = Arc::new(CampaignManager::new(&stores, config.dispatch.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        manager,
        Arc::new(gateway),
        MessageRenderer::from_config(&config.messaging),
        metrics,
    ));

    // Recover campaigns left running by a previous process
    match dispatcher.reconcile_all().await {
        Ok(0) => {}
        Ok(count) => warn!(count, "Failed orphaned tasks from a previous run"),
        Err(e) => error!("Startup reconciliation failed: {}", e),
    }
    dispatcher.resume_active().await?;

    let shutdown = CancellationToken::new();

    // Start schedule trigger
    let trigger_handle = {
        let trigger = ScheduleTrigger::new(
            dispatcher.clone(),
            Duration::from_secs(config.dispatch.trigger_poll_secs.max(1)),
            config.dispatch.orphan_policy,
        );
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            trigger.run(shutdown).await;
        })
    };

    // Start API server
    let app = wacast_api::create_router(AppState {
        dispatcher: dispatcher.clone(),
        db_pool,
    });
    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("Failed to bind API server to {}", config.server.bind_address))?;
    info!("Starting API server on {}", config.server.bind_address);

    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move { api_shutdown.cancelled().await });
        if let Err(e) = serve.await {
            error!("API server error: {}", e);
        }
    });

    info!("wacast server started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.cancel();
    dispatcher.shutdown(SHUTDOWN_GRACE).await;

    if let Err(e) = trigger_handle.await {
        error!("Schedule trigger task failed: {}", e);
    }
    if let Err(e) = api_handle.await {
        error!("API server task failed: {}", e);
    }

    info!("wacast server shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
