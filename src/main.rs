//! linkwatch - Internet connection health monitor
//!
//! Probes reachability, measures bandwidth, records outages and serves the
//! history over a JSON API.

mod clock;
mod config;
mod db;
mod outage;
mod probe;
mod scheduler;
mod speedtest;
mod stats;
mod web;

use clock::SystemClock;
use config::Config;
use db::Store;
use scheduler::Scheduler;
use stats::QueryService;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("linkwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = Arc::new(Config::load()?);
    tracing::info!("Starting linkwatch on port {}...", cfg.server.http_port);
    tracing::info!("Using database at {}", cfg.server.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.server.db_path)?);
    tracing::info!("Database initialized successfully");

    let clock = Arc::new(SystemClock);
    let scheduler = Arc::new(Scheduler::new(store.clone()).with_clock(clock.clone()));
    let queries = Arc::new(QueryService::new(store, clock));

    // Start scheduler; an invalid configuration is fatal
    scheduler.start(&cfg).await?;

    // Start web server
    let server = Server::new(cfg, queries, scheduler.clone());
    server.start(shutdown_signal()).await?;

    scheduler.stop().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
