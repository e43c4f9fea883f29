mod api;
mod config;
mod db;
mod error;
mod fetcher;
mod scheduler;
mod stream;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::api::routes::{router, ApiState};
use crate::config::Config;
use crate::error::Result;
use crate::fetcher::HttpFixtureSource;
use crate::scheduler::{CycleOutcome, PollerConfig, PollingScheduler};
use crate::stream::{StreamConfig, StreamManager};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Storage ---
    let repo = db::connect(&cfg).await?;
    info!(backend = ?cfg.storage_backend, path = %cfg.db_path, "Fixture repository ready");

    // --- Upstream + streaming ---
    if cfg.upstream_api_key.is_empty() {
        warn!("UPSTREAM_API_KEY is not set; provider requests will likely be rejected");
    }
    let source = Arc::new(HttpFixtureSource::new(&cfg.upstream_url, &cfg.upstream_api_key)?);
    let streams = StreamManager::new(StreamConfig {
        queue_capacity: cfg.subscriber_queue_capacity,
        heartbeat_interval: Duration::from_secs(cfg.heartbeat_interval_secs),
        max_send_failures: cfg.max_send_failures,
        send_timeout: Duration::from_secs(cfg.send_timeout_secs),
    });

    let health = Arc::new(HealthState::new());
    let latency = Arc::new(LatencyStats::new());
    let scheduler = Arc::new(PollingScheduler::new(
        source,
        Arc::clone(&repo),
        Arc::clone(&streams),
        PollerConfig::from(&cfg),
        Arc::clone(&health),
        Arc::clone(&latency),
    ));

    // Pre-warm so the first subscriber does not wait a full interval for data.
    let scopes: Vec<String> = cfg.poll_scopes.iter().map(|s| s.to_string()).collect();
    info!(scopes = ?scopes, interval_secs = cfg.poll_interval_secs, "Running startup poll");
    match scheduler.run_cycle().await {
        Ok(CycleOutcome::Completed(report)) => {
            info!(fixtures = report.fetched, events = report.events(), "Startup poll complete");
        }
        Ok(CycleOutcome::Skipped) => {}
        Err(e) => warn!("Startup poll failed, serving stored fixtures until next tick: {e}"),
    }

    // --- Background tasks ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let poller = tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx.clone()));
    let heartbeat = tokio::spawn(Arc::clone(&streams).run_heartbeat(shutdown_rx));

    // --- HTTP API ---
    let api_state = ApiState {
        repo,
        streams: Arc::clone(&streams),
        scheduler,
        health,
        latency,
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    let shutdown_streams = Arc::clone(&streams);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {e}");
                return;
            }
            info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
            // Upgraded WebSocket connections are not tracked by the server; end them here.
            shutdown_streams.close_all();
        })
        .await?;

    if let Err(e) = poller.await {
        warn!("Polling scheduler task failed: {e}");
    }
    if let Err(e) = heartbeat.await {
        warn!("Heartbeat task failed: {e}");
    }
    info!(
        published = streams.stats().events_published,
        "Shutdown complete"
    );
    Ok(())
}
