//! Clip render worker binary.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use renderq_engine::{AllowAllQuota, EngineConfig, JobService};
use renderq_render_client::RenderServiceClient;
use renderq_store::PgJobStore;

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("renderq=info".parse().unwrap())
        .add_directive("sqlx=warn".parse().unwrap());

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting renderq-worker");

    // Load configuration
    let config = EngineConfig::from_env();
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        std::process::exit(1);
    }
    info!("Engine config: {:?}", config);

    // Connect the shared job store
    let store = match PgJobStore::from_env().await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Failed to connect job store: {e}");
            std::process::exit(1);
        }
    };

    // Render service collaborator
    let render = match RenderServiceClient::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to create render client: {e}");
            std::process::exit(1);
        }
    };
    if !render.health_check().await {
        // Start anyway; executions will requeue until it comes back.
        error!("Render service is not healthy yet");
    }

    // Entitlement enforcement happens at the API edge; the worker admits
    // whatever reaches it.
    let service = JobService::new(config, store, render, Arc::new(AllowAllQuota));

    // Background loops: dispatcher and reaper
    let pool = service.pool().clone();
    let pool_task = tokio::spawn(async move { pool.run().await });

    let reaper = service.reaper();
    let reaper_shutdown = service.pool().subscribe_shutdown();
    let reaper_task = tokio::spawn(async move { reaper.run(reaper_shutdown).await });

    // Wait for a termination signal
    shutdown_signal().await;
    info!("Received shutdown signal");

    // Drain in-flight work and hand owned leases back to the pool before
    // letting the process exit.
    match service.shutdown_coordinator().run().await {
        Ok(released) => info!("Shutdown complete, {released} leases released"),
        Err(e) => error!("Shutdown release failed: {e}"),
    }

    pool_task.await.ok();
    reaper_task.await.ok();

    info!("Worker shutdown complete");
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}
