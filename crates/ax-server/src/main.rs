//! Agnox producer daemon — wires the store, cache, queue, scheduler, and
//! HTTP/WS surface together and serves until SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use ax_bridge::http_api::{api_router, ApiState};
use ax_cache::LiveCache;
use ax_core::config::Config;
use ax_harness::shutdown::ShutdownSignal;
use ax_queue::{AmqpQueue, MemoryQueue, TaskPublisher};
use ax_store::StoreDb;
use ax_telemetry::logging::LogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    ax_telemetry::logging::init("ax-server", "info", LogFormat::from_env());

    let config_path = std::env::var("AGNOX_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("agnox.toml"));
    let config = Config::load(Some(config_path)).context("failed to load configuration")?;

    info!(
        host = %config.server.host,
        port = config.server.port,
        production = config.server.production,
        "ax-server starting"
    );

    // --- Durable store ---
    let store = if config.store.path == ":memory:" {
        StoreDb::open_in_memory().await
    } else {
        StoreDb::open(&config.store.path).await
    }
    .context("failed to open store")?;
    let store = Arc::new(store);

    // --- Live cache ---
    let cache = match &config.cache.url {
        Some(url) => match LiveCache::connect(url).await {
            Ok(cache) => {
                info!("connected to shared cache");
                cache
            }
            Err(err) => {
                warn!(error = %err, "cache unreachable at startup, using in-process fallback");
                LiveCache::memory()
            }
        },
        None => {
            warn!("no cache configured, using in-process fallback only");
            LiveCache::memory()
        }
    };
    let cache = Arc::new(cache);

    // --- Task queue ---
    let queue: Arc<dyn TaskPublisher> = match &config.queue.url {
        Some(url) => {
            let amqp = AmqpQueue::connect(url, &config.queue.queue_name)
                .await
                .context("failed to connect to task queue")?;
            Arc::new(amqp)
        }
        None => {
            warn!("no queue configured, tasks will be recorded in memory only");
            Arc::new(MemoryQueue::new())
        }
    };

    // --- Shared state + background work ---
    let state = Arc::new(ApiState::new(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&cache),
        queue,
    ));

    let loaded = state.scheduler.load_active(&store).await;
    info!(loaded, "cron scheduler ready");

    cache.start_fallback_sweeper(Duration::from_secs(60));
    spawn_archive_purge(Arc::clone(&store));

    // --- Serve ---
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %listener.local_addr()?, "listening");

    let shutdown = state.shutdown.clone();
    spawn_signal_listener(shutdown.clone());

    let router = api_router(Arc::clone(&state));
    let mut shutdown_rx = shutdown.subscribe();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .context("server error")?;

    // In-flight HTTP requests have finished; stop the cron registry,
    // disconnect the dashboard sockets, then wait for detached cache
    // writes to drain before exiting.
    state.scheduler.stop_all();
    state.rooms.close();
    if !shutdown.wait_drained(Duration::from_secs(10)).await {
        warn!("exiting with undrained background work");
    }
    info!("ax-server stopped");
    Ok(())
}

/// Translate SIGINT/SIGTERM into the cooperative shutdown signal.
fn spawn_signal_listener(shutdown: ShutdownSignal) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sig) => sig,
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    shutdown.initiate();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        shutdown.initiate();
    });
}

/// Hourly purge of expired ingest-session archive rows.
fn spawn_archive_purge(store: Arc<StoreDb>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60 * 60));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.purge_ingest_archive().await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "purged expired ingest archive rows"),
                Err(err) => warn!(error = %err, "ingest archive purge failed"),
            }
        }
    });
}
