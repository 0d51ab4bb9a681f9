//! Orchestrator: startup ordering, shutdown, and hot reload for the
//! sightings/scout coordination layer (spec §4.7).
//!
//! Startup order: logging -> GeofenceResolver.refresh (blocking) ->
//! PriorityQueue ready -> Dispatcher start -> Janitor start -> HTTP server
//! start. Shutdown runs in reverse, each step awaited, triggered by
//! SIGINT/SIGTERM. Grounded on the teacher's `main()`: tracing init, state
//! construction, background task spawning, `axum::serve(...)
//! .with_graceful_shutdown(...)`.

mod config;
mod dispatcher;
mod error;
mod geo;
mod geofence;
mod http;
mod janitor;
mod queue;
mod rarity;
mod s2grid;
mod scout_client;
mod webhook;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "lazyscout", version, about = "Sightings feed <-> scout service coordination layer")]
struct Cli {
    /// Path to the JSON tunables file (spec §6.4).
    #[arg(long, default_value = "config.json")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "lazyscout=info,tower_http=info".into()))
        .json()
        .init();

    let cli = Cli::parse();
    let config = Arc::new(config::Config::load(cli.config)?);
    tracing::info!("lazyscout starting up");

    // --- GeofenceResolver: blocking initial refresh -------------------------
    let geofence = Arc::new(geofence::GeofenceResolver::new(
        config.static_cfg.geofence_base_url.clone(),
        config.static_cfg.geofence_project.clone(),
        config.static_cfg.geofence_bearer_token.clone(),
        Duration::from_secs(config.static_cfg.geofence_http_timeout_secs),
    ));
    if let Err(err) = geofence.refresh().await {
        tracing::error!(%err, "initial geofence refresh failed, continuing with an empty resolver");
    }

    // --- PriorityQueue + RarityCensus: ready before the dispatcher starts ---
    let startup = config.reloadable.load();
    let census = Arc::new(rarity::RarityCensus::new(startup.calibration_minutes * 60));
    let queue = Arc::new(queue::PriorityQueue::new(startup.concurrency_scout));
    let dispatcher_check_interval = Duration::from_millis(startup.dispatcher_check_interval_ms);
    let janitor_interval = Duration::from_secs(startup.janitor_interval_seconds);
    drop(startup);

    let scout_client = scout_client::ScoutClient::new(
        config.static_cfg.scout_base_url.clone(),
        config.static_cfg.scout_username.clone(),
        config.static_cfg.scout_auth.clone(),
        Duration::from_secs(config.static_cfg.general_http_timeout_secs),
    );

    let filter = Arc::new(webhook::WebhookFilter::new(
        queue.clone(),
        census.clone(),
        geofence.clone(),
        config.clone(),
    ));

    // --- Dispatcher ----------------------------------------------------------
    let dispatcher = Arc::new(dispatcher::Dispatcher::new(queue.clone(), scout_client));
    let dispatcher_stats = dispatcher.stats();
    let dispatcher_handle = dispatcher.clone().spawn(dispatcher_check_interval);

    // --- Janitor ---------------------------------------------------------------
    let janitor = Arc::new(janitor::Janitor::new(queue.clone()));
    let janitor_config = config.clone();
    let janitor_handle =
        janitor.spawn(janitor_interval, move || janitor_config.reloadable.load().timeout_iv);

    // Background refresh/cleanup loops for the geofence resolver and census.
    // Each period is read fresh from the live config snapshot every cycle so
    // a hot-reload of the corresponding interval takes effect without a
    // restart, matching the janitor's `timeout_iv` closure below.
    let geofence_reload_config = config.clone();
    let geofence_handle = geofence
        .clone()
        .spawn_background(move || Duration::from_secs(geofence_reload_config.reloadable.load().geofence_refresh_cache_seconds));

    let census_cleanup_config = config.clone();
    let census_ranking_config = config.clone();
    let census_handle = census.clone().spawn_background(
        move || Duration::from_secs(census_cleanup_config.reloadable.load().cleanup_interval_seconds),
        move || Duration::from_secs(census_ranking_config.reloadable.load().ranking_interval_seconds),
    );

    // Hot reload: SIGHUP re-reads the tunables file and republishes the
    // reloadable config snapshot, propagating concurrency changes.
    let reload_handle = tokio::spawn(watch_hot_reload(config.clone(), queue.clone(), census.clone()));

    // --- HTTP server -----------------------------------------------------------
    let state = http::AppState {
        queue: queue.clone(),
        census: census.clone(),
        config: config.clone(),
        filter,
        dispatcher_stats,
    };
    let app = http::router(state);

    let listen_addr = config.static_cfg.listen_addr;
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(%listen_addr, "listening");

    // Shutdown order per spec §4.7: Dispatcher stop -> HTTP server drain ->
    // Janitor stop -> RarityCensus stop -> GeofenceResolver stop. The
    // dispatcher's stop (halt its drain loop, then wait for in-flight scouts)
    // must start the instant the signal fires, not after the HTTP server has
    // already drained — so both race off the same notification rather than
    // running one after the other.
    let shutdown = Arc::new(tokio::sync::Notify::new());
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.notify_waiters();
        }
    });

    let dispatcher_stop = {
        let shutdown = shutdown.clone();
        let queue = queue.clone();
        async move {
            shutdown.notified().await;
            dispatcher_handle.abort();
            tracing::info!("dispatcher stopped, waiting for in-flight scouts to finish");
            queue.wait_for_idle().await;
        }
    };

    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.notified().await }
        });

    let (_, server_result) = tokio::join!(dispatcher_stop, server);
    server_result?;

    tracing::info!("http server drained, stopping background tasks");
    janitor_handle.abort();
    census_handle.abort();
    geofence_handle.abort();
    reload_handle.abort();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => tracing::warn!(%err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining in-flight scouts");
}

#[cfg(unix)]
async fn watch_hot_reload(
    config: Arc<config::Config>,
    queue: Arc<queue::PriorityQueue>,
    census: Arc<rarity::RarityCensus>,
) {
    let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!(%err, "could not install SIGHUP handler, hot reload disabled");
            return;
        }
    };
    loop {
        sighup.recv().await;
        match config.reload() {
            Ok(previous_concurrency) => {
                let reloadable = config.reloadable.load();
                if reloadable.concurrency_scout != previous_concurrency {
                    queue.update_concurrency(reloadable.concurrency_scout).await;
                }
                census.set_calibration_secs(reloadable.calibration_minutes * 60);
                tracing::info!("configuration reloaded");
            }
            Err(err) => tracing::error!(%err, "configuration reload failed"),
        }
    }
}

#[cfg(not(unix))]
async fn watch_hot_reload(
    _config: Arc<config::Config>,
    _queue: Arc<queue::PriorityQueue>,
    _census: Arc<rarity::RarityCensus>,
) {
    std::future::pending::<()>().await
}
