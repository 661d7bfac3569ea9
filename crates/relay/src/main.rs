use std::sync::Arc;

use anyhow::Context;
use tokio::{net::TcpListener, sync::watch, time::timeout};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use ydoc_relay::{
    app,
    config::{LogFormat, RelayConfig},
    history::HistoryStore,
    metrics::{self, RelayMetrics},
    sync::{reaper::spawn_idle_reaper, Broadcaster, HistoryWriter, RoomRegistry},
    ws::RelayState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    let relay_metrics = Arc::new(RelayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&relay_metrics));

    let store = HistoryStore::from_config(&config).await?;
    let store_kind = store.kind();
    let (writer, _writer_task) = HistoryWriter::spawn(store.clone(), config.persist_queue);
    let registry = Arc::new(RoomRegistry::new(store, config.rooms.clone()));
    let reaper = spawn_idle_reaper(Arc::clone(&registry), config.reap_interval);

    let state = RelayState {
        registry: Arc::clone(&registry),
        broadcaster: Broadcaster::new(writer.clone()),
        liveness: config.liveness,
    };
    let app = app::build_router(state, relay_metrics, config.cors_origins.as_deref());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        history_store = store_kind,
        max_history = config.rooms.max_history,
        "starting relay server"
    );

    // Upgraded sockets outlive the HTTP connection, so sessions are closed
    // as soon as the signal arrives rather than after `serve` returns.
    let grace = config.shutdown_grace;
    let (stop, stopped) = watch::channel(false);
    let stop = Arc::new(stop);
    tokio::spawn({
        let stop = Arc::clone(&stop);
        async move {
            app::shutdown_signal().await;
            let _ = stop.send(true);
        }
    });
    let closer = {
        let registry = Arc::clone(&registry);
        let mut stopped = stopped.clone();
        tokio::spawn(async move {
            let _ = stopped.wait_for(|stop| *stop).await;
            registry.close_all(grace).await
        })
    };

    let mut stopped = stopped;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = stopped.wait_for(|stop| *stop).await;
        })
        .await
        .context("relay server exited unexpectedly");

    let _ = stop.send(true);
    let closed = closer.await.unwrap_or_default();
    if timeout(grace, writer.flush()).await.is_err() {
        warn!("history writer did not drain within the shutdown grace period");
    }
    reaper.abort();
    info!(closed_sessions = closed, "relay stopped");

    served
}

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
