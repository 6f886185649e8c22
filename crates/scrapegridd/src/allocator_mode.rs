//! Allocator mode — runs the CR watcher and serves the generated jobs.
//!
//! In this mode, the daemon:
//! 1. Loads allocator.toml (or defaults)
//! 2. Connects to the cluster and discovers which monitoring CRDs exist
//! 3. Starts the CR watcher; every change event regenerates the config
//! 4. Serves `/scrape_configs`, `/livez` and `/readyz`
//! 5. On Ctrl-C, stops the HTTP server and closes the watcher

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use scrapegrid_api::ScrapeConfigStore;
use scrapegrid_watcher::{AllocatorConfig, Event, PrometheusCrWatcher};

/// Run the allocator.
pub async fn run_allocator(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    info!("ScrapeGrid daemon starting in allocator mode");

    let config = match &config_path {
        Some(path) => AllocatorConfig::from_file(path)
            .with_context(|| format!("load allocator config {}", path.display()))?,
        None => AllocatorConfig::default(),
    };
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen_addr {:?}", config.listen_addr))?;

    // ── Kubernetes client + watcher ──────────────────────────────
    let client = kube::Client::try_default()
        .await
        .context("build kubernetes client")?;
    let watcher = Arc::new(
        PrometheusCrWatcher::connect(client, &config)
            .await
            .context("connect CR watcher")?,
    );
    info!(watcher = %watcher.name(), "CR watcher connected");

    // ── Watch loop ───────────────────────────────────────────────
    let (events_tx, events_rx) = mpsc::channel::<Event>(1);
    let watch_handle = {
        let watcher = Arc::clone(&watcher);
        tokio::spawn(async move { watcher.watch(events_tx).await })
    };

    let store = ScrapeConfigStore::new();
    let reload_handle = tokio::spawn(reload_on_events(
        Arc::clone(&watcher),
        store.clone(),
        events_rx,
    ));

    // ── HTTP server ──────────────────────────────────────────────
    let router = scrapegrid_api::build_router(store);
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    let shutdown_watcher = Arc::clone(&watcher);
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown signal received");
        shutdown_watcher.close();
    })
    .into_future();

    // A watcher that fails to start is fatal; a clean stop ends the server.
    let result = tokio::select! {
        served = server => served.context("API server"),
        watched = watch_handle => match watched {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("CR watcher failed")),
            Err(e) => Err(anyhow::Error::new(e).context("CR watcher task")),
        },
    };

    watcher.close();
    let _ = reload_handle.await;

    info!("allocator stopped");
    result
}

/// Regenerate and publish the configuration for each change event until
/// the watcher drops its sender.
async fn reload_on_events(
    watcher: Arc<PrometheusCrWatcher>,
    store: ScrapeConfigStore,
    mut events: mpsc::Receiver<Event>,
) {
    while let Some(event) = events.recv().await {
        debug!(watcher = %event.watcher, source = ?event.source, "change event received");
        let config = match watcher.load_config().await {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "failed to load scrape config, keeping previous");
                continue;
            }
        };
        match store.update(&config) {
            Ok(true) => info!(jobs = config.scrape_configs.len(), "scrape config updated"),
            Ok(false) => debug!("scrape config unchanged"),
            Err(e) => warn!(error = %e, "failed to encode scrape config"),
        }
    }
}
