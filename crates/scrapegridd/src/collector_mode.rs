//! Collector mode — keeps a local scrape configuration in step with the
//! allocator.
//!
//! The sync client writes the applied job set to `--output` for the
//! scraping agent to reload, and keeps per-job HTTP SD settings pointing
//! back at the allocator's target endpoints.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};

use scrapegrid_sync::{
    ConfigSyncClient, DiscoveryRegistry, HttpConfigSource, ScrapeConfigFile, SyncSettings,
};

pub struct CollectorArgs {
    pub allocator_url: String,
    pub collector_id: String,
    pub shard: String,
    pub sync_interval: u64,
    pub output: PathBuf,
    pub request_timeout: u64,
}

/// Run the collector until Ctrl-C.
pub async fn run_collector(args: CollectorArgs) -> anyhow::Result<()> {
    info!("ScrapeGrid daemon starting in collector mode");

    let source = HttpConfigSource::new(
        &args.allocator_url,
        Duration::from_secs(args.request_timeout),
    )
    .context("configure allocator source")?;
    info!(uri = %source.uri(), "allocator source configured");

    if let Some(dir) = args.output.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create output directory {}", dir.display()))?;
    }

    let settings = SyncSettings {
        allocator_url: args.allocator_url,
        collector_id: args.collector_id,
        shard: args.shard,
        interval: Duration::from_secs(args.sync_interval),
    };
    let client = ConfigSyncClient::new(
        settings,
        Arc::new(source),
        Arc::new(ScrapeConfigFile::new(args.output)),
        Arc::new(DiscoveryRegistry::new()),
    );

    // ── Shutdown signal ──────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync_handle = tokio::spawn(client.run(shutdown_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    sync_handle.await.context("config sync task")?;

    info!("collector stopped");
    Ok(())
}
