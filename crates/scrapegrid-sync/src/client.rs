//! The config sync client run by each collector.
//!
//! ```text
//! tick ──► fetch body ──► $(SHARD) → shard ──► parse job map ──► hash
//!                                                               │
//!                            equal to applied hash? ── yes ──► done
//!                                                               │ no
//!              rewrite SD to <allocator>/jobs/<job>/targets ◄───┘
//!                                   │
//!                 ScrapeManager ──► DiscoveryManager ──► record hash
//! ```
//!
//! The hash is only recorded after both managers accept the
//! configuration, so any failure is retried on the next tick with a fresh
//! fetch while the previous configuration keeps running.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use scrapegrid_core::{
    ConfigError, HttpClientConfig, HttpSdConfig, PromConfig, SHARD_PLACEHOLDER, ScrapeConfig,
};

use crate::error::{ApplyError, SyncResult};
use crate::hash::config_hash;
use crate::manager::{DiscoveryManager, ScrapeManager};
use crate::source::ScrapeConfigSource;

/// Shard substituted when none is configured.
pub const DEFAULT_SHARD: &str = "0";

/// Collector-side sync settings.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Base URL of the allocator, e.g. `http://allocator:8080`.
    pub allocator_url: String,
    pub collector_id: String,
    pub shard: String,
    pub interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            allocator_url: "http://localhost:8080".to_string(),
            collector_id: String::new(),
            shard: DEFAULT_SHARD.to_string(),
            interval: Duration::from_secs(30),
        }
    }
}

/// Result of one successful sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Remote content hashed the same as the applied configuration.
    Unchanged,
    Applied { jobs: usize },
}

/// Polls the allocator and applies changed configurations.
pub struct ConfigSyncClient {
    settings: SyncSettings,
    source: Arc<dyn ScrapeConfigSource>,
    scrape: Arc<dyn ScrapeManager>,
    discovery: Arc<dyn DiscoveryManager>,
    applied_hash: Option<String>,
    applied: Option<PromConfig>,
}

impl ConfigSyncClient {
    pub fn new(
        settings: SyncSettings,
        source: Arc<dyn ScrapeConfigSource>,
        scrape: Arc<dyn ScrapeManager>,
        discovery: Arc<dyn DiscoveryManager>,
    ) -> Self {
        Self {
            settings,
            source,
            scrape,
            discovery,
            applied_hash: None,
            applied: None,
        }
    }

    /// Hash of the last configuration both managers accepted.
    pub fn applied_hash(&self) -> Option<&str> {
        self.applied_hash.as_deref()
    }

    /// Fetch, compare and, if changed, apply once.
    pub async fn sync_once(&mut self) -> SyncResult<SyncOutcome> {
        let body = self.source.fetch().await?;
        let body = body.replace(SHARD_PLACEHOLDER, &self.settings.shard);
        let jobs: BTreeMap<String, ScrapeConfig> =
            serde_yaml::from_str(&body).map_err(ConfigError::from)?;

        let hash = config_hash(&jobs)?;
        if self.applied_hash.as_deref() == Some(hash.as_str()) {
            debug!(%hash, "scrape configs unchanged");
            return Ok(SyncOutcome::Unchanged);
        }

        let (config, discovery) = self.rewrite_discovery(jobs);
        let count = config.scrape_configs.len();
        self.apply(&config, discovery)?;

        info!(jobs = count, %hash, "scrape configs applied");
        self.applied_hash = Some(hash);
        self.applied = Some(config);
        Ok(SyncOutcome::Applied { jobs: count })
    }

    /// Sync immediately, then every `interval` until shutdown. Failures
    /// are logged and retried; they never end the loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.settings.interval.max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            allocator = %self.settings.allocator_url,
            collector_id = %self.settings.collector_id,
            shard = %self.settings.shard,
            ?interval,
            "config sync starting"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.sync_once().await {
                    Ok(SyncOutcome::Applied { jobs }) => debug!(jobs, "sync applied new configuration"),
                    Ok(SyncOutcome::Unchanged) => {}
                    Err(e) => warn!(error = %e, "config sync failed, keeping previous configuration"),
                },
                _ = shutdown.changed() => {
                    info!("config sync shutting down");
                    break;
                }
            }
        }
    }

    /// Point every job's discovery at the allocator's per-job target list.
    fn rewrite_discovery(
        &self,
        jobs: BTreeMap<String, ScrapeConfig>,
    ) -> (PromConfig, BTreeMap<String, Vec<HttpSdConfig>>) {
        let mut discovery = BTreeMap::new();
        let mut scrape_configs = Vec::with_capacity(jobs.len());

        for (name, mut job) in jobs {
            let sd = HttpSdConfig {
                url: self.targets_url(&name),
                refresh_interval: None,
                http_client: HttpClientConfig {
                    follow_redirects: Some(false),
                    ..Default::default()
                },
            };
            job.job_name = name.clone();
            job.kubernetes_sd_configs.clear();
            job.static_configs.clear();
            job.http_sd_configs = vec![sd];
            discovery.insert(name, job.http_sd_configs.clone());
            scrape_configs.push(job);
        }

        (PromConfig::from_jobs(scrape_configs), discovery)
    }

    fn targets_url(&self, job: &str) -> String {
        let escape = |s: &str| url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>();
        format!(
            "{}/jobs/{}/targets?collector_id={}",
            self.settings.allocator_url.trim_end_matches('/'),
            escape(job),
            escape(&self.settings.collector_id)
        )
    }

    /// Scrape manager first, then discovery. A discovery failure puts the
    /// previous scrape configuration back.
    fn apply(
        &self,
        config: &PromConfig,
        discovery: BTreeMap<String, Vec<HttpSdConfig>>,
    ) -> Result<(), ApplyError> {
        self.scrape.apply_config(config)?;
        if let Err(e) = self.discovery.apply_config(discovery) {
            if let Some(previous) = &self.applied {
                if let Err(restore) = self.scrape.apply_config(previous) {
                    warn!(error = %restore, "restoring previous scrape config failed");
                }
            }
            return Err(e);
        }
        Ok(())
    }
}
