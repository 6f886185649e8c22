//! Scrape and discovery managers the client applies configurations to.
//!
//! The managers own the actual scrape and target-resolution loops; the
//! client only hands them complete configurations.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, info};

use scrapegrid_core::{HttpSdConfig, PromConfig};

use crate::error::ApplyError;

/// Governs which jobs actively scrape.
pub trait ScrapeManager: Send + Sync {
    fn apply_config(&self, config: &PromConfig) -> Result<(), ApplyError>;
}

/// Governs which targets each job resolves.
pub trait DiscoveryManager: Send + Sync {
    fn apply_config(&self, jobs: BTreeMap<String, Vec<HttpSdConfig>>) -> Result<(), ApplyError>;
}

// ── File-backed scrape manager ───────────────────────────────────

/// Writes the applied configuration as Prometheus YAML for an agent to
/// reload. The file is replaced atomically.
pub struct ScrapeConfigFile {
    path: PathBuf,
}

impl ScrapeConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScrapeManager for ScrapeConfigFile {
    fn apply_config(&self, config: &PromConfig) -> Result<(), ApplyError> {
        let yaml = config.to_yaml()?;
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(yaml.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        info!(
            path = %self.path.display(),
            jobs = config.scrape_configs.len(),
            "scrape config written"
        );
        Ok(())
    }
}

// ── In-memory discovery manager ──────────────────────────────────

/// Holds the per-job HTTP SD configuration.
#[derive(Default)]
pub struct DiscoveryRegistry {
    jobs: RwLock<BTreeMap<String, Vec<HttpSdConfig>>>,
}

impl DiscoveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the registered jobs.
    pub fn jobs(&self) -> BTreeMap<String, Vec<HttpSdConfig>> {
        self.jobs.read().expect("discovery lock").clone()
    }
}

impl DiscoveryManager for DiscoveryRegistry {
    fn apply_config(&self, jobs: BTreeMap<String, Vec<HttpSdConfig>>) -> Result<(), ApplyError> {
        let mut current = self.jobs.write().expect("discovery lock");
        for name in current.keys().filter(|k| !jobs.contains_key(*k)) {
            debug!(job = %name, "discovery job removed");
        }
        for name in jobs.keys().filter(|k| !current.contains_key(*k)) {
            debug!(job = %name, "discovery job added");
        }
        info!(jobs = jobs.len(), "discovery config applied");
        *current = jobs;
        Ok(())
    }
}
