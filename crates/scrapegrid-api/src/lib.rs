//! scrapegrid-api — the allocator's HTTP surface.
//!
//! Serves the most recently generated scrape configuration to collectors.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/scrape_configs` | YAML map of job name → scrape config |
//! | GET | `/livez` | Process is up |
//! | GET | `/readyz` | A configuration has been loaded |

pub mod handlers;

use std::sync::{Arc, RwLock};

use axum::Router;
use axum::routing::get;
use tracing::debug;

use scrapegrid_core::{ConfigError, PromConfig};

/// Latest configuration, pre-rendered as the YAML body collectors fetch.
#[derive(Clone, Default)]
pub struct ScrapeConfigStore {
    inner: Arc<RwLock<Option<Snapshot>>>,
}

#[derive(Clone)]
struct Snapshot {
    jobs: usize,
    body: Arc<str>,
}

impl ScrapeConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the served configuration. Returns whether the body changed.
    pub fn update(&self, config: &PromConfig) -> Result<bool, ConfigError> {
        let body: Arc<str> = serde_yaml::to_string(&config.job_map())?.into();
        let jobs = config.scrape_configs.len();
        let mut inner = self.inner.write().expect("config store lock");
        let changed = inner.as_ref().is_none_or(|s| s.body != body);
        *inner = Some(Snapshot { jobs, body });
        debug!(jobs, changed, "served scrape configuration updated");
        Ok(changed)
    }

    /// The YAML body, or `None` before the first load.
    pub fn body(&self) -> Option<Arc<str>> {
        self.inner
            .read()
            .expect("config store lock")
            .as_ref()
            .map(|s| s.body.clone())
    }

    pub fn job_count(&self) -> usize {
        self.inner
            .read()
            .expect("config store lock")
            .as_ref()
            .map_or(0, |s| s.jobs)
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.read().expect("config store lock").is_some()
    }
}

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: ScrapeConfigStore,
}

/// Build the allocator router.
pub fn build_router(store: ScrapeConfigStore) -> Router {
    let state = ApiState { store };

    Router::new()
        .route("/scrape_configs", get(handlers::scrape_configs))
        .route("/livez", get(handlers::livez))
        .route("/readyz", get(handlers::readyz))
        .with_state(state)
}
