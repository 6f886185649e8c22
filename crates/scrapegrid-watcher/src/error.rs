//! Error types for the CR watcher.

use thiserror::Error;

use scrapegrid_core::{ConfigError, PromDuration, RelabelError};
use scrapegrid_crd::ResourceKind;

/// Result type alias for watcher operations.
pub type WatcherResult<T> = Result<T, WatcherError>;

/// Errors surfaced by [`crate::PrometheusCrWatcher`].
#[derive(Debug, Error)]
pub enum WatcherError {
    /// One or more informers did not finish their initial list in time.
    #[error("informer caches failed to sync: {}", kind_list(.kinds))]
    CacheSync { kinds: Vec<ResourceKind> },

    #[error("CRD discovery failed: {0}")]
    Discovery(#[source] kube::Error),

    #[error("duplicate scrape job {0:?}")]
    DuplicateJob(String),

    #[error("watcher was already started")]
    AlreadyStarted,
}

fn kind_list(kinds: &[ResourceKind]) -> String {
    kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", ")
}

/// Failure to resolve one credential reference.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("secret {namespace}/{name} not found")]
    SecretNotFound { namespace: String, name: String },

    #[error("key {key:?} missing from secret {namespace}/{name}")]
    KeyNotFound {
        namespace: String,
        name: String,
        key: String,
    },

    #[error("key {key:?} in secret {namespace}/{name} is not valid UTF-8")]
    NotUtf8 {
        namespace: String,
        name: String,
        key: String,
    },

    #[error("fetching secret {namespace}/{name}: {source}")]
    Fetch {
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("reference to configmap {namespace}/{name} cannot be resolved")]
    ConfigMapUnsupported { namespace: String, name: String },

    #[error("empty secret or configmap reference")]
    EmptyReference,
}

/// Why a single endpoint or resource produced no job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid relabeling: {0}")]
    Relabel(#[source] RelabelError),

    #[error("invalid metric relabeling: {0}")]
    MetricRelabel(#[source] RelabelError),

    #[error(transparent)]
    Duration(#[from] ConfigError),

    #[error("scrape timeout {timeout} exceeds interval {interval}")]
    TimeoutExceedsInterval {
        timeout: PromDuration,
        interval: PromDuration,
    },

    #[error("endpoint sets neither port nor targetPort")]
    MissingPort,

    #[error("probe has no prober url")]
    MissingProber,

    #[error("probe has no targets")]
    MissingTargets,
}
