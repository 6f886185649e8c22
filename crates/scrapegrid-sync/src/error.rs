//! Error types for the config sync client.

use thiserror::Error;

use scrapegrid_core::ConfigError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Why a sync attempt did not apply a configuration.
///
/// Every variant is transient: the client logs it and retries on the next
/// tick with the previous configuration still in place.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid allocator url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("fetching scrape configs: {0}")]
    Fetch(String),

    #[error("allocator returned HTTP {0}")]
    Status(http::StatusCode),

    #[error("allocator request timed out")]
    Timeout,

    #[error("allocator response is not valid UTF-8")]
    NotUtf8,

    #[error("parsing scrape configs: {0}")]
    Parse(#[from] ConfigError),

    #[error("applying scrape configs: {0}")]
    Apply(#[from] ApplyError),
}

/// Failure inside a scrape or discovery manager.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Encode(#[from] ConfigError),

    #[error("{manager} rejected configuration: {reason}")]
    Rejected {
        manager: &'static str,
        reason: String,
    },
}
