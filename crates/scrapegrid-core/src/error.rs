//! Error types for the scrape-configuration model.

use thiserror::Error;

/// Errors raised while parsing or encoding a scrape configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration {0:?}")]
    Duration(String),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A relabel rule that Prometheus would refuse to load.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelabelError {
    #[error("unknown relabel action {0:?}")]
    UnknownAction(String),

    #[error("invalid regex {regex:?}: {reason}")]
    Regex { regex: String, reason: String },

    #[error("relabel action {0} requires target_label")]
    MissingTargetLabel(&'static str),

    #[error("{target:?} is not a valid target label for action {action}")]
    InvalidTargetLabel { action: &'static str, target: String },

    #[error("relabel action hashmod requires a non-zero modulus")]
    ZeroModulus,

    #[error("relabel action {action} does not accept {field}")]
    UnexpectedField { action: &'static str, field: &'static str },
}
