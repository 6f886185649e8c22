//! scrapegrid-core — the Prometheus scrape-configuration model shared by
//! the allocator and the collectors.
//!
//! Only the subset of the Prometheus configuration that the allocator
//! generates and the collectors apply is modelled. Every map is ordered so
//! that serializing the same configuration twice yields identical bytes.

pub mod duration;
pub mod error;
pub mod relabel;
pub mod scrape;

pub use duration::PromDuration;
pub use error::{ConfigError, RelabelError};
pub use relabel::{RelabelAction, RelabelConfig};
pub use scrape::*;
