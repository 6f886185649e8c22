//! scrapegrid-sync — the collector side of scrape-config distribution.
//!
//! Each collector polls the allocator for the full job map, substitutes its
//! shard number, and applies the result only when its content hash differs
//! from what it last applied.
//!
//! # Components
//!
//! - **`client`** — `ConfigSyncClient`: poll, hash, rewrite discovery, apply
//! - **`source`** — `HttpConfigSource`: `GET /scrape_configs` over hyper
//! - **`manager`** — scrape/discovery manager traits with file-backed and
//!   in-memory implementations
//! - **`hash`** — order-independent content hash of a job map

pub mod client;
pub mod error;
pub mod hash;
pub mod manager;
pub mod source;

pub use client::{ConfigSyncClient, DEFAULT_SHARD, SyncOutcome, SyncSettings};
pub use error::{ApplyError, SyncError, SyncResult};
pub use hash::config_hash;
pub use manager::{DiscoveryManager, DiscoveryRegistry, ScrapeConfigFile, ScrapeManager};
pub use source::{HttpConfigSource, ScrapeConfigSource};
