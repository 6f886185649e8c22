//! scrapegrid-watcher — the allocator's control plane.
//!
//! Watches ServiceMonitor, PodMonitor, Probe and ScrapeConfig resources
//! together with the Secrets and Namespaces they depend on, and turns them
//! into one Prometheus scrape configuration on demand.
//!
//! # Architecture
//!
//! ```text
//! PrometheusCrWatcher
//!   ├── Informer<K> per kind (watch cache + handlers)
//!   │   └── empty stand-in for optional CRDs that are not installed
//!   ├── AssetStore (secret key → value, tracked on first use)
//!   ├── ChangeNotifier → run_rate_limited_sender → Event
//!   └── load_config()
//!       └── ResourceSelector: select_all() → generate() → ScrapeConfig jobs
//! ```
//!
//! Many changes within one `event_interval` collapse into a single
//! [`Event`]. Consumers react by calling
//! [`PrometheusCrWatcher::load_config`], which always reflects the latest
//! cache state.

pub mod assets;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod informer;
pub mod namespace;
pub mod selector;
pub mod watcher;

pub use assets::{AssetStore, KubeSecrets, SecretSource, StaticSecrets};
pub use config::{AllocatorConfig, NamespaceScope, PrometheusCrConfig};
pub use error::{AssetError, JobError, WatcherError, WatcherResult};
pub use events::{ChangeNotifier, Event, EventSource, MIN_EVENT_INTERVAL};
pub use informer::{EventHandler, Informer, SyncState};
pub use namespace::{NamespaceHandler, NamespaceSelectorSet};
pub use selector::{ResourceSelector, WatchedResource};
pub use watcher::{Informers, PrometheusCrWatcher, WATCHER_NAME};
