//! scrapegrid-crd — typed monitoring custom resources.
//!
//! Mirrors the `monitoring.coreos.com` CRDs the allocator watches. Only
//! the fields that influence scrape-config generation are modelled;
//! everything else is ignored on deserialization.
//!
//! | Kind | Version |
//! |---|---|
//! | `ServiceMonitor` | `v1` |
//! | `PodMonitor` | `v1` |
//! | `Probe` | `v1` |
//! | `ScrapeConfig` | `v1alpha1` |

pub mod common;
pub mod kind;
pub mod pod_monitor;
pub mod probe;
pub mod scrape_config;
pub mod selector;
pub mod service_monitor;

pub use common::*;
pub use kind::ResourceKind;
pub use pod_monitor::{PodMetricsEndpoint, PodMonitor, PodMonitorSpec};
pub use probe::{Probe, ProbeSpec, ProberSpec, ProbeTargetIngress, ProbeTargetStaticConfig, ProbeTargets};
pub use scrape_config::{HttpSdConfig, ScrapeConfig, ScrapeConfigSpec, StaticConfig};
pub use selector::{label_selector_matches, selector_matches};
pub use service_monitor::{Endpoint, ServiceMonitor, ServiceMonitorSpec};

/// API group of every monitoring resource.
pub const MONITORING_GROUP: &str = "monitoring.coreos.com";
