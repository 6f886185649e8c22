//! allocator.toml configuration.
//!
//! ```toml
//! listen_addr = "0.0.0.0:8080"
//!
//! [prometheus_cr]
//! scrape_interval = "30s"
//! event_interval = "5s"
//! shards = 2
//!
//! [prometheus_cr.service_monitor_selector.matchLabels]
//! team = "infra"
//!
//! [namespaces]
//! deny = ["kube-system"]
//! ```

use std::path::Path;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::{Deserialize, Serialize};
use tracing::warn;

use scrapegrid_core::{KubernetesRole, PromDuration};
use scrapegrid_crd::ResourceKind;

use crate::events::MIN_EVENT_INTERVAL;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    pub listen_addr: String,
    pub prometheus_cr: PrometheusCrConfig,
    pub namespaces: NamespaceScope,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            prometheus_cr: PrometheusCrConfig::default(),
            namespaces: NamespaceScope::default(),
        }
    }
}

impl AllocatorConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let mut config: AllocatorConfig = toml::from_str(content)?;
        config.prometheus_cr.normalize();
        Ok(config)
    }
}

/// Settings for turning monitoring resources into scrape jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrometheusCrConfig {
    /// Used when an endpoint sets no interval.
    pub scrape_interval: PromDuration,
    /// Used when an endpoint sets no timeout.
    pub scrape_timeout: PromDuration,
    /// Minimum spacing between change events; never below 5s.
    pub event_interval: PromDuration,
    pub resync_period: PromDuration,
    /// How long startup waits for each informer's initial list.
    pub sync_timeout: PromDuration,
    pub service_discovery_role: KubernetesRole,
    /// Number of collector shards; above 1, jobs carry hashmod sharding.
    pub shards: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_monitor_selector: Option<LabelSelector>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_monitor_namespace_selector: Option<LabelSelector>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_monitor_selector: Option<LabelSelector>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_monitor_namespace_selector: Option<LabelSelector>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_selector: Option<LabelSelector>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_namespace_selector: Option<LabelSelector>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scrape_config_selector: Option<LabelSelector>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scrape_config_namespace_selector: Option<LabelSelector>,
}

impl Default for PrometheusCrConfig {
    fn default() -> Self {
        Self {
            scrape_interval: PromDuration::from_secs(30),
            scrape_timeout: PromDuration::from_secs(10),
            event_interval: PromDuration::from(MIN_EVENT_INTERVAL),
            resync_period: PromDuration::from_secs(5 * 60),
            sync_timeout: PromDuration::from_secs(15),
            service_discovery_role: KubernetesRole::EndpointSlice,
            shards: 1,
            service_monitor_selector: None,
            service_monitor_namespace_selector: None,
            pod_monitor_selector: None,
            pod_monitor_namespace_selector: None,
            probe_selector: None,
            probe_namespace_selector: None,
            scrape_config_selector: None,
            scrape_config_namespace_selector: None,
        }
    }
}

impl PrometheusCrConfig {
    fn normalize(&mut self) {
        if self.event_interval.as_duration() < MIN_EVENT_INTERVAL {
            warn!(
                configured = %self.event_interval,
                minimum = %PromDuration::from(MIN_EVENT_INTERVAL),
                "event_interval below minimum, clamping"
            );
            self.event_interval = PromDuration::from(MIN_EVENT_INTERVAL);
        }
        if self.shards == 0 {
            warn!("shards must be at least 1, using 1");
            self.shards = 1;
        }
    }

    pub fn event_interval(&self) -> Duration {
        self.event_interval.as_duration().max(MIN_EVENT_INTERVAL)
    }

    /// Resource selector for a monitor kind.
    pub fn selector(&self, kind: ResourceKind) -> Option<&LabelSelector> {
        match kind {
            ResourceKind::ServiceMonitor => self.service_monitor_selector.as_ref(),
            ResourceKind::PodMonitor => self.pod_monitor_selector.as_ref(),
            ResourceKind::Probe => self.probe_selector.as_ref(),
            ResourceKind::ScrapeConfig => self.scrape_config_selector.as_ref(),
            ResourceKind::Secret | ResourceKind::Namespace => None,
        }
    }

    /// Namespace selector for a monitor kind.
    pub fn namespace_selector(&self, kind: ResourceKind) -> Option<&LabelSelector> {
        match kind {
            ResourceKind::ServiceMonitor => self.service_monitor_namespace_selector.as_ref(),
            ResourceKind::PodMonitor => self.pod_monitor_namespace_selector.as_ref(),
            ResourceKind::Probe => self.probe_namespace_selector.as_ref(),
            ResourceKind::ScrapeConfig => self.scrape_config_namespace_selector.as_ref(),
            ResourceKind::Secret | ResourceKind::Namespace => None,
        }
    }
}

/// Namespaces the informers may see.
///
/// An empty allow list admits every namespace not on the deny list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceScope {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl NamespaceScope {
    /// Cluster-scoped objects (no namespace) are always admitted.
    pub fn admits(&self, namespace: Option<&str>) -> bool {
        let Some(ns) = namespace else {
            return true;
        };
        if !self.allow.is_empty() && !self.allow.iter().any(|a| a == ns) {
            return false;
        }
        !self.deny.iter().any(|d| d == ns)
    }
}
