//! The resource kinds the allocator watches.

use std::fmt;

use crate::MONITORING_GROUP;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    ServiceMonitor,
    PodMonitor,
    Probe,
    ScrapeConfig,
    Secret,
    Namespace,
}

impl ResourceKind {
    /// Kinds that turn into scrape jobs, in generation order.
    pub const MONITORS: [ResourceKind; 4] = [
        ResourceKind::ServiceMonitor,
        ResourceKind::PodMonitor,
        ResourceKind::Probe,
        ResourceKind::ScrapeConfig,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceMonitor => "ServiceMonitor",
            Self::PodMonitor => "PodMonitor",
            Self::Probe => "Probe",
            Self::ScrapeConfig => "ScrapeConfig",
            Self::Secret => "Secret",
            Self::Namespace => "Namespace",
        }
    }

    /// Prefix of the job names generated from this kind.
    pub fn job_prefix(&self) -> &'static str {
        match self {
            Self::ServiceMonitor => "serviceMonitor",
            Self::PodMonitor => "podMonitor",
            Self::Probe => "probe",
            Self::ScrapeConfig => "scrapeConfig",
            Self::Secret => "secret",
            Self::Namespace => "namespace",
        }
    }

    /// `group/version` the kind is served under, if it is a CRD.
    pub fn group_version(&self) -> Option<String> {
        match self {
            Self::ServiceMonitor | Self::PodMonitor | Self::Probe => {
                Some(format!("{MONITORING_GROUP}/v1"))
            }
            Self::ScrapeConfig => Some(format!("{MONITORING_GROUP}/v1alpha1")),
            Self::Secret | Self::Namespace => None,
        }
    }

    /// Plural resource name used by API discovery.
    pub fn plural(&self) -> &'static str {
        match self {
            Self::ServiceMonitor => "servicemonitors",
            Self::PodMonitor => "podmonitors",
            Self::Probe => "probes",
            Self::ScrapeConfig => "scrapeconfigs",
            Self::Secret => "secrets",
            Self::Namespace => "namespaces",
        }
    }

    /// Optional kinds are only watched when their CRD is installed.
    pub fn is_optional(&self) -> bool {
        matches!(self, Self::Probe | Self::ScrapeConfig)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
