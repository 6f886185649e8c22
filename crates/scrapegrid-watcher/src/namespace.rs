//! Namespace-label change detection.
//!
//! A namespace update only matters when it flips whether some monitor
//! kind's namespace selector admits that namespace. Everything else is
//! dropped so unrelated namespace churn never reaches the event sender.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use tracing::debug;

use scrapegrid_crd::{ResourceKind, label_selector_matches};

use crate::config::PrometheusCrConfig;
use crate::events::ChangeNotifier;
use crate::informer::EventHandler;

/// The namespace selectors of the four monitor kinds.
#[derive(Debug, Clone, Default)]
pub struct NamespaceSelectorSet {
    pub service_monitor: Option<LabelSelector>,
    pub pod_monitor: Option<LabelSelector>,
    pub probe: Option<LabelSelector>,
    pub scrape_config: Option<LabelSelector>,
}

impl NamespaceSelectorSet {
    pub fn from_config(config: &PrometheusCrConfig) -> Self {
        Self {
            service_monitor: config.namespace_selector(ResourceKind::ServiceMonitor).cloned(),
            pod_monitor: config.namespace_selector(ResourceKind::PodMonitor).cloned(),
            probe: config.namespace_selector(ResourceKind::Probe).cloned(),
            scrape_config: config.namespace_selector(ResourceKind::ScrapeConfig).cloned(),
        }
    }

    fn selectors(&self) -> [Option<&LabelSelector>; 4] {
        [
            self.service_monitor.as_ref(),
            self.pod_monitor.as_ref(),
            self.probe.as_ref(),
            self.scrape_config.as_ref(),
        ]
    }

    /// Whether any selector admits one label set but not the other.
    ///
    /// Absent selectors admit every namespace and so never change.
    pub fn selection_changed(
        &self,
        old: &BTreeMap<String, String>,
        new: &BTreeMap<String, String>,
    ) -> bool {
        self.selectors()
            .into_iter()
            .flatten()
            .any(|sel| label_selector_matches(sel, old) != label_selector_matches(sel, new))
    }
}

/// Notifies when a namespace update changes selector membership.
pub struct NamespaceHandler {
    selectors: NamespaceSelectorSet,
    notifier: ChangeNotifier,
}

impl NamespaceHandler {
    pub fn new(selectors: NamespaceSelectorSet, notifier: ChangeNotifier) -> Self {
        Self {
            selectors,
            notifier,
        }
    }
}

impl EventHandler<Namespace> for NamespaceHandler {
    fn on_add(&self, _obj: &Namespace) {}

    fn on_update(&self, old: &Namespace, new: &Namespace) {
        if old.resource_version() == new.resource_version() {
            return;
        }
        if !self.selectors.selection_changed(old.labels(), new.labels()) {
            return;
        }
        debug!(namespace = %new.name_any(), "namespace selection changed");
        self.notifier.notify();
    }

    fn on_delete(&self, _obj: &Namespace) {}
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    pub(crate) fn test_namespace(name: &str, version: &str, labels: &[(&str, &str)]) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.into()),
                resource_version: Some(version.into()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn match_labels(pairs: &[(&str, &str)]) -> LabelSelector {
        LabelSelector {
            match_labels: Some(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            ..Default::default()
        }
    }

    fn handler(selectors: NamespaceSelectorSet) -> (NamespaceHandler, ChangeNotifier) {
        let notifier = ChangeNotifier::new();
        (NamespaceHandler::new(selectors, notifier.clone()), notifier)
    }

    #[test]
    fn test_irrelevant_label_change_is_dropped() {
        let (handler, notifier) = handler(NamespaceSelectorSet {
            pod_monitor: Some(match_labels(&[("monitoring", "enabled")])),
            ..Default::default()
        });
        let old = test_namespace("test", "1", &[("monitoring", "enabled"), ("owner", "me")]);
        let new = test_namespace("test", "2", &[("monitoring", "enabled")]);
        handler.on_update(&old, &new);
        assert!(!notifier.is_pending());
    }

    #[test]
    fn test_relevant_label_change_notifies_once() {
        let (handler, notifier) = handler(NamespaceSelectorSet {
            pod_monitor: Some(match_labels(&[("monitoring", "enabled")])),
            ..Default::default()
        });
        let old = test_namespace("test", "1", &[("monitoring", "enabled")]);
        let new = test_namespace("test", "2", &[]);
        handler.on_update(&old, &new);
        assert!(notifier.take());
        assert!(!notifier.take());
    }

    #[test]
    fn test_same_resource_version_is_dropped() {
        let (handler, notifier) = handler(NamespaceSelectorSet {
            service_monitor: Some(match_labels(&[("a", "b")])),
            ..Default::default()
        });
        let old = test_namespace("test", "5", &[("a", "b")]);
        let new = test_namespace("test", "5", &[]);
        handler.on_update(&old, &new);
        assert!(!notifier.is_pending());
    }

    #[test]
    fn test_absent_selectors_never_change() {
        let set = NamespaceSelectorSet::default();
        let old = BTreeMap::from([("a".to_string(), "b".to_string())]);
        assert!(!set.selection_changed(&old, &BTreeMap::new()));
    }

    #[test]
    fn test_add_and_delete_do_not_notify() {
        let (handler, notifier) = handler(NamespaceSelectorSet {
            probe: Some(match_labels(&[("a", "b")])),
            ..Default::default()
        });
        let ns = test_namespace("test", "1", &[("a", "b")]);
        handler.on_add(&ns);
        handler.on_delete(&ns);
        assert!(!notifier.is_pending());
    }
}
