//! `ServiceMonitor` (monitoring.coreos.com/v1).

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::common::{NamespaceSelector, ScrapeEndpoint, TlsConfig};

/// Scrapes the endpoints of Services matched by `selector`.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "ServiceMonitor",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMonitorSpec {
    /// Service label whose value becomes the `job` label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_label: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_target_labels: Vec<String>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub selector: LabelSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<NamespaceSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_limit: Option<u64>,
}

/// One scrape endpoint of a ServiceMonitor.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Named Service port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<IntOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_config: Option<TlsConfig>,
    #[serde(flatten)]
    pub common: ScrapeEndpoint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_monitor_manifest() {
        let yaml = r#"
apiVersion: monitoring.coreos.com/v1
kind: ServiceMonitor
metadata:
  name: app
  namespace: test
spec:
  jobLabel: app.kubernetes.io/name
  selector:
    matchLabels:
      app: web
  namespaceSelector:
    matchNames: [test, other]
  endpoints:
    - port: web
      interval: 15s
      bearerTokenSecret:
        name: token
        key: value
      relabelings:
        - sourceLabels: [__meta_kubernetes_pod_name]
          targetLabel: pod
    - targetPort: 8080
      path: /stats
"#;
        let sm: ServiceMonitor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(sm.metadata.name.as_deref(), Some("app"));
        assert_eq!(sm.spec.job_label.as_deref(), Some("app.kubernetes.io/name"));
        assert_eq!(sm.spec.endpoints.len(), 2);

        let first = &sm.spec.endpoints[0];
        assert_eq!(first.port.as_deref(), Some("web"));
        assert_eq!(first.common.interval.as_deref(), Some("15s"));
        assert_eq!(first.common.bearer_token_secret.as_ref().unwrap().name, "token");
        assert_eq!(first.common.relabelings.len(), 1);

        let second = &sm.spec.endpoints[1];
        assert_eq!(second.target_port, Some(IntOrString::Int(8080)));
        assert_eq!(second.common.path.as_deref(), Some("/stats"));
        assert_eq!(
            sm.spec.namespace_selector.unwrap().match_names,
            vec!["test".to_string(), "other".to_string()]
        );
    }
}
