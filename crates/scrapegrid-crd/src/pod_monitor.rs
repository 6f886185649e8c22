//! `PodMonitor` (monitoring.coreos.com/v1).

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::common::{NamespaceSelector, SafeTlsConfig, ScrapeEndpoint};

/// Scrapes Pods matched by `selector` directly.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "PodMonitor",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct PodMonitorSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_label: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_target_labels: Vec<String>,
    #[serde(default)]
    pub pod_metrics_endpoints: Vec<PodMetricsEndpoint>,
    #[serde(default)]
    pub selector: LabelSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<NamespaceSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_limit: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodMetricsEndpoint {
    /// Named container port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<IntOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_config: Option<SafeTlsConfig>,
    #[serde(flatten)]
    pub common: ScrapeEndpoint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pod_monitor_manifest() {
        let yaml = r#"
apiVersion: monitoring.coreos.com/v1
kind: PodMonitor
metadata:
  name: pods
  namespace: test
spec:
  selector:
    matchExpressions:
      - key: app
        operator: Exists
  podMetricsEndpoints:
    - port: metrics
      scheme: https
      tlsConfig:
        serverName: pods.test
      basicAuth:
        username: {name: creds, key: user}
        password: {name: creds, key: pass}
"#;
        let pm: PodMonitor = serde_yaml::from_str(yaml).unwrap();
        let ep = &pm.spec.pod_metrics_endpoints[0];
        assert_eq!(ep.port.as_deref(), Some("metrics"));
        assert_eq!(ep.common.scheme.as_deref(), Some("https"));
        assert_eq!(
            ep.tls_config.as_ref().unwrap().server_name.as_deref(),
            Some("pods.test")
        );
        let auth = ep.common.basic_auth.as_ref().unwrap();
        assert_eq!(auth.password.as_ref().unwrap().key, "pass");
        assert!(pm.spec.namespace_selector.is_none());
    }
}
