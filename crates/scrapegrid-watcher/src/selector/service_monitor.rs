//! ServiceMonitor → one job per endpoint.

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::warn;

use scrapegrid_core::{RelabelConfig, ScrapeConfig};
use scrapegrid_crd::{Endpoint, ServiceMonitor};

use super::{
    ResourceSelector, copy_labels, kubernetes_sd, sanitize_label_name, selector_relabelings,
    set_label,
};
use crate::error::JobError;

pub(super) async fn generate(sel: &ResourceSelector<'_>, sm: &ServiceMonitor) -> Vec<ScrapeConfig> {
    let namespace = sm.namespace().unwrap_or_default();
    let name = sm.name_any();

    let mut jobs = Vec::new();
    for (i, ep) in sm.spec.endpoints.iter().enumerate() {
        let job_name = format!("serviceMonitor/{namespace}/{name}/{i}");
        match endpoint_job(sel, sm, &namespace, ep, job_name.clone()).await {
            Ok(job) => jobs.push(job),
            Err(e) => warn!(job = %job_name, error = %e, "skipping ServiceMonitor endpoint"),
        }
    }
    jobs
}

async fn endpoint_job(
    sel: &ResourceSelector<'_>,
    sm: &ServiceMonitor,
    namespace: &str,
    ep: &Endpoint,
    job_name: String,
) -> Result<ScrapeConfig, JobError> {
    let role = sel.config.service_discovery_role;
    let meta = role.meta_prefix();

    let mut job = ScrapeConfig::new(job_name);
    job.kubernetes_sd_configs = vec![kubernetes_sd(
        role,
        namespace,
        sm.spec.namespace_selector.as_ref(),
    )];
    job.sample_limit = sm.spec.sample_limit;
    job.target_limit = sm.spec.target_limit;

    let mut rules = selector_relabelings("__meta_kubernetes_service", &sm.spec.selector);

    let endpoint_label = match (&ep.port, &ep.target_port) {
        (Some(port), _) => {
            let port_name = format!("{meta}_port_name");
            rules.push(RelabelConfig::keep(&[port_name.as_str()], port));
            port.clone()
        }
        (None, Some(IntOrString::Int(number))) => {
            let number = number.to_string();
            rules.push(RelabelConfig::keep(
                &["__meta_kubernetes_pod_container_port_number"],
                &number,
            ));
            number
        }
        (None, Some(IntOrString::String(port))) => {
            rules.push(RelabelConfig::keep(
                &["__meta_kubernetes_pod_container_port_name"],
                port,
            ));
            port.clone()
        }
        (None, None) => return Err(JobError::MissingPort),
    };

    // Endpoints backed by nodes or pods get a node/pod label.
    let target_kind = format!("{meta}_address_target_kind");
    let target_name = format!("{meta}_address_target_name");
    for (kind, label) in [("Node", "node"), ("Pod", "pod")] {
        rules.push(
            RelabelConfig::replace(&[target_kind.as_str(), target_name.as_str()], label)
                .with_separator(";")
                .with_regex(&format!("{kind};(.*)"))
                .with_replacement("${1}"),
        );
    }

    rules.extend([
        RelabelConfig::replace(&["__meta_kubernetes_namespace"], "namespace"),
        RelabelConfig::replace(&["__meta_kubernetes_service_name"], "service"),
        RelabelConfig::replace(&["__meta_kubernetes_pod_name"], "pod"),
        RelabelConfig::replace(&["__meta_kubernetes_pod_container_name"], "container"),
    ]);
    rules.extend(copy_labels("__meta_kubernetes_service", &sm.spec.target_labels));
    rules.extend(copy_labels("__meta_kubernetes_pod", &sm.spec.pod_target_labels));

    rules.push(RelabelConfig::replace(&["__meta_kubernetes_service_name"], "job"));
    if let Some(job_label) = sm.spec.job_label.as_deref().filter(|l| !l.is_empty()) {
        let source = format!("__meta_kubernetes_service_label_{}", sanitize_label_name(job_label));
        rules.push(
            RelabelConfig::replace(&[source.as_str()], "job")
                .with_regex("(.+)")
                .with_replacement("${1}"),
        );
    }
    rules.push(set_label("endpoint", &endpoint_label));

    job.relabel_configs = rules;
    let tls = ep.tls_config.as_ref().map(|t| &t.safe);
    sel.apply_endpoint(&mut job, namespace, &ep.common, tls).await?;
    if let (Some(tls_files), Some(tls_config)) = (&ep.tls_config, job.http_client.tls_config.as_mut()) {
        tls_config.ca_file = tls_files.ca_file.clone();
        tls_config.cert_file = tls_files.cert_file.clone();
        tls_config.key_file = tls_files.key_file.clone();
    }
    sel.add_sharding(&mut job.relabel_configs);
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrometheusCrConfig;
    use crate::selector::tests::{Fixture, basic_auth_secret, match_labels};
    use scrapegrid_core::{KubernetesRole, PromDuration, RelabelAction};
    use scrapegrid_crd::{
        BasicAuth, RelabelConfig as CrRelabelConfig, ScrapeEndpoint, SecretKeySelector,
        ServiceMonitorSpec, TlsConfig,
    };

    fn test_sm(endpoints: Vec<Endpoint>) -> ServiceMonitor {
        let mut sm = ServiceMonitor::new(
            "app",
            ServiceMonitorSpec {
                endpoints,
                selector: match_labels(&[("app", "web")]),
                ..Default::default()
            },
        );
        sm.metadata.namespace = Some("test".into());
        sm
    }

    fn web_endpoint() -> Endpoint {
        Endpoint {
            port: Some("web".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_plain_endpoint_job() {
        let fx = Fixture::new(PrometheusCrConfig::default(), vec![], vec![]).await;
        let jobs = generate(&fx.selector(), &test_sm(vec![web_endpoint()])).await;

        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.job_name, "serviceMonitor/test/app/0");
        assert_eq!(job.kubernetes_sd_configs[0].role, KubernetesRole::EndpointSlice);
        assert_eq!(
            job.kubernetes_sd_configs[0].namespaces.as_ref().unwrap().names,
            vec!["test"]
        );
        assert_eq!(job.scrape_interval, Some(PromDuration::from_secs(30)));
        assert_eq!(job.scrape_timeout, Some(PromDuration::from_secs(10)));
        assert!(job.http_client.basic_auth.is_none());
        assert!(job.relabel_configs.iter().any(|r| {
            r.action == RelabelAction::Keep
                && r.source_labels == ["__meta_kubernetes_endpointslice_port_name"]
                && r.regex.as_deref() == Some("web")
        }));
        for rule in &job.relabel_configs {
            rule.validate().unwrap();
        }
    }

    #[tokio::test]
    async fn test_basic_auth_is_resolved() {
        let fx = Fixture::new(PrometheusCrConfig::default(), vec![basic_auth_secret()], vec![]).await;
        let ep = Endpoint {
            common: ScrapeEndpoint {
                basic_auth: Some(BasicAuth {
                    username: Some(SecretKeySelector {
                        name: "basic-auth".into(),
                        key: "username".into(),
                        optional: None,
                    }),
                    password: Some(SecretKeySelector {
                        name: "basic-auth".into(),
                        key: "password".into(),
                        optional: None,
                    }),
                }),
                ..Default::default()
            },
            ..web_endpoint()
        };
        let jobs = generate(&fx.selector(), &test_sm(vec![ep])).await;
        let auth = jobs[0].http_client.basic_auth.as_ref().unwrap();
        assert_eq!(auth.username, "admin");
        assert_eq!(auth.password.as_deref(), Some("password"));
        assert!(fx.assets.is_tracked("test", "basic-auth"));
    }

    #[tokio::test]
    async fn test_missing_secret_drops_only_auth() {
        let fx = Fixture::new(PrometheusCrConfig::default(), vec![], vec![]).await;
        let ep = Endpoint {
            common: ScrapeEndpoint {
                bearer_token_secret: Some(SecretKeySelector {
                    name: "absent".into(),
                    key: "token".into(),
                    optional: None,
                }),
                ..Default::default()
            },
            ..web_endpoint()
        };
        let jobs = generate(&fx.selector(), &test_sm(vec![ep])).await;
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].http_client.authorization.is_none());
    }

    #[tokio::test]
    async fn test_invalid_endpoint_is_skipped() {
        let fx = Fixture::new(PrometheusCrConfig::default(), vec![], vec![]).await;
        let bad_relabel = Endpoint {
            common: ScrapeEndpoint {
                relabelings: vec![CrRelabelConfig {
                    action: Some("hashmod".into()),
                    source_labels: vec!["__address__".into()],
                    target_label: Some("shard".into()),
                    modulus: Some(0),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..web_endpoint()
        };
        let bad_timeout = Endpoint {
            common: ScrapeEndpoint {
                interval: Some("5s".into()),
                scrape_timeout: Some("10s".into()),
                ..Default::default()
            },
            ..web_endpoint()
        };
        let no_port = Endpoint::default();

        let jobs = generate(
            &fx.selector(),
            &test_sm(vec![bad_relabel, web_endpoint(), bad_timeout, no_port]),
        )
        .await;
        let names: Vec<_> = jobs.iter().map(|j| j.job_name.as_str()).collect();
        assert_eq!(names, vec!["serviceMonitor/test/app/1"]);
    }

    #[tokio::test]
    async fn test_job_label_target_port_and_tls_files() {
        let config = PrometheusCrConfig {
            service_discovery_role: KubernetesRole::Endpoints,
            ..Default::default()
        };
        let fx = Fixture::new(config, vec![], vec![]).await;
        let mut sm = test_sm(vec![Endpoint {
            target_port: Some(IntOrString::Int(8080)),
            tls_config: Some(TlsConfig {
                ca_file: Some("/etc/ca.crt".into()),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        sm.spec.job_label = Some("app.kubernetes.io/name".into());

        let jobs = generate(&fx.selector(), &sm).await;
        let job = &jobs[0];
        assert_eq!(job.kubernetes_sd_configs[0].role, KubernetesRole::Endpoints);
        assert!(job.relabel_configs.iter().any(|r| {
            r.source_labels == ["__meta_kubernetes_service_label_app_kubernetes_io_name"]
                && r.target_label.as_deref() == Some("job")
        }));
        assert!(job.relabel_configs.iter().any(|r| {
            r.target_label.as_deref() == Some("endpoint") && r.replacement.as_deref() == Some("8080")
        }));
        assert_eq!(
            job.http_client.tls_config.as_ref().unwrap().ca_file.as_deref(),
            Some("/etc/ca.crt")
        );
    }

    #[tokio::test]
    async fn test_sharding_relabelings() {
        let config = PrometheusCrConfig {
            shards: 3,
            ..Default::default()
        };
        let fx = Fixture::new(config, vec![], vec![]).await;
        let jobs = generate(&fx.selector(), &test_sm(vec![web_endpoint()])).await;
        let rules = &jobs[0].relabel_configs;
        let hashmod = &rules[rules.len() - 2];
        assert_eq!(hashmod.action, RelabelAction::HashMod);
        assert_eq!(hashmod.modulus, Some(3));
        let keep = &rules[rules.len() - 1];
        assert_eq!(keep.action, RelabelAction::Keep);
        assert_eq!(keep.regex.as_deref(), Some("$(SHARD)"));
    }
}
