//! PodMonitor → one job per pod metrics endpoint.

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::warn;

use scrapegrid_core::{KubernetesRole, RelabelConfig, ScrapeConfig};
use scrapegrid_crd::{PodMetricsEndpoint, PodMonitor};

use super::{
    ResourceSelector, copy_labels, kubernetes_sd, sanitize_label_name, selector_relabelings,
    set_label,
};
use crate::error::JobError;

pub(super) async fn generate(sel: &ResourceSelector<'_>, pm: &PodMonitor) -> Vec<ScrapeConfig> {
    let namespace = pm.namespace().unwrap_or_default();
    let name = pm.name_any();

    let mut jobs = Vec::new();
    for (i, ep) in pm.spec.pod_metrics_endpoints.iter().enumerate() {
        let job_name = format!("podMonitor/{namespace}/{name}/{i}");
        match endpoint_job(sel, pm, &namespace, &name, ep, job_name.clone()).await {
            Ok(job) => jobs.push(job),
            Err(e) => warn!(job = %job_name, error = %e, "skipping PodMonitor endpoint"),
        }
    }
    jobs
}

async fn endpoint_job(
    sel: &ResourceSelector<'_>,
    pm: &PodMonitor,
    namespace: &str,
    name: &str,
    ep: &PodMetricsEndpoint,
    job_name: String,
) -> Result<ScrapeConfig, JobError> {
    let mut job = ScrapeConfig::new(job_name);
    job.kubernetes_sd_configs = vec![kubernetes_sd(
        KubernetesRole::Pod,
        namespace,
        pm.spec.namespace_selector.as_ref(),
    )];
    job.sample_limit = pm.spec.sample_limit;
    job.target_limit = pm.spec.target_limit;

    let mut rules = selector_relabelings("__meta_kubernetes_pod", &pm.spec.selector);

    let endpoint_label = match (&ep.port, &ep.target_port) {
        (Some(port), _) => {
            rules.push(RelabelConfig::keep(
                &["__meta_kubernetes_pod_container_port_name"],
                port,
            ));
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

    rules.extend([
        RelabelConfig::replace(&["__meta_kubernetes_namespace"], "namespace"),
        RelabelConfig::replace(&["__meta_kubernetes_pod_container_name"], "container"),
        RelabelConfig::replace(&["__meta_kubernetes_pod_name"], "pod"),
    ]);
    rules.extend(copy_labels("__meta_kubernetes_pod", &pm.spec.pod_target_labels));

    rules.push(set_label("job", &format!("{namespace}/{name}")));
    if let Some(job_label) = pm.spec.job_label.as_deref().filter(|l| !l.is_empty()) {
        let source = format!("__meta_kubernetes_pod_label_{}", sanitize_label_name(job_label));
        rules.push(
            RelabelConfig::replace(&[source.as_str()], "job")
                .with_regex("(.+)")
                .with_replacement("${1}"),
        );
    }
    rules.push(set_label("endpoint", &endpoint_label));

    job.relabel_configs = rules;
    sel.apply_endpoint(&mut job, namespace, &ep.common, ep.tls_config.as_ref())
        .await?;
    sel.add_sharding(&mut job.relabel_configs);
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrometheusCrConfig;
    use crate::selector::tests::{Fixture, match_labels};
    use scrapegrid_core::PromDuration;
    use scrapegrid_crd::{NamespaceSelector, PodMonitorSpec, ScrapeEndpoint};

    fn test_pm(endpoints: Vec<PodMetricsEndpoint>) -> PodMonitor {
        let mut pm = PodMonitor::new(
            "pods",
            PodMonitorSpec {
                pod_metrics_endpoints: endpoints,
                selector: match_labels(&[("app", "worker")]),
                ..Default::default()
            },
        );
        pm.metadata.namespace = Some("test".into());
        pm
    }

    #[tokio::test]
    async fn test_pod_monitor_job() {
        let fx = Fixture::new(PrometheusCrConfig::default(), vec![], vec![]).await;
        let pm = test_pm(vec![PodMetricsEndpoint {
            port: Some("metrics".into()),
            common: ScrapeEndpoint {
                interval: Some("1m".into()),
                path: Some("/stats".into()),
                ..Default::default()
            },
            ..Default::default()
        }]);

        let jobs = generate(&fx.selector(), &pm).await;
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.job_name, "podMonitor/test/pods/0");
        assert_eq!(job.kubernetes_sd_configs[0].role, KubernetesRole::Pod);
        assert_eq!(job.scrape_interval, Some(PromDuration::from_secs(60)));
        assert_eq!(job.scrape_timeout, Some(PromDuration::from_secs(10)));
        assert_eq!(job.metrics_path.as_deref(), Some("/stats"));
        assert!(job.relabel_configs.iter().any(|r| {
            r.target_label.as_deref() == Some("job") && r.replacement.as_deref() == Some("test/pods")
        }));
        assert!(job.relabel_configs.iter().any(|r| {
            r.source_labels == ["__meta_kubernetes_pod_label_app", "__meta_kubernetes_pod_labelpresent_app"]
        }));
        for rule in &job.relabel_configs {
            rule.validate().unwrap();
        }
    }

    #[tokio::test]
    async fn test_any_namespace() {
        let fx = Fixture::new(PrometheusCrConfig::default(), vec![], vec![]).await;
        let mut pm = test_pm(vec![PodMetricsEndpoint {
            port: Some("metrics".into()),
            ..Default::default()
        }]);
        pm.spec.namespace_selector = Some(NamespaceSelector {
            any: true,
            match_names: vec![],
        });
        let jobs = generate(&fx.selector(), &pm).await;
        assert!(jobs[0].kubernetes_sd_configs[0].namespaces.is_none());
    }
}
