//! Probe → one job scraping the prober, one target per probed URL.

use kube::ResourceExt;
use tracing::warn;

use scrapegrid_core::{KubernetesRole, RelabelConfig, ScrapeConfig, StaticConfig};
use scrapegrid_crd::{Probe, ProberSpec, to_prometheus_relabelings};

use super::{AuthRefs, ResourceSelector, kubernetes_sd, selector_relabelings, set_label};
use crate::error::JobError;

const DEFAULT_PROBER_PATH: &str = "/probe";

pub(super) async fn generate(sel: &ResourceSelector<'_>, probe: &Probe) -> Option<ScrapeConfig> {
    let namespace = probe.namespace().unwrap_or_default();
    let job_name = format!("probe/{namespace}/{}", probe.name_any());
    match probe_job(sel, probe, &namespace, job_name.clone()).await {
        Ok(job) => Some(job),
        Err(e) => {
            warn!(job = %job_name, error = %e, "skipping Probe");
            None
        }
    }
}

async fn probe_job(
    sel: &ResourceSelector<'_>,
    probe: &Probe,
    namespace: &str,
    job_name: String,
) -> Result<ScrapeConfig, JobError> {
    let spec = &probe.spec;
    let prober = spec
        .prober
        .as_ref()
        .filter(|p| !p.url.is_empty())
        .ok_or(JobError::MissingProber)?;
    let (interval, timeout) = sel.intervals(spec.interval.as_deref(), spec.scrape_timeout.as_deref())?;
    let metric_relabelings =
        to_prometheus_relabelings(&spec.metric_relabelings).map_err(JobError::MetricRelabel)?;

    let mut job = ScrapeConfig::new(job_name);
    job.scrape_interval = Some(interval);
    job.scrape_timeout = Some(timeout);
    job.metrics_path = Some(
        prober
            .path
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_PROBER_PATH.to_string()),
    );
    job.scheme = prober.scheme.clone();
    if let Some(module) = spec.module.as_deref().filter(|m| !m.is_empty()) {
        job.params.insert("module".into(), vec![module.to_string()]);
    }
    job.sample_limit = spec.sample_limit;
    job.target_limit = spec.target_limit;
    job.metric_relabel_configs = metric_relabelings;

    let mut rules = Vec::new();
    if let Some(job_label) = spec.job_name.as_deref().filter(|j| !j.is_empty()) {
        rules.push(set_label("job", job_label));
    }

    if let Some(targets) = spec.targets.static_config.as_ref().filter(|s| !s.targets.is_empty()) {
        let mut labels = targets.labels.clone();
        labels.insert("namespace".into(), namespace.to_string());
        job.static_configs = vec![StaticConfig {
            targets: targets.targets.clone(),
            labels,
        }];
        rules.push(RelabelConfig::replace(&["__address__"], "__param_target"));
        rules.extend(prober_relabelings(prober));
        rules.extend(to_prometheus_relabelings(&targets.relabeling_configs).map_err(JobError::Relabel)?);
    } else if let Some(ingress) = spec.targets.ingress.as_ref() {
        job.kubernetes_sd_configs = vec![kubernetes_sd(
            KubernetesRole::Ingress,
            namespace,
            ingress.namespace_selector.as_ref(),
        )];
        rules.extend(selector_relabelings("__meta_kubernetes_ingress", &ingress.selector));
        rules.push(
            RelabelConfig::replace(
                &[
                    "__meta_kubernetes_ingress_scheme",
                    "__address__",
                    "__meta_kubernetes_ingress_path",
                ],
                "__param_target",
            )
            .with_separator(";")
            .with_regex("(.+);(.+);(.+)")
            .with_replacement("${1}://${2}${3}"),
        );
        rules.extend([
            RelabelConfig::replace(&["__meta_kubernetes_namespace"], "namespace"),
            RelabelConfig::replace(&["__meta_kubernetes_ingress_name"], "ingress"),
        ]);
        rules.extend(prober_relabelings(prober));
        rules.extend(to_prometheus_relabelings(&ingress.relabeling_configs).map_err(JobError::Relabel)?);
    } else {
        return Err(JobError::MissingTargets);
    }
    job.relabel_configs = rules;

    let name = job.job_name.clone();
    let refs = AuthRefs {
        basic_auth: spec.basic_auth.as_ref(),
        bearer_token: spec.bearer_token_secret.as_ref(),
        authorization: spec.authorization.as_ref(),
        oauth2: spec.oauth2.as_ref(),
        tls: spec.tls_config.as_ref(),
    };
    job.http_client = sel.http_client(&name, namespace, refs).await;
    job.http_client.proxy_url = prober.proxy_url.clone();

    sel.add_sharding(&mut job.relabel_configs);
    Ok(job)
}

/// The probed URL becomes `instance`; the scrape itself goes to the prober.
fn prober_relabelings(prober: &ProberSpec) -> [RelabelConfig; 2] {
    [
        RelabelConfig::replace(&["__param_target"], "instance"),
        set_label("__address__", &prober.url),
    ]
}
