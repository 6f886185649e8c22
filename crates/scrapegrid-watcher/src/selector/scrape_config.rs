//! ScrapeConfig → one job carrying its own static and HTTP SD targets.

use kube::ResourceExt;
use tracing::warn;

use scrapegrid_core::{HttpSdConfig, PromDuration, ScrapeConfig, StaticConfig};
use scrapegrid_crd::{ScrapeConfig as ScrapeConfigResource, to_prometheus_relabelings};

use super::{AuthRefs, ResourceSelector, set_label};
use crate::error::JobError;

pub(super) async fn generate(
    sel: &ResourceSelector<'_>,
    sc: &ScrapeConfigResource,
) -> Option<ScrapeConfig> {
    let namespace = sc.namespace().unwrap_or_default();
    let job_name = format!("scrapeConfig/{namespace}/{}", sc.name_any());
    match scrape_config_job(sel, sc, &namespace, job_name.clone()).await {
        Ok(job) => Some(job),
        Err(e) => {
            warn!(job = %job_name, error = %e, "skipping ScrapeConfig");
            None
        }
    }
}

async fn scrape_config_job(
    sel: &ResourceSelector<'_>,
    sc: &ScrapeConfigResource,
    namespace: &str,
    job_name: String,
) -> Result<ScrapeConfig, JobError> {
    let spec = &sc.spec;
    let (interval, timeout) =
        sel.intervals(spec.scrape_interval.as_deref(), spec.scrape_timeout.as_deref())?;
    let relabelings = to_prometheus_relabelings(&spec.relabelings).map_err(JobError::Relabel)?;
    let metric_relabelings =
        to_prometheus_relabelings(&spec.metric_relabelings).map_err(JobError::MetricRelabel)?;

    let mut job = ScrapeConfig::new(job_name);
    job.scrape_interval = Some(interval);
    job.scrape_timeout = Some(timeout);
    job.metrics_path = spec.metrics_path.clone();
    job.scheme = spec.scheme.clone();
    job.params = spec.params.clone();
    job.honor_labels = spec.honor_labels;
    job.honor_timestamps = spec.honor_timestamps;
    job.sample_limit = spec.sample_limit;
    job.target_limit = spec.target_limit;
    job.metric_relabel_configs = metric_relabelings;

    job.static_configs = spec
        .static_configs
        .iter()
        .map(|s| StaticConfig {
            targets: s.targets.clone(),
            labels: s.labels.clone(),
        })
        .collect();

    for (i, sd) in spec.http_sd_configs.iter().enumerate() {
        let refresh_interval = match sd.refresh_interval.as_deref() {
            Some(s) if !s.is_empty() => Some(s.parse::<PromDuration>()?),
            _ => None,
        };
        let refs = AuthRefs {
            basic_auth: sd.basic_auth.as_ref(),
            authorization: sd.authorization.as_ref(),
            tls: sd.tls_config.as_ref(),
            ..Default::default()
        };
        let label = format!("{}/httpSDConfigs/{i}", job.job_name);
        let mut http_client = sel.http_client(&label, namespace, refs).await;
        http_client.proxy_url = sd.proxy_url.clone();
        job.http_sd_configs.push(HttpSdConfig {
            url: sd.url.clone(),
            refresh_interval,
            http_client,
        });
    }

    if let Some(job_label) = spec.job_name.as_deref().filter(|j| !j.is_empty()) {
        job.relabel_configs.push(set_label("job", job_label));
    }
    job.relabel_configs.extend(relabelings);

    let name = job.job_name.clone();
    let refs = AuthRefs {
        basic_auth: spec.basic_auth.as_ref(),
        authorization: spec.authorization.as_ref(),
        oauth2: spec.oauth2.as_ref(),
        tls: spec.tls_config.as_ref(),
        ..Default::default()
    };
    job.http_client = sel.http_client(&name, namespace, refs).await;
    job.http_client.proxy_url = spec.proxy_url.clone();
    job.http_client.follow_redirects = spec.follow_redirects;
    job.http_client.enable_http2 = spec.enable_http2;

    sel.add_sharding(&mut job.relabel_configs);
    Ok(job)
}
