//! Resource selector — turns monitoring resources into scrape jobs.
//!
//! Selection filters each kind by its resource selector and namespace
//! selector. Generation then builds one job per endpoint (ServiceMonitor,
//! PodMonitor) or per resource (Probe, ScrapeConfig). A bad endpoint is
//! logged and skipped; its siblings still produce jobs. Credentials are
//! resolved through the [`AssetStore`], which starts tracking every secret
//! it is asked for.

mod pod_monitor;
mod probe;
mod scrape_config;
mod service_monitor;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::ResourceExt;
use tracing::warn;

use scrapegrid_core::{
    HttpClientConfig, KubernetesSdConfig, NamespaceDiscovery, PromDuration, RelabelAction,
    RelabelConfig, SHARD_PLACEHOLDER, ScrapeConfig,
};
use scrapegrid_crd::{
    BasicAuth, NamespaceSelector, OAuth2, PodMonitor, Probe, ResourceKind, SafeAuthorization,
    SafeTlsConfig, ScrapeEndpoint, SecretKeySelector, ServiceMonitor, label_selector_matches,
    selector_matches, to_prometheus_relabelings,
};

use crate::assets::AssetStore;
use crate::config::PrometheusCrConfig;
use crate::error::JobError;
use crate::informer::Informer;

/// Label holding the shard hash when sharding is enabled.
const SHARD_HASH_LABEL: &str = "__tmp_hash";

/// A watched monitoring resource, one variant per monitor kind.
#[derive(Debug, Clone)]
pub enum WatchedResource {
    ServiceMonitor(Arc<ServiceMonitor>),
    PodMonitor(Arc<PodMonitor>),
    Probe(Arc<Probe>),
    ScrapeConfig(Arc<scrapegrid_crd::ScrapeConfig>),
}

impl WatchedResource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::ServiceMonitor(_) => ResourceKind::ServiceMonitor,
            Self::PodMonitor(_) => ResourceKind::PodMonitor,
            Self::Probe(_) => ResourceKind::Probe,
            Self::ScrapeConfig(_) => ResourceKind::ScrapeConfig,
        }
    }

    pub fn namespace(&self) -> String {
        match self {
            Self::ServiceMonitor(r) => r.namespace(),
            Self::PodMonitor(r) => r.namespace(),
            Self::Probe(r) => r.namespace(),
            Self::ScrapeConfig(r) => r.namespace(),
        }
        .unwrap_or_default()
    }

    pub fn name(&self) -> String {
        match self {
            Self::ServiceMonitor(r) => r.name_any(),
            Self::PodMonitor(r) => r.name_any(),
            Self::Probe(r) => r.name_any(),
            Self::ScrapeConfig(r) => r.name_any(),
        }
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        match self {
            Self::ServiceMonitor(r) => r.labels(),
            Self::PodMonitor(r) => r.labels(),
            Self::Probe(r) => r.labels(),
            Self::ScrapeConfig(r) => r.labels(),
        }
    }

    /// `<kind prefix>/<namespace>/<name>`, the stem of every job it yields.
    pub fn job_key(&self) -> String {
        format!("{}/{}/{}", self.kind().job_prefix(), self.namespace(), self.name())
    }
}

/// A monitor type that can be wrapped as a [`WatchedResource`].
pub trait Selectable: kube::Resource + Clone + Send + Sync + 'static {
    fn watched(obj: Arc<Self>) -> WatchedResource;
}

impl Selectable for ServiceMonitor {
    fn watched(obj: Arc<Self>) -> WatchedResource {
        WatchedResource::ServiceMonitor(obj)
    }
}

impl Selectable for PodMonitor {
    fn watched(obj: Arc<Self>) -> WatchedResource {
        WatchedResource::PodMonitor(obj)
    }
}

impl Selectable for Probe {
    fn watched(obj: Arc<Self>) -> WatchedResource {
        WatchedResource::Probe(obj)
    }
}

impl Selectable for scrapegrid_crd::ScrapeConfig {
    fn watched(obj: Arc<Self>) -> WatchedResource {
        WatchedResource::ScrapeConfig(obj)
    }
}

/// Auth references of one endpoint, resolved together.
#[derive(Default)]
struct AuthRefs<'a> {
    basic_auth: Option<&'a BasicAuth>,
    bearer_token: Option<&'a SecretKeySelector>,
    authorization: Option<&'a SafeAuthorization>,
    oauth2: Option<&'a OAuth2>,
    tls: Option<&'a SafeTlsConfig>,
}

impl<'a> AuthRefs<'a> {
    fn from_endpoint(ep: &'a ScrapeEndpoint, tls: Option<&'a SafeTlsConfig>) -> Self {
        Self {
            basic_auth: ep.basic_auth.as_ref(),
            bearer_token: ep.bearer_token_secret.as_ref(),
            authorization: ep.authorization.as_ref(),
            oauth2: ep.oauth2.as_ref(),
            tls,
        }
    }
}

/// Selects resources and generates their jobs.
pub struct ResourceSelector<'a> {
    config: &'a PrometheusCrConfig,
    assets: &'a AssetStore,
    namespaces: &'a Informer<Namespace>,
}

impl<'a> ResourceSelector<'a> {
    pub fn new(
        config: &'a PrometheusCrConfig,
        assets: &'a AssetStore,
        namespaces: &'a Informer<Namespace>,
    ) -> Self {
        Self {
            config,
            assets,
            namespaces,
        }
    }

    /// Resources of `kind` admitted by the configured selectors, keyed by
    /// job key.
    pub fn select_all(
        &self,
        kind: ResourceKind,
        resources: impl IntoIterator<Item = WatchedResource>,
    ) -> BTreeMap<String, WatchedResource> {
        let selector = self.config.selector(kind);
        let namespace_selector = self.config.namespace_selector(kind);
        resources
            .into_iter()
            .filter(|r| r.kind() == kind)
            .filter(|r| selector_matches(selector, r.labels()))
            .filter(|r| self.namespace_admitted(namespace_selector, &r.namespace()))
            .map(|r| (r.job_key(), r))
            .collect()
    }

    fn namespace_admitted(&self, selector: Option<&LabelSelector>, namespace: &str) -> bool {
        let Some(selector) = selector else {
            return true;
        };
        match self.namespaces.get("", namespace) {
            Some(ns) => label_selector_matches(selector, ns.labels()),
            None => false,
        }
    }

    /// Every job a selected resource yields.
    pub async fn generate(&self, resource: &WatchedResource) -> Vec<ScrapeConfig> {
        match resource {
            WatchedResource::ServiceMonitor(sm) => service_monitor::generate(self, sm).await,
            WatchedResource::PodMonitor(pm) => pod_monitor::generate(self, pm).await,
            WatchedResource::Probe(p) => probe::generate(self, p).await.into_iter().collect(),
            WatchedResource::ScrapeConfig(sc) => {
                scrape_config::generate(self, sc).await.into_iter().collect()
            }
        }
    }

    /// Interval and timeout with configured fallbacks.
    ///
    /// An unset timeout is capped at the interval; an explicit timeout
    /// longer than the interval is an error.
    fn intervals(
        &self,
        interval: Option<&str>,
        timeout: Option<&str>,
    ) -> Result<(PromDuration, PromDuration), JobError> {
        let interval = match interval {
            Some(s) if !s.is_empty() => s.parse()?,
            _ => self.config.scrape_interval,
        };
        let timeout = match timeout {
            Some(s) if !s.is_empty() => {
                let timeout: PromDuration = s.parse()?;
                if timeout > interval {
                    return Err(JobError::TimeoutExceedsInterval { timeout, interval });
                }
                timeout
            }
            _ => self.config.scrape_timeout.min(interval),
        };
        Ok((interval, timeout))
    }

    /// Resolve auth references. A field that fails to resolve is logged
    /// and left out; the rest of the job is unaffected.
    async fn http_client(&self, job: &str, namespace: &str, refs: AuthRefs<'_>) -> HttpClientConfig {
        let mut client = HttpClientConfig::default();

        if let Some(auth) = refs.basic_auth {
            match self.assets.basic_auth(namespace, auth).await {
                Ok(v) => client.basic_auth = Some(v),
                Err(e) => warn!(%job, field = "basicAuth", error = %e, "dropping auth field"),
            }
        }
        if let Some(sel) = refs.bearer_token {
            match self.assets.bearer_token(namespace, sel).await {
                Ok(v) => client.authorization = Some(v),
                Err(e) => warn!(%job, field = "bearerTokenSecret", error = %e, "dropping auth field"),
            }
        }
        if let Some(auth) = refs.authorization {
            match self.assets.authorization(namespace, auth).await {
                Ok(v) => client.authorization = Some(v),
                Err(e) => warn!(%job, field = "authorization", error = %e, "dropping auth field"),
            }
        }
        if let Some(oauth2) = refs.oauth2 {
            match self.assets.oauth2(namespace, oauth2).await {
                Ok(v) => client.oauth2 = Some(v),
                Err(e) => warn!(%job, field = "oauth2", error = %e, "dropping auth field"),
            }
        }
        if let Some(tls) = refs.tls {
            match self.assets.tls_config(namespace, tls).await {
                Ok(v) => client.tls_config = Some(v),
                Err(e) => warn!(%job, field = "tlsConfig", error = %e, "dropping auth field"),
            }
        }
        client
    }

    /// Fill the fields shared by ServiceMonitor and PodMonitor endpoints.
    async fn apply_endpoint(
        &self,
        job: &mut ScrapeConfig,
        namespace: &str,
        ep: &ScrapeEndpoint,
        tls: Option<&SafeTlsConfig>,
    ) -> Result<(), JobError> {
        let (interval, timeout) = self.intervals(ep.interval.as_deref(), ep.scrape_timeout.as_deref())?;
        let relabelings = to_prometheus_relabelings(&ep.relabelings).map_err(JobError::Relabel)?;
        job.metric_relabel_configs =
            to_prometheus_relabelings(&ep.metric_relabelings).map_err(JobError::MetricRelabel)?;

        job.scrape_interval = Some(interval);
        job.scrape_timeout = Some(timeout);
        job.metrics_path = ep.path.clone();
        job.scheme = ep.scheme.clone();
        job.params = ep.params.clone();
        job.honor_labels = ep.honor_labels;
        job.honor_timestamps = ep.honor_timestamps;
        job.relabel_configs.extend(relabelings);

        let name = job.job_name.clone();
        job.http_client = self
            .http_client(&name, namespace, AuthRefs::from_endpoint(ep, tls))
            .await;
        job.http_client.proxy_url = ep.proxy_url.clone();
        job.http_client.follow_redirects = ep.follow_redirects;
        job.http_client.enable_http2 = ep.enable_http2;
        Ok(())
    }

    /// Append the hashmod/keep pair that splits targets across shards.
    fn add_sharding(&self, relabelings: &mut Vec<RelabelConfig>) {
        if self.config.shards <= 1 {
            return;
        }
        relabelings.push(RelabelConfig {
            source_labels: vec!["__address__".into()],
            target_label: Some(SHARD_HASH_LABEL.into()),
            modulus: Some(u64::from(self.config.shards)),
            action: RelabelAction::HashMod,
            ..Default::default()
        });
        relabelings.push(RelabelConfig::keep(&[SHARD_HASH_LABEL], SHARD_PLACEHOLDER));
    }
}

/// Replace characters Prometheus does not allow in label names.
pub fn sanitize_label_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Kubernetes SD config honoring a monitor's namespace selector.
fn kubernetes_sd(
    role: scrapegrid_core::KubernetesRole,
    own_namespace: &str,
    selector: Option<&NamespaceSelector>,
) -> KubernetesSdConfig {
    let namespaces = match selector {
        Some(sel) if sel.any => None,
        Some(sel) if !sel.match_names.is_empty() => Some(NamespaceDiscovery {
            own_namespace: None,
            names: sel.match_names.clone(),
        }),
        _ => Some(NamespaceDiscovery {
            own_namespace: None,
            names: vec![own_namespace.to_string()],
        }),
    };
    KubernetesSdConfig { role, namespaces }
}

/// Relabelings that keep only targets whose object labels satisfy
/// `selector`. `prefix` is e.g. `__meta_kubernetes_service`.
fn selector_relabelings(prefix: &str, selector: &LabelSelector) -> Vec<RelabelConfig> {
    let label = |k: &str| format!("{prefix}_label_{}", sanitize_label_name(k));
    let present = |k: &str| format!("{prefix}_labelpresent_{}", sanitize_label_name(k));
    let mut rules = Vec::new();

    for (key, value) in selector.match_labels.iter().flatten() {
        let (label, present) = (label(key), present(key));
        rules.push(RelabelConfig::keep(
            &[label.as_str(), present.as_str()],
            &format!("({});true", regex_escape(value)),
        ));
    }
    for req in selector.match_expressions.iter().flatten() {
        if let Some(rule) = expression_relabeling(req, &label(&req.key), &present(&req.key)) {
            rules.push(rule);
        }
    }
    rules
}

fn expression_relabeling(
    req: &LabelSelectorRequirement,
    label: &str,
    present: &str,
) -> Option<RelabelConfig> {
    let values = req
        .values
        .iter()
        .flatten()
        .map(|v| regex_escape(v))
        .collect::<Vec<_>>()
        .join("|");
    match req.operator.as_str() {
        "In" => Some(RelabelConfig::keep(&[label, present], &format!("({values});true"))),
        "NotIn" => Some(RelabelConfig::drop(&[label, present], &format!("({values});true"))),
        "Exists" => Some(RelabelConfig::keep(&[present], "true")),
        "DoesNotExist" => Some(RelabelConfig::drop(&[present], "true")),
        _ => None,
    }
}

fn regex_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// `replace` of a fixed value into `target`.
fn set_label(target: &str, value: &str) -> RelabelConfig {
    RelabelConfig {
        target_label: Some(target.into()),
        replacement: Some(value.into()),
        ..Default::default()
    }
}

/// Copy object labels named in `names` onto the target, skipping empty ones.
fn copy_labels(prefix: &str, names: &[String]) -> Vec<RelabelConfig> {
    names
        .iter()
        .map(|name| {
            let target = sanitize_label_name(name);
            let source = format!("{prefix}_label_{target}");
            RelabelConfig::replace(&[source.as_str()], &target)
                .with_regex("(.+)")
                .with_replacement("${1}")
        })
        .collect()
}
