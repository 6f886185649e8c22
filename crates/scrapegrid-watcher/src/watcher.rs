//! The Prometheus CR watcher.
//!
//! Owns one informer per watched kind, wires their change handlers into a
//! shared [`ChangeNotifier`], and materializes the scrape configuration on
//! demand.
//!
//! ```text
//!  ServiceMonitor ─┐
//!  PodMonitor     ─┤ ResourceChangeHandler ─┐
//!  Probe          ─┤                        │
//!  ScrapeConfig   ─┘                        ├─► ChangeNotifier ─► sender ─► Event
//!  Secret    ── SecretHandler ── AssetStore ┤      (1 slot)      (ticker)
//!  Namespace ── NamespaceHandler ───────────┘
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::ResourceExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use scrapegrid_core::PromConfig;
use scrapegrid_crd::{PodMonitor, Probe, ResourceKind, ScrapeConfig, ServiceMonitor};

use crate::assets::{AssetStore, KubeSecrets, SecretSource};
use crate::config::{AllocatorConfig, PrometheusCrConfig};
use crate::discovery::installed_optional_kinds;
use crate::error::{WatcherError, WatcherResult};
use crate::events::{ChangeNotifier, Event, run_rate_limited_sender};
use crate::informer::{EventHandler, Informer, cluster_watch_stream, namespaced_watch_stream};
use crate::namespace::{NamespaceHandler, NamespaceSelectorSet};
use crate::selector::{ResourceSelector, Selectable, WatchedResource};

/// Name the allocator's watcher reports in its events.
pub const WATCHER_NAME: &str = "prometheus-cr-watcher";

/// The six informers a watcher runs.
pub struct Informers {
    pub service_monitors: Informer<ServiceMonitor>,
    pub pod_monitors: Informer<PodMonitor>,
    pub probes: Informer<Probe>,
    pub scrape_configs: Informer<ScrapeConfig>,
    pub secrets: Informer<Secret>,
    pub namespaces: Informer<Namespace>,
}

impl Informers {
    /// Informers backed by the cluster API.
    ///
    /// Probe and ScrapeConfig get an empty stand-in when their CRD is not
    /// installed.
    pub async fn connect(client: kube::Client, config: &AllocatorConfig) -> WatcherResult<Self> {
        let installed = installed_optional_kinds(&client).await?;
        let scope = &config.namespaces;
        let resync = config.prometheus_cr.resync_period.as_duration();

        let probes: Informer<Probe> = if installed.contains(&ResourceKind::Probe) {
            Informer::new(
                ResourceKind::Probe,
                namespaced_watch_stream(client.clone(), scope),
                scope.clone(),
                resync,
            )
        } else {
            Informer::empty(ResourceKind::Probe)
        };
        let scrape_configs: Informer<ScrapeConfig> = if installed.contains(&ResourceKind::ScrapeConfig) {
            Informer::new(
                ResourceKind::ScrapeConfig,
                namespaced_watch_stream(client.clone(), scope),
                scope.clone(),
                resync,
            )
        } else {
            Informer::empty(ResourceKind::ScrapeConfig)
        };

        Ok(Self {
            service_monitors: Informer::new(
                ResourceKind::ServiceMonitor,
                namespaced_watch_stream(client.clone(), scope),
                scope.clone(),
                resync,
            ),
            pod_monitors: Informer::new(
                ResourceKind::PodMonitor,
                namespaced_watch_stream(client.clone(), scope),
                scope.clone(),
                resync,
            ),
            probes,
            scrape_configs,
            secrets: Informer::new(
                ResourceKind::Secret,
                namespaced_watch_stream(client.clone(), scope),
                scope.clone(),
                resync,
            ),
            namespaces: Informer::new(
                ResourceKind::Namespace,
                cluster_watch_stream(client),
                Default::default(),
                resync,
            ),
        })
    }
}

/// Watches monitoring resources and generates the scrape configuration.
pub struct PrometheusCrWatcher {
    name: String,
    config: PrometheusCrConfig,
    informers: Informers,
    assets: Arc<AssetStore>,
    notifier: ChangeNotifier,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
}

impl PrometheusCrWatcher {
    pub fn new(
        name: impl Into<String>,
        config: PrometheusCrConfig,
        informers: Informers,
        secrets: Arc<dyn SecretSource>,
    ) -> Self {
        let notifier = ChangeNotifier::new();
        let (shutdown, _) = watch::channel(false);
        Self {
            name: name.into(),
            config,
            informers,
            assets: Arc::new(AssetStore::new(secrets, notifier.clone())),
            notifier,
            shutdown,
            started: AtomicBool::new(false),
        }
    }

    /// Watcher for the cluster `client` points at.
    pub async fn connect(client: kube::Client, config: &AllocatorConfig) -> WatcherResult<Self> {
        let informers = Informers::connect(client.clone(), config).await?;
        Ok(Self::new(
            WATCHER_NAME,
            config.prometheus_cr.clone(),
            informers,
            Arc::new(KubeSecrets::new(client)),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn assets(&self) -> &AssetStore {
        &self.assets
    }

    /// Start the informers and run until [`close`](Self::close).
    ///
    /// Returns [`WatcherError::CacheSync`] naming every informer that did
    /// not finish its initial list within `sync_timeout`; closing the
    /// watcher during that wait returns `Ok(())`. Once synced, one
    /// event is forced so the caller loads an initial configuration even on
    /// an empty cluster.
    pub async fn watch(&self, events: mpsc::Sender<Event>) -> WatcherResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(WatcherError::AlreadyStarted);
        }
        self.install_handlers();

        let inf = &self.informers;
        let mut tasks = Vec::new();
        tasks.extend(inf.service_monitors.start(self.shutdown.subscribe()));
        tasks.extend(inf.pod_monitors.start(self.shutdown.subscribe()));
        tasks.extend(inf.probes.start(self.shutdown.subscribe()));
        tasks.extend(inf.scrape_configs.start(self.shutdown.subscribe()));
        tasks.extend(inf.secrets.start(self.shutdown.subscribe()));
        tasks.extend(inf.namespaces.start(self.shutdown.subscribe()));
        debug!(watcher = %self.name, informers = tasks.len(), "informers started");

        let timeout = self.config.sync_timeout.as_duration();
        let mut shutdown = self.shutdown.subscribe();
        let synced = tokio::select! {
            synced = async {
                tokio::join!(
                    inf.service_monitors.wait_for_sync(timeout),
                    inf.pod_monitors.wait_for_sync(timeout),
                    inf.probes.wait_for_sync(timeout),
                    inf.scrape_configs.wait_for_sync(timeout),
                    inf.secrets.wait_for_sync(timeout),
                    inf.namespaces.wait_for_sync(timeout),
                )
            } => synced,
            _ = closed(&mut shutdown) => {
                for task in tasks {
                    let _ = task.await;
                }
                info!(watcher = %self.name, "watcher closed before caches synced");
                return Ok(());
            }
        };
        let failed: Vec<ResourceKind> = [
            (ResourceKind::ServiceMonitor, synced.0),
            (ResourceKind::PodMonitor, synced.1),
            (ResourceKind::Probe, synced.2),
            (ResourceKind::ScrapeConfig, synced.3),
            (ResourceKind::Secret, synced.4),
            (ResourceKind::Namespace, synced.5),
        ]
        .into_iter()
        .filter(|(_, ok)| !ok)
        .map(|(kind, _)| kind)
        .collect();
        if !failed.is_empty() {
            self.close();
            return Err(WatcherError::CacheSync { kinds: failed });
        }
        info!(watcher = %self.name, "informer caches synced");

        self.notifier.notify();
        tasks.push(tokio::spawn(run_rate_limited_sender(
            self.notifier.clone(),
            self.config.event_interval(),
            events,
            self.name.clone(),
            self.shutdown.subscribe(),
        )));

        closed(&mut shutdown).await;
        for task in tasks {
            let _ = task.await;
        }
        info!(watcher = %self.name, "watcher stopped");
        Ok(())
    }

    /// Stop the informers and the event sender.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    /// Generate the scrape configuration from the current caches.
    ///
    /// Jobs are sorted by name, so two calls over the same cache state
    /// serialize identically.
    pub async fn load_config(&self) -> WatcherResult<PromConfig> {
        let selector = ResourceSelector::new(&self.config, &self.assets, &self.informers.namespaces);
        let mut names = BTreeSet::new();
        let mut jobs = Vec::new();

        for kind in ResourceKind::MONITORS {
            let selected = selector.select_all(kind, self.resources(kind));
            for resource in selected.values() {
                for job in selector.generate(resource).await {
                    push_unique(&mut names, &mut jobs, job)?;
                }
            }
        }

        debug!(watcher = %self.name, jobs = jobs.len(), "scrape configuration generated");
        Ok(PromConfig::from_jobs(jobs))
    }

    fn resources(&self, kind: ResourceKind) -> Vec<WatchedResource> {
        let inf = &self.informers;
        match kind {
            ResourceKind::ServiceMonitor => watched(&inf.service_monitors),
            ResourceKind::PodMonitor => watched(&inf.pod_monitors),
            ResourceKind::Probe => watched(&inf.probes),
            ResourceKind::ScrapeConfig => watched(&inf.scrape_configs),
            ResourceKind::Secret | ResourceKind::Namespace => Vec::new(),
        }
    }

    fn install_handlers(&self) {
        let inf = &self.informers;
        let changes = Arc::new(ResourceChangeHandler {
            notifier: self.notifier.clone(),
        });
        inf.service_monitors.add_handler(changes.clone());
        inf.pod_monitors.add_handler(changes.clone());
        inf.probes.add_handler(changes.clone());
        inf.scrape_configs.add_handler(changes);
        inf.secrets.add_handler(Arc::new(SecretHandler {
            assets: self.assets.clone(),
        }));
        inf.namespaces.add_handler(Arc::new(NamespaceHandler::new(
            NamespaceSelectorSet::from_config(&self.config),
            self.notifier.clone(),
        )));
    }
}

/// Wait until the shutdown flag is raised or its sender is gone.
async fn closed(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

/// Add `job` unless its name is taken.
///
/// Generated names embed kind, namespace and resource name, so a collision
/// means a generator bug; it fails the load rather than serving one job
/// over another.
fn push_unique(
    names: &mut BTreeSet<String>,
    jobs: &mut Vec<scrapegrid_core::ScrapeConfig>,
    job: scrapegrid_core::ScrapeConfig,
) -> WatcherResult<()> {
    if !names.insert(job.job_name.clone()) {
        return Err(WatcherError::DuplicateJob(job.job_name));
    }
    jobs.push(job);
    Ok(())
}

fn watched<K: Selectable>(informer: &Informer<K>) -> Vec<WatchedResource> {
    informer.list().into_iter().map(K::watched).collect()
}

// ── Handlers ─────────────────────────────────────────────────────

/// Any change to a monitoring resource may change the configuration.
struct ResourceChangeHandler {
    notifier: ChangeNotifier,
}

impl<K: kube::Resource + Send + Sync> EventHandler<K> for ResourceChangeHandler {
    fn on_add(&self, _obj: &K) {
        self.notifier.notify();
    }

    fn on_update(&self, _old: &K, _new: &K) {
        self.notifier.notify();
    }

    fn on_delete(&self, _obj: &K) {
        self.notifier.notify();
    }
}

/// Feeds secret changes into the asset store, which ignores secrets it
/// does not track and notifies on changes it accepts.
struct SecretHandler {
    assets: Arc<AssetStore>,
}

impl EventHandler<Secret> for SecretHandler {
    fn on_add(&self, _obj: &Secret) {}

    fn on_update(&self, _old: &Secret, new: &Secret) {
        self.assets.update(new);
    }

    fn on_delete(&self, obj: &Secret) {
        self.assets.remove(&obj.namespace().unwrap_or_default(), &obj.name_any());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use kube::runtime::watcher;

    use crate::assets::StaticSecrets;
    use crate::assets::tests::test_secret;
    use crate::informer::tests::{EventTx, channel_informer, send_list};
    use crate::selector::tests::basic_auth_secret;
    use scrapegrid_crd::{BasicAuth, Endpoint, ScrapeEndpoint, SecretKeySelector, ServiceMonitorSpec};

    struct Feeds {
        service_monitors: EventTx<ServiceMonitor>,
        pod_monitors: EventTx<PodMonitor>,
        secrets: EventTx<Secret>,
        namespaces: EventTx<Namespace>,
    }

    fn test_watcher(config: PrometheusCrConfig, secrets: Vec<Secret>) -> (PrometheusCrWatcher, Feeds) {
        let (service_monitors, sm_tx) = channel_informer(ResourceKind::ServiceMonitor);
        let (pod_monitors, pm_tx) = channel_informer(ResourceKind::PodMonitor);
        let (secret_informer, secret_tx) = channel_informer(ResourceKind::Secret);
        let (namespaces, ns_tx) = channel_informer(ResourceKind::Namespace);
        let source = Arc::new(StaticSecrets::new());
        for s in secrets {
            source.insert(s);
        }
        let watcher = PrometheusCrWatcher::new(
            "test",
            config,
            Informers {
                service_monitors,
                pod_monitors,
                probes: Informer::empty(ResourceKind::Probe),
                scrape_configs: Informer::empty(ResourceKind::ScrapeConfig),
                secrets: secret_informer,
                namespaces,
            },
            source,
        );
        let feeds = Feeds {
            service_monitors: sm_tx,
            pod_monitors: pm_tx,
            secrets: secret_tx,
            namespaces: ns_tx,
        };
        (watcher, feeds)
    }

    fn test_sm(name: &str, version: &str, basic_auth: bool) -> ServiceMonitor {
        let auth = basic_auth.then(|| BasicAuth {
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
        });
        let mut sm = ServiceMonitor::new(
            name,
            ServiceMonitorSpec {
                endpoints: vec![Endpoint {
                    port: Some("web".into()),
                    common: ScrapeEndpoint {
                        basic_auth: auth,
                        ..Default::default()
                    },
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        sm.metadata.namespace = Some("test".into());
        sm.metadata.resource_version = Some(version.into());
        sm
    }

    fn sync_all(feeds: &Feeds, monitors: Vec<ServiceMonitor>) {
        send_list(&feeds.service_monitors, monitors);
        send_list(&feeds.pod_monitors, vec![]);
        send_list(&feeds.secrets, vec![]);
        send_list(&feeds.namespaces, vec![]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_emits_initial_event_and_debounces() {
        let (watcher, feeds) = test_watcher(PrometheusCrConfig::default(), vec![]);
        let watcher = Arc::new(watcher);
        let (tx, mut rx) = mpsc::channel(4);
        let handle = tokio::spawn({
            let watcher = watcher.clone();
            async move { watcher.watch(tx).await }
        });

        sync_all(&feeds, vec![]);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.watcher, "test");

        for version in ["1", "2", "3"] {
            feeds
                .service_monitors
                .unbounded_send(Ok(watcher::Event::Apply(test_sm("app", version, false))))
                .unwrap();
        }
        assert!(rx.recv().await.is_some());
        assert!(
            tokio::time::timeout(Duration::from_secs(30), rx.recv())
                .await
                .is_err()
        );

        watcher.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_reports_unsynced_informers() {
        let (watcher, feeds) = test_watcher(PrometheusCrConfig::default(), vec![]);
        send_list(&feeds.service_monitors, vec![]);
        send_list(&feeds.namespaces, vec![]);

        let (tx, _rx) = mpsc::channel(1);
        let err = watcher.watch(tx).await.unwrap_err();
        match err {
            WatcherError::CacheSync { kinds } => {
                assert_eq!(kinds, vec![ResourceKind::PodMonitor, ResourceKind::Secret]);
            }
            other => panic!("unexpected error: {other}"),
        }
        watcher.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_sync_is_not_an_error() {
        let (watcher, _feeds) = test_watcher(PrometheusCrConfig::default(), vec![]);
        let watcher = Arc::new(watcher);
        let (tx, _rx) = mpsc::channel(1);
        let handle = tokio::spawn({
            let watcher = watcher.clone();
            async move { watcher.watch(tx).await }
        });
        while !watcher.started.load(Ordering::Acquire) {
            tokio::task::yield_now().await;
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        watcher.close();
        let started = tokio::time::Instant::now();
        handle.await.unwrap().unwrap();
        assert!(started.elapsed() < watcher.config.sync_timeout.as_duration());
    }

    #[test]
    fn test_duplicate_job_names_fail_the_load() {
        let mut names = BTreeSet::new();
        let mut jobs = Vec::new();
        let job = scrapegrid_core::ScrapeConfig::new("serviceMonitor/test/app/0");
        push_unique(&mut names, &mut jobs, job.clone()).unwrap();
        match push_unique(&mut names, &mut jobs, job) {
            Err(WatcherError::DuplicateJob(name)) => assert_eq!(name, "serviceMonitor/test/app/0"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_watch_twice_is_rejected() {
        let (watcher, feeds) = test_watcher(PrometheusCrConfig::default(), vec![]);
        let watcher = Arc::new(watcher);
        sync_all(&feeds, vec![]);
        let (tx, _rx) = mpsc::channel(1);
        let handle = tokio::spawn({
            let watcher = watcher.clone();
            async move { watcher.watch(tx).await }
        });
        while !watcher.started.load(Ordering::Acquire) {
            tokio::task::yield_now().await;
        }

        let (tx2, _rx2) = mpsc::channel(1);
        assert!(matches!(
            watcher.watch(tx2).await,
            Err(WatcherError::AlreadyStarted)
        ));
        watcher.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_load_config_is_idempotent() {
        let (watcher, feeds) = test_watcher(PrometheusCrConfig::default(), vec![basic_auth_secret()]);
        let watcher = Arc::new(watcher);
        sync_all(&feeds, vec![test_sm("b", "1", true), test_sm("a", "1", false)]);
        let (tx, _rx) = mpsc::channel(1);
        let handle = tokio::spawn({
            let watcher = watcher.clone();
            async move { watcher.watch(tx).await }
        });
        assert!(
            watcher
                .informers
                .service_monitors
                .wait_for_sync(Duration::from_secs(1))
                .await
        );

        let first = watcher.load_config().await.unwrap();
        let second = watcher.load_config().await.unwrap();
        let names: Vec<_> = first.scrape_configs.iter().map(|j| j.job_name.as_str()).collect();
        assert_eq!(names, vec!["serviceMonitor/test/a/0", "serviceMonitor/test/b/0"]);
        assert_eq!(first.to_yaml().unwrap(), second.to_yaml().unwrap());
        assert_eq!(
            first.scrape_configs[1].http_client.basic_auth.as_ref().unwrap().username,
            "admin"
        );

        watcher.close();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_untracked_secret_churn_is_ignored() {
        let notifier = ChangeNotifier::new();
        let assets = Arc::new(AssetStore::new(Arc::new(StaticSecrets::new()), notifier.clone()));
        let handler = SecretHandler {
            assets: assets.clone(),
        };

        let secret = test_secret("test", "unrelated", &[("token", "x")]);
        handler.on_update(&secret, &secret);
        handler.on_delete(&secret);
        assert!(assets.is_empty());
        assert!(!notifier.is_pending());
    }

    #[tokio::test]
    async fn test_tracked_secret_update_refreshes_credentials() {
        let (watcher, _feeds) = test_watcher(PrometheusCrConfig::default(), vec![basic_auth_secret()]);
        let selector = SecretKeySelector {
            name: "basic-auth".into(),
            key: "password".into(),
            optional: None,
        };
        assert_eq!(watcher.assets().resolve("test", &selector).await.unwrap(), "password");

        let handler = SecretHandler {
            assets: watcher.assets.clone(),
        };
        let rotated = test_secret("test", "basic-auth", &[("username", "admin"), ("password", "rotated")]);
        handler.on_update(&basic_auth_secret(), &rotated);
        assert!(watcher.notifier.take());
        assert_eq!(watcher.assets().resolve("test", &selector).await.unwrap(), "rotated");

        handler.on_delete(&rotated);
        assert!(watcher.notifier.take());
        assert!(!watcher.assets().is_tracked("test", "basic-auth"));
    }
}
