//! Resource informers — per-kind watch caches with change handlers.
//!
//! ```text
//! kube watcher stream ──► Informer ──► cache (namespace, name) → object
//!                            │
//!                            └──► handlers: on_add / on_update / on_delete
//! ```
//!
//! A re-list (`Init` … `InitDone`) is diffed against the cache so handlers
//! see adds, updates and deletes exactly as if they had been watched. Every
//! `resync_period` all cached objects are re-dispatched as updates.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use kube::api::Api;
use kube::core::NamespaceResourceScope;
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use scrapegrid_crd::ResourceKind;

use crate::config::NamespaceScope;

/// Interval between "still waiting" logs in [`Informer::wait_for_sync`].
const SYNC_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Stream of watch events feeding an informer.
pub type WatchStream<K> = BoxStream<'static, Result<watcher::Event<K>, watcher::Error>>;

/// Callbacks invoked for cache changes. Called outside the cache lock.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);
    fn on_update(&self, old: &K, new: &K);
    fn on_delete(&self, obj: &K);
}

/// Initial-sync progress of an informer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    NotStarted,
    Syncing,
    Synced,
    /// Initial list did not finish in time; the informer keeps running.
    TimedOut,
}

type ObjectKey = (String, String);

enum Dispatch<K> {
    Add(Arc<K>),
    Update(Arc<K>, Arc<K>),
    Delete(Arc<K>),
}

struct Inner<K> {
    kind: ResourceKind,
    cache: RwLock<BTreeMap<ObjectKey, Arc<K>>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler<K>>>>,
    stream: Mutex<Option<WatchStream<K>>>,
    scope: NamespaceScope,
    resync_period: Duration,
    state: watch::Sender<SyncState>,
}

/// Watch cache for one resource kind.
pub struct Informer<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for Informer<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> Informer<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new(
        kind: ResourceKind,
        stream: WatchStream<K>,
        scope: NamespaceScope,
        resync_period: Duration,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::NotStarted);
        Self {
            inner: Arc::new(Inner {
                kind,
                cache: RwLock::new(BTreeMap::new()),
                handlers: RwLock::new(Vec::new()),
                stream: Mutex::new(Some(stream)),
                scope,
                resync_period,
                state,
            }),
        }
    }

    /// Stand-in for a kind whose CRD is not installed: always synced, never
    /// holds objects.
    pub fn empty(kind: ResourceKind) -> Self {
        let (state, _) = watch::channel(SyncState::Synced);
        Self {
            inner: Arc::new(Inner {
                kind,
                cache: RwLock::new(BTreeMap::new()),
                handlers: RwLock::new(Vec::new()),
                stream: Mutex::new(None),
                scope: NamespaceScope::default(),
                resync_period: Duration::ZERO,
                state,
            }),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.inner.kind
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler<K>>) {
        self.inner
            .handlers
            .write()
            .expect("handlers lock")
            .push(handler);
    }

    /// Spawn the watch loop. Returns `None` if there is nothing to run
    /// (empty stand-in, or already started).
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let stream = self.inner.stream.lock().expect("stream lock").take()?;
        self.inner.state.send_replace(SyncState::Syncing);
        let inner = self.inner.clone();
        Some(tokio::spawn(run_informer(inner, stream, shutdown)))
    }

    pub fn state(&self) -> SyncState {
        *self.inner.state.borrow()
    }

    pub fn has_synced(&self) -> bool {
        self.state() == SyncState::Synced
    }

    /// Wait until the initial list completes or `timeout` elapses.
    ///
    /// On timeout the state becomes [`SyncState::TimedOut`] and `false` is
    /// returned; a later successful list still moves it to `Synced`.
    pub async fn wait_for_sync(&self, timeout: Duration) -> bool {
        let kind = self.inner.kind;
        let mut state = self.inner.state.subscribe();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(SYNC_LOG_INTERVAL);
        ticker.tick().await;

        loop {
            if *state.borrow_and_update() == SyncState::Synced {
                return true;
            }
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = ticker.tick() => {
                    debug!(%kind, "waiting for informer cache to sync");
                }
                _ = &mut deadline => {
                    let timed_out = self.inner.state.send_if_modified(|s| {
                        if *s == SyncState::Synced {
                            false
                        } else {
                            *s = SyncState::TimedOut;
                            true
                        }
                    });
                    if timed_out {
                        warn!(%kind, ?timeout, "informer cache sync timed out");
                    }
                    return !timed_out;
                }
            }
        }
    }

    /// Snapshot of cached objects, ordered by namespace then name.
    pub fn list(&self) -> Vec<Arc<K>> {
        self.inner
            .cache
            .read()
            .expect("cache lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.inner
            .cache
            .read()
            .expect("cache lock")
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

async fn run_informer<K>(
    inner: Arc<Inner<K>>,
    mut stream: WatchStream<K>,
    mut shutdown: watch::Receiver<bool>,
) where
    K: Resource + Clone + Send + Sync + 'static,
{
    let kind = inner.kind;
    let resync_enabled = !inner.resync_period.is_zero();
    let period = inner.resync_period.max(Duration::from_secs(1));
    let mut resync = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut relist: Option<BTreeMap<ObjectKey, Arc<K>>> = None;

    debug!(%kind, "informer starting");

    loop {
        tokio::select! {
            event = stream.next() => match event {
                Some(Ok(event)) => inner.handle_event(event, &mut relist),
                Some(Err(e)) => warn!(%kind, error = %e, "watch error, retrying"),
                None => {
                    warn!(%kind, "watch stream ended");
                    break;
                }
            },
            _ = resync.tick(), if resync_enabled => inner.resync(),
            _ = shutdown.changed() => {
                debug!(%kind, "informer shutting down");
                break;
            }
        }
    }
}

impl<K> Inner<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    fn key(obj: &K) -> ObjectKey {
        (obj.namespace().unwrap_or_default(), obj.name_any())
    }

    fn handle_event(
        &self,
        event: watcher::Event<K>,
        relist: &mut Option<BTreeMap<ObjectKey, Arc<K>>>,
    ) {
        let dispatch = match event {
            watcher::Event::Init => {
                *relist = Some(BTreeMap::new());
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                if self.scope.admits(obj.namespace().as_deref()) {
                    relist
                        .get_or_insert_with(BTreeMap::new)
                        .insert(Self::key(&obj), Arc::new(obj));
                }
                Vec::new()
            }
            watcher::Event::InitDone => {
                let listed = relist.take().unwrap_or_default();
                let objects = listed.len();
                let dispatch = self.replace(listed);
                self.dispatch(dispatch);
                if self.state.send_replace(SyncState::Synced) != SyncState::Synced {
                    info!(kind = %self.kind, objects, "informer synced");
                }
                return;
            }
            watcher::Event::Apply(obj) => {
                if !self.scope.admits(obj.namespace().as_deref()) {
                    return;
                }
                let new = Arc::new(obj);
                let old = self
                    .cache
                    .write()
                    .expect("cache lock")
                    .insert(Self::key(&new), new.clone());
                match old {
                    Some(old) => vec![Dispatch::Update(old, new)],
                    None => vec![Dispatch::Add(new)],
                }
            }
            watcher::Event::Delete(obj) => {
                let removed = self.cache.write().expect("cache lock").remove(&Self::key(&obj));
                match removed {
                    Some(_) => vec![Dispatch::Delete(Arc::new(obj))],
                    None => Vec::new(),
                }
            }
        };
        self.dispatch(dispatch);
    }

    /// Swap the cache for a fresh list, returning the implied changes.
    fn replace(&self, listed: BTreeMap<ObjectKey, Arc<K>>) -> Vec<Dispatch<K>> {
        let mut cache = self.cache.write().expect("cache lock");
        let previous = std::mem::replace(&mut *cache, listed);
        let mut dispatch = Vec::new();
        for (key, new) in cache.iter() {
            match previous.get(key) {
                Some(old) => dispatch.push(Dispatch::Update(old.clone(), new.clone())),
                None => dispatch.push(Dispatch::Add(new.clone())),
            }
        }
        for (key, old) in previous {
            if !cache.contains_key(&key) {
                dispatch.push(Dispatch::Delete(old));
            }
        }
        dispatch
    }

    fn resync(&self) {
        if *self.state.borrow() != SyncState::Synced {
            return;
        }
        let objects: Vec<Arc<K>> = self.cache.read().expect("cache lock").values().cloned().collect();
        debug!(kind = %self.kind, objects = objects.len(), "informer resync");
        self.dispatch(
            objects
                .into_iter()
                .map(|obj| Dispatch::Update(obj.clone(), obj))
                .collect(),
        );
    }

    fn dispatch(&self, dispatch: Vec<Dispatch<K>>) {
        if dispatch.is_empty() {
            return;
        }
        let handlers = self.handlers.read().expect("handlers lock").clone();
        for d in &dispatch {
            for handler in &handlers {
                match d {
                    Dispatch::Add(obj) => handler.on_add(obj),
                    Dispatch::Update(old, new) => handler.on_update(old, new),
                    Dispatch::Delete(obj) => handler.on_delete(obj),
                }
            }
        }
    }
}

/// Watch stream for a namespaced kind, narrowed to `scope`.
///
/// A single allowed namespace gets a namespaced watch; anything else
/// watches cluster-wide and the informer filters client-side. Denied
/// namespaces are also excluded server-side with a field selector.
pub fn namespaced_watch_stream<K>(client: kube::Client, scope: &NamespaceScope) -> WatchStream<K>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
    K::DynamicType: Default,
{
    let api: Api<K> = match scope.allow.as_slice() {
        [only] => Api::namespaced(client, only),
        _ => Api::all(client),
    };
    let mut config = watcher::Config::default();
    if !scope.deny.is_empty() {
        let fields = scope
            .deny
            .iter()
            .map(|ns| format!("metadata.namespace!={ns}"))
            .collect::<Vec<_>>()
            .join(",");
        config = config.fields(&fields);
    }
    watcher(api, config).default_backoff().boxed()
}

/// Watch stream for a cluster-scoped kind.
pub fn cluster_watch_stream<K>(client: kube::Client) -> WatchStream<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::all(client);
    watcher(api, watcher::Config::default()).default_backoff().boxed()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures::channel::mpsc;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    pub(crate) type EventTx<K> = mpsc::UnboundedSender<Result<watcher::Event<K>, watcher::Error>>;

    /// Informer fed from a channel instead of the cluster.
    pub(crate) fn channel_informer<K>(kind: ResourceKind) -> (Informer<K>, EventTx<K>)
    where
        K: Resource + Clone + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded();
        let informer = Informer::new(
            kind,
            rx.boxed(),
            NamespaceScope::default(),
            Duration::from_secs(300),
        );
        (informer, tx)
    }

    /// Send a complete initial list.
    pub(crate) fn send_list<K>(tx: &EventTx<K>, objects: Vec<K>) {
        tx.unbounded_send(Ok(watcher::Event::Init)).unwrap();
        for obj in objects {
            tx.unbounded_send(Ok(watcher::Event::InitApply(obj))).unwrap();
        }
        tx.unbounded_send(Ok(watcher::Event::InitDone)).unwrap();
    }

    fn test_cm(namespace: &str, name: &str, version: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                resource_version: Some(version.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.seen.lock().unwrap())
        }
    }

    impl EventHandler<ConfigMap> for Recorder {
        fn on_add(&self, obj: &ConfigMap) {
            self.seen.lock().unwrap().push(format!("add {}", obj.name_any()));
        }
        fn on_update(&self, old: &ConfigMap, new: &ConfigMap) {
            self.seen.lock().unwrap().push(format!(
                "update {} {}->{}",
                new.name_any(),
                old.resource_version().unwrap_or_default(),
                new.resource_version().unwrap_or_default()
            ));
        }
        fn on_delete(&self, obj: &ConfigMap) {
            self.seen.lock().unwrap().push(format!("delete {}", obj.name_any()));
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_initial_list_and_watch_events() {
        let (informer, tx) = channel_informer::<ConfigMap>(ResourceKind::ServiceMonitor);
        let recorder = Arc::new(Recorder::default());
        informer.add_handler(recorder.clone());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        informer.start(shutdown_rx).unwrap();
        assert_eq!(informer.state(), SyncState::Syncing);

        send_list(&tx, vec![test_cm("a", "one", "1"), test_cm("b", "two", "1")]);
        assert!(informer.wait_for_sync(Duration::from_secs(1)).await);
        assert_eq!(recorder.take(), vec!["add one", "add two"]);

        tx.unbounded_send(Ok(watcher::Event::Apply(test_cm("a", "one", "2")))).unwrap();
        tx.unbounded_send(Ok(watcher::Event::Delete(test_cm("b", "two", "1")))).unwrap();
        settle().await;
        assert_eq!(recorder.take(), vec!["update one 1->2", "delete two"]);
        assert_eq!(informer.list().len(), 1);
        assert!(informer.get("a", "one").is_some());
    }

    #[tokio::test]
    async fn test_relist_is_diffed_against_cache() {
        let (informer, tx) = channel_informer::<ConfigMap>(ResourceKind::PodMonitor);
        let recorder = Arc::new(Recorder::default());
        informer.add_handler(recorder.clone());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        informer.start(shutdown_rx).unwrap();

        send_list(&tx, vec![test_cm("a", "keep", "1"), test_cm("a", "gone", "1")]);
        assert!(informer.wait_for_sync(Duration::from_secs(1)).await);
        recorder.take();

        send_list(&tx, vec![test_cm("a", "keep", "3"), test_cm("a", "new", "1")]);
        settle().await;
        assert_eq!(
            recorder.take(),
            vec!["update keep 1->3", "add new", "delete gone"]
        );
    }

    #[tokio::test]
    async fn test_scope_filters_objects() {
        let (tx, rx) = mpsc::unbounded();
        let informer = Informer::<ConfigMap>::new(
            ResourceKind::Probe,
            rx.boxed(),
            NamespaceScope {
                allow: vec![],
                deny: vec!["kube-system".into()],
            },
            Duration::from_secs(300),
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        informer.start(shutdown_rx).unwrap();

        send_list(&tx, vec![test_cm("kube-system", "hidden", "1"), test_cm("app", "shown", "1")]);
        tx.unbounded_send(Ok(watcher::Event::Apply(test_cm("kube-system", "late", "1")))).unwrap();
        assert!(informer.wait_for_sync(Duration::from_secs(1)).await);
        settle().await;

        let names: Vec<String> = informer.list().iter().map(|cm| cm.name_any()).collect();
        assert_eq!(names, vec!["shown"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_sync_times_out() {
        let (informer, _tx) = channel_informer::<ConfigMap>(ResourceKind::ServiceMonitor);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        informer.start(shutdown_rx).unwrap();

        assert!(!informer.wait_for_sync(Duration::from_secs(15)).await);
        assert_eq!(informer.state(), SyncState::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_informer_can_still_sync() {
        let (informer, tx) = channel_informer::<ConfigMap>(ResourceKind::ServiceMonitor);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        informer.start(shutdown_rx).unwrap();
        assert!(!informer.wait_for_sync(Duration::from_secs(15)).await);

        send_list(&tx, vec![test_cm("a", "late", "1")]);
        assert!(informer.wait_for_sync(Duration::from_secs(1)).await);
        assert!(informer.has_synced());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_redispatches_updates() {
        let (informer, tx) = channel_informer::<ConfigMap>(ResourceKind::ServiceMonitor);
        let recorder = Arc::new(Recorder::default());
        informer.add_handler(recorder.clone());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        informer.start(shutdown_rx).unwrap();

        send_list(&tx, vec![test_cm("a", "one", "7")]);
        assert!(informer.wait_for_sync(Duration::from_secs(1)).await);
        recorder.take();

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(recorder.take(), vec!["update one 7->7"]);
    }

    #[tokio::test]
    async fn test_empty_informer_is_synced() {
        let informer = Informer::<ConfigMap>::empty(ResourceKind::ScrapeConfig);
        assert!(informer.has_synced());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        assert!(informer.start(shutdown_rx).is_none());
        assert!(informer.wait_for_sync(Duration::from_secs(1)).await);
        assert!(informer.list().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let (informer, _tx) = channel_informer::<ConfigMap>(ResourceKind::ServiceMonitor);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = informer.start(shutdown_rx).unwrap();
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
