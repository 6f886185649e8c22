//! Asset store — resolved credential material for scrape jobs.
//!
//! Entries are keyed by `(namespace, secret, key)` and created the first
//! time a monitor references them. Secret updates and deletions only
//! touch secrets that are already tracked, so the store never grows from
//! unrelated secret churn.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use tracing::debug;

use scrapegrid_core as prom;
use scrapegrid_crd::{
    BasicAuth, OAuth2, SafeAuthorization, SafeTlsConfig, SecretKeySelector, SecretOrConfigMap,
};

use crate::error::AssetError;
use crate::events::ChangeNotifier;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Where the store fetches secrets it has not seen yet.
pub trait SecretSource: Send + Sync {
    /// `Ok(None)` when the secret does not exist.
    fn get<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<Secret>, kube::Error>>;
}

/// Reads secrets from the cluster API.
pub struct KubeSecrets {
    client: kube::Client,
}

impl KubeSecrets {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

impl SecretSource for KubeSecrets {
    fn get<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<Secret>, kube::Error>> {
        Box::pin(async move {
            let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
            api.get_opt(name).await
        })
    }
}

/// In-memory secrets, for tests and offline rendering.
#[derive(Default)]
pub struct StaticSecrets {
    secrets: RwLock<BTreeMap<(String, String), Secret>>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, secret: Secret) {
        let key = (
            secret.metadata.namespace.clone().unwrap_or_default(),
            secret.metadata.name.clone().unwrap_or_default(),
        );
        self.secrets
            .write()
            .expect("secrets lock")
            .insert(key, secret);
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.secrets
            .write()
            .expect("secrets lock")
            .remove(&(namespace.to_string(), name.to_string()));
    }
}

impl SecretSource for StaticSecrets {
    fn get<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<Secret>, kube::Error>> {
        let secret = self
            .secrets
            .read()
            .expect("secrets lock")
            .get(&(namespace.to_string(), name.to_string()))
            .cloned();
        Box::pin(async move { Ok(secret) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct AssetKey {
    namespace: String,
    name: String,
    key: String,
}

impl AssetKey {
    fn new(namespace: &str, name: &str, key: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            key: key.to_string(),
        }
    }

    fn same_secret(&self, namespace: &str, name: &str) -> bool {
        self.namespace == namespace && self.name == name
    }
}

/// Fetch attempts before a value is served without being tracked.
const FETCH_ATTEMPTS: usize = 3;

type SecretId = (String, String);

fn secret_id(namespace: &str, name: &str) -> SecretId {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct AssetState {
    entries: BTreeMap<AssetKey, String>,
    /// Secrets with a fetch in progress: `(generation, fetchers)`. Any
    /// update or deletion of such a secret bumps its generation.
    in_flight: BTreeMap<SecretId, (u64, usize)>,
}

impl AssetState {
    fn begin_fetch(&mut self, secret: &SecretId) -> u64 {
        let slot = self.in_flight.entry(secret.clone()).or_insert((0, 0));
        slot.1 += 1;
        slot.0
    }

    fn end_fetch(&mut self, secret: &SecretId) {
        if let Some(slot) = self.in_flight.get_mut(secret) {
            slot.1 -= 1;
            if slot.1 == 0 {
                self.in_flight.remove(secret);
            }
        }
    }

    fn generation(&self, secret: &SecretId) -> u64 {
        self.in_flight.get(secret).map_or(0, |slot| slot.0)
    }

    fn invalidate(&mut self, namespace: &str, name: &str) {
        if let Some(slot) = self.in_flight.get_mut(&secret_id(namespace, name)) {
            slot.0 += 1;
        }
    }
}

/// Registration of one in-progress fetch; released on drop so a cancelled
/// resolve does not pin the entry.
struct InFlight<'a> {
    state: &'a RwLock<AssetState>,
    secret: SecretId,
    generation: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.write() {
            state.end_fetch(&self.secret);
        }
    }
}

/// Cache of resolved secret values.
pub struct AssetStore {
    source: Arc<dyn SecretSource>,
    state: RwLock<AssetState>,
    notifier: ChangeNotifier,
}

impl AssetStore {
    pub fn new(source: Arc<dyn SecretSource>, notifier: ChangeNotifier) -> Self {
        Self {
            source,
            state: RwLock::new(AssetState::default()),
            notifier,
        }
    }

    /// Value of one secret key, fetched and tracked on first use.
    ///
    /// A fetch that races with an update or deletion of the same secret is
    /// discarded and retried, so a deleted secret is never tracked.
    pub async fn resolve(
        &self,
        namespace: &str,
        selector: &SecretKeySelector,
    ) -> Result<String, AssetError> {
        let asset_key = AssetKey::new(namespace, &selector.name, &selector.key);
        for _ in 0..FETCH_ATTEMPTS {
            let in_flight = {
                let mut state = self.state.write().expect("assets lock");
                if let Some(value) = state.entries.get(&asset_key) {
                    return Ok(value.clone());
                }
                let secret = secret_id(namespace, &selector.name);
                let generation = state.begin_fetch(&secret);
                InFlight {
                    state: &self.state,
                    secret,
                    generation,
                }
            };

            // Fetch without holding the lock.
            let value = self.fetch(namespace, selector).await?;
            if self.track_if_current(&in_flight, &asset_key, &value) {
                debug!(namespace, secret = %selector.name, key = %selector.key, "tracking secret key");
                return Ok(value);
            }
            debug!(namespace, secret = %selector.name, "secret changed while fetching, retrying");
        }

        // Still churning: serve the latest read, the next load tracks it.
        self.fetch(namespace, selector).await
    }

    async fn fetch(&self, namespace: &str, selector: &SecretKeySelector) -> Result<String, AssetError> {
        let secret = self
            .source
            .get(namespace, &selector.name)
            .await
            .map_err(|source| AssetError::Fetch {
                namespace: namespace.to_string(),
                name: selector.name.clone(),
                source,
            })?
            .ok_or_else(|| AssetError::SecretNotFound {
                namespace: namespace.to_string(),
                name: selector.name.clone(),
            })?;
        secret_value(&secret, namespace, &selector.name, &selector.key)
    }

    fn track_if_current(&self, in_flight: &InFlight<'_>, key: &AssetKey, value: &str) -> bool {
        let mut state = self.state.write().expect("assets lock");
        if state.generation(&in_flight.secret) != in_flight.generation {
            return false;
        }
        state.entries.insert(key.clone(), value.to_string());
        true
    }

    /// Whether any key of `namespace/name` is tracked.
    pub fn is_tracked(&self, namespace: &str, name: &str) -> bool {
        self.state
            .read()
            .expect("assets lock")
            .entries
            .keys()
            .any(|k| k.same_secret(namespace, name))
    }

    /// Refresh tracked keys from a new version of the secret.
    ///
    /// Returns `true`, and notifies, only when a tracked value changed.
    /// Untracked secrets only invalidate fetches in progress.
    pub fn update(&self, secret: &Secret) -> bool {
        let (Some(namespace), Some(name)) = (
            secret.metadata.namespace.as_deref(),
            secret.metadata.name.as_deref(),
        ) else {
            return false;
        };

        {
            let mut state = self.state.write().expect("assets lock");
            state.invalidate(namespace, name);
            let tracked: Vec<AssetKey> = state
                .entries
                .keys()
                .filter(|k| k.same_secret(namespace, name))
                .cloned()
                .collect();
            let mut changed = false;
            for key in tracked {
                match secret_value(secret, namespace, name, &key.key) {
                    Ok(value) => {
                        if state.entries.get(&key) != Some(&value) {
                            state.entries.insert(key, value);
                            changed = true;
                        }
                    }
                    Err(_) => {
                        state.entries.remove(&key);
                        changed = true;
                    }
                }
            }
            if !changed {
                return false;
            }
        }

        debug!(namespace, secret = name, "tracked secret updated");
        self.notifier.notify();
        true
    }

    /// Forget a deleted secret. Returns `false` for untracked secrets.
    pub fn remove(&self, namespace: &str, name: &str) -> bool {
        {
            let mut state = self.state.write().expect("assets lock");
            state.invalidate(namespace, name);
            let before = state.entries.len();
            state.entries.retain(|k, _| !k.same_secret(namespace, name));
            if state.entries.len() == before {
                return false;
            }
        }

        debug!(namespace, secret = name, "tracked secret removed");
        self.notifier.notify();
        true
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.state.read().expect("assets lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Credential helpers ──────────────────────────────────────────

    pub async fn basic_auth(
        &self,
        namespace: &str,
        auth: &BasicAuth,
    ) -> Result<prom::BasicAuth, AssetError> {
        let username = match &auth.username {
            Some(sel) => self.resolve(namespace, sel).await?,
            None => String::new(),
        };
        let password = match &auth.password {
            Some(sel) => Some(self.resolve(namespace, sel).await?),
            None => None,
        };
        Ok(prom::BasicAuth { username, password })
    }

    pub async fn bearer_token(
        &self,
        namespace: &str,
        selector: &SecretKeySelector,
    ) -> Result<prom::Authorization, AssetError> {
        let token = self.resolve(namespace, selector).await?;
        Ok(prom::Authorization::bearer(token))
    }

    pub async fn authorization(
        &self,
        namespace: &str,
        auth: &SafeAuthorization,
    ) -> Result<prom::Authorization, AssetError> {
        let credentials = match &auth.credentials {
            Some(sel) => Some(self.resolve(namespace, sel).await?),
            None => None,
        };
        Ok(prom::Authorization {
            auth_type: Some(auth.auth_type.clone().unwrap_or_else(|| "Bearer".to_string())),
            credentials,
        })
    }

    pub async fn tls_config(
        &self,
        namespace: &str,
        tls: &SafeTlsConfig,
    ) -> Result<prom::TlsConfig, AssetError> {
        let ca = match &tls.ca {
            Some(r) => Some(self.secret_or_config_map(namespace, r).await?),
            None => None,
        };
        let cert = match &tls.cert {
            Some(r) => Some(self.secret_or_config_map(namespace, r).await?),
            None => None,
        };
        let key = match &tls.key_secret {
            Some(sel) => Some(self.resolve(namespace, sel).await?),
            None => None,
        };
        Ok(prom::TlsConfig {
            ca,
            cert,
            key,
            server_name: tls.server_name.clone(),
            insecure_skip_verify: tls.insecure_skip_verify,
            ..Default::default()
        })
    }

    pub async fn oauth2(
        &self,
        namespace: &str,
        oauth2: &OAuth2,
    ) -> Result<prom::OAuth2, AssetError> {
        let client_id = self.secret_or_config_map(namespace, &oauth2.client_id).await?;
        let client_secret = self.resolve(namespace, &oauth2.client_secret).await?;
        Ok(prom::OAuth2 {
            client_id,
            client_secret: Some(client_secret),
            token_url: oauth2.token_url.clone(),
            scopes: oauth2.scopes.clone(),
            endpoint_params: oauth2.endpoint_params.clone(),
        })
    }

    async fn secret_or_config_map(
        &self,
        namespace: &str,
        reference: &SecretOrConfigMap,
    ) -> Result<String, AssetError> {
        match (&reference.secret, &reference.config_map) {
            (Some(sel), _) => self.resolve(namespace, sel).await,
            (None, Some(cm)) => Err(AssetError::ConfigMapUnsupported {
                namespace: namespace.to_string(),
                name: cm.name.clone(),
            }),
            (None, None) => Err(AssetError::EmptyReference),
        }
    }
}

/// Read `key` from `data`, falling back to `stringData`.
fn secret_value(
    secret: &Secret,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<String, AssetError> {
    if let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return String::from_utf8(bytes.0.clone()).map_err(|_| AssetError::NotUtf8 {
            namespace: namespace.to_string(),
            name: name.to_string(),
            key: key.to_string(),
        });
    }
    if let Some(value) = secret.string_data.as_ref().and_then(|d| d.get(key)) {
        return Ok(value.clone());
    }
    Err(AssetError::KeyNotFound {
        namespace: namespace.to_string(),
        name: name.to_string(),
        key: key.to_string(),
    })
}
