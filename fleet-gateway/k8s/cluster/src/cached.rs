use crate::ClusterHandle;
use fleet_gateway_core::{PrincipalKey, TtlCache, UserPrincipal};
use fleet_gateway_k8s_api::{ClusterClient, Error, RestConfig, Result};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const CLIENT_TTL: Duration = Duration::from_secs(30 * 60);
pub const CACHE_RESOLUTION: Duration = Duration::from_secs(30);

/// The server and user client caches shared by every cached handle.
pub struct ClientCaches {
    server: Arc<TtlCache<String, Arc<dyn ClusterClient>>>,
    user: Arc<TtlCache<UserClientKey, Arc<dyn ClusterClient>>>,
    metrics: CacheMetrics,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UserClientKey {
    principal: PrincipalKey,
    cluster: String,
}

#[derive(Clone, Debug, Default)]
pub struct CacheMetrics {
    lookups: Family<CacheLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CacheLabels {
    cache: String,
    result: String,
}

/// Memoizes the clients of another handle.
///
/// A cached client is returned until it expires, even if the cluster's
/// credentials change in the meantime. Failures are never cached.
pub struct CachedCluster {
    inner: Arc<dyn ClusterHandle>,
    caches: Arc<ClientCaches>,
}

// === impl ClientCaches ===

impl ClientCaches {
    pub fn new(ttl: Duration, resolution: Duration) -> Self {
        Self {
            server: Arc::new(TtlCache::new(ttl, resolution)),
            user: Arc::new(TtlCache::new(ttl, resolution)),
            metrics: CacheMetrics::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: CacheMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn spawn_sweepers(&self, shutdown: CancellationToken) -> [JoinHandle<()>; 2] {
        [
            self.server.spawn_sweeper(shutdown.clone()),
            self.user.spawn_sweeper(shutdown),
        ]
    }

    /// Drops every client built for `cluster`.
    pub fn evict_cluster(&self, cluster: &str) {
        self.server.remove(&cluster.to_string());
        self.user.retain(|key, _| key.cluster != cluster);
    }

    pub fn clear(&self) {
        self.server.clear();
        self.user.clear();
    }

    pub fn server_len(&self) -> usize {
        self.server.len()
    }

    pub fn user_len(&self) -> usize {
        self.user.len()
    }
}

impl Default for ClientCaches {
    fn default() -> Self {
        Self::new(CLIENT_TTL, CACHE_RESOLUTION)
    }
}

// === impl CacheMetrics ===

impl CacheMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let lookups = Family::default();
        prom.register(
            "client_cache_lookups",
            "Count of client cache lookups by cache and result",
            lookups.clone(),
        );
        Self { lookups }
    }

    fn record(&self, cache: &str, hit: bool) {
        self.lookups
            .get_or_create(&CacheLabels {
                cache: cache.to_string(),
                result: if hit { "hit" } else { "miss" }.to_string(),
            })
            .inc();
    }
}

// === impl CachedCluster ===

impl CachedCluster {
    pub fn new(inner: Arc<dyn ClusterHandle>, caches: Arc<ClientCaches>) -> Self {
        Self { inner, caches }
    }
}

#[async_trait::async_trait]
impl ClusterHandle for CachedCluster {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn host(&self) -> &str {
        self.inner.host()
    }

    fn server_config(&self) -> &RestConfig {
        self.inner.server_config()
    }

    fn user_config(&self, principal: &UserPrincipal) -> Result<RestConfig> {
        self.inner.user_config(principal)
    }

    async fn server_client(&self) -> Result<Arc<dyn ClusterClient>> {
        let key = self.name().to_string();
        if let Some(client) = self.caches.server.get(&key) {
            self.caches.metrics.record("server", true);
            return Ok(client);
        }
        self.caches.metrics.record("server", false);

        let client = self.inner.server_client().await?;
        self.caches.server.insert(key, client.clone());
        Ok(client)
    }

    async fn user_client(&self, principal: &UserPrincipal) -> Result<Arc<dyn ClusterClient>> {
        if !principal.is_valid() {
            return Err(Error::InvalidPrincipal);
        }

        let key = UserClientKey {
            principal: principal.key(),
            cluster: self.name().to_string(),
        };
        if let Some(client) = self.caches.user.get(&key) {
            self.caches.metrics.record("user", true);
            return Ok(client);
        }
        self.caches.metrics.record("user", false);

        let client = self.inner.user_client(principal).await?;
        self.caches.user.insert(key, client.clone());
        Ok(client)
    }

    fn server_clientset(&self) -> Result<kube::Client> {
        self.inner.server_clientset()
    }

    fn user_clientset(&self, principal: &UserPrincipal) -> Result<kube::Client> {
        self.inner.user_clientset(principal)
    }
}
