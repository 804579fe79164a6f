use crate::{
    client::{self, REQUEST_TIMEOUT},
    ClientPool, ClustersClient, FleetMetrics, Subscribers, Subscription, SUBSCRIBER_CAPACITY,
};
use ahash::{AHashMap, AHashSet};
use fleet_gateway_k8s_cluster::{
    ClientCaches, ClusterConnector, ClusterFetcher, ClusterHandle, NamespaceChecker,
    CACHE_RESOLUTION,
};
use fleet_gateway_core::{Cluster, ClusterDiff, PrincipalKey, TtlCache, UserPrincipal};
use fleet_gateway_k8s_api::{dynamic, Error, ListParams, Namespace, PartialErrors, Result};
use futures::prelude::*;
use parking_lot::{Mutex, RwLock};
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex as AsyncMutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Timing of the manager's background work.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub fleet_refresh: Duration,
    pub namespace_refresh: Duration,
    pub user_namespace_ttl: Duration,
    pub cache_resolution: Duration,
    pub request_timeout: Duration,
    pub subscriber_capacity: usize,
}

/// The clusters currently in the fleet and their handles.
#[derive(Default)]
pub struct Fleet {
    clusters: Vec<Cluster>,
    handles: AHashMap<String, Arc<dyn ClusterHandle>>,
}

/// Tracks the fleet and the namespaces each user may reach in it, and hands
/// out clients for both the gateway's own identity and its users.
///
/// Cloning the manager is cheap; clones share state.
#[derive(Clone)]
pub struct ClustersManager {
    inner: Arc<Inner>,
}

type NamespaceIndex = AHashMap<String, Vec<Namespace>>;

struct Inner {
    fetcher: Arc<dyn ClusterFetcher>,
    connector: Arc<dyn ClusterConnector>,
    checker: Arc<dyn NamespaceChecker>,
    caches: Arc<ClientCaches>,
    config: ManagerConfig,

    fleet: RwLock<Arc<Fleet>>,
    cluster_namespaces: RwLock<Arc<NamespaceIndex>>,
    user_namespaces: Arc<TtlCache<(PrincipalKey, String), Vec<Namespace>>>,
    user_locks: Mutex<AHashMap<PrincipalKey, Weak<AsyncMutex<()>>>>,
    refresh: AsyncMutex<()>,

    subscribers: Subscribers,
    metrics: FleetMetrics,
    lifetime: Mutex<Option<Lifetime>>,
}

struct Lifetime {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

// === impl ManagerConfig ===

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            fleet_refresh: Duration::from_secs(30),
            namespace_refresh: Duration::from_secs(30),
            user_namespace_ttl: Duration::from_secs(30 * 60),
            cache_resolution: CACHE_RESOLUTION,
            request_timeout: REQUEST_TIMEOUT,
            subscriber_capacity: SUBSCRIBER_CAPACITY,
        }
    }
}

// === impl Fleet ===

impl Fleet {
    /// Clusters in the order the fetcher returned them.
    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.clusters.iter().map(|c| c.name.as_str())
    }

    pub fn handle(&self, cluster: &str) -> Option<&Arc<dyn ClusterHandle>> {
        self.handles.get(cluster)
    }

    pub fn handles(&self) -> impl Iterator<Item = (&str, &Arc<dyn ClusterHandle>)> {
        self.handles.iter().map(|(name, h)| (name.as_str(), h))
    }

    pub fn contains(&self, cluster: &str) -> bool {
        self.handles.contains_key(cluster)
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

// === impl ClustersManager ===

impl ClustersManager {
    pub fn new(
        fetcher: Arc<dyn ClusterFetcher>,
        connector: Arc<dyn ClusterConnector>,
        checker: Arc<dyn NamespaceChecker>,
        caches: Arc<ClientCaches>,
        config: ManagerConfig,
        metrics: FleetMetrics,
    ) -> Self {
        let user_namespaces = Arc::new(TtlCache::new(
            config.user_namespace_ttl,
            config.cache_resolution,
        ));
        Self {
            inner: Arc::new(Inner {
                fetcher,
                connector,
                checker,
                caches,
                subscribers: Subscribers::new(config.subscriber_capacity),
                config,
                fleet: Default::default(),
                cluster_namespaces: Default::default(),
                user_namespaces,
                user_locks: Default::default(),
                refresh: AsyncMutex::new(()),
                metrics,
                lifetime: Mutex::new(None),
            }),
        }
    }

    /// Spawns the fleet and namespace refresh loops and the cache sweepers.
    /// Does nothing if the manager is already running.
    pub fn start(&self) {
        let mut lifetime = self.inner.lifetime.lock();
        if lifetime.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let (loaded_tx, loaded_rx) = watch::channel(false);
        let mut tasks = vec![
            tokio::spawn(
                self.clone()
                    .fleet_loop(token.clone(), loaded_tx)
                    .instrument(info_span!("fleet")),
            ),
            tokio::spawn(
                self.clone()
                    .namespace_loop(token.clone(), loaded_rx)
                    .instrument(info_span!("namespaces")),
            ),
            self.inner.user_namespaces.spawn_sweeper(token.clone()),
        ];
        tasks.extend(self.inner.caches.spawn_sweepers(token.clone()));
        *lifetime = Some(Lifetime { token, tasks });
    }

    /// Stops the background loops and drops all cached clients and user
    /// namespaces. Facades already handed out keep working.
    pub async fn stop(&self) {
        let lifetime = self.inner.lifetime.lock().take();
        if let Some(Lifetime { token, tasks }) = lifetime {
            token.cancel();
            for task in tasks {
                if let Err(error) = task.await {
                    if error.is_panic() {
                        warn!(%error, "Background task panicked");
                    }
                }
            }
        }
        self.inner.caches.clear();
        self.inner.user_namespaces.clear();
        debug!("Stopped");
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.subscribers.subscribe()
    }

    /// The current fleet snapshot.
    pub fn fleet(&self) -> Arc<Fleet> {
        self.inner.fleet.read().clone()
    }

    /// Every namespace of every cluster, as last listed by the server
    /// clients.
    pub fn cluster_namespaces(&self) -> Arc<AHashMap<String, Vec<Namespace>>> {
        self.inner.cluster_namespaces.read().clone()
    }

    /// The namespaces `principal` may use, by cluster. Only clusters in the
    /// fleet appear, and only namespaces the cluster still has.
    pub fn user_namespaces(&self, principal: &UserPrincipal) -> AHashMap<String, Vec<Namespace>> {
        let (fleet, index) = self.snapshot();
        self.accessible(&fleet, &index, &principal.key())
    }

    /// Refetches the fleet, connecting new clusters and retiring removed
    /// ones, and notifies subscribers when membership changed.
    ///
    /// When the fetch fails the current fleet is kept.
    pub async fn update_clusters(&self) -> Result<ClusterDiff> {
        let _refresh = self.inner.refresh.lock().await;

        let fetched = match self.inner.fetcher.fetch().await {
            Ok(clusters) => clusters,
            Err(error) => {
                self.inner.metrics.fetch_failures.inc();
                return Err(Error::FetchFailed(Box::new(error)));
            }
        };

        let current = self.fleet();
        let mut seen = AHashSet::new();
        let mut keep = Vec::with_capacity(fetched.len());
        let mut connect = Vec::new();
        for cluster in fetched {
            if !seen.insert(cluster.name.clone()) {
                warn!(cluster = %cluster.name, "Ignoring duplicate cluster");
                continue;
            }
            let reusable = current
                .clusters
                .iter()
                .find(|c| c.name == cluster.name)
                .filter(|c| c.same_connection(&cluster))
                .and_then(|_| current.handles.get(&cluster.name));
            match reusable {
                Some(handle) => keep.push((cluster, Some(handle.clone()))),
                None => {
                    if current.contains(&cluster.name) {
                        debug!(cluster = %cluster.name, "Connection changed; evicting clients");
                        self.inner.caches.evict_cluster(&cluster.name);
                    }
                    connect.push(keep.len());
                    keep.push((cluster, None));
                }
            }
        }

        let connected = future::join_all(connect.into_iter().map(|i| {
            let cluster = keep[i].0.clone();
            let connector = self.inner.connector.clone();
            async move { (i, connector.connect(&cluster).await) }
        }))
        .await;
        for (i, result) in connected {
            match result {
                Ok(handle) => keep[i].1 = Some(handle),
                Err(error) => {
                    warn!(cluster = %keep[i].0.name, %error, "Failed to connect to cluster");
                }
            }
        }

        let mut clusters = Vec::with_capacity(keep.len());
        let mut handles = AHashMap::with_capacity(keep.len());
        for (cluster, handle) in keep {
            if let Some(handle) = handle {
                handles.insert(cluster.name.clone(), handle);
                clusters.push(cluster);
            }
        }

        let diff = ClusterDiff::between(&current.clusters, &clusters);
        for removed in &diff.removed {
            if !handles.contains_key(&removed.name) {
                self.inner.caches.evict_cluster(&removed.name);
            }
        }

        let next = Arc::new(Fleet { clusters, handles });
        self.inner.metrics.clusters.set(next.len() as i64);
        *self.inner.fleet.write() = next.clone();
        {
            let mut index = self.inner.cluster_namespaces.write();
            if index.keys().any(|name| !next.contains(name)) {
                let mut pruned = (**index).clone();
                pruned.retain(|name, _| next.contains(name));
                *index = Arc::new(pruned);
            }
        }

        if !diff.is_empty() {
            info!(
                added = ?diff.added.iter().map(|c| &c.name).collect::<Vec<_>>(),
                removed = ?diff.removed.iter().map(|c| &c.name).collect::<Vec<_>>(),
                "Fleet changed"
            );
            self.inner.metrics.updates.inc();
            let dropped = self.inner.subscribers.notify(&diff);
            if dropped > 0 {
                warn!(dropped, "Lagging subscribers missed a fleet update");
                self.inner.metrics.dropped_updates.inc_by(dropped as u64);
            }
        }
        Ok(diff)
    }

    /// Lists the namespaces of every cluster in the fleet with its server
    /// client.
    ///
    /// A cluster that fails keeps its previous namespaces; its error is
    /// returned in [`Error::Partial`] once every cluster has been tried.
    pub async fn update_namespaces(&self) -> Result<()> {
        let fleet = self.fleet();
        let resource = dynamic::api_resource::<Namespace>();
        let listed = future::join_all(fleet.handles().map(|(name, handle)| {
            let resource = &resource;
            async move {
                let result = async {
                    let client = handle.server_client().await?;
                    let page = client.list(resource, None, &ListParams::default()).await?;
                    page.items
                        .into_iter()
                        .map(|o| dynamic::from_dynamic::<Namespace>(resource, o))
                        .collect::<Result<Vec<_>>>()
                }
                .await
                .map_err(|e| e.for_cluster(name));
                (name, result)
            }
        }))
        .await;

        let previous = self.cluster_namespaces();
        let mut index = NamespaceIndex::with_capacity(listed.len());
        let mut errors = PartialErrors::default();
        for (name, result) in listed {
            match result {
                Ok(namespaces) => {
                    debug!(cluster = %name, namespaces = ?client::names(&namespaces), "Listed namespaces");
                    index.insert(name.to_string(), namespaces);
                }
                Err(error) => {
                    if error.is_forbidden() {
                        debug!(cluster = %name, %error, "Not permitted to list namespaces");
                    } else {
                        warn!(cluster = %name, %error, "Failed to list namespaces");
                        self.inner.metrics.namespace_failed(name);
                    }
                    if let Some(namespaces) = previous.get(name) {
                        index.insert(name.to_string(), namespaces.clone());
                    }
                    errors.push(name, None, error);
                }
            }
        }

        {
            // The fleet may have changed while listing.
            let fleet = self.inner.fleet.read();
            let mut current = self.inner.cluster_namespaces.write();
            index.retain(|name, _| fleet.contains(name));
            for (name, namespaces) in current.iter() {
                if fleet.contains(name) && !index.contains_key(name) {
                    index.insert(name.clone(), namespaces.clone());
                }
            }
            *current = Arc::new(index);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Partial(errors))
        }
    }

    /// Recomputes the namespaces `principal` may use in every cluster.
    pub async fn update_user_namespaces(&self, principal: &UserPrincipal) -> Result<()> {
        if !principal.is_valid() {
            return Err(Error::InvalidPrincipal);
        }
        let lock = self.user_lock(&principal.key());
        let _guard = lock.lock().await;
        self.refresh_user_namespaces(principal, false).await;
        Ok(())
    }

    /// A facade over user clients for every cluster in the fleet.
    pub async fn get_user_client(&self, principal: &UserPrincipal) -> Result<ClustersClient> {
        self.ensure_user_namespaces(principal).await?;

        let (fleet, index) = self.snapshot();
        let namespaces = self.accessible(&fleet, &index, &principal.key());
        let pool = ClientPool::for_user(&fleet, principal).await?;
        Ok(ClustersClient::new(
            pool,
            namespaces,
            self.inner.config.request_timeout,
        ))
    }

    /// A facade over the user client for one cluster.
    pub async fn get_user_client_for_cluster(
        &self,
        principal: &UserPrincipal,
        cluster: &str,
    ) -> Result<ClustersClient> {
        if !self.fleet().contains(cluster) {
            return Err(Error::NoSuchCluster(cluster.to_string()));
        }
        self.ensure_user_namespaces(principal).await?;

        let (fleet, index) = self.snapshot();
        let handle = fleet
            .handle(cluster)
            .ok_or_else(|| Error::NoSuchCluster(cluster.to_string()))?;
        let mut pool = ClientPool::default();
        pool.add(handle.as_ref(), principal).await?;
        let namespaces = self
            .accessible(&fleet, &index, &principal.key())
            .remove(cluster)
            .map(|nss| (cluster.to_string(), nss))
            .into_iter()
            .collect();
        Ok(ClustersClient::new(
            pool,
            namespaces,
            self.inner.config.request_timeout,
        ))
    }

    /// A facade over the gateway's own clients, seeing every namespace.
    pub async fn get_server_client(&self) -> Result<ClustersClient> {
        let (fleet, index) = self.snapshot();
        let pool = ClientPool::for_server(&fleet).await?;
        let namespaces = index
            .iter()
            .filter(|(name, _)| fleet.contains(name))
            .map(|(name, nss)| (name.clone(), nss.clone()))
            .collect();
        Ok(ClustersClient::new(
            pool,
            namespaces,
            self.inner.config.request_timeout,
        ))
    }

    /// Discovers the API groups `principal` can see in `cluster`.
    pub async fn discovery(
        &self,
        principal: &UserPrincipal,
        cluster: &str,
    ) -> Result<kube::Discovery> {
        let fleet = self.fleet();
        let handle = fleet
            .handle(cluster)
            .ok_or_else(|| Error::NoSuchCluster(cluster.to_string()))?;
        let client = handle.user_clientset(principal)?;
        kube::Discovery::new(client)
            .run()
            .await
            .map_err(|e| Error::from(e).for_cluster(cluster))
    }

    /// Reads the fleet and the namespace index together so that neither is
    /// newer than the other.
    fn snapshot(&self) -> (Arc<Fleet>, Arc<NamespaceIndex>) {
        let fleet = self.inner.fleet.read();
        let index = self.inner.cluster_namespaces.read();
        (fleet.clone(), index.clone())
    }

    fn accessible(
        &self,
        fleet: &Fleet,
        index: &NamespaceIndex,
        key: &PrincipalKey,
    ) -> AHashMap<String, Vec<Namespace>> {
        let mut accessible = AHashMap::new();
        for name in fleet.names() {
            let (Some(current), Some(allowed)) = (
                index.get(name),
                self.inner
                    .user_namespaces
                    .get(&(key.clone(), name.to_string())),
            ) else {
                continue;
            };
            let namespaces = allowed
                .into_iter()
                .filter(|ns| {
                    current
                        .iter()
                        .any(|c| c.metadata.name == ns.metadata.name)
                })
                .collect();
            accessible.insert(name.to_string(), namespaces);
        }
        accessible
    }

    /// Computes the user's namespaces for clusters that have none cached.
    async fn ensure_user_namespaces(&self, principal: &UserPrincipal) -> Result<()> {
        if !principal.is_valid() {
            return Err(Error::InvalidPrincipal);
        }
        let key = principal.key();
        let lock = self.user_lock(&key);
        let _guard = lock.lock().await;
        if self.missing_clusters(&key) {
            self.refresh_user_namespaces(principal, true).await;
        }
        Ok(())
    }

    fn missing_clusters(&self, key: &PrincipalKey) -> bool {
        let (fleet, index) = self.snapshot();
        let missing = fleet.names().any(|name| {
            index.contains_key(name)
                && self
                    .inner
                    .user_namespaces
                    .get(&(key.clone(), name.to_string()))
                    .is_none()
        });
        missing
    }

    /// Checks the user's access to each cluster's namespaces in parallel.
    /// A cluster that cannot be checked is left without an entry, so the
    /// user sees no namespaces there.
    async fn refresh_user_namespaces(&self, principal: &UserPrincipal, only_missing: bool) {
        let (fleet, index) = self.snapshot();
        let key = principal.key();
        self.inner.metrics.user_namespace_refreshes.inc();

        let checks = fleet.handles().filter_map(|(name, handle)| {
            let namespaces = index.get(name)?;
            let entry = (key.clone(), name.to_string());
            if only_missing && self.inner.user_namespaces.get(&entry).is_some() {
                return None;
            }
            Some(async move {
                let result = async {
                    let config = handle.user_config(principal)?;
                    self.inner
                        .checker
                        .filter_accessible(&config, namespaces)
                        .await
                }
                .await;
                (entry, result)
            })
        });

        for (entry, result) in future::join_all(checks).await {
            match result {
                Ok(accessible) => {
                    debug!(cluster = %entry.1, user = %principal, namespaces = ?client::names(&accessible), "Updated user namespaces");
                    self.inner.user_namespaces.insert(entry, accessible);
                }
                Err(error) => {
                    warn!(cluster = %entry.1, user = %principal, %error, "Failed to check namespace access");
                    self.inner.user_namespaces.remove(&entry);
                }
            }
        }
    }

    fn user_lock(&self, key: &PrincipalKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self.inner.user_locks.lock();
        if let Some(lock) = locks.get(key).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(key.clone(), Arc::downgrade(&lock));
        lock
    }

    async fn fleet_loop(self, token: CancellationToken, loaded: watch::Sender<bool>) {
        let mut interval = time::interval(self.inner.config.fleet_refresh);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            let update = tokio::select! {
                _ = token.cancelled() => break,
                update = self.update_clusters() => update,
            };
            if let Err(error) = update {
                warn!(%error, "Failed to refresh fleet; keeping current clusters");
            }
            loaded.send_replace(true);
        }
        debug!("Stopped");
    }

    async fn namespace_loop(self, token: CancellationToken, mut loaded: watch::Receiver<bool>) {
        let first_load = async move { loaded.wait_for(|loaded| *loaded).await.is_ok() };
        tokio::select! {
            _ = token.cancelled() => return,
            _ = first_load => {}
        }

        let mut interval = time::interval(self.inner.config.namespace_refresh);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            let update = tokio::select! {
                _ = token.cancelled() => break,
                update = self.update_namespaces() => update,
            };
            if let Err(error) = update {
                debug!(%error, "Namespace refresh incomplete");
            }
        }
        debug!("Stopped");
    }
}

impl std::fmt::Debug for ClustersManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClustersManager")
            .field("fleet", &self.fleet())
            .finish_non_exhaustive()
    }
}
