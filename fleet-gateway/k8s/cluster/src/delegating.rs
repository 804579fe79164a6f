use crate::{
    informer::{self, InformerCache},
    ClusterHandle,
};
use ahash::AHashSet;
use fleet_gateway_core::{AccessRule, UserPrincipal};
use fleet_gateway_k8s_api::{
    watch::WatchStream, ApiResource, ClusterClient, DeleteParams, DynamicObject, Error,
    GroupVersionKind, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourcePage,
    RestConfig, Result,
};
use parking_lot::Mutex;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::debug;

pub const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct DelegatingOptions {
    /// Kinds that are always read from the live API.
    pub uncached: AHashSet<GroupVersionKind>,

    /// Kinds whose informers are started, and synced, before the cache is
    /// returned.
    pub preload: Vec<ApiResource>,

    pub sync_timeout: Duration,
}

/// A client that serves reads from informers.
///
/// Informers watch with the wrapped client's identity but do not enforce
/// that identity's permissions on later reads, so the first read of each
/// kind is checked against the live API with a metadata-only request.
/// Once a kind passes, further reads of it never reach the live API.
///
/// A probe answered with 403 makes the read come back empty (or not
/// found) without marking the kind, so the next read probes again.
pub struct DelegatingReadCache {
    live: Arc<dyn ClusterClient>,
    cache: InformerCache,
    checked: Mutex<AHashSet<GroupVersionKind>>,
    uncached: AHashSet<GroupVersionKind>,
}

/// Wraps every client of another handle in a [`DelegatingReadCache`].
pub struct DelegatingCacheCluster {
    inner: Arc<dyn ClusterHandle>,
    options: DelegatingOptions,
}

// === impl DelegatingOptions ===

impl Default for DelegatingOptions {
    fn default() -> Self {
        let uncached = [
            GroupVersionKind::gvk("", "v1", "Event"),
            GroupVersionKind::gvk("events.k8s.io", "v1", "Event"),
        ]
        .into_iter()
        .collect();
        Self {
            uncached,
            preload: Vec::new(),
            sync_timeout: SYNC_TIMEOUT,
        }
    }
}

// === impl DelegatingReadCache ===

impl DelegatingReadCache {
    /// Wraps `live`, returning once the preloaded informers have synced.
    pub async fn start(live: Arc<dyn ClusterClient>, options: &DelegatingOptions) -> Result<Self> {
        let cache = InformerCache::new(live.clone(), options.sync_timeout);
        cache.start(&options.preload).await?;
        Ok(Self {
            live,
            cache,
            checked: Mutex::new(AHashSet::new()),
            uncached: options.uncached.clone(),
        })
    }

    /// Returns false when the live API denies access to `gvk`.
    async fn probe(
        &self,
        gvk: GroupVersionKind,
        request: impl Future<Output = Result<()>>,
    ) -> Result<bool> {
        if self.checked.lock().contains(&gvk) {
            return Ok(true);
        }
        match request.await {
            Ok(()) => {
                self.checked.lock().insert(gvk);
                Ok(true)
            }
            Err(error) if error.is_forbidden() => {
                debug!(kind = %gvk.kind, %error, "Access denied");
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }
}

#[async_trait::async_trait]
impl ClusterClient for DelegatingReadCache {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject> {
        let gvk = informer::gvk(resource);
        if self.uncached.contains(&gvk) {
            return self.live.get(resource, namespace, name).await;
        }

        let probe = async {
            self.live
                .get_metadata(resource, namespace, name)
                .await
                .map(drop)
        };
        if !self.probe(gvk, probe).await? {
            return Err(Error::NotFound {
                kind: resource.kind.clone(),
                name: name.to_string(),
            });
        }
        self.cache.get(resource, namespace, name).await
    }

    async fn get_metadata(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<ObjectMeta> {
        self.live.get_metadata(resource, namespace, name).await
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<ResourcePage<DynamicObject>> {
        let gvk = informer::gvk(resource);
        let paginated = params.limit.is_some() || params.continue_token.is_some();
        if self.uncached.contains(&gvk) || params.field_selector.is_some() || paginated {
            return self.live.list(resource, namespace, params).await;
        }

        let probe_params = params.clone().limit(1);
        let probe = async {
            self.live
                .list_metadata(resource, namespace, &probe_params)
                .await
                .map(drop)
        };
        if !self.probe(gvk, probe).await? {
            return Ok(ResourcePage {
                items: Vec::new(),
                continue_token: None,
            });
        }
        self.cache.list(resource, namespace, params).await
    }

    async fn list_metadata(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<ResourcePage<ObjectMeta>> {
        self.live.list_metadata(resource, namespace, params).await
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
        params: &PostParams,
    ) -> Result<DynamicObject> {
        self.live.create(resource, namespace, object, params).await
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        object: &DynamicObject,
        params: &PostParams,
    ) -> Result<DynamicObject> {
        self.live
            .replace(resource, namespace, name, object, params)
            .await
    }

    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        params: &PatchParams,
        patch: &Patch<serde_json::Value>,
    ) -> Result<DynamicObject> {
        self.live
            .patch(resource, namespace, name, params, patch)
            .await
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        params: &DeleteParams,
    ) -> Result<()> {
        self.live.delete(resource, namespace, name, params).await
    }

    async fn rules_review(&self, namespace: &str) -> Result<Vec<AccessRule>> {
        self.live.rules_review(namespace).await
    }

    fn watch(&self, resource: &ApiResource) -> WatchStream {
        self.live.watch(resource)
    }
}

// === impl DelegatingCacheCluster ===

impl DelegatingCacheCluster {
    pub fn new(inner: Arc<dyn ClusterHandle>, options: DelegatingOptions) -> Self {
        Self { inner, options }
    }
}

#[async_trait::async_trait]
impl ClusterHandle for DelegatingCacheCluster {
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
        let live = self.inner.server_client().await?;
        Ok(Arc::new(DelegatingReadCache::start(live, &self.options).await?))
    }

    async fn user_client(&self, principal: &UserPrincipal) -> Result<Arc<dyn ClusterClient>> {
        let live = self.inner.user_client(principal).await?;
        Ok(Arc::new(DelegatingReadCache::start(live, &self.options).await?))
    }

    fn server_clientset(&self) -> Result<kube::Client> {
        self.inner.server_clientset()
    }

    fn user_clientset(&self, principal: &UserPrincipal) -> Result<kube::Client> {
        self.inner.user_clientset(principal)
    }
}

#[cfg(test)]
mod tests;
