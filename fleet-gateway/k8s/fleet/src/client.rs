use crate::{list, ClientPool, ClusteredList, ListOptions};
use ahash::AHashMap;
use fleet_gateway_k8s_api::{
    dynamic, ClusterClient, DeleteParams, Error, ListParams, Namespace, Patch, PatchParams,
    PostParams, Resource, ResourceExt, ResourcePage, Result,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Bounds each request made through a facade.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Typed access to a pool of cluster clients and the namespaces its
/// identity may use in each cluster.
///
/// Single-cluster operations name their cluster; [`Self::clustered_list`]
/// fans out across all of them.
#[derive(Clone, Debug)]
pub struct ClustersClient {
    pool: Arc<ClientPool>,
    namespaces: Arc<AHashMap<String, Vec<Namespace>>>,
    timeout: Duration,
}

impl ClustersClient {
    pub fn new(
        pool: ClientPool,
        namespaces: AHashMap<String, Vec<Namespace>>,
        timeout: Duration,
    ) -> Self {
        Self {
            pool: Arc::new(pool),
            namespaces: Arc::new(namespaces),
            timeout,
        }
    }

    pub fn pool(&self) -> &ClientPool {
        &self.pool
    }

    pub fn namespaces(&self) -> &AHashMap<String, Vec<Namespace>> {
        &self.namespaces
    }

    /// The untyped client for `cluster`.
    pub fn client(&self, cluster: &str) -> Result<&Arc<dyn ClusterClient>> {
        self.pool.client(cluster)
    }

    /// A facade restricted to `cluster`.
    pub fn scoped(&self, cluster: &str) -> Result<Self> {
        let pool = self.pool.only(cluster)?;
        let namespaces = self
            .namespaces
            .get(cluster)
            .map(|nss| (cluster.to_string(), nss.clone()))
            .into_iter()
            .collect();
        Ok(Self::new(pool, namespaces, self.timeout))
    }

    pub async fn get<K>(&self, cluster: &str, namespace: Option<&str>, name: &str) -> Result<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let resource = dynamic::api_resource::<K>();
        let client = self.pool.client(cluster)?;
        let object = self
            .bounded(cluster, client.get(&resource, namespace, name))
            .await?;
        dynamic::from_dynamic(&resource, object)
    }

    pub async fn list<K>(
        &self,
        cluster: &str,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<ResourcePage<K>>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let resource = dynamic::api_resource::<K>();
        let client = self.pool.client(cluster)?;
        let page = self
            .bounded(cluster, client.list(&resource, namespace, params))
            .await?;
        let items = page
            .items
            .into_iter()
            .map(|o| dynamic::from_dynamic(&resource, o))
            .collect::<Result<Vec<K>>>()?;
        Ok(ResourcePage {
            items,
            continue_token: page.continue_token,
        })
    }

    /// Creates `object` in the namespace named by its metadata.
    pub async fn create<K>(&self, cluster: &str, object: &K, params: &PostParams) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let resource = dynamic::api_resource::<K>();
        let client = self.pool.client(cluster)?;
        let dynamic = dynamic::to_dynamic(object)?;
        let created = self
            .bounded(
                cluster,
                client.create(&resource, object.meta().namespace.as_deref(), &dynamic, params),
            )
            .await?;
        dynamic::from_dynamic(&resource, created)
    }

    /// Replaces the object named by `object`'s metadata.
    pub async fn update<K>(&self, cluster: &str, object: &K, params: &PostParams) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let resource = dynamic::api_resource::<K>();
        let client = self.pool.client(cluster)?;
        let name = object.meta().name.clone().ok_or_else(|| {
            Error::InvalidConfig(format!("{} has no name", resource.kind))
        })?;
        let dynamic = dynamic::to_dynamic(object)?;
        let replaced = self
            .bounded(
                cluster,
                client.replace(
                    &resource,
                    object.meta().namespace.as_deref(),
                    &name,
                    &dynamic,
                    params,
                ),
            )
            .await?;
        dynamic::from_dynamic(&resource, replaced)
    }

    pub async fn patch<K>(
        &self,
        cluster: &str,
        namespace: Option<&str>,
        name: &str,
        params: &PatchParams,
        patch: &Patch<serde_json::Value>,
    ) -> Result<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let resource = dynamic::api_resource::<K>();
        let client = self.pool.client(cluster)?;
        let patched = self
            .bounded(
                cluster,
                client.patch(&resource, namespace, name, params, patch),
            )
            .await?;
        dynamic::from_dynamic(&resource, patched)
    }

    pub async fn delete<K>(
        &self,
        cluster: &str,
        namespace: Option<&str>,
        name: &str,
        params: &DeleteParams,
    ) -> Result<()>
    where
        K: Resource<DynamicType = ()>,
    {
        let resource = dynamic::api_resource::<K>();
        let client = self.pool.client(cluster)?;
        self.bounded(cluster, client.delete(&resource, namespace, name, params))
            .await
    }

    /// Lists across every cluster in the pool and, for namespaced
    /// resources, every namespace the identity may use there.
    pub async fn clustered_list<K>(
        &self,
        cancel: &CancellationToken,
        options: &ListOptions,
    ) -> Result<ClusteredList<K>>
    where
        K: DeserializeOwned,
    {
        list::clustered_list(&self.pool, &self.namespaces, self.timeout, cancel, options).await
    }

    async fn bounded<T>(&self, cluster: &str, request: impl Future<Output = Result<T>>) -> Result<T> {
        match time::timeout(self.timeout, request).await {
            Ok(result) => result.map_err(|e| e.for_cluster(cluster)),
            Err(_) => Err(Error::Timeout(self.timeout)),
        }
    }
}

/// Names of `namespaces`, for logging.
pub(crate) fn names(namespaces: &[Namespace]) -> Vec<String> {
    namespaces.iter().map(ResourceExt::name_any).collect()
}
