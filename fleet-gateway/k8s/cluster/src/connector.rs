use crate::{
    CachedCluster, ClientCaches, ClusterHandle, DelegatingCacheCluster, DelegatingOptions,
    SingleCluster,
};
use fleet_gateway_core::Cluster;
use fleet_gateway_k8s_api::{config, ClientFactory, ConfigOption, Result};
use std::sync::Arc;

/// Builds handles for fleet members.
#[async_trait::async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterHandle>>;
}

/// Connects leaf clusters through cached handles, optionally serving reads
/// from a [`DelegatingReadCache`](crate::DelegatingReadCache).
pub struct LeafConnector {
    clients: Arc<dyn ClientFactory>,
    caches: Arc<ClientCaches>,
    options: Vec<Arc<dyn ConfigOption>>,
    read_cache: Option<DelegatingOptions>,
}

// === impl LeafConnector ===

impl LeafConnector {
    pub fn new(clients: Arc<dyn ClientFactory>, caches: Arc<ClientCaches>) -> Self {
        Self {
            clients,
            caches,
            options: config::default_options(),
            read_cache: None,
        }
    }

    pub fn with_options(mut self, options: Vec<Arc<dyn ConfigOption>>) -> Self {
        self.options = options;
        self
    }

    pub fn with_read_cache(mut self, options: DelegatingOptions) -> Self {
        self.read_cache = Some(options);
        self
    }
}

#[async_trait::async_trait]
impl ClusterConnector for LeafConnector {
    async fn connect(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterHandle>> {
        let single = SingleCluster::connect(cluster, &self.options, self.clients.clone()).await?;
        let mut handle: Arc<dyn ClusterHandle> = Arc::new(single);
        if let Some(options) = &self.read_cache {
            handle = Arc::new(DelegatingCacheCluster::new(handle, options.clone()));
        }
        Ok(Arc::new(CachedCluster::new(handle, self.caches.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{object, FakeFactory};
    use fleet_gateway_core::UserPrincipal;
    use fleet_gateway_k8s_api::{dynamic::api_resource, Namespace};

    #[tokio::test]
    async fn caches_read_cached_clients() {
        let factory = Arc::new(FakeFactory::default());
        let namespaces = api_resource::<Namespace>();
        let fake = factory.cluster("https://a:6443");
        fake.add(&namespaces, object(&namespaces, None, "ns1"));

        let caches = Arc::new(ClientCaches::default());
        let connector = LeafConnector::new(factory.clone(), caches.clone())
            .with_read_cache(DelegatingOptions::default());
        let handle = connector
            .connect(&Cluster::new("a", "https://a:6443").with_token("T"))
            .await
            .expect("cluster must connect");

        let alice = UserPrincipal::new("alice", ["g"]);
        for _ in 0..3 {
            let client = handle.user_client(&alice).await.expect("valid principal");
            client
                .get(&namespaces, None, "ns1")
                .await
                .expect("namespace is cached");
        }
        assert_eq!(factory.configs().len(), 1);
        assert_eq!(fake.metadata_gets(), 1);
        assert_eq!(fake.watches(), 1);
        assert_eq!(caches.user_len(), 1);
    }
}
