use crate::Fleet;
use ahash::AHashMap;
use fleet_gateway_k8s_cluster::ClusterHandle;
use fleet_gateway_core::UserPrincipal;
use fleet_gateway_k8s_api::{ClusterClient, Error, Result};
use futures::prelude::*;
use std::sync::Arc;

/// Clients for a set of clusters, keyed by cluster name, all acting as the
/// same identity.
#[derive(Clone, Default)]
pub struct ClientPool {
    clients: AHashMap<String, Arc<dyn ClusterClient>>,
}

impl ClientPool {
    /// Adds a client for `handle`'s cluster acting on behalf of `principal`.
    pub async fn add(&mut self, handle: &dyn ClusterHandle, principal: &UserPrincipal) -> Result<()> {
        let client = handle
            .user_client(principal)
            .await
            .map_err(|e| e.for_cluster(handle.name()))?;
        self.insert(handle.name(), client);
        Ok(())
    }

    pub fn insert(&mut self, cluster: impl Into<String>, client: Arc<dyn ClusterClient>) {
        self.clients.insert(cluster.into(), client);
    }

    pub fn clients(&self) -> &AHashMap<String, Arc<dyn ClusterClient>> {
        &self.clients
    }

    pub fn client(&self, cluster: &str) -> Result<&Arc<dyn ClusterClient>> {
        self.clients
            .get(cluster)
            .ok_or_else(|| Error::NoSuchCluster(cluster.to_string()))
    }

    pub fn contains(&self, cluster: &str) -> bool {
        self.clients.contains_key(cluster)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Builds user clients for every cluster in `fleet`. The first failure
    /// aborts the whole pool.
    pub(crate) async fn for_user(fleet: &Fleet, principal: &UserPrincipal) -> Result<Self> {
        let clients = future::try_join_all(fleet.handles().map(|(name, handle)| async move {
            let client = handle
                .user_client(principal)
                .await
                .map_err(|e| e.for_cluster(name))?;
            Ok::<_, Error>((name.to_string(), client))
        }))
        .await?;
        Ok(Self {
            clients: clients.into_iter().collect(),
        })
    }

    pub(crate) async fn for_server(fleet: &Fleet) -> Result<Self> {
        let clients = future::try_join_all(fleet.handles().map(|(name, handle)| async move {
            let client = handle.server_client().await.map_err(|e| e.for_cluster(name))?;
            Ok::<_, Error>((name.to_string(), client))
        }))
        .await?;
        Ok(Self {
            clients: clients.into_iter().collect(),
        })
    }

    /// A pool holding only `cluster`'s client.
    pub(crate) fn only(&self, cluster: &str) -> Result<Self> {
        let client = self.client(cluster)?.clone();
        let mut pool = Self::default();
        pool.insert(cluster, client);
        Ok(pool)
    }
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut clusters = self.clients.keys().collect::<Vec<_>>();
        clusters.sort();
        f.debug_struct("ClientPool")
            .field("clusters", &clusters)
            .finish()
    }
}
