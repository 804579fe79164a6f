use fleet_gateway_core::{Cluster, UserPrincipal};
use fleet_gateway_k8s_api::{
    config::{self, ConfigOption},
    ClientFactory, ClusterClient, RestConfig, Result,
};
use std::sync::Arc;

/// A connection to one cluster.
///
/// A handle produces clients that act either as the cluster's own identity
/// (the server clients) or on behalf of a user. Handles compose: the
/// caching and read-cache variants wrap another handle.
#[async_trait::async_trait]
pub trait ClusterHandle: Send + Sync {
    fn name(&self) -> &str;

    fn host(&self) -> &str;

    /// The cluster's REST configuration, with options applied.
    fn server_config(&self) -> &RestConfig;

    /// The REST configuration acting on behalf of `principal`.
    fn user_config(&self, principal: &UserPrincipal) -> Result<RestConfig> {
        self.server_config().with_principal(principal)
    }

    async fn server_client(&self) -> Result<Arc<dyn ClusterClient>>;

    /// Fails with `InvalidPrincipal` when the principal has neither an
    /// identifier nor a token.
    async fn user_client(&self, principal: &UserPrincipal) -> Result<Arc<dyn ClusterClient>>;

    fn server_clientset(&self) -> Result<kube::Client> {
        self.server_config().client()
    }

    fn user_clientset(&self, principal: &UserPrincipal) -> Result<kube::Client> {
        self.user_config(principal)?.client()
    }
}

/// A handle that builds a fresh client on every call.
pub struct SingleCluster {
    name: String,
    host: String,
    config: RestConfig,
    clients: Arc<dyn ClientFactory>,
}

// === impl SingleCluster ===

impl SingleCluster {
    pub fn new(name: impl Into<String>, config: RestConfig, clients: Arc<dyn ClientFactory>) -> Self {
        let host = config.host();
        Self {
            name: name.into(),
            host,
            config,
            clients,
        }
    }

    /// Builds a handle for `cluster`, applying `options` to its REST
    /// configuration in order.
    pub async fn connect(
        cluster: &Cluster,
        options: &[Arc<dyn ConfigOption>],
        clients: Arc<dyn ClientFactory>,
    ) -> Result<Self> {
        let config = RestConfig::for_cluster(cluster)?;
        let config = config::apply_options(config, options).await?;
        Ok(Self::new(cluster.name.clone(), config, clients))
    }
}

#[async_trait::async_trait]
impl ClusterHandle for SingleCluster {
    fn name(&self) -> &str {
        &self.name
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn server_config(&self) -> &RestConfig {
        &self.config
    }

    async fn server_client(&self) -> Result<Arc<dyn ClusterClient>> {
        self.clients.client(&self.config)
    }

    async fn user_client(&self, principal: &UserPrincipal) -> Result<Arc<dyn ClusterClient>> {
        let config = self.user_config(principal)?;
        self.clients.client(&config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeFactory;
    use fleet_gateway_k8s_api::Error;

    #[tokio::test]
    async fn user_client_impersonates() {
        let factory = Arc::new(FakeFactory::default());
        let cluster = Cluster::new("a", "https://a:6443").with_token("T");
        let handle = SingleCluster::connect(&cluster, &config::default_options(), factory.clone())
            .await
            .expect("cluster must connect");
        assert_eq!(handle.name(), "a");

        handle
            .user_client(&UserPrincipal::new("alice", ["g1", "g2"]))
            .await
            .expect("valid principal");
        handle
            .user_client(&UserPrincipal::from_token("tok"))
            .await
            .expect("valid principal");

        let configs = factory.configs();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].impersonated_user(), Some("alice"));
        assert_eq!(configs[0].impersonated_groups(), ["g1", "g2"]);
        assert_eq!(configs[0].bearer_token(), Some("T"));
        assert_eq!(configs[1].bearer_token(), Some("tok"));
        assert_eq!(configs[1].impersonated_user(), None);
        assert!(configs[1].impersonated_groups().is_empty());
        assert_eq!(configs[0].connect_timeout(), Some(config::DIAL_TIMEOUT));
    }

    #[tokio::test]
    async fn invalid_principal_fails_fast() {
        let factory = Arc::new(FakeFactory::default());
        let cluster = Cluster::new("a", "https://a:6443");
        let handle = SingleCluster::connect(&cluster, &[], factory.clone())
            .await
            .expect("cluster must connect");
        let err = handle
            .user_client(&UserPrincipal::default())
            .await
            .err()
            .expect("principal is invalid");
        assert!(matches!(err, Error::InvalidPrincipal), "{err}");
        assert!(factory.configs().is_empty());
    }
}
