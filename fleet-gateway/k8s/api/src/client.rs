use crate::{config::RestConfig, watch::WatchStream, Result};
use fleet_gateway_core::AccessRule;
use futures::prelude::*;
use k8s_openapi::api::authorization::v1::{SelfSubjectRulesReview, SelfSubjectRulesReviewSpec};
use kube::{
    api::{
        Api, ApiResource, DeleteParams, DynamicObject, ListParams, ObjectMeta, Patch, PatchParams,
        PostParams,
    },
    runtime::watcher,
};
use std::{sync::Arc, time::Duration};

/// The server-side watch timeout kube uses by default, in seconds.
const WATCH_TIMEOUT_SECS: u64 = 290;

/// Watches end this long before the client's read timeout would fire.
const WATCH_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// One page of a list response.
#[derive(Clone, Debug)]
pub struct ResourcePage<T> {
    pub items: Vec<T>,
    /// Set when the server has more items to return.
    pub continue_token: Option<String>,
}

/// A client for one cluster's API, acting as one identity.
///
/// Requests are untyped: the resource is described by an [`ApiResource`]
/// and objects travel as [`DynamicObject`]s. `namespace` is `None` for
/// cluster-scoped resources and for lists across all namespaces.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject>;

    /// Fetches only an object's metadata.
    async fn get_metadata(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<ObjectMeta>;

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<ResourcePage<DynamicObject>>;

    async fn list_metadata(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<ResourcePage<ObjectMeta>>;

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
        params: &PostParams,
    ) -> Result<DynamicObject>;

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        object: &DynamicObject,
        params: &PostParams,
    ) -> Result<DynamicObject>;

    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        params: &PatchParams,
        patch: &Patch<serde_json::Value>,
    ) -> Result<DynamicObject>;

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        params: &DeleteParams,
    ) -> Result<()>;

    /// Returns the rules the client's identity holds in `namespace`.
    async fn rules_review(&self, namespace: &str) -> Result<Vec<AccessRule>>;

    /// Watches every object of `resource` across all namespaces.
    fn watch(&self, resource: &ApiResource) -> WatchStream;
}

/// Builds clients from REST configurations.
pub trait ClientFactory: Send + Sync {
    fn client(&self, config: &RestConfig) -> Result<Arc<dyn ClusterClient>>;
}

#[derive(Clone)]
pub struct KubeClusterClient {
    client: kube::Client,
    watch_timeout: u32,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct KubeClientFactory;

// === impl KubeClusterClient ===

impl KubeClusterClient {
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            watch_timeout: WATCH_TIMEOUT_SECS as u32,
        }
    }

    /// Bounds each watch request so that the server closes it before
    /// `read_timeout` elapses on an idle stream.
    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.watch_timeout = watch_timeout(read_timeout);
        self
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject> {
        Ok(self.api(resource, namespace).get(name).await?)
    }

    async fn get_metadata(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<ObjectMeta> {
        let partial = self.api(resource, namespace).get_metadata(name).await?;
        Ok(partial.metadata)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<ResourcePage<DynamicObject>> {
        let list = self.api(resource, namespace).list(params).await?;
        Ok(ResourcePage {
            items: list.items,
            continue_token: list.metadata.continue_.filter(|c| !c.is_empty()),
        })
    }

    async fn list_metadata(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<ResourcePage<ObjectMeta>> {
        let list = self.api(resource, namespace).list_metadata(params).await?;
        Ok(ResourcePage {
            items: list.items.into_iter().map(|p| p.metadata).collect(),
            continue_token: list.metadata.continue_.filter(|c| !c.is_empty()),
        })
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
        params: &PostParams,
    ) -> Result<DynamicObject> {
        Ok(self.api(resource, namespace).create(params, object).await?)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        object: &DynamicObject,
        params: &PostParams,
    ) -> Result<DynamicObject> {
        Ok(self
            .api(resource, namespace)
            .replace(name, params, object)
            .await?)
    }

    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        params: &PatchParams,
        patch: &Patch<serde_json::Value>,
    ) -> Result<DynamicObject> {
        Ok(self
            .api(resource, namespace)
            .patch(name, params, patch)
            .await?)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        params: &DeleteParams,
    ) -> Result<()> {
        self.api(resource, namespace).delete(name, params).await?;
        Ok(())
    }

    async fn rules_review(&self, namespace: &str) -> Result<Vec<AccessRule>> {
        let review = SelfSubjectRulesReview {
            spec: SelfSubjectRulesReviewSpec {
                namespace: Some(namespace.to_string()),
            },
            ..Default::default()
        };
        let review = Api::<SelfSubjectRulesReview>::all(self.client.clone())
            .create(&PostParams::default(), &review)
            .await?;
        let rules = review
            .status
            .map(|s| s.resource_rules)
            .unwrap_or_default()
            .into_iter()
            .map(|r| AccessRule {
                api_groups: r.api_groups.unwrap_or_default(),
                resources: r.resources.unwrap_or_default(),
                verbs: r.verbs,
            })
            .collect();
        Ok(rules)
    }

    fn watch(&self, resource: &ApiResource) -> WatchStream {
        let api = Api::<DynamicObject>::all_with(self.client.clone(), resource);
        let config = watcher::Config::default().timeout(self.watch_timeout);
        watcher(api, config).boxed()
    }
}

// === impl KubeClientFactory ===

impl ClientFactory for KubeClientFactory {
    fn client(&self, config: &RestConfig) -> Result<Arc<dyn ClusterClient>> {
        let client = KubeClusterClient::new(config.client()?)
            .with_read_timeout(config.request_timeout());
        Ok(Arc::new(client))
    }
}

fn watch_timeout(read_timeout: Option<Duration>) -> u32 {
    let secs = match read_timeout {
        Some(timeout) => timeout.saturating_sub(WATCH_TIMEOUT_MARGIN).as_secs(),
        None => WATCH_TIMEOUT_SECS,
    };
    secs.clamp(1, WATCH_TIMEOUT_SECS) as u32
}
