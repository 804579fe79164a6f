//! In-memory stand-ins for cluster APIs and fleet sources.

use crate::ClusterFetcher;
use ahash::{AHashMap, AHashSet};
use fleet_gateway_core::{AccessRule, Cluster};
use fleet_gateway_k8s_api::{
    api_error, watch::WatchStream, ApiResource, ClientFactory, ClusterClient, DeleteParams,
    DynamicObject, Event, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt,
    ResourcePage, RestConfig, Result,
};
use futures::prelude::*;
use kube::runtime::watcher;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// A cluster API backed by a list of objects.
#[derive(Default)]
pub struct FakeClient {
    objects: Mutex<Vec<(Kind, DynamicObject)>>,
    rules: Mutex<AHashMap<String, Vec<AccessRule>>>,
    failure: Mutex<Option<u16>>,
    forbidden: Mutex<AHashSet<String>>,
    delay: Mutex<Option<Duration>>,
    counts: Counts,
}

#[derive(Default)]
struct Counts {
    gets: AtomicUsize,
    metadata_gets: AtomicUsize,
    lists: AtomicUsize,
    metadata_lists: AtomicUsize,
    rules_reviews: AtomicUsize,
    watches: AtomicUsize,
}

type Kind = (String, String);

/// Hands out one [`FakeClient`] per cluster host, recording every
/// configuration it is asked to build a client for.
#[derive(Default)]
pub struct FakeFactory {
    clusters: Mutex<AHashMap<String, Arc<FakeClient>>>,
    configs: Mutex<Vec<RestConfig>>,
}

/// A fleet source whose answer is set by the test.
pub struct FakeFetcher {
    clusters: Mutex<std::result::Result<Vec<Cluster>, String>>,
    fetches: AtomicUsize,
}

fn kind_of(resource: &ApiResource) -> Kind {
    (resource.group.clone(), resource.kind.clone())
}

fn host_key(host: &str) -> String {
    host.trim_end_matches('/').to_string()
}

// === impl FakeClient ===

impl FakeClient {
    pub fn add(&self, resource: &ApiResource, object: DynamicObject) {
        self.objects.lock().push((kind_of(resource), object));
    }

    pub fn remove(&self, resource: &ApiResource, namespace: Option<&str>, name: &str) {
        let kind = kind_of(resource);
        self.objects.lock().retain(|(k, o)| {
            !(*k == kind && o.metadata.namespace.as_deref() == namespace && o.name_any() == name)
        });
    }

    pub fn set_rules(&self, namespace: &str, rules: Vec<AccessRule>) {
        self.rules.lock().insert(namespace.to_string(), rules);
    }

    /// Every subsequent request fails with an API error carrying `code`.
    pub fn fail_with(&self, code: u16) {
        *self.failure.lock() = Some(code);
    }

    pub fn clear_failure(&self) {
        *self.failure.lock() = None;
    }

    /// Requests for `kind` are answered with 403.
    pub fn forbid(&self, kind: &str) {
        self.forbidden.lock().insert(kind.to_string());
    }

    /// Every subsequent request waits for `delay` before being answered.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn gets(&self) -> usize {
        self.counts.gets.load(Ordering::SeqCst)
    }

    pub fn metadata_gets(&self) -> usize {
        self.counts.metadata_gets.load(Ordering::SeqCst)
    }

    pub fn lists(&self) -> usize {
        self.counts.lists.load(Ordering::SeqCst)
    }

    pub fn metadata_lists(&self) -> usize {
        self.counts.metadata_lists.load(Ordering::SeqCst)
    }

    pub fn rules_reviews(&self) -> usize {
        self.counts.rules_reviews.load(Ordering::SeqCst)
    }

    pub fn watches(&self) -> usize {
        self.counts.watches.load(Ordering::SeqCst)
    }

    async fn respond(&self, kind: Option<&str>) -> Result<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(code) = *self.failure.lock() {
            return Err(api_error(code, "InternalError", "injected failure"));
        }
        if let Some(kind) = kind {
            if self.forbidden.lock().contains(kind) {
                return Err(api_error(403, "Forbidden", format!("{kind} is forbidden")));
            }
        }
        Ok(())
    }

    fn find(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject> {
        let kind = kind_of(resource);
        self.objects
            .lock()
            .iter()
            .find(|(k, o)| {
                *k == kind && o.metadata.namespace.as_deref() == namespace && o.name_any() == name
            })
            .map(|(_, o)| o.clone())
            .ok_or_else(|| api_error(404, "NotFound", format!("{} {name} not found", resource.kind)))
    }

    fn page(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<ResourcePage<DynamicObject>> {
        let kind = kind_of(resource);
        let items = self
            .objects
            .lock()
            .iter()
            .filter(|(k, o)| {
                *k == kind && (namespace.is_none() || o.metadata.namespace.as_deref() == namespace)
            })
            .map(|(_, o)| o.clone())
            .collect::<Vec<_>>();

        let start = match params.continue_token.as_deref() {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| api_error(410, "Expired", "invalid continue token"))?,
            None => 0,
        };
        let end = match params.limit {
            Some(limit) => (start + limit as usize).min(items.len()),
            None => items.len(),
        };
        let continue_token = (end < items.len()).then(|| end.to_string());
        let items = items.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
        Ok(ResourcePage {
            items,
            continue_token,
        })
    }
}

#[async_trait::async_trait]
impl ClusterClient for FakeClient {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject> {
        self.counts.gets.fetch_add(1, Ordering::SeqCst);
        self.respond(Some(&resource.kind)).await?;
        self.find(resource, namespace, name)
    }

    async fn get_metadata(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<ObjectMeta> {
        self.counts.metadata_gets.fetch_add(1, Ordering::SeqCst);
        self.respond(Some(&resource.kind)).await?;
        self.find(resource, namespace, name).map(|o| o.metadata)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<ResourcePage<DynamicObject>> {
        self.counts.lists.fetch_add(1, Ordering::SeqCst);
        self.respond(Some(&resource.kind)).await?;
        self.page(resource, namespace, params)
    }

    async fn list_metadata(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<ResourcePage<ObjectMeta>> {
        self.counts.metadata_lists.fetch_add(1, Ordering::SeqCst);
        self.respond(Some(&resource.kind)).await?;
        let page = self.page(resource, namespace, params)?;
        Ok(ResourcePage {
            items: page.items.into_iter().map(|o| o.metadata).collect(),
            continue_token: page.continue_token,
        })
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
        _: &PostParams,
    ) -> Result<DynamicObject> {
        self.respond(Some(&resource.kind)).await?;
        let name = object.name_any();
        if self.find(resource, namespace, &name).is_ok() {
            return Err(api_error(409, "AlreadyExists", format!("{name} already exists")));
        }
        let mut object = object.clone();
        object.metadata.namespace = namespace.map(ToString::to_string);
        self.add(resource, object.clone());
        Ok(object)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        object: &DynamicObject,
        _: &PostParams,
    ) -> Result<DynamicObject> {
        self.respond(Some(&resource.kind)).await?;
        self.find(resource, namespace, name)?;
        self.remove(resource, namespace, name);
        let mut object = object.clone();
        object.metadata.namespace = namespace.map(ToString::to_string);
        self.add(resource, object.clone());
        Ok(object)
    }

    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        _: &PatchParams,
        patch: &Patch<serde_json::Value>,
    ) -> Result<DynamicObject> {
        self.respond(Some(&resource.kind)).await?;
        let mut object = self.find(resource, namespace, name)?;
        if let Patch::Merge(serde_json::Value::Object(fields)) = patch {
            if let serde_json::Value::Object(data) = &mut object.data {
                for (k, v) in fields {
                    if k != "metadata" {
                        data.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        self.remove(resource, namespace, name);
        self.add(resource, object.clone());
        Ok(object)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        _: &DeleteParams,
    ) -> Result<()> {
        self.respond(Some(&resource.kind)).await?;
        self.find(resource, namespace, name)?;
        self.remove(resource, namespace, name);
        Ok(())
    }

    async fn rules_review(&self, namespace: &str) -> Result<Vec<AccessRule>> {
        self.counts.rules_reviews.fetch_add(1, Ordering::SeqCst);
        self.respond(None).await?;
        Ok(self.rules.lock().get(namespace).cloned().unwrap_or_default())
    }

    fn watch(&self, resource: &ApiResource) -> WatchStream {
        self.counts.watches.fetch_add(1, Ordering::SeqCst);
        if self.failure.lock().is_some() {
            return stream::pending().boxed();
        }
        let kind = kind_of(resource);
        let mut events = vec![Event::Init];
        events.extend(
            self.objects
                .lock()
                .iter()
                .filter(|(k, _)| *k == kind)
                .map(|(_, o)| Event::InitApply(o.clone())),
        );
        events.push(Event::InitDone);
        stream::iter(events.into_iter().map(Ok::<_, watcher::Error>))
            .chain(stream::pending())
            .boxed()
    }
}

// === impl FakeFactory ===

impl FakeFactory {
    /// The client serving `host`, created on first use.
    pub fn cluster(&self, host: &str) -> Arc<FakeClient> {
        self.clusters
            .lock()
            .entry(host_key(host))
            .or_default()
            .clone()
    }

    pub fn configs(&self) -> Vec<RestConfig> {
        self.configs.lock().clone()
    }

    pub fn clear_configs(&self) {
        self.configs.lock().clear();
    }
}

impl ClientFactory for FakeFactory {
    fn client(&self, config: &RestConfig) -> Result<Arc<dyn ClusterClient>> {
        self.configs.lock().push(config.clone());
        Ok(self.cluster(&config.host()))
    }
}

// === impl FakeFetcher ===

impl FakeFetcher {
    pub fn new(clusters: Vec<Cluster>) -> Self {
        Self {
            clusters: Mutex::new(Ok(clusters)),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, clusters: Vec<Cluster>) {
        *self.clusters.lock() = Ok(clusters);
    }

    pub fn fail(&self, message: impl Into<String>) {
        *self.clusters.lock() = Err(message.into());
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ClusterFetcher for FakeFetcher {
    async fn fetch(&self) -> Result<Vec<Cluster>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.clusters
            .lock()
            .clone()
            .map_err(|message| api_error(500, "InternalError", message))
    }
}

/// Builds an object of `resource` for seeding a [`FakeClient`].
pub fn object(resource: &ApiResource, namespace: Option<&str>, name: &str) -> DynamicObject {
    let object = DynamicObject::new(name, resource);
    match namespace {
        Some(ns) => object.within(ns),
        None => object,
    }
}
