//! In-memory object stores fed by watches.

use ahash::AHashMap;
use fleet_gateway_k8s_api::{
    ApiResource, ClusterClient, DynamicObject, Error, GroupVersionKind, ListParams, ResourceExt,
    ResourcePage, Result, Watch,
};
use futures::prelude::*;
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time};
use tracing::{debug, info_span};

/// Watches resources on demand and serves reads from the watched state.
pub(crate) struct InformerCache {
    source: Arc<dyn ClusterClient>,
    informers: Mutex<AHashMap<GroupVersionKind, Arc<Informer>>>,
    sync_timeout: Duration,
}

struct Informer {
    store: Store<DynamicObject>,
    task: JoinHandle<()>,
}

pub(crate) fn gvk(resource: &ApiResource) -> GroupVersionKind {
    GroupVersionKind::gvk(&resource.group, &resource.version, &resource.kind)
}

// === impl InformerCache ===

impl InformerCache {
    pub(crate) fn new(source: Arc<dyn ClusterClient>, sync_timeout: Duration) -> Self {
        Self {
            source,
            informers: Mutex::new(AHashMap::new()),
            sync_timeout,
        }
    }

    /// Starts informers for `resources` and waits for all of them to sync.
    pub(crate) async fn start(&self, resources: &[ApiResource]) -> Result<()> {
        for resource in resources {
            self.informer(resource).await?;
        }
        Ok(())
    }

    pub(crate) async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject> {
        let informer = self.informer(resource).await?;
        let mut key = ObjectRef::<DynamicObject>::new_with(name, resource.clone());
        if let Some(ns) = namespace {
            key = key.within(ns);
        }
        let object = informer.store.get(&key);
        object
            .map(|obj| DynamicObject::clone(&obj))
            .ok_or_else(|| Error::NotFound {
                kind: resource.kind.clone(),
                name: match namespace {
                    Some(ns) => format!("{ns}/{name}"),
                    None => name.to_string(),
                },
            })
    }

    /// Lists cached objects, ordered by namespace and name.
    ///
    /// Only label selectors are honored; callers route field selectors and
    /// paginated requests elsewhere.
    pub(crate) async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<ResourcePage<DynamicObject>> {
        let selector = match params.label_selector.as_deref() {
            Some(s) => crate::selector::Selector::parse(s)?,
            None => crate::selector::Selector::default(),
        };
        let informer = self.informer(resource).await?;
        let mut items = informer
            .store
            .state()
            .into_iter()
            .filter(|obj| namespace.is_none() || obj.namespace().as_deref() == namespace)
            .filter(|obj| selector.matches(obj.labels()))
            .map(|obj| DynamicObject::clone(&obj))
            .collect::<Vec<_>>();
        items.sort_by_key(|obj| (obj.namespace(), obj.name_any()));
        Ok(ResourcePage {
            items,
            continue_token: None,
        })
    }

    async fn informer(&self, resource: &ApiResource) -> Result<Arc<Informer>> {
        let gvk = gvk(resource);
        let informer = self
            .informers
            .lock()
            .entry(gvk.clone())
            .or_insert_with(|| Arc::new(Informer::spawn(&*self.source, resource)))
            .clone();

        if !informer.wait_synced(self.sync_timeout).await {
            let mut informers = self.informers.lock();
            if informers
                .get(&gvk)
                .is_some_and(|i| Arc::ptr_eq(i, &informer))
            {
                informers.remove(&gvk);
            }
            return Err(Error::CacheSyncFailed(resource.kind.clone()));
        }
        Ok(informer)
    }
}

// === impl Informer ===

impl Informer {
    fn spawn(source: &dyn ClusterClient, resource: &ApiResource) -> Self {
        let writer = Writer::<DynamicObject>::new(resource.clone());
        let store = writer.as_reader();
        let span = info_span!("informer", kind = %resource.kind, group = %resource.group);
        let events = reflector::reflector(writer, source.watch(resource)).boxed();
        let task = tokio::spawn(Self::run(Watch::new(events).instrument(span)));
        Self { store, task }
    }

    /// Drives the reflector, which applies each event to the store.
    async fn run(mut watch: Watch) {
        while watch.recv().await.is_some() {}
        debug!("Watch ended");
    }

    async fn wait_synced(&self, timeout: Duration) -> bool {
        let ready = time::timeout(timeout, self.store.wait_until_ready()).await;
        matches!(ready, Ok(Ok(())))
    }
}

impl Drop for Informer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
