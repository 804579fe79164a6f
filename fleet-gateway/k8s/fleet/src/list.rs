//! Concurrent list fan-out across a pool's clusters and namespaces.

use crate::ClientPool;
use ahash::AHashMap;
use base64::{engine::general_purpose::STANDARD, Engine};
use fleet_gateway_k8s_api::{
    dynamic, ApiResource, DynamicObject, Error, ListParams, Namespace, PartialErrors, Resource,
    ResourceExt, ResourcePage, Result,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};
use tokio::{
    task::{JoinError, JoinSet},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What to list and how.
#[derive(Clone, Debug)]
pub struct ListOptions {
    pub resource: ApiResource,
    pub params: ListParams,
    /// When false, one task per cluster lists a cluster-scoped resource.
    pub namespaced: bool,
}

/// Per-cluster results of a fan-out list.
///
/// Clusters with at least one successful page appear in `lists`. Failures
/// are collected in `error` as [`Error::Partial`], or [`Error::Cancelled`]
/// when the caller gave up first.
#[derive(Debug)]
pub struct ClusteredList<K> {
    lists: BTreeMap<String, Vec<K>>,
    continue_token: Option<String>,
    error: Option<Error>,
}

/// Continue tokens by cluster and namespace. Cluster-scoped lists use the
/// empty namespace.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
struct PageTokens(BTreeMap<String, BTreeMap<String, String>>);

#[derive(Debug)]
struct Target {
    cluster: String,
    index: usize,
    namespace: Option<String>,
    token: Option<String>,
}

type Joined = std::result::Result<(Target, Result<ResourcePage<DynamicObject>>), JoinError>;

/// Pages gathered from finished list tasks, in no particular order.
#[derive(Default)]
struct Pages {
    pages: BTreeMap<String, Vec<(usize, Vec<DynamicObject>)>>,
    next: PageTokens,
    errors: PartialErrors,
}

// === impl ListOptions ===

impl ListOptions {
    pub fn new(resource: ApiResource) -> Self {
        Self {
            resource,
            params: ListParams::default(),
            namespaced: true,
        }
    }

    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        Self::new(dynamic::api_resource::<K>())
    }

    pub fn with_params(mut self, params: ListParams) -> Self {
        self.params = params;
        self
    }

    pub fn cluster_scoped(mut self) -> Self {
        self.namespaced = false;
        self
    }
}

// === impl ClusteredList ===

impl<K> ClusteredList<K> {
    pub fn lists(&self) -> &BTreeMap<String, Vec<K>> {
        &self.lists
    }

    pub fn get(&self, cluster: &str) -> Option<&[K]> {
        self.lists.get(cluster).map(Vec::as_slice)
    }

    /// Passed back in [`ListParams::continue_token`] to fetch the next page.
    pub fn continue_token(&self) -> Option<&str> {
        self.continue_token.as_deref()
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_parts(self) -> (BTreeMap<String, Vec<K>>, Option<String>, Option<Error>) {
        (self.lists, self.continue_token, self.error)
    }
}

// === impl PageTokens ===

impl PageTokens {
    fn decode(token: &str) -> Result<Self> {
        let json = STANDARD
            .decode(token)
            .map_err(|_| Error::InvalidContinueToken)?;
        serde_json::from_slice(&json).map_err(|_| Error::InvalidContinueToken)
    }

    fn encode(&self) -> Result<Option<String>> {
        if self.0.is_empty() {
            return Ok(None);
        }
        Ok(Some(STANDARD.encode(serde_json::to_vec(&self.0)?)))
    }

    fn get(&self, cluster: &str, namespace: Option<&str>) -> Option<&str> {
        self.0
            .get(cluster)?
            .get(namespace.unwrap_or_default())
            .map(String::as_str)
    }

    fn set(&mut self, cluster: &str, namespace: Option<&str>, token: String) {
        self.0
            .entry(cluster.to_string())
            .or_default()
            .insert(namespace.unwrap_or_default().to_string(), token);
    }
}

/// Lists `options.resource` in every (cluster, namespace) pair, one task per
/// pair, each bounded by `timeout`.
///
/// Failures do not stop the other tasks. Cancelling `cancel` aborts the
/// outstanding tasks and returns what was collected so far.
pub(crate) async fn clustered_list<K>(
    pool: &ClientPool,
    namespaces: &AHashMap<String, Vec<Namespace>>,
    timeout: Duration,
    cancel: &CancellationToken,
    options: &ListOptions,
) -> Result<ClusteredList<K>>
where
    K: DeserializeOwned,
{
    let incoming = match options.params.continue_token.as_deref() {
        Some(token) if !token.is_empty() => Some(PageTokens::decode(token)?),
        _ => None,
    };

    let mut tasks = JoinSet::new();
    for target in targets(pool, namespaces, options.namespaced, incoming.as_ref()) {
        let client = pool.client(&target.cluster)?.clone();
        let resource = options.resource.clone();
        let mut params = options.params.clone();
        params.continue_token = target.token.clone();
        tasks.spawn(async move {
            let list = client.list(&resource, target.namespace.as_deref(), &params);
            let result = match time::timeout(timeout, list).await {
                Ok(result) => result.map_err(|e| e.for_cluster(&target.cluster)),
                Err(_) => Err(Error::Timeout(timeout)),
            };
            (target, result)
        });
    }

    let mut pages = Pages::default();
    let mut cancelled = false;
    loop {
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tasks.abort_all();
                cancelled = true;
                // Pages that finished before cancellation are kept.
                pages.drain_finished(&mut tasks);
                break;
            }
            joined = tasks.join_next() => joined,
        };
        let Some(joined) = joined else { break };
        pages.record(joined);
    }

    let Pages {
        pages,
        next,
        mut errors,
    } = pages;
    let mut lists = BTreeMap::new();
    for (cluster, mut chunks) in pages {
        chunks.sort_by_key(|(index, _)| *index);
        let mut items = Vec::new();
        for object in chunks.into_iter().flat_map(|(_, objects)| objects) {
            let namespace = object.namespace();
            match dynamic::from_dynamic::<K>(&options.resource, object) {
                Ok(item) => items.push(item),
                Err(error) => errors.push(&cluster, namespace.as_deref(), error),
            }
        }
        lists.insert(cluster, items);
    }

    let (continue_token, error) = if cancelled {
        (None, Some(Error::Cancelled))
    } else if errors.is_empty() {
        (next.encode()?, None)
    } else {
        (next.encode()?, Some(Error::Partial(errors)))
    };
    Ok(ClusteredList {
        lists,
        continue_token,
        error,
    })
}

// === impl Pages ===

impl Pages {
    fn record(&mut self, joined: Joined) {
        let (target, result) = match joined {
            Ok(res) => res,
            Err(error) if error.is_cancelled() => return,
            Err(error) => {
                warn!(%error, "List task failed");
                return;
            }
        };
        match result {
            Ok(page) => {
                if let Some(token) = page.continue_token.filter(|t| !t.is_empty()) {
                    self.next
                        .set(&target.cluster, target.namespace.as_deref(), token);
                }
                self.pages
                    .entry(target.cluster)
                    .or_default()
                    .push((target.index, page.items));
            }
            Err(error) => {
                debug!(cluster = %target.cluster, namespace = ?target.namespace, %error, "List failed");
                if let Some(token) = target.token {
                    self.next
                        .set(&target.cluster, target.namespace.as_deref(), token);
                }
                self.errors
                    .push(&target.cluster, target.namespace.as_deref(), error);
            }
        }
    }

    /// Records every task that has already finished without waiting on the
    /// rest.
    fn drain_finished(
        &mut self,
        tasks: &mut JoinSet<(Target, Result<ResourcePage<DynamicObject>>)>,
    ) {
        while let Some(joined) = tasks.try_join_next() {
            self.record(joined);
        }
    }
}

/// Expands the pool into (cluster, namespace) pairs in a stable order,
/// skipping exhausted pairs when resuming from `incoming`.
fn targets(
    pool: &ClientPool,
    namespaces: &AHashMap<String, Vec<Namespace>>,
    namespaced: bool,
    incoming: Option<&PageTokens>,
) -> Vec<Target> {
    let mut clusters = pool.clients().keys().collect::<Vec<_>>();
    clusters.sort();

    let mut targets = Vec::new();
    for cluster in clusters {
        let scopes = if namespaced {
            namespaces
                .get(cluster.as_str())
                .map(|nss| nss.iter().map(|ns| Some(ns.name_any())).collect())
                .unwrap_or_default()
        } else {
            vec![None]
        };
        for (index, namespace) in scopes.into_iter().enumerate() {
            let token = match incoming {
                Some(tokens) => match tokens.get(cluster, namespace.as_deref()) {
                    Some(token) => Some(token.to_string()),
                    None => continue,
                },
                None => None,
            };
            targets.push(Target {
                cluster: cluster.clone(),
                index,
                namespace,
                token,
            });
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_gateway_k8s_api::ConfigMap;
    use maplit::btreemap;

    #[test]
    fn tokens_encode_by_cluster_and_namespace() {
        let mut tokens = PageTokens::default();
        assert_eq!(tokens.encode().unwrap(), None);

        tokens.set("a", Some("x"), "1".to_string());
        tokens.set("b", None, "2".to_string());
        let encoded = tokens.encode().unwrap().expect("token must be set");
        let decoded = PageTokens::decode(&encoded).unwrap();
        assert_eq!(
            decoded.0,
            btreemap! {
                "a".to_string() => btreemap!{ "x".to_string() => "1".to_string() },
                "b".to_string() => btreemap!{ String::new() => "2".to_string() },
            }
        );
        assert_eq!(decoded.get("a", Some("x")), Some("1"));
        assert_eq!(decoded.get("b", None), Some("2"));
        assert_eq!(decoded.get("a", Some("y")), None);
    }

    #[tokio::test]
    async fn cancellation_keeps_finished_pages() {
        let target = |cluster: &str| Target {
            cluster: cluster.to_string(),
            index: 0,
            namespace: Some("ns".to_string()),
            token: None,
        };
        let resource = ApiResource::erase::<ConfigMap>(&());

        let mut tasks = JoinSet::new();
        let done = target("a");
        let object = DynamicObject::new("cm", &resource).within("ns");
        tasks.spawn(async move {
            let page = ResourcePage {
                items: vec![object],
                continue_token: Some("next".to_string()),
            };
            (done, Ok(page))
        });
        let stuck = target("b");
        tasks.spawn(async move {
            std::future::pending::<()>().await;
            let page = ResourcePage {
                items: Vec::new(),
                continue_token: None,
            };
            (stuck, Ok(page))
        });
        // The first task completes but is never joined.
        tokio::task::yield_now().await;

        tasks.abort_all();
        let mut pages = Pages::default();
        pages.drain_finished(&mut tasks);
        assert_eq!(pages.pages.keys().collect::<Vec<_>>(), ["a"]);
        assert_eq!(pages.pages["a"][0].1.len(), 1);
        assert_eq!(pages.next.get("a", Some("ns")), Some("next"));
        assert!(pages.errors.is_empty());
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(matches!(
            PageTokens::decode("not base64!"),
            Err(Error::InvalidContinueToken)
        ));
        let not_json = STANDARD.encode("[1, 2]");
        assert!(matches!(
            PageTokens::decode(&not_json),
            Err(Error::InvalidContinueToken)
        ));
    }
}
