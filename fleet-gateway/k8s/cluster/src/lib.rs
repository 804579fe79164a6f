#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Per-cluster access for the fleet gateway.
//!
//! A [`ClusterHandle`] hands out clients for one cluster, acting either as
//! the cluster's own identity or on behalf of a user. Handles are layered:
//!
//! ```text
//! [ CachedCluster ] -> [ DelegatingCacheCluster ]? -> [ SingleCluster ]
//! ```
//!
//! The outer layer memoizes clients in TTL caches shared by every handle,
//! the optional middle layer serves reads from informers, and the inner
//! layer builds clients from the cluster's REST configuration.
//!
//! Fleet membership comes from a [`ClusterFetcher`] and namespace
//! visibility is decided by a [`NamespaceChecker`].

mod cached;
mod connector;
mod delegating;
mod fetcher;
mod handle;
mod informer;
mod nsaccess;
mod selector;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use self::{
    cached::{CacheMetrics, CachedCluster, ClientCaches, CACHE_RESOLUTION, CLIENT_TTL},
    connector::{ClusterConnector, LeafConnector},
    delegating::{DelegatingCacheCluster, DelegatingOptions, DelegatingReadCache},
    fetcher::{ClusterFetcher, ConfigMapFetcher, SingleClusterFetcher, DEFAULT_CONFIG_MAP},
    handle::{ClusterHandle, SingleCluster},
    nsaccess::{NamespaceChecker, RulesReviewChecker},
};
