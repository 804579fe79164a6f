#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The fleet gateway's view of its clusters.
//!
//! A [`ClustersManager`] keeps three indices current: the fleet itself, the
//! namespaces of each cluster, and the namespaces each user may reach. Two
//! background loops refresh the first two; user namespaces are computed on
//! demand and cached with a TTL.
//!
//! Callers obtain a [`ClustersClient`] for a user (or for the gateway
//! itself) and use it either against a single cluster or to list across
//! the whole fleet with [`ClustersClient::clustered_list`].

mod client;
mod list;
mod manager;
mod metrics;
mod pool;
mod subscription;


pub use self::{
    client::{ClustersClient, REQUEST_TIMEOUT},
    list::{ClusteredList, ListOptions},
    manager::{ClustersManager, Fleet, ManagerConfig},
    metrics::FleetMetrics,
    pool::ClientPool,
    subscription::{Subscription, SUBSCRIBER_CAPACITY},
};
use self::subscription::Subscribers;
