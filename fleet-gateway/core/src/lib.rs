#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Domain types shared by the fleet gateway crates.
//!
//! Nothing in this crate talks to a Kubernetes API server: it describes who
//! is asking ([`UserPrincipal`]), which clusters exist ([`Cluster`]), what
//! a user must be allowed to do in a namespace to see it ([`AccessRule`]),
//! and provides the expiring map ([`TtlCache`]) the client and namespace
//! indices are built on.

pub mod access;
mod cluster;
mod principal;
pub mod ttl;

pub use self::{
    access::AccessRule,
    cluster::{Cluster, ClusterDiff, TlsConfig, DEFAULT_CLUSTER},
    principal::{PrincipalKey, UserPrincipal},
    ttl::TtlCache,
};
