#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Kubernetes API access for the fleet gateway: cluster REST
//! configurations, the [`ClusterClient`] seam every cluster request goes
//! through, and the gateway's error type.

pub mod config;
mod client;
pub mod duration;
pub mod dynamic;
mod error;
pub mod watch;

pub use self::{
    client::{ClientFactory, ClusterClient, KubeClientFactory, KubeClusterClient, ResourcePage},
    config::{ConfigOption, RestConfig},
    duration::GoDuration,
    error::{api_error, Error, NamespaceError, PartialErrors, Result},
    watch::{Event, Watch, WatchStream},
};
pub use k8s_openapi::api::{
    self,
    core::v1::{ConfigMap, Event as CoreEvent, Namespace, Secret},
};
pub use kube::{
    api::{
        ApiResource, DeleteParams, DynamicObject, ListParams, ObjectMeta, Patch, PatchParams,
        PostParams, ResourceExt,
    },
    core::GroupVersionKind,
    Resource,
};
