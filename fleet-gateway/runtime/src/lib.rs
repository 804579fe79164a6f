#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use fleet_gateway_core as core;
pub use fleet_gateway_k8s_api as k8s;
pub use fleet_gateway_k8s_cluster as cluster;
pub use fleet_gateway_k8s_fleet as fleet;

mod args;
pub mod auth;

pub use self::args::Args;
