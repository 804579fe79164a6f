//! Connection settings for a cluster's API server.

use crate::{Error, Result};
use fleet_gateway_core::{Cluster, UserPrincipal};
use hyper_util::{client::legacy::connect::HttpConnector, rt::TokioExecutor};
use kube::{client::ConfigExt, config::AuthInfo};
use secrecy::{ExposeSecret, SecretString};
use std::{fmt, sync::Arc, time::Duration};

/// Environment variable overriding [`REQUEST_TIMEOUT`].
pub const REQUEST_TIMEOUT_ENV: &str = "FLEET_GATEWAY_KUBE_CLIENT_TIMEOUT";

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const KEEP_ALIVE: Duration = Duration::from_secs(30);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client-side request rate applied when the server does not manage flow
/// control itself.
pub const CLIENT_QPS: u64 = 1000;

const FLOW_SCHEMA_HEADER: &str = "x-kubernetes-pf-flowschema-uid";

/// A cluster's REST configuration: a [`kube::Config`] plus the client-side
/// settings kube does not model.
#[derive(Clone, Debug)]
pub struct RestConfig {
    kube: kube::Config,
    keep_alive: Option<Duration>,
    rate_limit: Option<u64>,
}

/// A transform over a [`RestConfig`].
///
/// Options are applied in order when a cluster handle is built. Each option
/// may contact the cluster and must yield the same result when applied again
/// to a copy of its output.
#[async_trait::async_trait]
pub trait ConfigOption: fmt::Debug + Send + Sync {
    async fn apply(&self, config: RestConfig) -> Result<RestConfig>;
}

/// Bounds how long establishing a connection may take and probes idle
/// connections with TCP keep-alives.
#[derive(Clone, Debug)]
pub struct DialTimeouts {
    pub connect: Duration,
    pub keep_alive: Duration,
}

/// Bounds how long a single API request may take.
#[derive(Clone, Debug)]
pub struct RequestTimeout(pub Duration);

/// Probes `/livez/ping` to learn whether the API server enforces API
/// priority and fairness. When it does, the client-side rate limit is
/// lifted.
#[derive(Clone, Debug, Default)]
pub struct FlowControl;

// === impl RestConfig ===

impl RestConfig {
    pub fn for_cluster(cluster: &Cluster) -> Result<Self> {
        let url = cluster.server.parse::<http::Uri>().map_err(|error| {
            Error::InvalidConfig(format!(
                "cluster {}: invalid server {:?}: {error}",
                cluster.name, cluster.server
            ))
        })?;
        let mut kube = kube::Config::new(url);
        kube.accept_invalid_certs = cluster.tls.insecure;
        if let Some(pem) = &cluster.tls.ca_data {
            let certs = pem_certificates(pem)
                .map_err(|error| Error::InvalidConfig(format!("cluster {}: {error}", cluster.name)))?;
            kube.root_cert = Some(certs);
        }
        kube.auth_info.token = cluster.bearer_token.clone().map(SecretString::from);
        Ok(Self {
            kube,
            keep_alive: None,
            rate_limit: Some(CLIENT_QPS),
        })
    }

    /// Returns a copy of this configuration acting on behalf of `principal`.
    ///
    /// A principal token replaces the cluster's credentials entirely.
    /// Otherwise the cluster's credentials are kept and the principal's
    /// identity is impersonated.
    pub fn with_principal(&self, principal: &UserPrincipal) -> Result<Self> {
        if !principal.is_valid() {
            return Err(Error::InvalidPrincipal);
        }

        let mut config = self.clone();
        match principal.token() {
            Some(token) => {
                config.kube.auth_info = AuthInfo {
                    token: Some(SecretString::from(token.to_string())),
                    ..AuthInfo::default()
                };
            }
            None => {
                config.kube.auth_info.impersonate = Some(principal.id.clone());
                config.kube.auth_info.impersonate_groups = if principal.groups.is_empty() {
                    None
                } else {
                    Some(principal.groups.clone())
                };
            }
        }
        Ok(config)
    }

    pub fn host(&self) -> String {
        self.kube.cluster_url.to_string()
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.kube
            .auth_info
            .token
            .as_ref()
            .map(|t| t.expose_secret())
    }

    pub fn impersonated_user(&self) -> Option<&str> {
        self.kube.auth_info.impersonate.as_deref()
    }

    pub fn impersonated_groups(&self) -> &[String] {
        self.kube
            .auth_info
            .impersonate_groups
            .as_deref()
            .unwrap_or_default()
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.kube.connect_timeout
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.kube.read_timeout
    }

    pub fn rate_limit(&self) -> Option<u64> {
        self.rate_limit
    }

    pub fn kube_config(&self) -> &kube::Config {
        &self.kube
    }

    /// Builds a client for this configuration.
    ///
    /// The request timeout bounds the wait for response headers, so
    /// streaming bodies such as watches are not cut off.
    pub fn client(&self) -> Result<kube::Client> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(self.kube.connect_timeout);
        http.set_keepalive(self.keep_alive);
        let https = self.kube.rustls_https_connector_with_connector(http)?;
        let hyper: hyper_util::client::legacy::Client<_, kube::client::Body> =
            hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(https);

        let service = tower::ServiceBuilder::new()
            .layer(self.kube.base_uri_layer())
            .option_layer(
                self.rate_limit
                    .map(|qps| tower::limit::RateLimitLayer::new(qps, Duration::from_secs(1))),
            )
            .option_layer(self.kube.read_timeout.map(tower::timeout::TimeoutLayer::new))
            .option_layer(self.kube.auth_layer()?)
            .layer(self.kube.extra_headers_layer()?)
            .map_err(tower::BoxError::from)
            .service(hyper);
        Ok(kube::Client::new(service, self.kube.default_namespace.clone()))
    }
}

impl From<kube::Config> for RestConfig {
    fn from(kube: kube::Config) -> Self {
        Self {
            kube,
            keep_alive: None,
            rate_limit: Some(CLIENT_QPS),
        }
    }
}

/// Decodes every `CERTIFICATE` block of a PEM bundle into DER.
fn pem_certificates(bundle: &[u8]) -> std::result::Result<Vec<Vec<u8>>, String> {
    let certs = pem::parse_many(bundle)
        .map_err(|error| format!("invalid CA data: {error}"))?
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(pem::Pem::into_contents)
        .collect::<Vec<_>>();
    if certs.is_empty() {
        return Err("no certificates found in CA data".to_string());
    }
    Ok(certs)
}

/// The options every cluster handle is built with.
pub fn default_options() -> Vec<Arc<dyn ConfigOption>> {
    vec![
        Arc::new(DialTimeouts::default()),
        Arc::new(RequestTimeout::from_env()),
    ]
}

pub async fn apply_options(
    mut config: RestConfig,
    options: &[Arc<dyn ConfigOption>],
) -> Result<RestConfig> {
    for option in options {
        config = option.apply(config).await?;
    }
    Ok(config)
}

// === impl DialTimeouts ===

impl Default for DialTimeouts {
    fn default() -> Self {
        Self {
            connect: DIAL_TIMEOUT,
            keep_alive: KEEP_ALIVE,
        }
    }
}

#[async_trait::async_trait]
impl ConfigOption for DialTimeouts {
    async fn apply(&self, mut config: RestConfig) -> Result<RestConfig> {
        config.kube.connect_timeout = Some(self.connect);
        config.keep_alive = Some(self.keep_alive);
        Ok(config)
    }
}

// === impl RequestTimeout ===

impl RequestTimeout {
    pub fn from_env() -> Self {
        Self(crate::GoDuration::from_env_or(
            REQUEST_TIMEOUT_ENV,
            REQUEST_TIMEOUT,
        ))
    }
}

impl Default for RequestTimeout {
    fn default() -> Self {
        Self(REQUEST_TIMEOUT)
    }
}

#[async_trait::async_trait]
impl ConfigOption for RequestTimeout {
    async fn apply(&self, mut config: RestConfig) -> Result<RestConfig> {
        config.kube.read_timeout = Some(self.0);
        config.kube.write_timeout = Some(self.0);
        Ok(config)
    }
}

// === impl FlowControl ===

#[async_trait::async_trait]
impl ConfigOption for FlowControl {
    async fn apply(&self, mut config: RestConfig) -> Result<RestConfig> {
        let mut probe = config.clone();
        probe.rate_limit = None;
        probe.kube.read_timeout = probe.kube.connect_timeout.or(Some(DIAL_TIMEOUT));
        let client = probe.client()?;

        let req = http::Request::get("/livez/ping")
            .body(Vec::new())
            .map_err(kube::Error::HttpError)?;
        let rsp = client.send(req.map(Into::into)).await?;
        let managed = rsp.headers().contains_key(FLOW_SCHEMA_HEADER);
        tracing::debug!(host = %config.host(), managed, "Probed API server flow control");

        config.rate_limit = if managed { None } else { Some(CLIENT_QPS) };
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_gateway_core::TlsConfig;

    fn cluster() -> Cluster {
        Cluster::new("a", "https://127.0.0.1:6443").with_token("cluster-token")
    }

    #[test]
    fn impersonates_without_token() {
        let base = RestConfig::for_cluster(&cluster()).expect("valid cluster");
        let config = base
            .with_principal(&UserPrincipal::new("alice", ["g1", "g2"]))
            .expect("valid principal");
        assert_eq!(config.impersonated_user(), Some("alice"));
        assert_eq!(config.impersonated_groups(), ["g1", "g2"]);
        assert_eq!(config.bearer_token(), Some("cluster-token"));

        // The source configuration is untouched.
        assert_eq!(base.impersonated_user(), None);
    }

    #[test]
    fn token_replaces_credentials() {
        let base = RestConfig::for_cluster(&cluster()).expect("valid cluster");
        let config = base
            .with_principal(&UserPrincipal::from_token("t"))
            .expect("valid principal");
        assert_eq!(config.bearer_token(), Some("t"));
        assert_eq!(config.impersonated_user(), None);
        assert!(config.impersonated_groups().is_empty());
    }

    #[test]
    fn invalid_principal_fails() {
        let base = RestConfig::for_cluster(&cluster()).expect("valid cluster");
        assert!(matches!(
            base.with_principal(&UserPrincipal::default()),
            Err(Error::InvalidPrincipal)
        ));
    }

    #[test]
    fn invalid_server_fails() {
        let err = RestConfig::for_cluster(&Cluster::new("bad", "not a url")).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)), "{err}");
    }

    #[test]
    fn decodes_ca_bundle() {
        let pem = b"-----BEGIN CERTIFICATE-----\nAAEC\nAw==\n-----END CERTIFICATE-----\n\
                    -----BEGIN CERTIFICATE-----\nBAU=\n-----END CERTIFICATE-----\n";
        let tls = TlsConfig {
            ca_data: Some(pem.to_vec()),
            insecure: false,
        };
        let config = RestConfig::for_cluster(&cluster().with_tls(tls)).expect("valid CA");
        assert_eq!(
            config.kube_config().root_cert,
            Some(vec![vec![0, 1, 2, 3], vec![4, 5]])
        );

        let tls = TlsConfig {
            ca_data: Some(b"garbage".to_vec()),
            insecure: false,
        };
        assert!(RestConfig::for_cluster(&cluster().with_tls(tls)).is_err());
    }

    #[tokio::test]
    async fn options_set_timeouts() {
        let config = RestConfig::for_cluster(&cluster()).expect("valid cluster");
        let options: Vec<Arc<dyn ConfigOption>> = vec![
            Arc::new(DialTimeouts::default()),
            Arc::new(RequestTimeout(Duration::from_secs(7))),
        ];
        let config = apply_options(config, &options).await.expect("options apply");
        assert_eq!(config.connect_timeout(), Some(DIAL_TIMEOUT));
        assert_eq!(config.keep_alive(), Some(KEEP_ALIVE));
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(7)));

        let again = apply_options(config.clone(), &options).await.expect("options apply");
        assert_eq!(again.connect_timeout(), config.connect_timeout());
        assert_eq!(again.keep_alive(), config.keep_alive());
        assert_eq!(again.request_timeout(), config.request_timeout());
    }
}
