use base64::Engine;
use fleet_gateway_core::{Cluster, TlsConfig, DEFAULT_CLUSTER};
use fleet_gateway_k8s_api::{
    dynamic::{api_resource, from_dynamic},
    ClusterClient, ConfigMap, Error, Result, Secret,
};
use futures::future;
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::sync::Arc;

pub const DEFAULT_CONFIG_MAP: &str = "leaf-clusters";

const CLUSTERS_KEY: &str = "clusters";
const TOKEN_KEY: &str = "token";
const CA_KEY: &str = "ca.crt";

/// A source of fleet membership.
#[async_trait::async_trait]
pub trait ClusterFetcher: Send + Sync {
    /// Returns every cluster currently in the fleet.
    async fn fetch(&self) -> Result<Vec<Cluster>>;
}

/// A fleet made of the cluster the gateway runs against.
pub struct SingleClusterFetcher {
    config: kube::Config,
}

/// A fleet described by a ConfigMap on the hub cluster.
///
/// The ConfigMap's `clusters` key holds a YAML list of
/// `{name, server, secretRef}` entries, each naming a Secret in the same
/// namespace whose `token` key holds the cluster's bearer token.
pub struct ConfigMapFetcher {
    hub: Arc<dyn ClusterClient>,
    namespace: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClusterList {
    Entries(Vec<ClusterEntry>),
    Document { clusters: Vec<ClusterEntry> },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterEntry {
    name: String,
    server: String,
    secret_ref: Option<String>,
    #[serde(default, rename = "certificate-authority-data")]
    ca_data: Option<String>,
    #[serde(default, rename = "insecure-skip-tls-verify")]
    insecure: bool,
}

// === impl SingleClusterFetcher ===

impl SingleClusterFetcher {
    pub fn new(config: kube::Config) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl ClusterFetcher for SingleClusterFetcher {
    async fn fetch(&self) -> Result<Vec<Cluster>> {
        let auth = &self.config.auth_info;
        let bearer_token = match (&auth.token, &auth.token_file) {
            (Some(token), _) => Some(token.expose_secret().to_string()),
            // Projected service account tokens rotate, so the file is read
            // on every fetch.
            (None, Some(path)) => {
                let token = tokio::fs::read_to_string(path).await.map_err(|error| {
                    Error::InvalidConfig(format!("failed to read token file {path}: {error}"))
                })?;
                Some(token.trim().to_string())
            }
            (None, None) => None,
        };

        let ca_data = self.config.root_cert.as_ref().map(|certs| {
            let blocks = certs
                .iter()
                .map(|der| pem::Pem::new("CERTIFICATE", der.clone()))
                .collect::<Vec<_>>();
            pem::encode_many(&blocks).into_bytes()
        });

        Ok(vec![Cluster {
            name: DEFAULT_CLUSTER.to_string(),
            server: self
                .config
                .cluster_url
                .to_string()
                .trim_end_matches('/')
                .to_string(),
            tls: TlsConfig {
                ca_data,
                insecure: self.config.accept_invalid_certs,
            },
            bearer_token,
        }])
    }
}

// === impl ConfigMapFetcher ===

impl ConfigMapFetcher {
    pub fn new(hub: Arc<dyn ClusterClient>, namespace: impl Into<String>) -> Self {
        Self::with_name(hub, namespace, DEFAULT_CONFIG_MAP)
    }

    pub fn with_name(
        hub: Arc<dyn ClusterClient>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            hub,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    async fn entries(&self) -> Result<Vec<ClusterEntry>> {
        let resource = api_resource::<ConfigMap>();
        let obj = self
            .hub
            .get(&resource, Some(&self.namespace), &self.name)
            .await?;
        let cm = from_dynamic::<ConfigMap>(&resource, obj)?;
        let data = cm
            .data
            .unwrap_or_default()
            .remove(CLUSTERS_KEY)
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "ConfigMap {}/{} has no {CLUSTERS_KEY:?} key",
                    self.namespace, self.name
                ))
            })?;
        let entries = match serde_yaml::from_str::<Option<ClusterList>>(&data) {
            Ok(Some(ClusterList::Entries(entries) | ClusterList::Document { clusters: entries })) => {
                entries
            }
            Ok(None) => Vec::new(),
            Err(error) => {
                return Err(Error::InvalidConfig(format!(
                    "ConfigMap {}/{}: invalid cluster list: {error}",
                    self.namespace, self.name
                )))
            }
        };

        let mut names = std::collections::HashSet::new();
        for entry in &entries {
            if !names.insert(entry.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate cluster name {:?}",
                    entry.name
                )));
            }
        }
        Ok(entries)
    }

    async fn resolve(&self, entry: ClusterEntry) -> Result<Cluster> {
        let secret_name = entry.secret_ref.as_deref().ok_or_else(|| {
            Error::InvalidConfig(format!("cluster {:?} has no secretRef", entry.name))
        })?;
        let resource = api_resource::<Secret>();
        let obj = self
            .hub
            .get(&resource, Some(&self.namespace), secret_name)
            .await?;
        let mut data = from_dynamic::<Secret>(&resource, obj)?
            .data
            .unwrap_or_default();

        let token = data
            .remove(TOKEN_KEY)
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "Secret {}/{secret_name} has no {TOKEN_KEY:?} key",
                    self.namespace
                ))
            })
            .and_then(|t| {
                String::from_utf8(t.0).map_err(|_| {
                    Error::InvalidConfig(format!("Secret {}/{secret_name}: token is not UTF-8", self.namespace))
                })
            })?;

        let ca_data = match entry.ca_data {
            Some(b64) => Some(
                base64::engine::general_purpose::STANDARD
                    .decode(b64.trim())
                    .map_err(|error| {
                        Error::InvalidConfig(format!(
                            "cluster {:?}: invalid certificate-authority-data: {error}",
                            entry.name
                        ))
                    })?,
            ),
            None => data.remove(CA_KEY).map(|ca| ca.0),
        };

        Ok(Cluster {
            name: entry.name,
            server: entry.server,
            tls: TlsConfig {
                ca_data,
                insecure: entry.insecure,
            },
            bearer_token: Some(token.trim().to_string()),
        })
    }
}

#[async_trait::async_trait]
impl ClusterFetcher for ConfigMapFetcher {
    async fn fetch(&self) -> Result<Vec<Cluster>> {
        let entries = self.entries().await?;
        future::try_join_all(entries.into_iter().map(|e| self.resolve(e))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeClient;
    use fleet_gateway_k8s_api::{dynamic::to_dynamic, ObjectMeta};
    use k8s_openapi::ByteString;
    use maplit::btreemap;

    fn hub(clusters: &str) -> Arc<FakeClient> {
        let hub = Arc::new(FakeClient::default());
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(DEFAULT_CONFIG_MAP.to_string()),
                namespace: Some("flux-system".to_string()),
                ..Default::default()
            },
            data: Some(btreemap! { "clusters".to_string() => clusters.to_string() }),
            ..Default::default()
        };
        hub.add(
            &api_resource::<ConfigMap>(),
            to_dynamic(&cm).expect("serializable"),
        );
        hub
    }

    fn add_secret(hub: &FakeClient, name: &str, data: Vec<(&str, &[u8])>) {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("flux-system".to_string()),
                ..Default::default()
            },
            data: Some(
                data.into_iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
                    .collect(),
            ),
            ..Default::default()
        };
        hub.add(&api_resource::<Secret>(), to_dynamic(&secret).expect("serializable"));
    }

    #[tokio::test]
    async fn reads_clusters_and_tokens() {
        let hub = hub(
            "- name: a\n  server: https://a:6443\n  secretRef: a-token\n\
             - name: b\n  server: https://b:6443\n  secretRef: b-token\n  insecure-skip-tls-verify: true\n",
        );
        add_secret(&hub, "a-token", vec![("token", b"ta\n"), ("ca.crt", b"PEM")]);
        add_secret(&hub, "b-token", vec![("token", b"tb")]);

        let clusters = ConfigMapFetcher::new(hub, "flux-system")
            .fetch()
            .await
            .expect("fetch succeeds");
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].name, "a");
        assert_eq!(clusters[0].bearer_token.as_deref(), Some("ta"));
        assert_eq!(clusters[0].tls.ca_data.as_deref(), Some(&b"PEM"[..]));
        assert_eq!(clusters[1].server, "https://b:6443");
        assert!(clusters[1].tls.insecure);
    }

    #[tokio::test]
    async fn accepts_a_clusters_document() {
        let hub = hub("clusters:\n  - name: a\n    server: https://a:6443\n    secretRef: a-token\n");
        add_secret(&hub, "a-token", vec![("token", b"ta")]);
        let clusters = ConfigMapFetcher::new(hub, "flux-system")
            .fetch()
            .await
            .expect("fetch succeeds");
        assert_eq!(clusters, vec![Cluster::new("a", "https://a:6443")]);
    }

    #[tokio::test]
    async fn missing_secret_fails_the_fetch() {
        let hub = hub(
            "- name: a\n  server: https://a:6443\n  secretRef: a-token\n\
             - name: b\n  server: https://b:6443\n  secretRef: missing\n",
        );
        add_secret(&hub, "a-token", vec![("token", b"ta")]);
        let err = ConfigMapFetcher::new(hub, "flux-system")
            .fetch()
            .await
            .expect_err("secret is missing");
        assert!(err.is_not_found(), "{err}");
    }

    #[tokio::test]
    async fn rejects_duplicate_names() {
        let hub = hub(
            "- name: a\n  server: https://a:6443\n  secretRef: s\n\
             - name: a\n  server: https://b:6443\n  secretRef: s\n",
        );
        add_secret(&hub, "s", vec![("token", b"t")]);
        let err = ConfigMapFetcher::new(hub, "flux-system")
            .fetch()
            .await
            .expect_err("names collide");
        assert!(matches!(err, Error::InvalidConfig(_)), "{err}");
    }

    #[tokio::test]
    async fn single_cluster() {
        let mut config = kube::Config::new("https://127.0.0.1:6443".parse().expect("valid url"));
        config.auth_info.token = Some("T".to_string().into());
        config.root_cert = Some(vec![vec![0, 1, 2, 3], vec![4, 5]]);
        let clusters = SingleClusterFetcher::new(config)
            .fetch()
            .await
            .expect("fetch succeeds");
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].name, DEFAULT_CLUSTER);
        assert_eq!(clusters[0].server, "https://127.0.0.1:6443");
        assert_eq!(clusters[0].bearer_token.as_deref(), Some("T"));

        // The CA bundle is handed on as PEM and decodes back to the same
        // certificates.
        let rest = fleet_gateway_k8s_api::RestConfig::for_cluster(&clusters[0])
            .expect("CA bundle is valid");
        assert_eq!(
            rest.kube_config().root_cert,
            Some(vec![vec![0, 1, 2, 3], vec![4, 5]])
        );
    }
}
