use std::{collections::BTreeMap, fmt, time::Duration};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("no user ID or token found in principal")]
    InvalidPrincipal,

    #[error("request is not authenticated")]
    Unauthenticated,

    #[error("cluster={0} not found")]
    NoSuchCluster(String),

    #[error("cluster {cluster} is unreachable: {source}")]
    LeafUnreachable {
        cluster: String,
        #[source]
        source: kube::Error,
    },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("cache for {0} did not sync")]
    CacheSyncFailed(String),

    #[error("failed to fetch clusters: {0}")]
    FetchFailed(#[source] Box<Error>),

    #[error(transparent)]
    Partial(PartialErrors),

    #[error("operation cancelled")]
    Cancelled,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid continue token")]
    InvalidContinueToken,

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failures collected from a fan-out, keyed by cluster name.
#[derive(Debug, Default)]
pub struct PartialErrors {
    clusters: BTreeMap<String, Vec<NamespaceError>>,
}

#[derive(Debug)]
pub struct NamespaceError {
    /// Empty when the failed request was not namespaced.
    pub namespace: String,
    pub error: Error,
}

// === impl Error ===

impl Error {
    /// Classifies an error returned by a request to `cluster`.
    ///
    /// Transport failures become [`Error::LeafUnreachable`] and 403 responses
    /// become [`Error::Forbidden`]; everything else is returned unchanged.
    pub fn for_cluster(self, cluster: &str) -> Self {
        match self {
            Self::Kube(kube::Error::Api(rsp)) if rsp.code == 403 => Self::Forbidden(rsp.message),
            Self::Kube(source @ (kube::Error::HyperError(_) | kube::Error::Service(_))) => {
                Self::LeafUnreachable {
                    cluster: cluster.to_string(),
                    source,
                }
            }
            error => error,
        }
    }

    pub fn is_forbidden(&self) -> bool {
        match self {
            Self::Forbidden(_) => true,
            Self::Kube(kube::Error::Api(rsp)) => rsp.code == 403,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } | Self::NoSuchCluster(_) => true,
            Self::Kube(kube::Error::Api(rsp)) => rsp.code == 404,
            _ => false,
        }
    }

    /// The HTTP status a request boundary should answer with.
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Self::InvalidPrincipal | Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::NoSuchCluster(_) | Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::LeafUnreachable { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Cancelled => StatusCode::REQUEST_TIMEOUT,
            Self::InvalidContinueToken => StatusCode::BAD_REQUEST,
            Self::Kube(kube::Error::Api(rsp)) => {
                StatusCode::from_u16(rsp.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// === impl PartialErrors ===

impl PartialErrors {
    pub fn push(&mut self, cluster: &str, namespace: Option<&str>, error: Error) {
        self.clusters
            .entry(cluster.to_string())
            .or_default()
            .push(NamespaceError {
                namespace: namespace.unwrap_or_default().to_string(),
                error,
            });
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// The number of clusters with at least one failure.
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn get(&self, cluster: &str) -> Option<&[NamespaceError]> {
        self.clusters.get(cluster).map(Vec::as_slice)
    }

    pub fn clusters(&self) -> impl Iterator<Item = &str> {
        self.clusters.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &NamespaceError)> {
        self.clusters
            .iter()
            .flat_map(|(c, errs)| errs.iter().map(move |e| (c.as_str(), e)))
    }
}

impl fmt::Display for PartialErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cluster(s) failed:", self.clusters.len())?;
        for (cluster, e) in self.iter() {
            if e.namespace.is_empty() {
                write!(f, " [cluster={cluster}: {}]", e.error)?;
            } else {
                write!(f, " [cluster={cluster} ns={}: {}]", e.namespace, e.error)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for PartialErrors {}

/// Builds an API error response, as returned by a Kubernetes API server.
pub fn api_error(code: u16, reason: &str, message: impl Into<String>) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.into(),
        reason: reason.to_string(),
        code,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_is_classified() {
        let error = api_error(403, "Forbidden", "nope");
        assert!(error.is_forbidden());
        let error = error.for_cluster("a");
        assert!(matches!(error, Error::Forbidden(ref m) if m == "nope"));
        assert_eq!(error.status_code(), http::StatusCode::FORBIDDEN);
    }

    #[test]
    fn status_codes() {
        assert_eq!(
            Error::InvalidPrincipal.status_code(),
            http::StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::NoSuchCluster("a".into()).status_code(),
            http::StatusCode::NOT_FOUND
        );
        assert_eq!(
            api_error(500, "InternalError", "boom").status_code(),
            http::StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn partial_errors_group_by_cluster() {
        let mut errors = PartialErrors::default();
        errors.push("a", Some("ns1"), api_error(500, "InternalError", "x"));
        errors.push("a", Some("ns2"), api_error(500, "InternalError", "y"));
        errors.push("b", None, Error::Cancelled);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors.get("a").map(<[_]>::len), Some(2));
        assert_eq!(errors.iter().count(), 3);
        let msg = errors.to_string();
        assert!(msg.contains("cluster=a ns=ns1"), "{msg}");
        assert!(msg.contains("cluster=b: operation cancelled"), "{msg}");
    }
}
