use std::fmt;

/// The name given to the only cluster of a single-cluster fleet.
pub const DEFAULT_CLUSTER: &str = "Default";

/// A leaf cluster as described by a fleet source.
///
/// Clusters compare equal when their name and server match; credentials
/// are not part of a cluster's identity.
#[derive(Clone, Default)]
pub struct Cluster {
    pub name: String,
    pub server: String,
    pub tls: TlsConfig,
    pub bearer_token: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// PEM-encoded CA bundle used to verify the API server.
    pub ca_data: Option<Vec<u8>>,
    pub insecure: bool,
}

/// The membership change between two fleet snapshots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterDiff {
    pub added: Vec<Cluster>,
    pub removed: Vec<Cluster>,
}

// === impl Cluster ===

impl Cluster {
    pub fn new(name: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server: server.into(),
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Returns true if a connection built for `self` is usable for `other`.
    pub fn same_connection(&self, other: &Self) -> bool {
        self == other && self.tls == other.tls && self.bearer_token == other.bearer_token
    }
}

impl PartialEq for Cluster {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.server == other.server
    }
}

impl Eq for Cluster {}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("server", &self.server)
            .field("tls", &self.tls)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// === impl ClusterDiff ===

impl ClusterDiff {
    pub fn between(old: &[Cluster], new: &[Cluster]) -> Self {
        let added = new
            .iter()
            .filter(|c| !old.contains(c))
            .cloned()
            .collect();
        let removed = old
            .iter()
            .filter(|c| !new.contains(c))
            .cloned()
            .collect();
        Self { added, removed }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_name_and_server() {
        let a = Cluster::new("a", "https://a:6443").with_token("t1");
        let b = Cluster::new("a", "https://a:6443").with_token("t2");
        assert_eq!(a, b);
        assert!(!a.same_connection(&b));
        assert_ne!(a, Cluster::new("a", "https://other:6443"));
    }

    #[test]
    fn diff() {
        let a = Cluster::new("a", "https://a");
        let b = Cluster::new("b", "https://b");
        let c = Cluster::new("c", "https://c");

        let diff = ClusterDiff::between(&[a.clone(), b.clone()], &[b.clone(), c.clone()]);
        assert_eq!(diff.added, vec![c]);
        assert_eq!(diff.removed, vec![a]);

        assert!(ClusterDiff::between(&[b.clone()], &[b]).is_empty());
    }

    #[test]
    fn moved_server_is_replaced() {
        let old = Cluster::new("a", "https://old");
        let new = Cluster::new("a", "https://new");
        let diff = ClusterDiff::between(&[old.clone()], &[new.clone()]);
        assert_eq!(diff.added, vec![new]);
        assert_eq!(diff.removed, vec![old]);
    }
}
