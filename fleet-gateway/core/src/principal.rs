use serde::Deserialize;
use std::fmt;

/// The authenticated identity attached to a request.
///
/// A principal either carries a bearer token, which is forwarded to leaf
/// clusters as-is, or an identifier and groups, which are sent as
/// impersonation headers alongside the cluster's own credentials.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UserPrincipal {
    #[serde(default, alias = "email", alias = "sub")]
    pub id: String,

    #[serde(default)]
    pub groups: Vec<String>,

    #[serde(skip)]
    token: Option<String>,
}

/// A canonical, hashable form of a principal used to key caches.
///
/// Groups are sorted and deduplicated so that two principals differing
/// only in group order share cache entries.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PrincipalKey {
    id: String,
    groups: Vec<String>,
    token: Option<String>,
}

// === impl UserPrincipal ===

impl UserPrincipal {
    pub fn new(id: impl Into<String>, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id: id.into(),
            groups: groups.into_iter().map(Into::into).collect(),
            token: None,
        }
    }

    /// A principal identified only by a bearer token.
    pub fn from_token(token: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            groups: Vec::new(),
            token: Some(token.into()),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }

    /// A principal is usable if it names a user or carries a token.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() || self.token().is_some()
    }

    pub fn key(&self) -> PrincipalKey {
        let mut groups = self.groups.clone();
        groups.sort_unstable();
        groups.dedup();
        PrincipalKey {
            id: self.id.clone(),
            groups,
            token: self.token().map(ToString::to_string),
        }
    }
}

impl fmt::Debug for UserPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPrincipal")
            .field("id", &self.id)
            .field("groups", &self.groups)
            .field("token", &self.token().map(|_| "<redacted>"))
            .finish()
    }
}

impl fmt::Display for UserPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id.is_empty() {
            f.write_str("<token>")
        } else {
            f.write_str(&self.id)
        }
    }
}

// === impl PrincipalKey ===

impl PrincipalKey {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }
}

impl fmt::Debug for PrincipalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrincipalKey")
            .field("id", &self.id)
            .field("groups", &self.groups)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity() {
        assert!(!UserPrincipal::default().is_valid());
        assert!(!UserPrincipal::new("", ["g"]).is_valid());
        assert!(!UserPrincipal::from_token("").is_valid());
        assert!(UserPrincipal::new("alice", Vec::<String>::new()).is_valid());
        assert!(UserPrincipal::from_token("t").is_valid());
    }

    #[test]
    fn key_ignores_group_order() {
        let a = UserPrincipal::new("alice", ["g2", "g1"]);
        let b = UserPrincipal::new("alice", ["g1", "g2", "g1"]);
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().groups(), ["g1", "g2"]);

        let c = UserPrincipal::new("alice", ["g1"]);
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn key_separates_tokens() {
        let a = UserPrincipal::from_token("a");
        let b = UserPrincipal::from_token("b");
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key().id(), "");
    }

    #[test]
    fn debug_redacts_token() {
        let p = UserPrincipal::new("alice", ["g"]).with_token("s3cret");
        let out = format!("{p:?} {:?}", p.key());
        assert!(!out.contains("s3cret"), "{out}");
    }
}
