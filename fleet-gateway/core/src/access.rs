//! Namespace visibility rules.
//!
//! A namespace is shown to a user when the rules granted to them in that
//! namespace cover every rule of a minimum policy. Grants are read from a
//! `SelfSubjectRulesReview`, so they may contain `*` wildcards; these are
//! expanded against the groups and resources the policy mentions and
//! against [`VERBS`].

use ahash::AHashSet;

/// The verbs a `*` verb grant expands to.
pub const VERBS: [&str; 7] = [
    "create",
    "get",
    "list",
    "watch",
    "patch",
    "delete",
    "deletecollection",
];

const WILDCARD: &str = "*";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessRule {
    pub api_groups: Vec<String>,
    pub resources: Vec<String>,
    pub verbs: Vec<String>,
}

// === impl AccessRule ===

impl AccessRule {
    pub fn new<G, R, V>(api_groups: G, resources: R, verbs: V) -> Self
    where
        G: IntoIterator,
        G::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
        V: IntoIterator,
        V::Item: Into<String>,
    {
        Self {
            api_groups: api_groups.into_iter().map(Into::into).collect(),
            resources: resources.into_iter().map(Into::into).collect(),
            verbs: verbs.into_iter().map(Into::into).collect(),
        }
    }

    /// The policy a user must satisfy in a namespace to see it.
    pub fn defaults() -> Vec<Self> {
        const READ: [&str; 2] = ["get", "list"];
        vec![
            Self::new([""], ["secrets", "events", "pods"], READ),
            Self::new(["apps"], ["deployments"], READ),
            Self::new(["kustomize.toolkit.fluxcd.io"], ["kustomizations"], READ),
            Self::new(["helm.toolkit.fluxcd.io"], ["helmreleases"], READ),
            Self::new(
                ["source.toolkit.fluxcd.io"],
                [
                    "buckets",
                    "helmcharts",
                    "gitrepositories",
                    "helmrepositories",
                    "ocirepositories",
                ],
                READ,
            ),
        ]
    }
}

/// Returns true if `granted` covers every rule in `policy`.
pub fn covers(granted: &[AccessRule], policy: &[AccessRule]) -> bool {
    let groups = policy
        .iter()
        .flat_map(|r| r.api_groups.iter().map(String::as_str))
        .collect::<AHashSet<_>>();
    let resources = policy
        .iter()
        .flat_map(|r| r.resources.iter().map(String::as_str))
        .collect::<AHashSet<_>>();

    let mut derived = AHashSet::<(&str, &str, &str)>::new();
    for rule in granted {
        let rule_groups = expand(&rule.api_groups, || groups.iter().copied().collect());
        let rule_resources = expand(&rule.resources, || resources.iter().copied().collect());
        let rule_verbs = expand(&rule.verbs, || VERBS.to_vec());
        for g in &rule_groups {
            for r in &rule_resources {
                for v in &rule_verbs {
                    derived.insert((*g, *r, *v));
                }
            }
        }
    }

    policy.iter().all(|rule| {
        rule.api_groups.iter().all(|g| {
            rule.resources.iter().all(|r| {
                rule.verbs
                    .iter()
                    .all(|v| derived.contains(&(g.as_str(), r.as_str(), v.as_str())))
            })
        })
    })
}

fn expand<'a>(values: &'a [String], universe: impl FnOnce() -> Vec<&'a str>) -> Vec<&'a str> {
    if values.iter().any(|v| v == WILDCARD) {
        let mut expanded = universe();
        expanded.extend(
            values
                .iter()
                .map(String::as_str)
                .filter(|v| *v != WILDCARD),
        );
        expanded
    } else {
        values.iter().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configmaps(verbs: &[&str]) -> AccessRule {
        AccessRule::new([""], ["configmaps"], verbs.iter().copied())
    }

    #[test]
    fn exact_grant_covers() {
        let policy = [configmaps(&["get", "list", "watch"])];
        assert!(covers(&[configmaps(&["get", "list", "watch"])], &policy));
    }

    #[test]
    fn missing_any_verb_fails() {
        let policy = [configmaps(&["get", "list", "watch"])];
        for missing in ["get", "list", "watch"] {
            let verbs = ["get", "list", "watch"]
                .into_iter()
                .filter(|v| *v != missing)
                .collect::<Vec<_>>();
            assert!(
                !covers(&[configmaps(&verbs)], &policy),
                "removing {missing} must exclude the namespace"
            );
        }
    }

    #[test]
    fn wildcards_expand_over_policy() {
        let policy = [
            configmaps(&["get", "list"]),
            AccessRule::new(["apps"], ["deployments"], ["deletecollection"]),
        ];
        assert!(covers(&[AccessRule::new(["*"], ["*"], ["*"])], &policy));
        assert!(covers(
            &[
                AccessRule::new([""], ["*"], ["get", "list"]),
                AccessRule::new(["*"], ["deployments"], ["*"]),
            ],
            &policy
        ));
        assert!(!covers(
            &[AccessRule::new([""], ["*"], ["*"])],
            &policy
        ));
    }

    #[test]
    fn grants_are_combined_across_rules() {
        let policy = [configmaps(&["get", "list"])];
        assert!(covers(&[configmaps(&["get"]), configmaps(&["list"])], &policy));
    }

    #[test]
    fn every_policy_rule_must_hold() {
        let policy = [
            configmaps(&["get"]),
            AccessRule::new([""], ["secrets"], ["get"]),
        ];
        assert!(!covers(&[configmaps(&["get"])], &policy));
        assert!(covers(&[], &[]));
    }

    #[test]
    fn defaults_are_read_only() {
        for rule in AccessRule::defaults() {
            assert!(rule.verbs.iter().all(|v| v == "get" || v == "list"), "{rule:?}");
        }
    }
}
