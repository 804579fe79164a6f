//! Kubernetes label selector matching for cached lists.

use fleet_gateway_k8s_api::{Error, Result};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Selector(Vec<Requirement>);

#[derive(Clone, Debug, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    DoesNotExist(String),
}

// === impl Selector ===

impl Selector {
    pub(crate) fn parse(s: &str) -> Result<Self> {
        split_requirements(s)
            .into_iter()
            .map(Requirement::parse)
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    pub(crate) fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|r| r.matches(labels))
    }
}

/// Splits on commas outside of parenthesized value sets.
fn split_requirements(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

// === impl Requirement ===

impl Requirement {
    fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidConfig(format!("invalid label selector: {s:?}"));

        if let Some(key) = s.strip_prefix('!') {
            return Ok(Self::DoesNotExist(key.trim().to_string()));
        }
        if let Some((k, v)) = s.split_once("!=") {
            return Ok(Self::NotEquals(k.trim().to_string(), v.trim().to_string()));
        }
        if let Some((k, v)) = s.split_once("==").or_else(|| s.split_once('=')) {
            return Ok(Self::Equals(k.trim().to_string(), v.trim().to_string()));
        }
        if let Some((k, rest)) = s.split_once(" notin ") {
            return Ok(Self::NotIn(k.trim().to_string(), values(rest).ok_or_else(invalid)?));
        }
        if let Some((k, rest)) = s.split_once(" in ") {
            return Ok(Self::In(k.trim().to_string(), values(rest).ok_or_else(invalid)?));
        }
        if s.contains(char::is_whitespace) {
            return Err(invalid());
        }
        Ok(Self::Exists(s.to_string()))
    }

    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals(k, v) => labels.get(k) == Some(v),
            Self::NotEquals(k, v) => labels.get(k) != Some(v),
            Self::In(k, vs) => labels.get(k).is_some_and(|l| vs.contains(l)),
            Self::NotIn(k, vs) => labels.get(k).map_or(true, |l| !vs.contains(l)),
            Self::Exists(k) => labels.contains_key(k),
            Self::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

fn values(s: &str) -> Option<Vec<String>> {
    let inner = s.trim().strip_prefix('(')?.strip_suffix(')')?;
    Some(
        inner
            .split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn matches_requirements() {
        let labels = btreemap! {
            "app".to_string() => "web".to_string(),
            "tier".to_string() => "frontend".to_string(),
        };
        let cases = [
            ("", true),
            ("app=web", true),
            ("app==web", true),
            ("app!=web", false),
            ("app=web,tier=backend", false),
            ("app in (web, api)", true),
            ("tier notin (frontend)", false),
            ("env notin (prod)", true),
            ("app", true),
            ("!app", false),
            ("!env", true),
            ("app in (web,api),tier", true),
        ];
        for (selector, expected) in cases {
            let parsed = Selector::parse(selector).expect("valid selector");
            assert_eq!(parsed.matches(&labels), expected, "{selector}");
        }
    }

    #[test]
    fn rejects_malformed() {
        assert!(Selector::parse("app in web").is_err());
        assert!(Selector::parse("app web").is_err());
    }
}
