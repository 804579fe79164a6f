use fleet_gateway_core::{access, AccessRule};
use fleet_gateway_k8s_api::{ClientFactory, Namespace, ResourceExt, RestConfig, Result};
use futures::prelude::*;
use std::sync::Arc;

/// Reviews issued concurrently for one filter call.
const REVIEW_CONCURRENCY: usize = 8;

/// Decides which namespaces an identity may use.
#[async_trait::async_trait]
pub trait NamespaceChecker: Send + Sync {
    /// Returns the subset of `namespaces` accessible with `config`, which
    /// already carries the user's identity.
    async fn filter_accessible(
        &self,
        config: &RestConfig,
        namespaces: &[Namespace],
    ) -> Result<Vec<Namespace>>;
}

/// Checks namespaces with `SelfSubjectRulesReview`s against a policy.
pub struct RulesReviewChecker {
    policy: Arc<[AccessRule]>,
    clients: Arc<dyn ClientFactory>,
}

// === impl RulesReviewChecker ===

impl RulesReviewChecker {
    pub fn new(clients: Arc<dyn ClientFactory>) -> Self {
        Self::with_policy(clients, AccessRule::defaults())
    }

    pub fn with_policy(clients: Arc<dyn ClientFactory>, policy: Vec<AccessRule>) -> Self {
        Self {
            policy: policy.into(),
            clients,
        }
    }
}

#[async_trait::async_trait]
impl NamespaceChecker for RulesReviewChecker {
    async fn filter_accessible(
        &self,
        config: &RestConfig,
        namespaces: &[Namespace],
    ) -> Result<Vec<Namespace>> {
        let client = self.clients.client(config)?;
        let reviews = namespaces.iter().cloned().map(|ns| {
            let client = client.clone();
            let policy = self.policy.clone();
            async move {
                let granted = client.rules_review(&ns.name_any()).await?;
                let accessible = access::covers(&granted, &policy);
                Ok::<_, fleet_gateway_k8s_api::Error>(accessible.then_some(ns))
            }
        });
        let accessible = stream::iter(reviews)
            .buffered(REVIEW_CONCURRENCY)
            .try_collect::<Vec<_>>()
            .await?;
        Ok(accessible.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeFactory;
    use fleet_gateway_core::{Cluster, UserPrincipal};
    use fleet_gateway_k8s_api::{Error, ObjectMeta};

    fn namespace(name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn configmaps(verbs: &[&str]) -> AccessRule {
        AccessRule::new([""], ["configmaps"], verbs.iter().copied())
    }

    fn user_config() -> RestConfig {
        RestConfig::for_cluster(&Cluster::new("a", "https://a:6443").with_token("T"))
            .and_then(|c| c.with_principal(&UserPrincipal::new("alice", ["g"])))
            .expect("valid config")
    }

    #[tokio::test]
    async fn filters_by_policy() {
        let factory = Arc::new(FakeFactory::default());
        let fake = factory.cluster("https://a:6443");
        fake.set_rules("x", vec![configmaps(&["get", "list", "watch"])]);
        fake.set_rules("y", vec![configmaps(&["get", "list"])]);
        fake.set_rules("z", vec![AccessRule::new(["*"], ["*"], ["*"])]);

        let checker = RulesReviewChecker::with_policy(
            factory.clone(),
            vec![configmaps(&["get", "list", "watch"])],
        );
        let accessible = checker
            .filter_accessible(
                &user_config(),
                &[namespace("x"), namespace("y"), namespace("z"), namespace("w")],
            )
            .await
            .expect("reviews succeed");
        let names = accessible.iter().map(|ns| ns.name_any()).collect::<Vec<_>>();
        assert_eq!(names, ["x", "z"]);
        assert_eq!(fake.rules_reviews(), 4);

        // Reviews are issued with the caller's identity.
        let configs = factory.configs();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].impersonated_user(), Some("alice"));
    }

    #[tokio::test]
    async fn review_errors_propagate() {
        let factory = Arc::new(FakeFactory::default());
        factory.cluster("https://a:6443").fail_with(500);
        let checker = RulesReviewChecker::new(factory);
        let err = checker
            .filter_accessible(&user_config(), &[namespace("x")])
            .await
            .expect_err("review fails");
        assert!(matches!(err, Error::Kube(_)), "{err}");
    }
}
