//! Identifies callers and equips requests to reach the fleet as them.
//!
//! [`AuthLayer`] resolves a [`UserPrincipal`] for each request with a
//! [`PrincipalGetter`] and stores it, along with the [`ClustersManager`], in
//! the request's extensions. Handlers then call [`client_from_extensions`]
//! to obtain a [`ClustersClient`] acting as the caller.

use crate::{
    core::UserPrincipal,
    fleet::{ClustersClient, ClustersManager},
    k8s::Error,
};
use futures::future::BoxFuture;
use http::{header, HeaderMap, Request, Response};
use std::{
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::{debug, trace};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("malformed {0} header")]
    MalformedHeader(&'static str),

    #[error("credentials rejected: {0}")]
    Rejected(String),
}

/// Resolves the caller of a request.
#[async_trait::async_trait]
pub trait PrincipalGetter: Send + Sync {
    /// Returns `None` when the request carries no credentials this getter
    /// understands.
    async fn principal(&self, headers: &HeaderMap) -> Result<Option<UserPrincipal>, AuthError>;
}

/// Validates a credential and returns the identity it stands for.
#[async_trait::async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<UserPrincipal, AuthError>;
}

/// Forwards the request's bearer token to the clusters unverified; the API
/// servers authenticate it.
#[derive(Clone, Debug, Default)]
pub struct BearerPassthrough;

/// Accepts bearer tokens the verifier vouches for.
#[derive(Clone)]
pub struct VerifiedBearer {
    verifier: Arc<dyn TokenVerifier>,
}

/// Accepts session cookies the verifier vouches for.
#[derive(Clone)]
pub struct VerifiedCookie {
    name: String,
    verifier: Arc<dyn TokenVerifier>,
}

/// Tries each getter in order, returning the first principal found.
#[derive(Clone, Default)]
pub struct MultiPrincipal {
    getters: Vec<Arc<dyn PrincipalGetter>>,
}

/// Installs the caller's principal and a manager handle on every request.
#[derive(Clone)]
pub struct AuthLayer {
    getter: Arc<dyn PrincipalGetter>,
    manager: ClustersManager,
    public_routes: Arc<[String]>,
}

#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    layer: AuthLayer,
}

/// The manager, as stored in request extensions.
#[derive(Clone, Debug)]
pub struct ManagerHandle(pub ClustersManager);

/// The caller's principal, if the request was authenticated.
pub fn principal(extensions: &http::Extensions) -> Option<&UserPrincipal> {
    extensions.get::<UserPrincipal>()
}

/// A facade acting as the request's caller.
pub async fn client_from_extensions(
    extensions: &http::Extensions,
) -> Result<ClustersClient, Error> {
    let principal = principal(extensions).ok_or(Error::Unauthenticated)?;
    let ManagerHandle(manager) = extensions
        .get::<ManagerHandle>()
        .ok_or(Error::Unauthenticated)?;
    manager.get_user_client(principal).await
}

/// An empty response carrying the status for `error`.
pub fn error_response<B: Default>(error: &Error) -> Response<B> {
    let mut rsp = Response::new(B::default());
    *rsp.status_mut() = error.status_code();
    rsp
}

fn bearer_token(headers: &HeaderMap) -> Result<Option<&str>, AuthError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| AuthError::MalformedHeader("authorization"))?;
    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => {
            let token = token.trim();
            Ok((!token.is_empty()).then_some(token))
        }
        _ => Ok(None),
    }
}

fn cookie<'h>(headers: &'h HeaderMap, name: &str) -> Result<Option<&'h str>, AuthError> {
    for value in headers.get_all(header::COOKIE) {
        let value = value
            .to_str()
            .map_err(|_| AuthError::MalformedHeader("cookie"))?;
        for pair in value.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=') {
                if key == name && !value.is_empty() {
                    return Ok(Some(value));
                }
            }
        }
    }
    Ok(None)
}

// === impl BearerPassthrough ===

#[async_trait::async_trait]
impl PrincipalGetter for BearerPassthrough {
    async fn principal(&self, headers: &HeaderMap) -> Result<Option<UserPrincipal>, AuthError> {
        Ok(bearer_token(headers)?.map(UserPrincipal::from_token))
    }
}

// === impl VerifiedBearer ===

impl VerifiedBearer {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait::async_trait]
impl PrincipalGetter for VerifiedBearer {
    async fn principal(&self, headers: &HeaderMap) -> Result<Option<UserPrincipal>, AuthError> {
        match bearer_token(headers)? {
            Some(token) => self.verifier.verify(token).await.map(Some),
            None => Ok(None),
        }
    }
}

// === impl VerifiedCookie ===

impl VerifiedCookie {
    pub fn new(name: impl Into<String>, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            name: name.into(),
            verifier,
        }
    }
}

#[async_trait::async_trait]
impl PrincipalGetter for VerifiedCookie {
    async fn principal(&self, headers: &HeaderMap) -> Result<Option<UserPrincipal>, AuthError> {
        match cookie(headers, &self.name)? {
            Some(token) => self.verifier.verify(token).await.map(Some),
            None => Ok(None),
        }
    }
}

// === impl MultiPrincipal ===

impl MultiPrincipal {
    pub fn new(getters: Vec<Arc<dyn PrincipalGetter>>) -> Self {
        Self { getters }
    }
}

#[async_trait::async_trait]
impl PrincipalGetter for MultiPrincipal {
    async fn principal(&self, headers: &HeaderMap) -> Result<Option<UserPrincipal>, AuthError> {
        let mut failure = None;
        for getter in &self.getters {
            match getter.principal(headers).await {
                Ok(Some(principal)) => return Ok(Some(principal)),
                Ok(None) => {}
                Err(error) => {
                    debug!(%error, "Principal lookup failed");
                    failure.get_or_insert(error);
                }
            }
        }
        failure.map_or(Ok(None), Err)
    }
}

// === impl AuthLayer ===

impl AuthLayer {
    pub fn new(getter: Arc<dyn PrincipalGetter>, manager: ClustersManager) -> Self {
        Self {
            getter,
            manager,
            public_routes: Arc::new([]),
        }
    }

    /// Lets requests for these paths through without a principal.
    pub fn with_public_routes(mut self, routes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.public_routes = routes.into_iter().map(Into::into).collect();
        self
    }

    fn is_public(&self, path: &str) -> bool {
        self.public_routes.iter().any(|route| route == path)
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            layer: self.clone(),
        }
    }
}

// === impl AuthService ===

impl<S, B, ResBody> Service<Request<B>> for AuthService<S>
where
    S: Service<Request<B>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response<ResBody>, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        // The readied service handles this request; its clone takes its place.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        req.extensions_mut()
            .insert(ManagerHandle(self.layer.manager.clone()));
        if self.layer.is_public(req.uri().path()) {
            trace!(path = %req.uri().path(), "Public route");
            return Box::pin(inner.call(req));
        }

        let getter = self.layer.getter.clone();
        Box::pin(async move {
            let principal = match getter.principal(req.headers()).await {
                Ok(Some(principal)) if principal.is_valid() => principal,
                Ok(_) => {
                    debug!(path = %req.uri().path(), "No credentials");
                    return Ok(error_response(&Error::Unauthenticated));
                }
                Err(error) => {
                    debug!(path = %req.uri().path(), %error, "Rejected credentials");
                    return Ok(error_response(&Error::Unauthenticated));
                }
            };
            req.extensions_mut().insert(principal);
            inner.call(req).await
        })
    }
}

impl std::fmt::Debug for AuthLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthLayer")
            .field("public_routes", &self.public_routes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::{
            fake::{FakeFactory, FakeFetcher},
            ClientCaches, LeafConnector, RulesReviewChecker,
        },
        fleet::{FleetMetrics, ManagerConfig},
    };
    use http::StatusCode;
    use std::convert::Infallible;
    use tower::ServiceExt;

    struct Sessions;

    #[async_trait::async_trait]
    impl TokenVerifier for Sessions {
        async fn verify(&self, token: &str) -> Result<UserPrincipal, AuthError> {
            match token {
                "good" => Ok(UserPrincipal::new("alice", ["dev"])),
                _ => Err(AuthError::Rejected("unknown session".to_string())),
            }
        }
    }

    fn manager() -> ClustersManager {
        let factory = Arc::new(FakeFactory::default());
        let caches = Arc::new(ClientCaches::default());
        ClustersManager::new(
            Arc::new(FakeFetcher::new(vec![])),
            Arc::new(LeafConnector::new(factory.clone(), caches.clone()).with_options(vec![])),
            Arc::new(RulesReviewChecker::new(factory)),
            caches,
            ManagerConfig::default(),
            FleetMetrics::default(),
        )
    }

    /// Responds with the caller and whether a facade could be built for
    /// them, e.g. `alice true`.
    async fn call(layer: AuthLayer, req: Request<()>) -> Response<String> {
        let svc = layer.layer(tower::service_fn(|req: Request<()>| async move {
            let client = client_from_extensions(req.extensions()).await;
            let caller = principal(req.extensions())
                .map(ToString::to_string)
                .unwrap_or_else(|| "-".to_string());
            Ok::<_, Infallible>(Response::new(format!("{caller} {}", client.is_ok())))
        }));
        svc.oneshot(req).await.expect("service must not fail")
    }

    fn request(path: &str, headers: &[(header::HeaderName, &str)]) -> Request<()> {
        let mut req = Request::get(path);
        for (name, value) in headers {
            req = req.header(name, *value);
        }
        req.body(()).expect("request must be valid")
    }

    #[tokio::test]
    async fn rejects_requests_without_credentials() {
        let layer = AuthLayer::new(Arc::new(BearerPassthrough), manager());
        let rsp = call(layer, request("/api/v1/objects", &[])).await;
        assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(rsp.body(), "");
    }

    #[tokio::test]
    async fn passes_bearer_tokens_through() {
        let layer = AuthLayer::new(Arc::new(BearerPassthrough), manager());
        let rsp = call(
            layer,
            request("/api/v1/objects", &[(header::AUTHORIZATION, "Bearer abc")]),
        )
        .await;
        assert_eq!(rsp.status(), StatusCode::OK);
        assert_eq!(rsp.body(), "<token> true");
    }

    #[tokio::test]
    async fn public_routes_skip_authentication() {
        let layer =
            AuthLayer::new(Arc::new(BearerPassthrough), manager()).with_public_routes(["/healthz"]);
        let rsp = call(layer, request("/healthz", &[])).await;
        assert_eq!(rsp.status(), StatusCode::OK);
        assert_eq!(rsp.body(), "- false");
    }

    #[tokio::test]
    async fn verifies_session_cookies() {
        let getter = Arc::new(VerifiedCookie::new("session", Arc::new(Sessions)));
        let layer = AuthLayer::new(getter, manager());

        let rsp = call(
            layer.clone(),
            request("/", &[(header::COOKIE, "theme=dark; session=good")]),
        )
        .await;
        assert_eq!(rsp.body(), "alice true");

        let rsp = call(layer, request("/", &[(header::COOKIE, "session=stolen")])).await;
        assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn tries_each_getter_in_order() {
        let getter = MultiPrincipal::new(vec![
            Arc::new(VerifiedCookie::new("session", Arc::new(Sessions))),
            Arc::new(VerifiedBearer::new(Arc::new(Sessions))),
        ]);
        let layer = AuthLayer::new(Arc::new(getter), manager());

        let rsp = call(
            layer.clone(),
            request("/", &[(header::AUTHORIZATION, "Bearer good")]),
        )
        .await;
        assert_eq!(rsp.body(), "alice true");

        let rsp = call(layer, request("/", &[(header::AUTHORIZATION, "Bearer bad")])).await;
        assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn ignores_other_authorization_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic dXNlcjpwYXNz".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), None);
        headers.insert(header::AUTHORIZATION, "bearer  xyz ".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), Some("xyz"));
    }
}
