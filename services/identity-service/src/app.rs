use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use identity_core::{
    AuthMiddleware, Authenticator, JwkSet, RequestContext, SessionCache, TokenService,
};

use crate::handlers::{authenticate, health, jwks, login, logout, me, metrics, refresh};
use crate::metrics::IdentityMetrics;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub authenticator: Authenticator,
    pub tokens: TokenService,
    pub sessions: SessionCache,
    pub metrics: Arc<IdentityMetrics>,
    /// Built once; the key set never changes while the process runs.
    pub jwks: Arc<JwkSet>,
    pub request_timeout: Duration,
}

impl FromRef<AppState> for Arc<IdentityMetrics> {
    fn from_ref(state: &AppState) -> Self {
        state.metrics.clone()
    }
}

impl AppState {
    pub fn new(
        authenticator: Authenticator,
        metrics: Arc<IdentityMetrics>,
        request_timeout: Duration,
    ) -> Self {
        let tokens = authenticator.tokens().clone();
        let sessions = authenticator.sessions().clone();
        let keys = tokens.keys();
        let jwks = Arc::new(identity_core::get_jwks(keys.public_key(), keys.kid()));
        Self {
            authenticator,
            tokens,
            sessions,
            metrics,
            jwks,
            request_timeout,
        }
    }

    pub fn request_context(&self) -> RequestContext {
        RequestContext::with_timeout(self.request_timeout)
    }

    /// Gate for one application, reporting rejections to the metrics.
    pub fn auth_for(&self, application: &str) -> AuthMiddleware {
        let metrics = self.metrics.clone();
        AuthMiddleware::new(self.tokens.clone(), self.sessions.clone(), application)
            .with_timeout(self.request_timeout)
            .with_rejection_hook(move |reason| metrics.token_rejected(reason))
    }

    pub fn record_login_metric(&self, outcome: &str) {
        self.metrics.login_attempt(outcome);
    }
}

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/me", get(me))
        .route_layer(from_fn_with_state(state.clone(), authenticate));

    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/.well-known/jwks.json", get(jwks))
        .route("/login", post(login))
        .route("/refresh", post(refresh))
        .route("/logout", post(logout))
        .merge(protected)
        .with_state(state)
}
