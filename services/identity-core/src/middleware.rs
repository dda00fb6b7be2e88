use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

use crate::claims::Claims;
use crate::context::RequestContext;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::session::SessionCache;
use crate::token::{fingerprint, TokenService};

/// Verified caller attached to the request by [`require_auth`].
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub claims: Claims,
    pub token: String,
    /// Application the middleware that admitted the request guards.
    pub application: String,
}

type RejectionHook = Arc<dyn Fn(&'static str) + Send + Sync>;

/// Bearer-token gate for one application.
#[derive(Clone)]
pub struct AuthMiddleware {
    tokens: TokenService,
    sessions: SessionCache,
    application: String,
    timeout: Option<Duration>,
    on_reject: Option<RejectionHook>,
}

impl fmt::Debug for AuthMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthMiddleware")
            .field("application", &self.application)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl AuthMiddleware {
    pub fn new(tokens: TokenService, sessions: SessionCache, application: impl Into<String>) -> Self {
        Self {
            tokens,
            sessions,
            application: application.into(),
            timeout: None,
            on_reject: None,
        }
    }

    /// Deadline applied to the session lookup of each request.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Called with a short reason label for every denied request.
    pub fn with_rejection_hook(mut self, hook: impl Fn(&'static str) + Send + Sync + 'static) -> Self {
        self.on_reject = Some(Arc::new(hook));
        self
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn request_context(&self) -> RequestContext {
        match self.timeout {
            Some(timeout) => RequestContext::with_timeout(timeout),
            None => RequestContext::new(),
        }
    }

    /// Authenticates one request. Every failure denies; a session backend
    /// outage surfaces as an internal error rather than letting the call through.
    pub async fn handle(&self, headers: &HeaderMap, ctx: &RequestContext) -> CoreResult<AuthContext> {
        let context = self.identify(headers)?;
        let claims = &context.claims;

        let revoked = self
            .sessions
            .is_revoked(ctx, claims.subject, &self.application, &fingerprint(&context.token))
            .await
            .map_err(|err| {
                warn!(user_id = %claims.subject, application = %self.application, error = %err, "session check failed");
                self.reject("session_unavailable", err)
            })?;
        if revoked {
            warn!(reason = "revoked", user_id = %claims.subject, application = %self.application, "rejected bearer token");
            return Err(self.reject("revoked", CoreError::unauthenticated("session expired or revoked")));
        }

        Ok(context)
    }

    /// Bearer parsing and token verification only, without the session
    /// lookup. Enough for logout, which must succeed on a revoked session.
    pub fn identify(&self, headers: &HeaderMap) -> CoreResult<AuthContext> {
        let token = match headers.get(AUTHORIZATION) {
            Some(value) => parse_bearer(value).map_err(|err| self.reject("invalid_header", err))?,
            None => {
                return Err(self.reject(
                    "missing_token",
                    CoreError::unauthenticated("missing bearer token"),
                ))
            }
        };

        let claims = self.tokens.validate(&token).map_err(|err| {
            warn!(reason = err.reason(), application = %self.application, "rejected bearer token");
            self.reject(err.reason(), err.into())
        })?;

        Ok(AuthContext {
            claims,
            token,
            application: self.application.clone(),
        })
    }

    fn reject(&self, reason: &'static str, err: CoreError) -> CoreError {
        if let Some(hook) = &self.on_reject {
            hook(reason);
        }
        err
    }
}

/// axum middleware: `from_fn_with_state(Arc<AuthMiddleware>, require_auth)`.
pub async fn require_auth(
    State(auth): State<Arc<AuthMiddleware>>,
    mut request: Request,
    next: Next,
) -> Result<Response, CoreError> {
    let ctx = auth.request_context();
    let context = auth.handle(request.headers(), &ctx).await?;
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = CoreError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or_else(|| CoreError::unauthenticated("missing bearer token"))
    }
}

fn parse_bearer(value: &HeaderValue) -> CoreResult<String> {
    let invalid = || CoreError::new(ErrorKind::Unauthenticated, "invalid authorization header");
    let raw = value.to_str().map_err(|_| invalid())?.trim();

    let token = raw.strip_prefix("Bearer ").ok_or_else(invalid)?.trim();
    if token.is_empty() {
        return Err(invalid());
    }

    Ok(token.to_owned())
}
