//! Login, logout and refresh: the state machine over the claims builder,
//! the token service and the session cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::builder::{truncate_to_seconds, ClaimsBuilder};
use crate::claims::Claims;
use crate::context::RequestContext;
use crate::error::{CoreError, CoreResult};
use crate::password::{verify_password, verify_without_account};
use crate::repository::{Repositories, User};
use crate::session::{SessionCache, SessionRecord};
use crate::token::{fingerprint, TokenService};

const INVALID_CREDENTIALS: &str = "invalid email or password";

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub application: String,
    pub email: String,
    pub password: String,
    /// A token from an earlier login; reused while its session is live.
    #[serde(default)]
    pub previous_token: Option<String>,
}

impl LoginRequest {
    fn validate(&self) -> CoreResult<()> {
        if self.application.trim().is_empty() {
            return Err(CoreError::validation("application is required"));
        }
        if self.email.trim().is_empty() {
            return Err(CoreError::validation("email is required"));
        }
        if self.password.is_empty() {
            return Err(CoreError::validation("password is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedSession {
    pub user: User,
    pub access_token: String,
    /// Fresh on every login. A reused session keeps its access token but
    /// still gets a new refresh token, replacing the recorded one.
    pub refresh_token: String,
    pub claims: Claims,
    pub expires_at: DateTime<Utc>,
    pub reused: bool,
}

#[derive(Clone)]
pub struct Authenticator {
    repos: Repositories,
    builder: ClaimsBuilder,
    tokens: TokenService,
    sessions: SessionCache,
}

impl Authenticator {
    pub fn new(repos: Repositories, tokens: TokenService, sessions: SessionCache) -> Self {
        let builder = ClaimsBuilder::new(repos.clone(), tokens.config().clone());
        Self {
            repos,
            builder,
            tokens,
            sessions,
        }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    pub async fn login(&self, request: &LoginRequest, ctx: &RequestContext) -> CoreResult<IssuedSession> {
        request.validate()?;
        let application = request.application.trim();

        let app = ctx
            .run("application lookup", self.repos.applications.find_by_code(application))
            .await??
            .ok_or_else(|| CoreError::not_found(format!("application '{application}' not found")))?;

        let user = ctx
            .run("user lookup", self.repos.users.find_by_email(request.email.trim()))
            .await??;
        // Unknown email and wrong password are indistinguishable to the
        // caller, in the error and in the time spent hashing.
        let verified = match &user {
            Some(user) => verify_password(&request.password, &user.password_hash),
            None => verify_without_account(&request.password),
        };
        let Some(user) = user.filter(|_| verified) else {
            info!(application = %app.code, "login rejected");
            return Err(CoreError::unauthenticated(INVALID_CREDENTIALS));
        };

        if let Some(previous) = request.previous_token.as_deref() {
            if let Some((claims, record)) = self.reusable(previous, &user, &app.code, ctx).await? {
                let refresh_claims = self.refresh_claims(&claims, truncate_to_seconds(Utc::now()))?;
                let refresh_token = self.tokens.issue(&refresh_claims)?;
                let record = SessionRecord {
                    refresh_fingerprint: fingerprint(&refresh_token),
                    refresh_expires_at: refresh_claims.expires_at,
                    ..record
                };
                self.sessions
                    .put(ctx, user.id, &app.code, &record, self.tokens.config().session_ttl())
                    .await?;

                info!(user_id = %user.id, application = %app.code, "login reused live session");
                return Ok(IssuedSession {
                    expires_at: claims.expires_at,
                    user,
                    access_token: previous.to_string(),
                    refresh_token,
                    claims,
                    reused: true,
                });
            }
        }

        let issued = self.issue(user, &app.code, ctx).await?;
        info!(user_id = %issued.user.id, application = %app.code, "login succeeded");
        Ok(issued)
    }

    /// Drops the session for (user, application). Logging out twice is fine.
    pub async fn logout(&self, user_id: Uuid, application: &str, ctx: &RequestContext) -> CoreResult<()> {
        self.sessions.remove(ctx, user_id, application).await?;
        info!(%user_id, application, "logged out");
        Ok(())
    }

    /// Exchanges the access or refresh token of the current session for a
    /// new pair. Expiry is ignored; signature and claims shape are not.
    pub async fn refresh(&self, token: &str, application: &str, ctx: &RequestContext) -> CoreResult<IssuedSession> {
        if application.trim().is_empty() {
            return Err(CoreError::validation("application is required"));
        }
        let claims = self.tokens.validate_ignoring_expiry(token)?;

        let record = self.sessions.get(ctx, claims.subject, application).await?;
        if !record.is_some_and(|record| record.matches_any(&fingerprint(token))) {
            info!(user_id = %claims.subject, application, "refresh rejected: no matching session");
            return Err(CoreError::unauthenticated("session expired or revoked"));
        }

        let user = ctx
            .run("user lookup", self.repos.users.find_by_id(claims.subject))
            .await??
            .ok_or_else(|| CoreError::unauthenticated("session expired or revoked"))?;

        let issued = self.issue(user, application, ctx).await?;
        info!(user_id = %issued.user.id, application, "session refreshed");
        Ok(issued)
    }

    /// Claims of `previous` and its session record when the token is valid,
    /// belongs to `user` and is the recorded access token for `application`.
    async fn reusable(
        &self,
        previous: &str,
        user: &User,
        application: &str,
        ctx: &RequestContext,
    ) -> CoreResult<Option<(Claims, SessionRecord)>> {
        let claims = match self.tokens.validate(previous) {
            Ok(claims) => claims,
            Err(err) => {
                debug!(reason = err.reason(), "previous token not reusable");
                return Ok(None);
            }
        };
        if claims.subject != user.id || !claims.audience.iter().any(|aud| aud == application) {
            return Ok(None);
        }
        let record = self
            .sessions
            .get(ctx, user.id, application)
            .await?
            .filter(|record| record.matches_access(&fingerprint(previous)));
        Ok(record.map(|record| (claims, record)))
    }

    /// Same identity and authorization as `access`, new id, refresh lifetime.
    fn refresh_claims(&self, access: &Claims, issued_at: DateTime<Utc>) -> CoreResult<Claims> {
        let lifetime = chrono::Duration::from_std(self.tokens.config().refresh_ttl)
            .map_err(|_| CoreError::internal("refresh lifetime out of range"))?;
        Ok(Claims {
            token_id: Uuid::new_v4(),
            issued_at,
            expires_at: issued_at + lifetime,
            ..access.clone()
        })
    }

    async fn issue(&self, user: User, application: &str, ctx: &RequestContext) -> CoreResult<IssuedSession> {
        let config = self.tokens.config();
        let now = Utc::now();
        let claims = self
            .builder
            .build_claims_at(&user, application, ctx, now, config.access_ttl)
            .await?;

        let refresh_claims = self.refresh_claims(&claims, claims.issued_at)?;

        let access_token = self.tokens.issue(&claims)?;
        let refresh_token = self.tokens.issue(&refresh_claims)?;

        let record = SessionRecord {
            token_id: claims.token_id,
            access_fingerprint: fingerprint(&access_token),
            refresh_fingerprint: fingerprint(&refresh_token),
            expires_at: claims.expires_at,
            refresh_expires_at: refresh_claims.expires_at,
        };
        self.sessions
            .put(ctx, user.id, application, &record, config.session_ttl())
            .await?;

        Ok(IssuedSession {
            expires_at: claims.expires_at,
            user,
            access_token,
            refresh_token,
            claims,
            reused: false,
        })
    }
}
