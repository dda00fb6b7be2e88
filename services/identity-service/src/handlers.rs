use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use common_http_errors::ApiError;
use identity_core::{
    require_auth, AuthContext, Claims, CoreError, IssuedSession, LoginRequest,
};
use serde::Deserialize;
use tracing::error;

use crate::app::AppState;
use crate::metrics::IdentityMetrics;

/// Names the application whose session guards `/logout` and `/me`.
pub const APPLICATION_HEADER: &str = "x-application";

pub async fn health() -> &'static str {
    "ok"
}

pub async fn metrics(State(metrics): State<Arc<IdentityMetrics>>) -> Response {
    match metrics.encode() {
        Ok(text) => ([(CONTENT_TYPE, prometheus::TEXT_FORMAT)], text).into_response(),
        Err(err) => {
            error!(error = %err, "failed to render metrics");
            ApiError::internal("metrics unavailable").into_response()
        }
    }
}

pub async fn jwks(State(state): State<AppState>) -> Response {
    let mut response = Json(state.jwks.as_ref().clone()).into_response();
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("public, max-age=300"));
    response
}

pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<IssuedSession>, CoreError> {
    let Json(request) = payload.map_err(|rejection| CoreError::validation(rejection.body_text()))?;

    let result = state
        .authenticator
        .login(&request, &state.request_context())
        .await;
    match &result {
        Ok(issued) if issued.reused => state.record_login_metric("reused"),
        Ok(_) => state.record_login_metric("success"),
        Err(err) => state.record_login_metric(err.kind().as_str()),
    }
    result.map(Json)
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub application: String,
    /// Either token of the current session.
    pub refresh_token: String,
}

pub async fn refresh(
    State(state): State<AppState>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<IssuedSession>, CoreError> {
    let Json(request) = payload.map_err(|rejection| CoreError::validation(rejection.body_text()))?;
    if request.refresh_token.trim().is_empty() {
        return Err(CoreError::validation("refresh_token is required"));
    }

    let issued = state
        .authenticator
        .refresh(
            request.refresh_token.trim(),
            request.application.trim(),
            &state.request_context(),
        )
        .await?;
    Ok(Json(issued))
}

/// Needs a verified token but not a live session, so a repeated logout
/// still answers 204.
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode, CoreError> {
    let application = target_application(&state, &headers)?;
    let auth = state.auth_for(&application).identify(&headers)?;
    state
        .authenticator
        .logout(auth.claims.subject, &application, &state.request_context())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn me(auth: AuthContext) -> Json<Claims> {
    Json(auth.claims)
}

/// Resolves the target application from the request and runs the core
/// bearer-token middleware for it.
pub async fn authenticate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, CoreError> {
    let application = target_application(&state, request.headers())?;
    require_auth(State(Arc::new(state.auth_for(&application))), request, next).await
}

/// A request without credentials is unauthenticated whatever else it
/// lacks; only then is the application header required.
fn target_application(state: &AppState, headers: &HeaderMap) -> Result<String, CoreError> {
    if !headers.contains_key(AUTHORIZATION) {
        state.metrics.token_rejected("missing_token");
        return Err(CoreError::unauthenticated("missing bearer token"));
    }
    headers
        .get(APPLICATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| CoreError::validation("missing X-Application header"))
}
