use axum::response::{IntoResponse, Response};
use common_http_errors::ApiError;
use thiserror::Error;

use crate::context::Interrupted;
use crate::keys::KeyLoadError;
use crate::repository::RepositoryError;
use crate::session::SessionError;
use crate::token::TokenError;

pub type CoreResult<T> = Result<T, CoreError>;

/// Externally visible failure classes. Each maps to exactly one HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ValidationError,
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct CoreError {
    kind: ErrorKind,
    message: String,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthenticated, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

// Backend detail is logged at the failure site; the messages below are the
// stable strings clients see.

impl From<KeyLoadError> for CoreError {
    fn from(_: KeyLoadError) -> Self {
        Self::internal("signing keys unavailable")
    }
}

impl From<TokenError> for CoreError {
    fn from(value: TokenError) -> Self {
        match value {
            TokenError::Signing => Self::internal("unable to sign token"),
            other => Self::unauthenticated(other.to_string()),
        }
    }
}

impl From<RepositoryError> for CoreError {
    fn from(_: RepositoryError) -> Self {
        Self::internal("identity repository unavailable")
    }
}

impl From<SessionError> for CoreError {
    fn from(_: SessionError) -> Self {
        Self::internal("session cache unavailable")
    }
}

impl From<Interrupted> for CoreError {
    fn from(value: Interrupted) -> Self {
        Self::internal(value.to_string())
    }
}

impl From<CoreError> for ApiError {
    fn from(value: CoreError) -> Self {
        let message = value.message;
        match value.kind {
            ErrorKind::ValidationError => ApiError::Validation { message },
            ErrorKind::Unauthenticated => ApiError::Unauthenticated { message },
            ErrorKind::Forbidden => ApiError::Forbidden { message },
            ErrorKind::NotFound => ApiError::NotFound { message },
            ErrorKind::Conflict => ApiError::Conflict { message },
            ErrorKind::InternalError => ApiError::Internal { message },
        }
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn token_failures_are_unauthenticated_with_stable_message() {
        let err = CoreError::from(TokenError::Expired);
        assert_eq!(err.kind(), ErrorKind::Unauthenticated);
        assert_eq!(err.message(), "token expired");
    }

    #[test]
    fn signing_failure_is_internal() {
        let err = CoreError::from(TokenError::Signing);
        assert_eq!(err.kind(), ErrorKind::InternalError);
    }

    #[test]
    fn backend_detail_is_not_exposed() {
        let err = CoreError::from(SessionError::Unavailable(
            "connection refused (os error 111) at 10.0.0.4:6379".into(),
        ));
        assert_eq!(err.kind(), ErrorKind::InternalError);
        assert!(!err.message().contains("10.0.0.4"));
    }

    #[test]
    fn kinds_map_to_statuses() {
        let cases = [
            (CoreError::validation("bad"), StatusCode::BAD_REQUEST),
            (CoreError::unauthenticated("no"), StatusCode::UNAUTHORIZED),
            (CoreError::forbidden("no"), StatusCode::FORBIDDEN),
            (CoreError::not_found("gone"), StatusCode::NOT_FOUND),
            (CoreError::conflict("dup"), StatusCode::CONFLICT),
            (CoreError::internal("boom"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            let kind = err.kind().as_str();
            let api = ApiError::from(err);
            assert_eq!(api.status(), status);
            assert_eq!(api.kind(), kind);
        }
    }
}
