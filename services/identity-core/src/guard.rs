use std::fmt;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;

use crate::claims::Claims;
use crate::error::{CoreError, CoreResult};
use crate::middleware::AuthContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Permission(String),
    Role(String),
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Permission(name) => write!(f, "permission '{name}'"),
            Requirement::Role(name) => write!(f, "role '{name}'"),
        }
    }
}

/// Exact-match check of one requirement against one application's entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionGuard {
    application: String,
    requirement: Requirement,
}

impl PermissionGuard {
    pub fn permission(application: impl Into<String>, permission: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            requirement: Requirement::Permission(permission.into()),
        }
    }

    pub fn role(application: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            requirement: Requirement::Role(role.into()),
        }
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn requirement(&self) -> &Requirement {
        &self.requirement
    }

    pub fn check(&self, claims: &Claims) -> CoreResult<()> {
        let granted = match &self.requirement {
            Requirement::Permission(name) => claims.has_permission(&self.application, name),
            Requirement::Role(name) => claims.has_role(&self.application, name),
        };
        if granted {
            return Ok(());
        }
        info!(
            user_id = %claims.subject,
            application = %self.application,
            requirement = %self.requirement,
            "access denied"
        );
        Err(CoreError::forbidden(format!(
            "{} required for application '{}'",
            self.requirement, self.application
        )))
    }
}

/// axum middleware layered inside [`crate::require_auth`].
pub async fn enforce_permission(
    State(guard): State<Arc<PermissionGuard>>,
    request: Request,
    next: Next,
) -> Result<Response, CoreError> {
    let context = request
        .extensions()
        .get::<AuthContext>()
        .ok_or_else(|| CoreError::unauthenticated("missing bearer token"))?;
    guard.check(&context.claims)?;
    Ok(next.run(request).await)
}
