//! Postgres-backed identity repositories.

use async_trait::async_trait;
use identity_core::repository::RepositoryResult;
use identity_core::{
    Application, ApplicationRepository, Permission, PermissionRepository, RepositoryError, Role,
    RoleRepository, RoleScope, User, UserRepository,
};
use sqlx::{Executor, PgPool};
use tracing::warn;
use uuid::Uuid;

/// Schema the repositories read from; applied at start-up.
pub const SCHEMA: &str = include_str!("../migrations/0001_identity.sql");

#[derive(Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn apply_schema(&self) -> Result<(), sqlx::Error> {
        self.pool.execute(SCHEMA).await?;
        Ok(())
    }
}

fn unavailable(operation: &'static str) -> impl FnOnce(sqlx::Error) -> RepositoryError {
    move |err| {
        warn!(operation, error = ?err, "identity query failed");
        RepositoryError::Unavailable(format!("{operation} failed"))
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    username: String,
    email: String,
    password_hash: String,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            username: row.username,
            email: row.email,
            password_hash: row.password_hash,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RoleRow {
    id: Uuid,
    name: String,
    application_id: Option<Uuid>,
}

impl From<RoleRow> for Role {
    fn from(row: RoleRow) -> Self {
        Role {
            id: row.id,
            name: row.name,
            scope: match row.application_id {
                Some(id) => RoleScope::Application(id),
                None => RoleScope::Global,
            },
        }
    }
}

#[derive(sqlx::FromRow)]
struct PermissionRow {
    id: Uuid,
    name: String,
}

#[derive(sqlx::FromRow)]
struct ApplicationRow {
    id: Uuid,
    code: String,
    name: String,
}

impl From<ApplicationRow> for Application {
    fn from(row: ApplicationRow) -> Self {
        Application {
            id: row.id,
            code: row.code,
            name: row.name,
        }
    }
}

#[async_trait]
impl UserRepository for PgDirectory {
    async fn find_by_email(&self, email: &str) -> RepositoryResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, email, password_hash FROM users WHERE lower(email) = lower($1)",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable("user lookup by email"))?;
        Ok(row.map(User::from))
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, email, password_hash FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable("user lookup by id"))?;
        Ok(row.map(User::from))
    }
}

#[async_trait]
impl RoleRepository for PgDirectory {
    async fn roles_for_user(&self, user_id: Uuid) -> RepositoryResult<Vec<Role>> {
        let rows = sqlx::query_as::<_, RoleRow>(
            "SELECT r.id, r.name, r.application_id \
             FROM roles r JOIN user_roles ur ON ur.role_id = r.id \
             WHERE ur.user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable("role lookup"))?;
        Ok(rows.into_iter().map(Role::from).collect())
    }
}

#[async_trait]
impl PermissionRepository for PgDirectory {
    async fn permissions_for_role(&self, role_id: Uuid) -> RepositoryResult<Vec<Permission>> {
        let rows = sqlx::query_as::<_, PermissionRow>(
            "SELECT p.id, p.name \
             FROM permissions p JOIN role_permissions rp ON rp.permission_id = p.id \
             WHERE rp.role_id = $1",
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable("permission lookup"))?;
        Ok(rows
            .into_iter()
            .map(|row| Permission {
                id: row.id,
                name: row.name,
            })
            .collect())
    }
}

#[async_trait]
impl ApplicationRepository for PgDirectory {
    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<Application>> {
        let row = sqlx::query_as::<_, ApplicationRow>(
            "SELECT id, code, name FROM applications WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable("application lookup by id"))?;
        Ok(row.map(Application::from))
    }

    async fn find_by_code(&self, code: &str) -> RepositoryResult<Option<Application>> {
        let row = sqlx::query_as::<_, ApplicationRow>(
            "SELECT id, code, name FROM applications WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable("application lookup by code"))?;
        Ok(row.map(Application::from))
    }
}
