//! Read-only views of the persistence layer that the core consumes.
//!
//! Concrete backends live outside the core (Postgres in the service crate);
//! [`InMemoryDirectory`] backs tests and local development.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("repository backend unavailable: {0}")]
    Unavailable(String),
    #[error("repository returned inconsistent data: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Application {
    pub id: Uuid,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleScope {
    /// Grants apply to every application.
    Global,
    Application(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub scope: RoleScope,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    pub id: Uuid,
    pub name: String,
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_email(&self, email: &str) -> RepositoryResult<Option<User>>;
    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<User>>;
}

#[async_trait]
pub trait RoleRepository: Send + Sync {
    /// Every role assigned to the user, global and application-scoped.
    async fn roles_for_user(&self, user_id: Uuid) -> RepositoryResult<Vec<Role>>;
}

#[async_trait]
pub trait PermissionRepository: Send + Sync {
    async fn permissions_for_role(&self, role_id: Uuid) -> RepositoryResult<Vec<Permission>>;
}

#[async_trait]
pub trait ApplicationRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<Application>>;
    async fn find_by_code(&self, code: &str) -> RepositoryResult<Option<Application>>;
}

/// The capability set handed to the claims builder and the login workflow.
#[derive(Clone)]
pub struct Repositories {
    pub users: Arc<dyn UserRepository>,
    pub roles: Arc<dyn RoleRepository>,
    pub permissions: Arc<dyn PermissionRepository>,
    pub applications: Arc<dyn ApplicationRepository>,
}

impl Repositories {
    /// One backend serving every capability.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: UserRepository + RoleRepository + PermissionRepository + ApplicationRepository + 'static,
    {
        Self {
            users: backend.clone(),
            roles: backend.clone(),
            permissions: backend.clone(),
            applications: backend,
        }
    }
}

#[derive(Default)]
struct DirectoryState {
    users: HashMap<Uuid, User>,
    applications: HashMap<Uuid, Application>,
    roles: HashMap<Uuid, Role>,
    permissions: HashMap<Uuid, Permission>,
    user_roles: HashMap<Uuid, Vec<Uuid>>,
    role_permissions: HashMap<Uuid, Vec<Uuid>>,
}

/// In-process implementation of every repository trait.
#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    inner: Arc<RwLock<DirectoryState>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, username: &str, email: &str, password_hash: &str) -> User {
        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
        };
        self.inner.write().await.users.insert(user.id, user.clone());
        user
    }

    pub async fn add_application(&self, code: &str, name: &str) -> Application {
        let app = Application {
            id: Uuid::new_v4(),
            code: code.to_string(),
            name: name.to_string(),
        };
        self.inner
            .write()
            .await
            .applications
            .insert(app.id, app.clone());
        app
    }

    pub async fn add_role(&self, name: &str, scope: RoleScope) -> Role {
        let role = Role {
            id: Uuid::new_v4(),
            name: name.to_string(),
            scope,
        };
        self.inner.write().await.roles.insert(role.id, role.clone());
        role
    }

    pub async fn add_permission(&self, name: &str) -> Permission {
        let permission = Permission {
            id: Uuid::new_v4(),
            name: name.to_string(),
        };
        self.inner
            .write()
            .await
            .permissions
            .insert(permission.id, permission.clone());
        permission
    }

    pub async fn assign_role(&self, user_id: Uuid, role_id: Uuid) {
        let mut state = self.inner.write().await;
        let roles = state.user_roles.entry(user_id).or_default();
        if !roles.contains(&role_id) {
            roles.push(role_id);
        }
    }

    pub async fn revoke_role(&self, user_id: Uuid, role_id: Uuid) {
        let mut state = self.inner.write().await;
        if let Some(roles) = state.user_roles.get_mut(&user_id) {
            roles.retain(|id| *id != role_id);
        }
    }

    pub async fn grant_permission(&self, role_id: Uuid, permission_id: Uuid) {
        let mut state = self.inner.write().await;
        let permissions = state.role_permissions.entry(role_id).or_default();
        if !permissions.contains(&permission_id) {
            permissions.push(permission_id);
        }
    }
}

#[async_trait]
impl UserRepository for InMemoryDirectory {
    async fn find_by_email(&self, email: &str) -> RepositoryResult<Option<User>> {
        let state = self.inner.read().await;
        Ok(state
            .users
            .values()
            .find(|user| user.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<User>> {
        Ok(self.inner.read().await.users.get(&id).cloned())
    }
}

#[async_trait]
impl RoleRepository for InMemoryDirectory {
    async fn roles_for_user(&self, user_id: Uuid) -> RepositoryResult<Vec<Role>> {
        let state = self.inner.read().await;
        let Some(role_ids) = state.user_roles.get(&user_id) else {
            return Ok(Vec::new());
        };
        role_ids
            .iter()
            .map(|id| {
                state
                    .roles
                    .get(id)
                    .cloned()
                    .ok_or_else(|| RepositoryError::Inconsistent(format!("dangling role {id}")))
            })
            .collect()
    }
}

#[async_trait]
impl PermissionRepository for InMemoryDirectory {
    async fn permissions_for_role(&self, role_id: Uuid) -> RepositoryResult<Vec<Permission>> {
        let state = self.inner.read().await;
        let Some(permission_ids) = state.role_permissions.get(&role_id) else {
            return Ok(Vec::new());
        };
        permission_ids
            .iter()
            .map(|id| {
                state.permissions.get(id).cloned().ok_or_else(|| {
                    RepositoryError::Inconsistent(format!("dangling permission {id}"))
                })
            })
            .collect()
    }
}

#[async_trait]
impl ApplicationRepository for InMemoryDirectory {
    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<Application>> {
        Ok(self.inner.read().await.applications.get(&id).cloned())
    }

    async fn find_by_code(&self, code: &str) -> RepositoryResult<Option<Application>> {
        let state = self.inner.read().await;
        Ok(state
            .applications
            .values()
            .find(|app| app.code == code)
            .cloned())
    }
}
