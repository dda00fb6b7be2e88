//! Turns a user's role graph into token claims.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, TimeZone, Utc};
use futures::future::try_join_all;
use tracing::warn;
use uuid::Uuid;

use crate::claims::{Authorization, Claims, WILDCARD_AUDIENCE};
use crate::config::JwtConfig;
use crate::context::RequestContext;
use crate::error::{CoreError, CoreResult};
use crate::repository::{Application, Permission, Repositories, RepositoryError, Role, RoleScope, User};

/// A role together with the permissions it grants, as fetched for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRole {
    pub name: String,
    /// `None` for global roles, otherwise the owning application's code.
    pub application: Option<String>,
    pub permissions: Vec<String>,
}

#[derive(Clone)]
pub struct ClaimsBuilder {
    repos: Repositories,
    config: JwtConfig,
}

impl ClaimsBuilder {
    pub fn new(repos: Repositories, config: JwtConfig) -> Self {
        Self { repos, config }
    }

    pub async fn build_claims(
        &self,
        user: &User,
        application: &str,
        ctx: &RequestContext,
    ) -> CoreResult<Claims> {
        self.build_claims_at(user, application, ctx, Utc::now(), self.config.access_ttl)
            .await
    }

    /// Builds claims issued at `now` and valid for `lifetime`.
    pub async fn build_claims_at(
        &self,
        user: &User,
        application: &str,
        ctx: &RequestContext,
        now: DateTime<Utc>,
        lifetime: std::time::Duration,
    ) -> CoreResult<Claims> {
        let roles = self.resolve_roles(user.id, ctx).await?;
        let (audience, authorization) = aggregate(&roles, application);

        let issued_at = truncate_to_seconds(now);
        let lifetime = chrono::Duration::from_std(lifetime)
            .map_err(|_| CoreError::internal("token lifetime out of range"))?;

        Ok(Claims {
            issuer: self.config.issuer.clone(),
            subject: user.id,
            audience,
            issued_at,
            expires_at: issued_at + lifetime,
            token_id: Uuid::new_v4(),
            username: user.username.clone(),
            email: user.email.clone(),
            authorization,
        })
    }

    /// Fetches roles, then fans out permission and application lookups.
    /// The join is all-or-nothing: one failed lookup fails the build.
    async fn resolve_roles(
        &self,
        user_id: Uuid,
        ctx: &RequestContext,
    ) -> CoreResult<Vec<ResolvedRole>> {
        let roles = ctx
            .run("role lookup", self.repos.roles.roles_for_user(user_id))
            .await?
            .inspect_err(|err| warn!(user_id = %user_id, error = %err, "role lookup failed"))?;
        if roles.is_empty() {
            return Ok(Vec::new());
        }

        let app_ids: Vec<Uuid> = roles
            .iter()
            .filter_map(|role| match role.scope {
                RoleScope::Application(id) => Some(id),
                RoleScope::Global => None,
            })
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let permission_lookups = try_join_all(
            roles
                .iter()
                .map(|role| self.repos.permissions.permissions_for_role(role.id)),
        );
        let application_lookups = try_join_all(
            app_ids
                .iter()
                .map(|id| self.repos.applications.find_by_id(*id)),
        );

        let (permissions, applications) = ctx
            .run("permission lookup", async {
                futures::try_join!(permission_lookups, application_lookups)
            })
            .await?
            .inspect_err(|err| warn!(user_id = %user_id, error = %err, "permission lookup failed"))?;

        let codes = index_applications(&app_ids, applications)?;
        let resolved = roles
            .into_iter()
            .zip(permissions)
            .map(|(role, permissions)| resolve(role, permissions, &codes))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(resolved)
    }
}

fn index_applications(
    ids: &[Uuid],
    found: Vec<Option<Application>>,
) -> Result<HashMap<Uuid, String>, RepositoryError> {
    ids.iter()
        .zip(found)
        .map(|(id, app)| match app {
            Some(app) => Ok((*id, app.code)),
            None => Err(RepositoryError::Inconsistent(format!(
                "role scoped to unknown application {id}"
            ))),
        })
        .collect()
}

fn resolve(
    role: Role,
    permissions: Vec<Permission>,
    codes: &HashMap<Uuid, String>,
) -> Result<ResolvedRole, RepositoryError> {
    let application = match role.scope {
        RoleScope::Global => None,
        RoleScope::Application(id) => Some(codes.get(&id).cloned().ok_or_else(|| {
            RepositoryError::Inconsistent(format!("role {} scoped to unknown application", role.id))
        })?),
    };
    Ok(ResolvedRole {
        name: role.name,
        application,
        permissions: permissions.into_iter().map(|p| p.name).collect(),
    })
}

/// Pure aggregation step: returns `(audience, authorization)`.
///
/// One entry per application referenced by a scoped role plus the requested
/// application, each merged with every global role. Entries are sorted by
/// application code; `*` follows the codes when any global role is held.
/// A user without roles gets no entries and an audience of just the
/// requested application.
pub fn aggregate(roles: &[ResolvedRole], requested: &str) -> (Vec<String>, Vec<Authorization>) {
    if roles.is_empty() {
        return (vec![requested.to_string()], Vec::new());
    }

    let mut global_roles = BTreeSet::new();
    let mut global_permissions = BTreeSet::new();
    let mut entries: BTreeMap<&str, Authorization> = BTreeMap::new();
    entries.insert(requested, Authorization::new(requested));

    for role in roles {
        match &role.application {
            None => {
                global_roles.insert(role.name.clone());
                global_permissions.extend(role.permissions.iter().cloned());
            }
            Some(app) => {
                let entry = entries
                    .entry(app.as_str())
                    .or_insert_with(|| Authorization::new(app.as_str()));
                entry.roles.insert(role.name.clone());
                entry.permissions.extend(role.permissions.iter().cloned());
            }
        }
    }

    let mut audience: Vec<String> = entries.keys().map(|code| code.to_string()).collect();
    if !global_roles.is_empty() {
        audience.push(WILDCARD_AUDIENCE.to_string());
    }

    let authorization = entries
        .into_values()
        .map(|mut entry| {
            entry.roles.extend(global_roles.iter().cloned());
            entry.permissions.extend(global_permissions.iter().cloned());
            entry
        })
        .collect();

    (audience, authorization)
}

pub(crate) fn truncate_to_seconds(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(at.timestamp(), 0).single().unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::repository::InMemoryDirectory;
    use std::sync::Arc;
    use std::time::Duration;

    fn global(name: &str, permissions: &[&str]) -> ResolvedRole {
        ResolvedRole {
            name: name.into(),
            application: None,
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn scoped(name: &str, app: &str, permissions: &[&str]) -> ResolvedRole {
        ResolvedRole {
            name: name.into(),
            application: Some(app.into()),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn global_and_scoped_roles_merge_into_one_entry() {
        let roles = vec![global("admin", &["read"]), scoped("editor", "app1", &["write"])];
        let (audience, authorization) = aggregate(&roles, "app1");

        assert_eq!(audience, vec!["app1".to_string(), "*".to_string()]);
        assert_eq!(authorization.len(), 1);
        assert_eq!(authorization[0].app, "app1");
        assert_eq!(authorization[0].roles, set(&["admin", "editor"]));
        assert_eq!(authorization[0].permissions, set(&["read", "write"]));
    }

    #[test]
    fn no_roles_yields_requested_audience_only() {
        let (audience, authorization) = aggregate(&[], "app1");
        assert_eq!(audience, vec!["app1".to_string()]);
        assert!(authorization.is_empty());
    }

    #[test]
    fn entries_are_sorted_and_deduplicated() {
        let roles = vec![
            scoped("viewer", "zeta", &["read", "read"]),
            scoped("editor", "alpha", &["write"]),
            scoped("author", "alpha", &["write", "publish"]),
        ];
        let (audience, authorization) = aggregate(&roles, "mid");

        assert_eq!(audience, vec!["alpha", "mid", "zeta"]);
        let apps: Vec<_> = authorization.iter().map(|a| a.app.as_str()).collect();
        assert_eq!(apps, vec!["alpha", "mid", "zeta"]);
        assert_eq!(authorization[0].permissions, set(&["publish", "write"]));
        assert_eq!(authorization[2].permissions, set(&["read"]));
        // requested app with no scoped grants and no globals
        assert!(authorization[1].roles.is_empty());
    }

    #[test]
    fn audience_matches_entry_codes_plus_wildcard() {
        let roles = vec![
            global("auditor", &["audit"]),
            scoped("editor", "app2", &["write"]),
        ];
        let (audience, authorization) = aggregate(&roles, "app1");
        let codes: Vec<_> = authorization.iter().map(|a| a.app.clone()).collect();
        assert_eq!(&audience[..codes.len()], &codes[..]);
        assert_eq!(audience.last().map(String::as_str), Some(WILDCARD_AUDIENCE));
        for entry in &authorization {
            assert!(entry.roles.contains("auditor"));
            assert!(entry.permissions.contains("audit"));
        }
    }

    async fn seeded() -> (InMemoryDirectory, User) {
        let dir = InMemoryDirectory::new();
        let user = dir.add_user("ada", "ada@example.com", "hash").await;
        let app = dir.add_application("app1", "App One").await;
        let admin = dir.add_role("admin", RoleScope::Global).await;
        let editor = dir.add_role("editor", RoleScope::Application(app.id)).await;
        let read = dir.add_permission("read").await;
        let write = dir.add_permission("write").await;
        dir.grant_permission(admin.id, read.id).await;
        dir.grant_permission(editor.id, write.id).await;
        dir.assign_role(user.id, admin.id).await;
        dir.assign_role(user.id, editor.id).await;
        (dir, user)
    }

    #[tokio::test]
    async fn builds_claims_from_repositories() {
        let (dir, user) = seeded().await;
        let builder = ClaimsBuilder::new(
            Repositories::from_backend(Arc::new(dir)),
            JwtConfig::new("identity"),
        );
        let now = Utc.timestamp_opt(1_700_000_000, 500).unwrap();
        let claims = builder
            .build_claims_at(&user, "app1", &RequestContext::new(), now, Duration::from_secs(900))
            .await
            .expect("claims");

        assert_eq!(claims.subject, user.id);
        assert_eq!(claims.issuer, "identity");
        assert_eq!(claims.issued_at.timestamp(), 1_700_000_000);
        assert_eq!(claims.issued_at.timestamp_subsec_nanos(), 0);
        assert_eq!(claims.expires_at.timestamp(), 1_700_000_900);
        assert_eq!(claims.audience, vec!["app1".to_string(), "*".to_string()]);
        assert_eq!(claims.authorization[0].roles, set(&["admin", "editor"]));
        assert_eq!(claims.authorization[0].permissions, set(&["read", "write"]));
    }

    #[tokio::test]
    async fn equal_inputs_give_equal_authorization() {
        let (dir, user) = seeded().await;
        let builder = ClaimsBuilder::new(
            Repositories::from_backend(Arc::new(dir)),
            JwtConfig::new("identity"),
        );
        let ctx = RequestContext::new();
        let first = builder.build_claims(&user, "app1", &ctx).await.unwrap();
        let second = builder.build_claims(&user, "app1", &ctx).await.unwrap();
        assert_eq!(first.authorization, second.authorization);
        assert_eq!(first.audience, second.audience);
        assert_ne!(first.token_id, second.token_id);
    }

    #[tokio::test]
    async fn cancelled_request_stops_before_lookup() {
        let (dir, user) = seeded().await;
        let builder = ClaimsBuilder::new(
            Repositories::from_backend(Arc::new(dir)),
            JwtConfig::new("identity"),
        );
        let ctx = RequestContext::new();
        ctx.cancellation().cancel();
        let err = builder.build_claims(&user, "app1", &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalError);
    }
}
