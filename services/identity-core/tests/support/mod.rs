#![allow(dead_code)]

use std::sync::{Arc, OnceLock};

use identity_core::{
    hash_password, Authenticator, InMemoryDirectory, InMemorySessionStore, JwtConfig, KeyManager,
    Repositories, RoleScope, SessionCache, SessionConfig, TokenService, User,
};
use rand_core::OsRng;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;

pub const PASSWORD: &str = "s3cret-passw0rd";

pub struct Pems {
    pub private: String,
    pub public: String,
}

pub fn pems() -> &'static Pems {
    static PEMS: OnceLock<Pems> = OnceLock::new();
    PEMS.get_or_init(|| {
        let key = RsaPrivateKey::new(&mut OsRng, 2048).expect("generate key");
        Pems {
            private: key.to_pkcs8_pem(LineEnding::LF).expect("pkcs8").to_string(),
            public: key
                .to_public_key()
                .to_public_key_pem(LineEnding::LF)
                .expect("public pem"),
        }
    })
}

pub fn key_manager() -> Arc<KeyManager> {
    let pems = pems();
    Arc::new(KeyManager::from_pem(&pems.private, &pems.public).expect("load keys"))
}

/// Directory seeded with the canonical example: `admin` (global, `read`)
/// and `editor` on `app1` (`write`).
pub struct World {
    pub directory: InMemoryDirectory,
    pub store: InMemorySessionStore,
    pub tokens: TokenService,
    pub sessions: SessionCache,
    pub authenticator: Authenticator,
    pub user: User,
}

pub async fn world() -> World {
    world_with(JwtConfig::new("identity-service")).await
}

pub async fn world_with(config: JwtConfig) -> World {
    let directory = InMemoryDirectory::new();
    let user = directory
        .add_user("ada", "ada@example.com", &hash_password(PASSWORD).expect("hash"))
        .await;
    let app1 = directory.add_application("app1", "Application One").await;
    directory.add_application("app2", "Application Two").await;

    let admin = directory.add_role("admin", RoleScope::Global).await;
    let editor = directory.add_role("editor", RoleScope::Application(app1.id)).await;
    let read = directory.add_permission("read").await;
    let write = directory.add_permission("write").await;
    directory.grant_permission(admin.id, read.id).await;
    directory.grant_permission(editor.id, write.id).await;
    directory.assign_role(user.id, admin.id).await;
    directory.assign_role(user.id, editor.id).await;

    let store = InMemorySessionStore::new();
    let tokens = TokenService::new(key_manager(), config);
    let sessions = SessionCache::new(Arc::new(store.clone()), &SessionConfig::default());
    let authenticator = Authenticator::new(
        Repositories::from_backend(Arc::new(directory.clone())),
        tokens.clone(),
        sessions.clone(),
    );

    World {
        directory,
        store,
        tokens,
        sessions,
        authenticator,
        user,
    }
}
