pub mod builder;
pub mod claims;
pub mod config;
pub mod context;
pub mod error;
pub mod guard;
pub mod jwks;
pub mod keys;
pub mod middleware;
pub mod password;
pub mod repository;
pub mod session;
pub mod token;
pub mod workflow;

pub use builder::{aggregate, ClaimsBuilder, ResolvedRole};
pub use claims::{Authorization, Claims, WILDCARD_AUDIENCE};
pub use config::{JwtConfig, KeyPaths, SessionConfig};
pub use context::{Interrupted, RequestContext};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use guard::{enforce_permission, PermissionGuard, Requirement};
pub use jwks::{get_jwks, Jwk, JwkSet};
pub use keys::{KeyLoadError, KeyManager};
pub use middleware::{require_auth, AuthContext, AuthMiddleware};
pub use password::{hash_password, verify_password};
pub use repository::{
    Application, ApplicationRepository, InMemoryDirectory, Permission, PermissionRepository,
    Repositories, RepositoryError, Role, RoleRepository, RoleScope, User, UserRepository,
};
pub use session::{
    InMemorySessionStore, RedisSessionStore, SessionCache, SessionError, SessionRecord,
    SessionStore,
};
pub use token::{fingerprint, generate_token, validate_token, TokenError, TokenService};
pub use workflow::{Authenticator, IssuedSession, LoginRequest};
