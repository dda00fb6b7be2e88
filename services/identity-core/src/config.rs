use std::path::PathBuf;
use std::time::Duration;

/// Token issuance settings handed to the token service and claims builder.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// Issuer claim (iss) stamped on every token and required on validation.
    pub issuer: String,
    /// Lifetime of access tokens.
    pub access_ttl: Duration,
    /// Lifetime of refresh tokens; also the session record TTL.
    pub refresh_ttl: Duration,
}

impl JwtConfig {
    /// Construct config with the default lifetimes (15 minutes / 24 hours).
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            access_ttl: Duration::from_secs(15 * 60),
            refresh_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }

    pub fn with_access_ttl(mut self, ttl: Duration) -> Self {
        self.access_ttl = ttl;
        self
    }

    pub fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    /// The session must outlive every token bound to it.
    pub fn session_ttl(&self) -> Duration {
        self.access_ttl.max(self.refresh_ttl)
    }
}

/// Locations of the PEM encoded signing keypair.
#[derive(Debug, Clone)]
pub struct KeyPaths {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
}

impl KeyPaths {
    pub fn new(private_key: impl Into<PathBuf>, public_key: impl Into<PathBuf>) -> Self {
        Self {
            private_key: private_key.into(),
            public_key: public_key.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Namespace for session keys in the shared cache.
    pub key_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            key_prefix: "session".to_string(),
        }
    }
}
