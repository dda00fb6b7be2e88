use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::token::TokenError;

/// Audience entry added when the subject holds at least one global role.
pub const WILDCARD_AUDIENCE: &str = "*";

/// One application's aggregated grant. Sets keep the wire order stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub app: String,
    pub roles: BTreeSet<String>,
    pub permissions: BTreeSet<String>,
}

impl Authorization {
    pub fn new(app: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            roles: BTreeSet::new(),
            permissions: BTreeSet::new(),
        }
    }
}

/// Application-focused representation of a token payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub issuer: String,
    pub subject: Uuid,
    pub audience: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub token_id: Uuid,
    pub username: String,
    pub email: String,
    /// Sorted by application code.
    pub authorization: Vec<Authorization>,
}

impl Claims {
    pub fn authorization_for(&self, app: &str) -> Option<&Authorization> {
        self.authorization.iter().find(|entry| entry.app == app)
    }

    pub fn has_permission(&self, app: &str, permission: &str) -> bool {
        self.authorization_for(app)
            .is_some_and(|entry| entry.permissions.contains(permission))
    }

    pub fn has_role(&self, app: &str, role: &str) -> bool {
        self.authorization_for(app)
            .is_some_and(|entry| entry.roles.contains(role))
    }
}

/// Serializes as the token payload.
impl Serialize for Claims {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ClaimsWire::from(self).serialize(serializer)
    }
}

/// Borrowed wire form used when signing.
#[derive(Debug, Serialize)]
pub(crate) struct ClaimsWire<'a> {
    iss: &'a str,
    sub: String,
    aud: &'a [String],
    exp: i64,
    iat: i64,
    jti: String,
    username: &'a str,
    email: &'a str,
    authorization: &'a [Authorization],
}

impl<'a> From<&'a Claims> for ClaimsWire<'a> {
    fn from(claims: &'a Claims) -> Self {
        Self {
            iss: &claims.issuer,
            sub: claims.subject.to_string(),
            aud: &claims.audience,
            exp: claims.expires_at.timestamp(),
            iat: claims.issued_at.timestamp(),
            jti: claims.token_id.to_string(),
            username: &claims.username,
            email: &claims.email,
            authorization: &claims.authorization,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClaimsRepr {
    iss: String,
    sub: String,
    #[serde(default)]
    aud: Option<AudienceRepr>,
    exp: i64,
    iat: i64,
    jti: String,
    username: String,
    email: String,
    authorization: Vec<Authorization>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AudienceRepr {
    Single(String),
    Many(Vec<String>),
}

impl TryFrom<ClaimsRepr> for Claims {
    type Error = TokenError;

    fn try_from(value: ClaimsRepr) -> Result<Self, TokenError> {
        let subject =
            Uuid::parse_str(&value.sub).map_err(|_| TokenError::ClaimsSchemaInvalid)?;
        let token_id =
            Uuid::parse_str(&value.jti).map_err(|_| TokenError::ClaimsSchemaInvalid)?;
        let expires_at = timestamp(value.exp)?;
        let issued_at = timestamp(value.iat)?;

        let audience = match value.aud {
            Some(AudienceRepr::Single(item)) => vec![item],
            Some(AudienceRepr::Many(items)) => items,
            None => Vec::new(),
        };

        Ok(Self {
            issuer: value.iss,
            subject,
            audience,
            issued_at,
            expires_at,
            token_id,
            username: value.username,
            email: value.email,
            authorization: value.authorization,
        })
    }
}

impl TryFrom<serde_json::Value> for Claims {
    type Error = TokenError;

    fn try_from(value: serde_json::Value) -> Result<Self, TokenError> {
        let repr: ClaimsRepr =
            serde_json::from_value(value).map_err(|_| TokenError::ClaimsSchemaInvalid)?;
        Claims::try_from(repr)
    }
}

fn timestamp(seconds: i64) -> Result<DateTime<Utc>, TokenError> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or(TokenError::ClaimsSchemaInvalid)
}
