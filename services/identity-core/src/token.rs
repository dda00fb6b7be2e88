use std::collections::HashSet;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error};

use crate::claims::{Claims, ClaimsWire};
use crate::config::JwtConfig;
use crate::keys::KeyManager;

/// The only signing algorithm issued or accepted.
pub const EXPECTED_ALGORITHM: Algorithm = Algorithm::RS256;
const EXPECTED_ALGORITHM_NAME: &str = "RS256";

const REQUIRED_CLAIMS: [&str; 4] = ["exp", "iat", "iss", "sub"];

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq, Hash)]
pub enum TokenError {
    #[error("malformed token")]
    MalformedToken,
    #[error("token signature invalid")]
    SignatureInvalid,
    #[error("token expired")]
    Expired,
    #[error("token algorithm not accepted")]
    AlgorithmMismatch,
    #[error("token claims invalid")]
    ClaimsSchemaInvalid,
    #[error("failed to sign token")]
    Signing,
}

impl TokenError {
    /// Short label for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            TokenError::MalformedToken => "malformed",
            TokenError::SignatureInvalid => "signature_invalid",
            TokenError::Expired => "expired",
            TokenError::AlgorithmMismatch => "algorithm_mismatch",
            TokenError::ClaimsSchemaInvalid => "claims_schema_invalid",
            TokenError::Signing => "signing_failed",
        }
    }
}

/// Signs `claims` as an RS256 token whose header names `kid`.
pub fn generate_token(claims: &Claims, key: &EncodingKey, kid: &str) -> Result<String, TokenError> {
    let mut header = Header::new(EXPECTED_ALGORITHM);
    header.kid = Some(kid.to_string());

    encode(&header, &ClaimsWire::from(claims), key).map_err(|err| {
        error!(kid, error = %err, "failed to sign token");
        TokenError::Signing
    })
}

/// Verifies signature and expiry (zero leeway) and rebuilds the claims.
pub fn validate_token(token: &str, key: &DecodingKey) -> Result<Claims, TokenError> {
    decode_claims(token, key, &ValidationMode::strict())
}

struct ValidationMode<'a> {
    check_expiry: bool,
    issuer: Option<&'a str>,
}

impl<'a> ValidationMode<'a> {
    fn strict() -> Self {
        Self {
            check_expiry: true,
            issuer: None,
        }
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(EXPECTED_ALGORITHM);
        validation.leeway = 0;
        validation.validate_exp = self.check_expiry;
        // Audience lists are authorization data here, enforced by the permission guard.
        validation.validate_aud = false;
        validation.required_spec_claims = REQUIRED_CLAIMS
            .iter()
            .map(|claim| claim.to_string())
            .collect::<HashSet<_>>();
        if let Some(issuer) = self.issuer {
            validation.set_issuer(&[issuer]);
        }
        validation
    }
}

fn decode_claims(
    token: &str,
    key: &DecodingKey,
    mode: &ValidationMode<'_>,
) -> Result<Claims, TokenError> {
    inspect_structure(token)?;
    let data = decode::<Value>(token, key, &mode.validation()).map_err(classify)?;
    Claims::try_from(data.claims)
}

/// Structural checks that run before any cryptography: three segments,
/// decodable JSON header and payload, and an RS256 header.
fn inspect_structure(token: &str) -> Result<(), TokenError> {
    let mut segments = token.split('.');
    let (Some(header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(TokenError::MalformedToken);
    };

    let header = decode_segment(header)?;
    decode_segment(payload)?;

    match header.get("alg").and_then(Value::as_str) {
        Some(EXPECTED_ALGORITHM_NAME) => Ok(()),
        Some(_) => Err(TokenError::AlgorithmMismatch),
        None => Err(TokenError::MalformedToken),
    }
}

fn decode_segment(segment: &str) -> Result<Value, TokenError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| TokenError::MalformedToken)?;
    serde_json::from_slice(&bytes).map_err(|_| TokenError::MalformedToken)
}

fn classify(err: jsonwebtoken::errors::Error) -> TokenError {
    match err.kind() {
        // Header and payload already decoded cleanly, so a base64 failure here
        // is the signature segment.
        JwtErrorKind::InvalidSignature | JwtErrorKind::Base64(_) => TokenError::SignatureInvalid,
        JwtErrorKind::ExpiredSignature => TokenError::Expired,
        JwtErrorKind::InvalidAlgorithm | JwtErrorKind::InvalidAlgorithmName => {
            TokenError::AlgorithmMismatch
        }
        JwtErrorKind::MissingRequiredClaim(_)
        | JwtErrorKind::InvalidIssuer
        | JwtErrorKind::InvalidAudience
        | JwtErrorKind::InvalidSubject
        | JwtErrorKind::ImmatureSignature
        | JwtErrorKind::Json(_) => TokenError::ClaimsSchemaInvalid,
        _ => TokenError::MalformedToken,
    }
}

/// Lowercase hex SHA-256 of the token string; what the session cache stores.
pub fn fingerprint(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Token issuance and verification bound to the process keypair.
#[derive(Debug, Clone)]
pub struct TokenService {
    keys: Arc<KeyManager>,
    config: JwtConfig,
}

impl TokenService {
    pub fn new(keys: Arc<KeyManager>, config: JwtConfig) -> Self {
        Self { keys, config }
    }

    pub fn config(&self) -> &JwtConfig {
        &self.config
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    pub fn issue(&self, claims: &Claims) -> Result<String, TokenError> {
        generate_token(claims, self.keys.encoding_key(), self.keys.kid())
    }

    /// Full validation, including the configured issuer.
    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = decode_claims(
            token,
            self.keys.decoding_key(),
            &ValidationMode {
                check_expiry: true,
                issuer: Some(self.config.issuer.as_str()),
            },
        )?;
        debug!(kid = self.keys.kid(), sub = %claims.subject, "verified token");
        Ok(claims)
    }

    /// Signature, algorithm and claims-shape checks without the expiry check.
    /// Only the refresh flow may use this.
    pub fn validate_ignoring_expiry(&self, token: &str) -> Result<Claims, TokenError> {
        decode_claims(
            token,
            self.keys.decoding_key(),
            &ValidationMode {
                check_expiry: false,
                issuer: Some(self.config.issuer.as_str()),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::Authorization;
    use crate::keys::test_keys::pair;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use uuid::Uuid;

    fn manager() -> KeyManager {
        let keys = pair();
        KeyManager::from_pem(&keys.private_pkcs8, &keys.public).expect("keys")
    }

    fn seconds(at: DateTime<Utc>) -> DateTime<Utc> {
        Utc.timestamp_opt(at.timestamp(), 0).unwrap()
    }

    fn claims_expiring_in(offset: Duration) -> Claims {
        let now = seconds(Utc::now());
        let mut app1 = Authorization::new("app1");
        app1.roles.extend(["admin".to_string(), "editor".to_string()]);
        app1.permissions.extend(["read".to_string(), "write".to_string()]);
        let mut app2 = Authorization::new("app2");
        app2.roles.insert("admin".to_string());
        app2.permissions.insert("read".to_string());
        Claims {
            issuer: "identity".into(),
            subject: Uuid::new_v4(),
            audience: vec!["app1".into(), "app2".into(), "*".into()],
            issued_at: now,
            expires_at: now + offset,
            token_id: Uuid::new_v4(),
            username: "ada".into(),
            email: "ada@example.com".into(),
            authorization: vec![app1, app2],
        }
    }

    fn tamper_signature(token: &str) -> String {
        let (signed, signature) = token.rsplit_once('.').unwrap();
        let mut bytes = signature.as_bytes().to_vec();
        let idx = bytes.len() / 2;
        bytes[idx] = if bytes[idx] == b'A' { b'B' } else { b'A' };
        format!("{signed}.{}", String::from_utf8(bytes).unwrap())
    }

    #[test]
    fn round_trip_preserves_claims() {
        let keys = manager();
        let claims = claims_expiring_in(Duration::hours(1));
        let token = generate_token(&claims, keys.encoding_key(), keys.kid()).expect("sign");
        let decoded = validate_token(&token, keys.decoding_key()).expect("valid");
        assert_eq!(decoded, claims);
    }

    #[test]
    fn header_carries_kid_and_rs256() {
        let keys = manager();
        let token = generate_token(&claims_expiring_in(Duration::hours(1)), keys.encoding_key(), keys.kid())
            .expect("sign");
        let header = jsonwebtoken::decode_header(&token).expect("header");
        assert_eq!(header.alg, Algorithm::RS256);
        assert_eq!(header.kid.as_deref(), Some(keys.kid()));
    }

    #[test]
    fn equal_claims_sign_to_identical_tokens() {
        let keys = manager();
        let claims = claims_expiring_in(Duration::hours(1));
        let first = generate_token(&claims, keys.encoding_key(), keys.kid()).unwrap();
        let second = generate_token(&claims, keys.encoding_key(), keys.kid()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let keys = manager();
        let token = generate_token(&claims_expiring_in(Duration::hours(1)), keys.encoding_key(), keys.kid())
            .unwrap();
        let err = validate_token(&tamper_signature(&token), keys.decoding_key()).unwrap_err();
        assert_eq!(err, TokenError::SignatureInvalid);
    }

    #[test]
    fn expired_token_is_rejected_without_leeway() {
        let keys = manager();
        let token = generate_token(&claims_expiring_in(Duration::seconds(-1)), keys.encoding_key(), keys.kid())
            .unwrap();
        assert_eq!(
            validate_token(&token, keys.decoding_key()).unwrap_err(),
            TokenError::Expired
        );
    }

    #[test]
    fn token_valid_for_an_hour_is_accepted() {
        let keys = manager();
        let token = generate_token(&claims_expiring_in(Duration::hours(1)), keys.encoding_key(), keys.kid())
            .unwrap();
        assert!(validate_token(&token, keys.decoding_key()).is_ok());
    }

    #[test]
    fn wrong_segment_count_is_malformed() {
        let keys = manager();
        for token in ["", "abc", "a.b", "a.b.c.d"] {
            assert_eq!(
                validate_token(token, keys.decoding_key()).unwrap_err(),
                TokenError::MalformedToken,
                "token {token:?}"
            );
        }
    }

    #[test]
    fn hs256_header_is_algorithm_mismatch() {
        let keys = manager();
        let claims = claims_expiring_in(Duration::hours(1));
        let forged = encode(
            &Header::new(Algorithm::HS256),
            &ClaimsWire::from(&claims),
            &EncodingKey::from_secret(b"public-key-bytes"),
        )
        .unwrap();
        assert_eq!(
            validate_token(&forged, keys.decoding_key()).unwrap_err(),
            TokenError::AlgorithmMismatch
        );
    }

    #[test]
    fn none_algorithm_is_algorithm_mismatch() {
        let keys = manager();
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"x"}"#);
        let token = format!("{header}.{payload}.");
        assert_eq!(
            validate_token(&token, keys.decoding_key()).unwrap_err(),
            TokenError::AlgorithmMismatch
        );
    }

    #[test]
    fn missing_custom_section_is_claims_schema_invalid() {
        let keys = manager();
        let now = Utc::now().timestamp();
        let payload = serde_json::json!({
            "iss": "identity",
            "sub": Uuid::new_v4().to_string(),
            "exp": now + 600,
            "iat": now,
        });
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(keys.kid().to_string());
        let token = encode(&header, &payload, keys.encoding_key()).unwrap();
        assert_eq!(
            validate_token(&token, keys.decoding_key()).unwrap_err(),
            TokenError::ClaimsSchemaInvalid
        );
    }

    #[test]
    fn service_enforces_issuer() {
        let keys = Arc::new(manager());
        let service = TokenService::new(keys.clone(), JwtConfig::new("someone-else"));
        let token = generate_token(&claims_expiring_in(Duration::hours(1)), keys.encoding_key(), keys.kid())
            .unwrap();
        assert_eq!(service.validate(&token).unwrap_err(), TokenError::ClaimsSchemaInvalid);
    }

    #[test]
    fn ignoring_expiry_still_checks_signature() {
        let keys = Arc::new(manager());
        let service = TokenService::new(keys.clone(), JwtConfig::new("identity"));
        let expired = service.issue(&claims_expiring_in(Duration::hours(-2))).unwrap();

        assert_eq!(service.validate(&expired).unwrap_err(), TokenError::Expired);
        assert!(service.validate_ignoring_expiry(&expired).is_ok());
        assert_eq!(
            service
                .validate_ignoring_expiry(&tamper_signature(&expired))
                .unwrap_err(),
            TokenError::SignatureInvalid
        );
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let value = fingerprint("abc");
        assert_eq!(
            value,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
