use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use std::sync::OnceLock;

use argon2::Argon2;
use rand_core::OsRng;

use crate::error::{CoreError, CoreResult};

/// Argon2id PHC string for `password` with a fresh random salt.
pub fn hash_password(password: &str) -> CoreResult<String> {
    if password.trim().is_empty() {
        return Err(CoreError::validation("password must not be empty"));
    }

    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| CoreError::internal("unable to hash password"))
}

/// False for a wrong password and for a stored value that is not a PHC hash.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Hash of a throwaway secret, made with the same parameters as real hashes.
fn placeholder_hash() -> &'static str {
    static HASH: OnceLock<String> = OnceLock::new();
    HASH.get_or_init(|| hash_password("placeholder account").unwrap_or_default())
}

/// Runs a full verification for a login whose account does not exist so
/// it costs as much as a real one. Always false.
pub(crate) fn verify_without_account(password: &str) -> bool {
    std::hint::black_box(verify_password(password, placeholder_hash()));
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn hash_then_verify() {
        let hash = hash_password("correct horse").expect("hash");
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
    }

    #[test]
    fn salts_differ() {
        let a = hash_password("secret").unwrap();
        let b = hash_password("secret").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn plaintext_stored_value_never_verifies() {
        assert!(!verify_password("secret", "secret"));
    }

    #[test]
    fn blank_password_is_rejected() {
        let err = hash_password("   ").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[test]
    fn missing_account_still_runs_argon2() {
        let parsed = PasswordHash::new(placeholder_hash()).expect("placeholder is a PHC string");
        assert_eq!(parsed.algorithm, argon2::Algorithm::Argon2id.ident());
        assert!(!verify_without_account("placeholder account"));
        assert!(!verify_without_account("anything"));
    }
}
