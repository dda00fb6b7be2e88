use std::fmt;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{DecodingKey, EncodingKey};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{
    DecodePrivateKey, DecodePublicKey, ObjectIdentifier, PrivateKeyInfo, SubjectPublicKeyInfoRef,
};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::config::KeyPaths;

/// Smallest modulus accepted for signing keys.
pub const MIN_RSA_BITS: usize = 2048;

/// Number of SHA-256 bytes kept for the key identifier.
const KID_HASH_BYTES: usize = 8;

/// rsaEncryption (PKCS#1).
const RSA_ENCRYPTION_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");

#[derive(Debug, Error)]
pub enum KeyLoadError {
    #[error("failed to read {which} key from {path}: {source}")]
    Unreadable {
        which: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{which} key is not a PEM block")]
    NotPem { which: &'static str },
    #[error("{which} key has unexpected PEM label '{label}'")]
    UnexpectedLabel { which: &'static str, label: String },
    #[error("{which} key is not an RSA key")]
    UnsupportedAlgorithm { which: &'static str },
    #[error("{which} key is malformed: {reason}")]
    Malformed { which: &'static str, reason: String },
    #[error("{which} key is {bits} bits, at least {min} required")]
    TooSmall {
        which: &'static str,
        bits: usize,
        min: usize,
    },
    #[error("public key does not belong to the private key")]
    Mismatch,
}

/// The process-wide signing keypair and its derived key identifier.
///
/// Loaded once at start-up and shared read-only (behind an `Arc`) by every
/// request task.
pub struct KeyManager {
    kid: String,
    public_key: RsaPublicKey,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("kid", &self.kid)
            .field("bits", &(self.public_key.size() * 8))
            .finish_non_exhaustive()
    }
}

impl KeyManager {
    pub fn load(paths: &KeyPaths) -> Result<Self, KeyLoadError> {
        let private_pem = read_source("private", &paths.private_key)?;
        let public_pem = read_source("public", &paths.public_key)?;
        let manager = Self::from_pem(&private_pem, &public_pem)?;
        info!(
            kid = %manager.kid,
            private_key = %paths.private_key.display(),
            public_key = %paths.public_key.display(),
            "loaded signing keypair"
        );
        Ok(manager)
    }

    pub fn from_pem(private_pem: &str, public_pem: &str) -> Result<Self, KeyLoadError> {
        let private_key = parse_private_key(private_pem)?;
        let public_key = parse_public_key(public_pem)?;

        ensure_size("private", &private_key.to_public_key())?;
        ensure_size("public", &public_key)?;
        if private_key.to_public_key() != public_key {
            return Err(KeyLoadError::Mismatch);
        }

        let der = private_key
            .to_pkcs1_der()
            .map_err(|err| KeyLoadError::Malformed {
                which: "private",
                reason: err.to_string(),
            })?;
        let encoding = EncodingKey::from_rsa_der(der.as_bytes());
        let decoding = DecodingKey::from_rsa_raw_components(
            &public_key.n().to_bytes_be(),
            &public_key.e().to_bytes_be(),
        );

        Ok(Self {
            kid: key_id(&public_key),
            public_key,
            encoding,
            decoding,
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }
}

/// Truncated SHA-256 of the big-endian modulus, base64url without padding.
pub fn key_id(public_key: &RsaPublicKey) -> String {
    let digest = Sha256::digest(public_key.n().to_bytes_be());
    URL_SAFE_NO_PAD.encode(&digest[..KID_HASH_BYTES])
}

fn read_source(which: &'static str, path: &Path) -> Result<String, KeyLoadError> {
    std::fs::read_to_string(path).map_err(|source| KeyLoadError::Unreadable {
        which,
        path: path.to_path_buf(),
        source,
    })
}

fn parse_private_key(text: &str) -> Result<RsaPrivateKey, KeyLoadError> {
    let block = pem::parse(text).map_err(|_| KeyLoadError::NotPem { which: "private" })?;
    match block.tag() {
        "PRIVATE KEY" | "RSA PRIVATE KEY" => {}
        other => {
            return Err(KeyLoadError::UnexpectedLabel {
                which: "private",
                label: other.to_string(),
            })
        }
    }

    let der = block.contents();
    if let Ok(key) = RsaPrivateKey::from_pkcs8_der(der) {
        return Ok(key);
    }
    // PKCS#8 wrapping a non-RSA key is an algorithm problem, not a parse problem.
    if let Ok(info) = PrivateKeyInfo::try_from(der) {
        if info.algorithm.oid != RSA_ENCRYPTION_OID {
            return Err(KeyLoadError::UnsupportedAlgorithm { which: "private" });
        }
    }
    RsaPrivateKey::from_pkcs1_der(der).map_err(|err| KeyLoadError::Malformed {
        which: "private",
        reason: err.to_string(),
    })
}

fn parse_public_key(text: &str) -> Result<RsaPublicKey, KeyLoadError> {
    let block = pem::parse(text).map_err(|_| KeyLoadError::NotPem { which: "public" })?;
    if block.tag() != "PUBLIC KEY" {
        return Err(KeyLoadError::UnexpectedLabel {
            which: "public",
            label: block.tag().to_string(),
        });
    }

    let der = block.contents();
    RsaPublicKey::from_public_key_der(der).map_err(|err| {
        match SubjectPublicKeyInfoRef::try_from(der) {
            Ok(info) if info.algorithm.oid != RSA_ENCRYPTION_OID => {
                KeyLoadError::UnsupportedAlgorithm { which: "public" }
            }
            _ => KeyLoadError::Malformed {
                which: "public",
                reason: err.to_string(),
            },
        }
    })
}

fn ensure_size(which: &'static str, key: &RsaPublicKey) -> Result<(), KeyLoadError> {
    let bits = key.size() * 8;
    if bits < MIN_RSA_BITS {
        return Err(KeyLoadError::TooSmall {
            which,
            bits,
            min: MIN_RSA_BITS,
        });
    }
    Ok(())
}
