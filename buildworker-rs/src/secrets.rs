//! Secret-carrying inputs to the bootstrap document.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretError {
    #[error("authentication password hash is empty")]
    EmptyHash,
    #[error("authentication password hash is not a bcrypt hash: {0}")]
    NotBcrypt(&'static str),
}

/// A secret string value.
///
/// `Debug` never prints the wrapped value. Unlike the underlying
/// [`SecretString`] this type is `Clone`, so that it can flow through
/// [`Output`](crate::output::Output) combinators.
pub struct SecretValue(SecretString);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        SecretValue(SecretString::from(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl Clone for SecretValue {
    fn clone(&self) -> Self {
        SecretValue::new(self.expose().to_string())
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue([REDACTED])")
    }
}

impl From<String> for SecretValue {
    fn from(value: String) -> Self {
        SecretValue::new(value)
    }
}

impl From<&str> for SecretValue {
    fn from(value: &str) -> Self {
        SecretValue::new(value)
    }
}

impl<'de> Deserialize<'de> for SecretValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(SecretValue::from)
    }
}

const BCRYPT_ALPHABET: &[u8] = b"./ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// A pre-computed bcrypt password hash, in modular crypt format
/// (`$2a$14$<53 characters of salt and digest>`).
///
/// This is only ever checked for shape. Hashes are computed out-of-band (for
/// instance with `caddy hash-password`) and never derived here.
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct BcryptHash(String);

impl BcryptHash {
    pub fn parse(hash: impl Into<String>) -> Result<Self, SecretError> {
        let hash = hash.into();
        let trimmed = hash.trim();

        if trimmed.is_empty() {
            return Err(SecretError::EmptyHash);
        }

        // $<version>$<cost>$<salt+digest>
        let mut parts = trimmed.splitn(4, '$');
        if parts.next() != Some("") {
            return Err(SecretError::NotBcrypt("missing leading `$`"));
        }

        match parts.next() {
            Some("2a") | Some("2b") | Some("2y") => (),
            _ => return Err(SecretError::NotBcrypt("unsupported version identifier")),
        }

        let cost = parts
            .next()
            .filter(|c| c.len() == 2 && c.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|c| c.parse::<u8>().ok())
            .ok_or(SecretError::NotBcrypt("cost must be two decimal digits"))?;
        if !(4..=31).contains(&cost) {
            return Err(SecretError::NotBcrypt("cost out of range 04..=31"));
        }

        let payload = parts
            .next()
            .ok_or(SecretError::NotBcrypt("missing salt and digest"))?;
        if payload.len() != 53 || !payload.bytes().all(|b| BCRYPT_ALPHABET.contains(&b)) {
            return Err(SecretError::NotBcrypt(
                "salt and digest must be 53 characters of the bcrypt alphabet",
            ));
        }

        Ok(BcryptHash(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BcryptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Version and cost only:
        write!(f, "BcryptHash({}…)", &self.0[..7])
    }
}

/// All secret inputs of a worker.
///
/// Registry credentials are optional. `None` means "not supplied", which is
/// kept distinct from a supplied-but-empty value; both cause the registry
/// login to be skipped at boot.
#[derive(Debug, Clone)]
pub struct SecretBundle {
    pub registry_username: Option<SecretValue>,
    pub registry_password: Option<SecretValue>,
    pub auth_password_hash: BcryptHash,
}

impl SecretBundle {
    pub fn new(auth_password_hash: BcryptHash) -> Self {
        SecretBundle {
            registry_username: None,
            registry_password: None,
            auth_password_hash,
        }
    }

    pub fn with_registry_credentials(
        mut self,
        username: Option<SecretValue>,
        password: Option<SecretValue>,
    ) -> Self {
        self.registry_username = username;
        self.registry_password = password;
        self
    }

    /// Whether the boot-time registry login will actually run.
    pub fn has_registry_credentials(&self) -> bool {
        matches!(
            (&self.registry_username, &self.registry_password),
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty()
        )
    }
}
