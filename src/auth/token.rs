//! Bearer tokens and their fingerprints.
//!
//! A token is held in a [`SecretString`] from the moment it is parsed and is
//! never logged or persisted. Everything downstream (cache keys, blacklist
//! entries, the identity table) is keyed by its SHA-256 fingerprint.

use std::fmt;

use rand::Rng;
use rand::distributions::Alphanumeric;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use crate::error::AuthError;

/// A syntactically valid bearer token.
pub struct BearerToken {
    value: SecretString,
}

impl BearerToken {
    /// Shape check only: prefix, minimum length, no whitespace or control
    /// characters. No backend is consulted.
    pub fn parse(raw: &str, prefix: &str, min_len: usize) -> Result<Self, AuthError> {
        let raw = raw.strip_prefix("Bearer ").unwrap_or(raw);
        if !raw.starts_with(prefix)
            || raw.len() < min_len.max(prefix.len() + 1)
            || raw.chars().any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(AuthError::Malformed);
        }
        Ok(Self {
            value: SecretString::from(raw.to_string()),
        })
    }

    /// Hex SHA-256 of the token.
    pub fn fingerprint(&self) -> String {
        fingerprint(self.value.expose_secret())
    }

    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn len(&self) -> usize {
        self.value.expose_secret().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BearerToken([REDACTED, {} bytes])", self.len())
    }
}

pub fn fingerprint(token: &str) -> String {
    Sha256::digest(token.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Short fingerprint prefix safe for logs.
pub(crate) fn short(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(8)]
}

fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Fresh API token with the given prefix.
pub fn generate_api_token(prefix: &str) -> String {
    format!("{prefix}{}", random_alphanumeric(40))
}

/// One-time password for a newly provisioned desktop session.
pub fn generate_session_password() -> String {
    random_alphanumeric(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_check() {
        assert!(BearerToken::parse("sk-abcdefghijklmnop", "sk-", 16).is_ok());
        assert!(BearerToken::parse("Bearer sk-abcdefghijklmnop", "sk-", 16).is_ok());
        assert!(matches!(
            BearerToken::parse("pk-abcdefghijklmnop", "sk-", 16),
            Err(AuthError::Malformed)
        ));
        assert!(BearerToken::parse("sk-short", "sk-", 16).is_err());
        assert!(BearerToken::parse("sk-abcdefgh ijklmnop", "sk-", 16).is_err());
        assert!(BearerToken::parse("sk-", "sk-", 0).is_err());
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let token = BearerToken::parse("sk-abcdefghijklmnop", "sk-", 16).unwrap();
        let fp = token.fingerprint();
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, fingerprint("sk-abcdefghijklmnop"));
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(short(&fp).len(), 8);
    }

    #[test]
    fn test_debug_redacts() {
        let token = BearerToken::parse("sk-abcdefghijklmnop", "sk-", 16).unwrap();
        let dbg = format!("{token:?}");
        assert!(!dbg.contains("abcdef"));
        assert!(dbg.contains("REDACTED"));
    }

    #[test]
    fn test_generated_values() {
        let token = generate_api_token("sk-");
        assert!(token.starts_with("sk-"));
        assert_eq!(token.len(), 43);
        let pw = generate_session_password();
        assert_eq!(pw.len(), 8);
        assert!(pw.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
