//! Credential resolution.
//!
//! Maps a supplied username/password pair to a [`Principal`]. The in-memory
//! store holds a fixed set of demo accounts configured at startup.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Username/password pair, as sent in basic-auth headers or RPC metadata.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parse an `Authorization: Basic <base64(user:password)>` header value.
    ///
    /// Returns `Ok(None)` for other schemes so callers can ignore them.
    pub fn from_basic_authorization(header: &str) -> Result<Option<Self>> {
        let Some(encoded) = header
            .trim()
            .split_once(' ')
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("basic"))
            .map(|(_, encoded)| encoded)
        else {
            return Ok(None);
        };

        let decoded = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::InvalidAuthorization(e.to_string()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| Error::InvalidAuthorization("credentials are not UTF-8".to_string()))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| Error::InvalidAuthorization("missing ':' separator".to_string()))?;

        Ok(Some(Self::new(username, password)))
    }

    /// Encode as a basic-auth header value.
    pub fn to_basic_authorization(&self) -> String {
        format!(
            "Basic {}",
            BASE64.encode(format!("{}:{}", self.username, self.password))
        )
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    name: String,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Resolves credentials to a principal.
pub trait CredentialStore: Send + Sync {
    /// Returns the principal when the credentials are valid.
    fn authenticate(&self, credentials: &Credentials) -> Option<Principal>;
}

/// Fixed table of demo accounts.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCredentialStore {
    users: HashMap<String, String>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }

    /// Parse a comma-separated `user:password` list, e.g. `jlong:pw,user:user`.
    pub fn parse(entries: &str) -> Result<Self> {
        let mut store = Self::new();
        for entry in entries.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (username, password) = entry
                .split_once(':')
                .filter(|(user, _)| !user.is_empty())
                .ok_or_else(|| Error::InvalidUserEntry(entry.to_string()))?;
            store = store.with_user(username, password);
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn authenticate(&self, credentials: &Credentials) -> Option<Principal> {
        match self.users.get(&credentials.username) {
            Some(password) if *password == credentials.password => {
                Some(Principal::new(credentials.username.clone()))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_authorization_roundtrip() {
        let credentials = Credentials::new("jlong", "pw");
        let header = credentials.to_basic_authorization();
        assert_eq!(header, "Basic amxvbmc6cHc=");
        assert_eq!(
            Credentials::from_basic_authorization(&header).unwrap(),
            Some(credentials)
        );
    }

    #[test]
    fn test_scheme_is_case_insensitive() {
        let expected = Some(Credentials::new("jlong", "pw"));
        for scheme in ["Basic", "basic", "BASIC", "bAsIc"] {
            let header = format!("{} amxvbmc6cHc=", scheme);
            assert_eq!(
                Credentials::from_basic_authorization(&header).unwrap(),
                expected,
                "{}",
                header
            );
        }
        assert_eq!(
            Credentials::from_basic_authorization("Basicamxvbmc6cHc=").unwrap(),
            None
        );
    }

    #[test]
    fn test_other_schemes_are_ignored() {
        assert_eq!(
            Credentials::from_basic_authorization("Bearer abc").unwrap(),
            None
        );
    }

    #[test]
    fn test_malformed_basic_header() {
        assert!(Credentials::from_basic_authorization("Basic !!!").is_err());
        // "nocolon" base64-encoded
        assert!(Credentials::from_basic_authorization("Basic bm9jb2xvbg==").is_err());
    }

    #[test]
    fn test_store_authenticate() {
        let store = InMemoryCredentialStore::parse("jlong:pw, user:user").unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(
            store.authenticate(&Credentials::new("jlong", "pw")),
            Some(Principal::new("jlong"))
        );
        assert_eq!(store.authenticate(&Credentials::new("jlong", "nope")), None);
        assert_eq!(store.authenticate(&Credentials::new("ghost", "pw")), None);
    }

    #[test]
    fn test_parse_rejects_bad_entries() {
        assert!(InMemoryCredentialStore::parse("nopassword").is_err());
        assert!(InMemoryCredentialStore::parse(":pw").is_err());
        assert!(InMemoryCredentialStore::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_debug_hides_password() {
        let debug = format!("{:?}", Credentials::new("user", "secret"));
        assert!(!debug.contains("secret"));
    }
}
