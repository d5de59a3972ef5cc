//! Credential store
//!
//! Maps opaque API keys to the SMTP login that is allowed to submit mail
//! for them. Built once from the configuration and read-only afterwards,
//! so it can be shared across sessions behind an `Arc` without locking.

use crate::config::ApiKeyEntry;
use crate::error::{GatewayError, Result};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CredentialStore {
    entries: BTreeMap<String, ApiKeyEntry>,
    /// login username -> API key
    by_user: HashMap<String, String>,
}

impl CredentialStore {
    /// Build the store, rejecting two API keys that share a login username.
    pub fn new(entries: BTreeMap<String, ApiKeyEntry>) -> Result<Self> {
        let mut by_user = HashMap::with_capacity(entries.len());

        for (api_key, entry) in &entries {
            if let Some(existing) = by_user.insert(entry.user.clone(), api_key.clone()) {
                return Err(GatewayError::Config(format!(
                    "Login '{}' is used by both API keys '{}' and '{}'",
                    entry.user, existing, api_key
                )));
            }
        }

        debug!("Loaded {} API key(s)", entries.len());
        Ok(Self { entries, by_user })
    }

    /// Whether `api_key` names a configured entry
    pub fn contains(&self, api_key: &str) -> bool {
        self.entries.contains_key(api_key)
    }

    /// Find the API key whose login matches exactly
    pub fn authenticate(&self, username: &str, password: &str) -> Result<&str> {
        self.by_user
            .get(username)
            .filter(|api_key| {
                self.entries
                    .get(api_key.as_str())
                    .is_some_and(|entry| entry.password == password)
            })
            .map(String::as_str)
            .ok_or(GatewayError::AuthenticationFailed)
    }

    /// Fails with [`GatewayError::UnknownApiKey`] unless `api_key` is configured
    pub fn authorize(&self, api_key: &str) -> Result<()> {
        if self.contains(api_key) {
            Ok(())
        } else {
            Err(GatewayError::UnknownApiKey(api_key.to_string()))
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(user: &str, password: &str) -> ApiKeyEntry {
        ApiKeyEntry {
            daily_limit: -1,
            user: user.to_string(),
            password: password.to_string(),
        }
    }

    fn store() -> CredentialStore {
        let mut entries = BTreeMap::new();
        entries.insert("abc123".to_string(), entry("admin", "secret"));
        entries.insert("def456".to_string(), entry("billing", "hunter2"));
        CredentialStore::new(entries).unwrap()
    }

    #[test]
    fn test_authenticate_every_configured_pair() {
        let store = store();
        assert_eq!(store.authenticate("admin", "secret").unwrap(), "abc123");
        assert_eq!(store.authenticate("billing", "hunter2").unwrap(), "def456");
    }

    #[test]
    fn test_authenticate_rejects_mismatched_pairs() {
        let store = store();
        for (user, password) in [
            ("admin", "hunter2"),
            ("billing", "secret"),
            ("nobody", "secret"),
            ("ADMIN", "secret"),
        ] {
            assert!(matches!(
                store.authenticate(user, password),
                Err(GatewayError::AuthenticationFailed)
            ));
        }
    }

    #[test]
    fn test_contains_api_key() {
        let store = store();
        assert!(store.contains("abc123"));
        assert!(!store.contains("none"));
        assert_eq!(store.len(), 2);
        assert!(!store.is_empty());
    }

    #[test]
    fn test_authorize_unknown_api_key() {
        let store = store();
        assert!(store.authorize("def456").is_ok());
        match store.authorize("none") {
            Err(GatewayError::UnknownApiKey(key)) => assert_eq!(key, "none"),
            other => panic!("expected UnknownApiKey, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_usernames_rejected() {
        let mut entries = BTreeMap::new();
        entries.insert("one".to_string(), entry("admin", "a"));
        entries.insert("two".to_string(), entry("admin", "b"));

        let err = CredentialStore::new(entries).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
