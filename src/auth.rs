//! Bearer-token lifecycle for the Chatter API.
//!
//! [`SessionAuth`] persists the session token and its absolute expiry through
//! a pluggable [`TokenStore`], migrating entries written under the single-key
//! layout used by SDK versions before 0.3. The stream and API clients consume
//! it through the narrow [`AuthProvider`] trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

const TOKEN_KEY: &str = "chatter.auth.token";
const EXPIRY_KEY: &str = "chatter.auth.expires_at";
/// Single-key layout used before the expiry field existed.
const LEGACY_TOKEN_KEY: &str = "chatter_token";

/// Authentication facts consumed by the stream and API clients.
pub trait AuthProvider: Send + Sync {
    /// Whether a usable session token is currently held.
    fn is_authenticated(&self) -> bool;

    /// Returns the current bearer token, if any.
    fn bearer_token(&self) -> Option<SecretString>;
}

/// Key/value persistence backing [`SessionAuth`].
pub trait TokenStore: Send + Sync {
    /// Reads the value stored under `key`.
    fn get(&self, key: &str) -> Option<String>;
    /// Writes `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str);
    /// Deletes the entry under `key` if present.
    fn remove(&self, key: &str);
}

/// In-memory token store, used by tests and short-lived tools.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let _ = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        let _ = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

/// Session token manager with expiry enforcement and legacy-key migration.
pub struct SessionAuth {
    store: Arc<dyn TokenStore>,
}

impl SessionAuth {
    /// Creates a manager over the given store.
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self { store }
    }

    /// Stores a fresh session token valid for `ttl` from now.
    pub fn store_token(&self, token: &SecretString, ttl: Duration) {
        self.store.set(TOKEN_KEY, token.expose_secret());
        let expires_at = now_ms().saturating_add(ttl.as_millis() as u64);
        self.store.set(EXPIRY_KEY, &expires_at.to_string());
        debug!(event = "token_stored", expires_at_ms = expires_at);
    }

    /// Returns the current token, migrating legacy entries and discarding
    /// expired ones.
    pub fn token(&self) -> Option<SecretString> {
        self.migrate_legacy_token();

        let token = self.store.get(TOKEN_KEY)?;

        if let Some(raw_expiry) = self.store.get(EXPIRY_KEY) {
            let expired = raw_expiry
                .parse::<u64>()
                .map(|expires_at| now_ms() >= expires_at)
                // Unreadable expiry is treated as expired rather than
                // handing out a token of unknown age.
                .unwrap_or(true);
            if expired {
                debug!(event = "token_expired", "discarding expired session token");
                self.clear();
                return None;
            }
        }

        Some(SecretString::new(token))
    }

    /// Removes the session token and both generations of storage keys.
    pub fn clear(&self) {
        self.store.remove(TOKEN_KEY);
        self.store.remove(EXPIRY_KEY);
        self.store.remove(LEGACY_TOKEN_KEY);
    }

    /// Adopts a token stored under the pre-0.3 key.
    ///
    /// Legacy entries carried no expiry; the migrated token stays valid until
    /// replaced by the next `store_token` call.
    fn migrate_legacy_token(&self) {
        let Some(legacy) = self.store.get(LEGACY_TOKEN_KEY) else {
            return;
        };

        if self.store.get(TOKEN_KEY).is_none() {
            info!(event = "token_migrated", "adopting legacy session token");
            self.store.set(TOKEN_KEY, &legacy);
        }
        self.store.remove(LEGACY_TOKEN_KEY);
    }
}

impl AuthProvider for SessionAuth {
    fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }

    fn bearer_token(&self) -> Option<SecretString> {
        self.token()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
