//! External-service link tokens — short-lived, single-use codes that bridge
//! a user action in this service to a later event from an outside system
//! (a messenger bot's "press Start", say).
//!
//! Grounded on `auth::models::ApiKey::generate_key`'s `Uuid::new_v4()`
//! convention for the opaque token, and on the backend's
//! `parking_lot::Mutex<HashMap<...>>`-guarded in-memory registries.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

const TOKEN_TTL_MINUTES: i64 = 15;

struct ConnectTokenRecord {
    user_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Single-use, expiring token registry. One instance lives on the
/// application for the lifetime of the process.
#[derive(Default)]
pub struct ConnectTokenStore {
    tokens: Mutex<HashMap<String, ConnectTokenRecord>>,
}

impl ConnectTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, user_id: impl Into<String>) -> IssuedToken {
        let token = Uuid::new_v4().simple().to_string();
        let expires_at = Utc::now() + Duration::minutes(TOKEN_TTL_MINUTES);
        self.tokens.lock().insert(
            token.clone(),
            ConnectTokenRecord {
                user_id: user_id.into(),
                expires_at,
            },
        );
        IssuedToken { token, expires_at }
    }

    /// Atomic single-use consume: the second call on the same token, or a
    /// call past expiry, returns `None`.
    pub fn consume(&self, token: &str) -> Option<String> {
        let mut tokens = self.tokens.lock();
        let record = tokens.remove(token)?;
        if record.expires_at < Utc::now() {
            None
        } else {
            Some(record.user_id)
        }
    }

    /// Drops expired-but-unconsumed entries. Piggybacked on the alert sweep
    /// interval so the map doesn't grow unbounded from abandoned links.
    pub fn sweep_expired(&self) {
        let now = Utc::now();
        self.tokens.lock().retain(|_, record| record.expires_at >= now);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.tokens.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_returns_the_issuing_user() {
        let store = ConnectTokenStore::new();
        let issued = store.create("user-1");
        assert_eq!(store.consume(&issued.token).as_deref(), Some("user-1"));
    }

    #[test]
    fn double_consume_returns_none_on_the_second_call() {
        let store = ConnectTokenStore::new();
        let issued = store.create("user-1");
        assert!(store.consume(&issued.token).is_some());
        assert!(store.consume(&issued.token).is_none());
    }

    #[test]
    fn unknown_token_is_none() {
        let store = ConnectTokenStore::new();
        assert!(store.consume("not-a-real-token").is_none());
    }

    #[test]
    fn expired_token_is_rejected_on_consume() {
        let store = ConnectTokenStore::new();
        let token = Uuid::new_v4().simple().to_string();
        store.tokens.lock().insert(
            token.clone(),
            ConnectTokenRecord {
                user_id: "user-1".to_string(),
                expires_at: Utc::now() - Duration::minutes(1),
            },
        );
        assert!(store.consume(&token).is_none());
    }

    #[test]
    fn sweep_expired_drops_stale_unconsumed_entries() {
        let store = ConnectTokenStore::new();
        let expired = Uuid::new_v4().simple().to_string();
        store.tokens.lock().insert(
            expired,
            ConnectTokenRecord {
                user_id: "user-1".to_string(),
                expires_at: Utc::now() - Duration::minutes(1),
            },
        );
        store.create("user-2");
        assert_eq!(store.len(), 2);
        store.sweep_expired();
        assert_eq!(store.len(), 1);
    }
}
