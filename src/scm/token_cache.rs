//! Capacity-bounded cache of expiring access tokens, keyed by installation.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct TokenCache {
    entries: HashMap<String, CachedToken>,
    capacity: usize,
    /// Tokens this close to expiry are treated as already expired.
    refresh_margin: Duration,
}

impl TokenCache {
    pub fn new(capacity: usize, refresh_margin: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            refresh_margin,
        }
    }

    /// A still-valid token for `key`, dropping it if it has expired.
    pub fn get(&mut self, key: &str, now: DateTime<Utc>) -> Option<String> {
        let fresh = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.expires_at - self.refresh_margin > now);
        if fresh {
            self.entries.get(key).map(|entry| entry.token.clone())
        } else {
            self.entries.remove(key);
            None
        }
    }

    pub fn insert(&mut self, key: &str, token: String, expires_at: DateTime<Utc>, now: DateTime<Utc>) {
        let margin = self.refresh_margin;
        self.entries
            .retain(|_, entry| entry.expires_at - margin > now);

        if !self.entries.contains_key(key) && self.entries.len() >= self.capacity {
            let soonest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(k, _)| k.clone());
            if let Some(soonest) = soonest {
                self.entries.remove(&soonest);
            }
        }

        self.entries
            .insert(key.to_string(), CachedToken { token, expires_at });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
