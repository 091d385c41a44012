//! Cache storage.
//!
//! [`CacheStore`] maps a composite key string to the last thing we learned about it: a payload
//! or an error, when it was written, when it expires and how many times in a row it failed.
//! Broadcasting changes is the client's job; the store only mutates entries.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::FetchError;

// Instant arithmetic that overflows lands here instead ("never").
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Returns `now + lifetime`, saturating to a far-future instant.
pub(crate) fn deadline(now: Instant, lifetime: Duration) -> Instant {
    now.checked_add(lifetime)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// A cached entry with timestamps and failure bookkeeping.
///
/// A write is either a success (`data` set, `error` cleared) or a failure (`error` set, `data`
/// cleared). `created_at == None` marks the entry as stale no matter how recent it is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheEntry {
    /// Last successful payload.
    pub data: Option<Value>,
    /// Last failure.
    pub error: Option<FetchError>,
    /// When the entry was written; `None` means "treat as infinitely old".
    pub created_at: Option<Instant>,
    /// End of the entry's cache lifetime.
    pub expires_at: Option<Instant>,
    /// Consecutive failures since the last success.
    pub retry_attempt: Option<u32>,
}

impl CacheEntry {
    /// A successful write.
    pub fn success(data: Value, now: Instant, lifetime: Duration) -> Self {
        Self {
            data: Some(data),
            error: None,
            created_at: Some(now),
            expires_at: Some(deadline(now, lifetime)),
            retry_attempt: None,
        }
    }

    /// A failed write.
    pub fn failure(error: FetchError, now: Instant, lifetime: Duration, retry_attempt: u32) -> Self {
        Self {
            data: None,
            error: Some(error),
            created_at: Some(now),
            expires_at: Some(deadline(now, lifetime)),
            retry_attempt: Some(retry_attempt),
        }
    }

    /// An entry that only remembers the failure count.
    pub fn retry_marker(retry_attempt: u32) -> Self {
        Self {
            retry_attempt: Some(retry_attempt),
            ..Self::default()
        }
    }

    /// Whether the entry holds a payload or an error.
    pub const fn is_settled(&self) -> bool {
        self.data.is_some() || self.error.is_some()
    }

    /// Whether the entry was written less than `window` ago.
    pub fn is_fresh_within(&self, window: Duration, now: Instant) -> bool {
        self.created_at
            .is_some_and(|created| created.checked_add(window).is_none_or(|until| until > now))
    }

    /// Whether the cache lifetime has run out.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expires| expires <= now)
    }

    /// Payload and error if the entry is still within its lifetime.
    pub fn cached_value(&self, now: Instant) -> (Option<Value>, Option<FetchError>) {
        if self.is_expired(now) {
            (None, None)
        } else {
            (self.data.clone(), self.error.clone())
        }
    }
}

/// Selects cache keys: one key, a list of keys, or a predicate.
#[derive(Clone)]
pub enum KeySelector {
    Key(String),
    Keys(Vec<String>),
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl KeySelector {
    /// Selects every key for which `f` returns `true`.
    pub fn predicate(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    /// Whether `key` is selected.
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Key(selected) => selected == key,
            Self::Keys(selected) => selected.iter().any(|k| k == key),
            Self::Predicate(f) => f(key),
        }
    }

    /// Keys this selector addresses.
    ///
    /// Explicit keys are returned as given, even when not cached. Predicates are evaluated
    /// against `existing`.
    pub fn resolve(&self, existing: impl IntoIterator<Item = String>) -> Vec<String> {
        match self {
            Self::Key(key) => vec![key.clone()],
            Self::Keys(keys) => keys.clone(),
            Self::Predicate(f) => existing.into_iter().filter(|key| f(key)).collect(),
        }
    }
}

impl fmt::Debug for KeySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => f.debug_tuple("Key").field(key).finish(),
            Self::Keys(keys) => f.debug_tuple("Keys").field(keys).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl From<&str> for KeySelector {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

impl From<String> for KeySelector {
    fn from(key: String) -> Self {
        Self::Key(key)
    }
}

impl From<&String> for KeySelector {
    fn from(key: &String) -> Self {
        Self::Key(key.clone())
    }
}

impl From<Vec<String>> for KeySelector {
    fn from(keys: Vec<String>) -> Self {
        Self::Keys(keys)
    }
}

impl From<Vec<&str>> for KeySelector {
    fn from(keys: Vec<&str>) -> Self {
        Self::Keys(keys.into_iter().map(str::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for KeySelector {
    fn from(keys: [&str; N]) -> Self {
        Self::Keys(keys.iter().map(|k| (*k).to_string()).collect())
    }
}

/// Key-addressed cache entries.
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: DashMap<String, CacheEntry>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the entry for `key`.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    /// Overwrites the entry for `key`.
    pub fn set(&self, key: impl Into<String>, entry: CacheEntry) {
        self.entries.insert(key.into(), entry);
    }

    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deletes every selected entry and returns the selected keys.
    pub fn invalidate(&self, selector: &KeySelector) -> Vec<String> {
        let keys = selector.resolve(self.keys());
        for key in &keys {
            self.entries.remove(key);
        }
        keys
    }

    /// Marks every selected entry as stale, keeping its payload visible.
    pub fn revalidate(&self, selector: &KeySelector) -> Vec<String> {
        let keys = selector.resolve(self.keys());
        for key in &keys {
            if let Some(mut entry) = self.entries.get_mut(key) {
                entry.created_at = None;
            }
        }
        keys
    }

    /// Writes `data` for every selected key, or deletes them when `data` is `None`.
    pub fn mutate(
        &self,
        selector: &KeySelector,
        data: Option<&Value>,
        now: Instant,
        lifetime: Duration,
    ) -> Vec<String> {
        let keys = selector.resolve(self.keys());
        for key in &keys {
            match data {
                Some(data) => self.set(key.clone(), CacheEntry::success(data.clone(), now, lifetime)),
                None => {
                    self.entries.remove(key);
                }
            }
        }
        keys
    }
}
