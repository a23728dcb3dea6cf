use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::Locator;

/// A cached locator together with the key it was resolved from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// The resolved locator, opaque to the cache.
    pub locator: Locator,
    /// The storage key that produced `locator`.
    pub source_key: String,
    /// When `locator` was resolved.
    pub resolved_at: SystemTime,
    /// Whether `locator` is the placeholder for a failed resolution.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_placeholder: bool,
}

impl CacheRecord {
    /// Creates a record for a successfully resolved locator.
    pub fn resolved(locator: Locator, source_key: &str, resolved_at: SystemTime) -> Self {
        Self {
            locator,
            source_key: source_key.to_owned(),
            resolved_at,
            is_placeholder: false,
        }
    }

    /// Creates a record standing in for a failed resolution.
    pub fn placeholder(placeholder: Locator, source_key: &str, resolved_at: SystemTime) -> Self {
        Self {
            is_placeholder: true,
            ..Self::resolved(placeholder, source_key, resolved_at)
        }
    }

    /// Whether `cache_duration` has elapsed since this record was resolved.
    ///
    /// A clock that went backwards counts as no time having elapsed.
    pub fn is_expired(&self, now: SystemTime, cache_duration: Duration) -> bool {
        now.duration_since(self.resolved_at).unwrap_or_default() >= cache_duration
    }

    /// Whether this record may be served for a request of `source_key`.
    ///
    /// Both conditions are required: the object stored under an id can be replaced under a new
    /// key while the old locator is still within its time window.
    pub fn is_valid(&self, source_key: &str, now: SystemTime, cache_duration: Duration) -> bool {
        self.source_key == source_key && !self.is_expired(now, cache_duration)
    }
}

/// The staleness policy: whether `record` can satisfy a request for `requested_source_key`.
pub fn is_valid(
    record: Option<&CacheRecord>,
    requested_source_key: &str,
    now: SystemTime,
    cache_duration: Duration,
) -> bool {
    record.is_some_and(|record| record.is_valid(requested_source_key, now, cache_duration))
}

/// Map from entity id to its cached [`CacheRecord`].
///
/// All operations are synchronous and total; an absent id is simply `None`.
#[derive(Debug, Default)]
pub struct CacheStore {
    records: HashMap<String, CacheRecord>,
}

impl CacheStore {
    /// Returns the cached locator for `id`, regardless of its validity.
    pub fn get(&self, id: &str) -> Option<&Locator> {
        self.records.get(id).map(|record| &record.locator)
    }

    pub fn get_record(&self, id: &str) -> Option<&CacheRecord> {
        self.records.get(id)
    }

    /// Returns the record for `id` if it may be served for `source_key`.
    pub fn get_valid(
        &self,
        id: &str,
        source_key: &str,
        now: SystemTime,
        cache_duration: Duration,
    ) -> Option<&CacheRecord> {
        self.records
            .get(id)
            .filter(|record| record.is_valid(source_key, now, cache_duration))
    }

    /// Inserts or overwrites the locator for `id`.
    pub fn put(&mut self, id: &str, locator: Locator, source_key: &str, timestamp: SystemTime) {
        self.insert(id, CacheRecord::resolved(locator, source_key, timestamp));
    }

    pub fn insert(&mut self, id: &str, record: CacheRecord) {
        self.records.insert(id.to_owned(), record);
    }

    pub fn remove(&mut self, id: &str) -> Option<CacheRecord> {
        self.records.remove(id)
    }

    /// Keeps only the records for which `f` returns `true`.
    pub fn retain<F>(&mut self, f: F)
    where
        F: FnMut(&String, &mut CacheRecord) -> bool,
    {
        self.records.retain(f)
    }

    pub fn clear(&mut self) {
        self.records.clear()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
