//! Mirroring cached locators to a durable key-value store.
//!
//! The [`DurableStore`] is a plain string-keyed store, modelled after browser local storage.
//! On top of it, items are wrapped in an envelope carrying an optional expiry (see [`set_item`]
//! and [`get_item`]). [`Persistence`] uses these envelopes to mirror the records of one cache under
//! a namespaced key per id.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{CacheName, CacheRecord};

/// An error accessing the durable store.
///
/// These errors are never fatal; the in-memory cache stays authoritative.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("durable store i/o failed")]
    Io(#[from] io::Error),
    #[error("durable item could not be (de)serialized")]
    Json(#[from] serde_json::Error),
}

/// A synchronous string-keyed store that survives restarts.
pub trait DurableStore: fmt::Debug + Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Removes `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Lists all keys currently in the store.
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// A [`DurableStore`] that only lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<BTreeMap<String, String>>,
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.items.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.items
            .lock()
            .unwrap()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.items.lock().unwrap().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.items.lock().unwrap().keys().cloned().collect())
    }
}

/// A [`DurableStore`] keeping one file per key in a directory.
///
/// File names are the hex-encoded keys. Writes go to a temporary file in the same directory first,
/// which is then atomically moved into place, so readers never observe partially written items.
#[derive(Debug, Clone)]
pub struct FsStore {
    dir: PathBuf,
}

impl FsStore {
    /// Opens the store in `dir`, creating the directory if it does not exist.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn item_path(&self, key: &str) -> PathBuf {
        self.dir.join(hex::encode(key))
    }
}

impl DurableStore for FsStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(catch_not_found(|| fs::read_to_string(self.item_path(key)))?)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut temp_file = tempfile::Builder::new()
            .prefix("tmp")
            .tempfile_in(&self.dir)?;
        temp_file.write_all(value.as_bytes())?;
        temp_file
            .persist(self.item_path(key))
            .map_err(|e| e.error)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        catch_not_found(|| fs::remove_file(self.item_path(key)))?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let file_name = entry?.file_name();
            // temporary files and foreign files do not decode
            let key = file_name
                .to_str()
                .and_then(|name| hex::decode(name).ok())
                .and_then(|bytes| String::from_utf8(bytes).ok());
            if let Some(key) = key {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

/// The envelope every durable item is wrapped in.
#[derive(Debug, Serialize, Deserialize)]
struct StorageItem<T> {
    value: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiry: Option<SystemTime>,
}

/// Stores `value` under `key`, optionally expiring at `expiry`.
pub fn set_item<T: Serialize>(
    store: &dyn DurableStore,
    key: &str,
    value: &T,
    expiry: Option<SystemTime>,
) -> Result<(), StoreError> {
    let item = StorageItem { value, expiry };
    store.set(key, &serde_json::to_string(&item)?)
}

/// Reads the item under `key`.
///
/// Returns `Ok(None)` if there is no such item, or if it expired before `now`. Expired items are
/// removed from the store.
pub fn get_item<T: DeserializeOwned>(
    store: &dyn DurableStore,
    key: &str,
    now: SystemTime,
) -> Result<Option<T>, StoreError> {
    let Some(raw) = store.get(key)? else {
        return Ok(None);
    };
    let item: StorageItem<T> = serde_json::from_str(&raw)?;

    if item.expiry.is_some_and(|expiry| now > expiry) {
        store.remove(key)?;
        return Ok(None);
    }
    Ok(Some(item.value))
}

/// Re-arms the expiry of the item under `key`.
///
/// Returns `false` if there is no such item.
pub fn touch_item(
    store: &dyn DurableStore,
    key: &str,
    expiry: SystemTime,
) -> Result<bool, StoreError> {
    let Some(raw) = store.get(key)? else {
        return Ok(false);
    };
    let mut item: StorageItem<serde_json::Value> = serde_json::from_str(&raw)?;
    item.expiry = Some(expiry);
    store.set(key, &serde_json::to_string(&item)?)?;
    Ok(true)
}

/// Removes every item whose key starts with `prefix`, returning how many were removed.
pub fn clear_prefix(store: &dyn DurableStore, prefix: &str) -> Result<usize, StoreError> {
    let mut removed = 0;
    for key in store.keys()? {
        if key.starts_with(prefix) {
            store.remove(&key)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Mirrors the records of one cache to a [`DurableStore`].
///
/// Every failure is logged and otherwise swallowed.
#[derive(Debug, Clone)]
pub struct Persistence {
    name: CacheName,
    store: Arc<dyn DurableStore>,
    prefix: String,
}

impl Persistence {
    pub fn new(store: Arc<dyn DurableStore>, name: CacheName) -> Self {
        Self {
            name,
            store,
            prefix: format!("locators:{name}:"),
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}{id}", self.prefix)
    }

    fn record_error(&self, operation: &str) {
        metric!(
            counter("locators.store.error") += 1,
            "cache" => self.name.as_ref(),
            "operation" => operation,
        );
    }

    /// Loads all records that have not expired at `now`.
    ///
    /// Entries that cannot be read are skipped without affecting the others.
    pub fn load(&self, now: SystemTime, cache_duration: Duration) -> Vec<(String, CacheRecord)> {
        let keys = match self.store.keys() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    prefix = %self.prefix,
                    "Failed to list persisted locators",
                );
                self.record_error("list");
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        for key in keys {
            let Some(id) = key.strip_prefix(&self.prefix) else {
                continue;
            };
            match get_item::<CacheRecord>(&*self.store, &key, now) {
                Ok(Some(record)) if record.is_expired(now, cache_duration) => {
                    tracing::trace!(id, "Dropping expired persisted locator");
                    self.remove(id);
                }
                Ok(Some(record)) => records.push((id.to_owned(), record)),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        %key,
                        "Failed to load persisted locator",
                    );
                    self.record_error("load");
                }
            }
        }
        records
    }

    /// Writes `record` through to the durable store.
    pub fn save(&self, id: &str, record: &CacheRecord, cache_duration: Duration) {
        let expiry = record.resolved_at.checked_add(cache_duration);
        if let Err(e) = set_item(&*self.store, &self.key(id), record, expiry) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                id,
                "Failed to persist locator",
            );
            self.record_error("save");
        }
    }

    pub fn remove(&self, id: &str) {
        if let Err(e) = self.store.remove(&self.key(id)) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                id,
                "Failed to remove persisted locator",
            );
            self.record_error("remove");
        }
    }

    /// Removes every record of this cache from the durable store.
    pub fn clear(&self) {
        if let Err(e) = clear_prefix(&*self.store, &self.prefix) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                prefix = %self.prefix,
                "Failed to clear persisted locators",
            );
            self.record_error("clear");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn tempdir() -> io::Result<tempfile::TempDir> {
        tempfile::tempdir_in(".")
    }

    #[test]
    fn test_fs_store_roundtrip() -> Result<(), StoreError> {
        let tempdir = tempdir()?;
        let store = FsStore::open(tempdir.path().join("locators"))?;

        assert_eq!(store.get("locators:products:p/1")?, None);
        store.set("locators:products:p/1", "hello")?;
        store.set("other", "world")?;
        assert_eq!(store.get("locators:products:p/1")?.as_deref(), Some("hello"));

        let mut keys = store.keys()?;
        keys.sort();
        assert_eq!(keys, vec!["locators:products:p/1", "other"]);

        store.remove("other")?;
        store.remove("other")?;
        assert_eq!(store.keys()?, vec!["locators:products:p/1"]);
        Ok(())
    }

    #[test]
    fn test_fs_store_ignores_foreign_files() -> Result<(), StoreError> {
        let tempdir = tempdir()?;
        let store = FsStore::open(tempdir.path())?;

        fs::write(tempdir.path().join("tmp.Xa8dj2"), "half written")?;
        fs::write(tempdir.path().join("README"), "not an item")?;
        store.set("a", "1")?;

        assert_eq!(store.keys()?, vec!["a"]);
        Ok(())
    }

    #[test]
    fn test_item_expiry() -> Result<(), StoreError> {
        let store = MemoryStore::default();
        let now = SystemTime::UNIX_EPOCH + 1000 * HOUR;

        set_item(&store, "fresh", &"a", Some(now + HOUR))?;
        set_item(&store, "stale", &"b", Some(now - HOUR))?;
        set_item(&store, "forever", &"c", None)?;

        assert_eq!(get_item::<String>(&store, "fresh", now)?.as_deref(), Some("a"));
        assert_eq!(get_item::<String>(&store, "forever", now)?.as_deref(), Some("c"));
        assert_eq!(get_item::<String>(&store, "stale", now)?, None);
        // reading an expired item removes it
        assert_eq!(store.get("stale")?, None);

        assert!(touch_item(&store, "fresh", now + 3 * HOUR)?);
        assert_eq!(
            get_item::<String>(&store, "fresh", now + 2 * HOUR)?.as_deref(),
            Some("a")
        );
        assert!(!touch_item(&store, "missing", now)?);
        Ok(())
    }

    #[test]
    fn test_corrupted_item() -> Result<(), StoreError> {
        let store = MemoryStore::default();
        store.set("broken", "{\"value\": ")?;

        let result = get_item::<String>(&store, "broken", SystemTime::UNIX_EPOCH);
        assert!(matches!(result, Err(StoreError::Json(_))));
        Ok(())
    }

    #[test]
    fn test_clear_prefix() -> Result<(), StoreError> {
        let store = MemoryStore::default();
        store.set("locators:products:a", "1")?;
        store.set("locators:products:b", "2")?;
        store.set("locators:stories:a", "3")?;

        assert_eq!(clear_prefix(&store, "locators:products:")?, 2);
        assert_eq!(store.keys()?, vec!["locators:stories:a"]);
        Ok(())
    }

    #[test]
    fn test_persistence_skips_corrupted_entries() {
        let store = Arc::new(MemoryStore::default());
        let persistence = Persistence::new(store.clone(), CacheName::Products);
        let now = SystemTime::UNIX_EPOCH + 1000 * HOUR;

        let good = CacheRecord::resolved("https://cdn/p1".into(), "k1", now);
        persistence.save("p1", &good, HOUR);
        persistence.save(
            "p2",
            &CacheRecord::resolved("https://cdn/p2".into(), "k2", now),
            HOUR,
        );
        store.set("locators:products:p3", "garbage").unwrap();
        // entries of other caches are not ours to load
        store.set("locators:stories:s1", "garbage").unwrap();

        let mut loaded = persistence.load(now, HOUR);
        loaded.sort_by(|a, b| a.0.cmp(&b.0));
        let ids: Vec<_> = loaded.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2"]);
        assert_eq!(loaded[0].1, good);
    }

    #[test]
    fn test_persistence_drops_expired() {
        let store = Arc::new(MemoryStore::default());
        let persistence = Persistence::new(store.clone(), CacheName::Stories);
        let now = SystemTime::UNIX_EPOCH + 1000 * HOUR;

        let old = CacheRecord::resolved("https://cdn/s1".into(), "k1", now - 2 * HOUR);
        persistence.save("s1", &old, HOUR);

        assert!(persistence.load(now, HOUR).is_empty());
        assert_eq!(store.keys().unwrap(), Vec::<String>::new());
    }
}
