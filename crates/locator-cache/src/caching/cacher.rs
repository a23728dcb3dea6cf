use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};
use tokio::sync::broadcast;

use crate::config::CacheConfig;
use crate::resolver::{ResolveError, Resolver};
use crate::utils::futures::CallOnDrop;
use crate::Locator;

use super::{CacheName, CacheRecord, CacheStore, Clock, DurableStore, Persistence, SystemClock};

/// Receives the locator of a pending resolution.
///
/// The channel is cancelled only if the resolution task panicked.
type ResolutionChannel = Shared<oneshot::Receiver<Locator>>;

/// A resolution task that has been registered, but not spawned yet.
type ResolutionTask = BoxFuture<'static, ()>;

/// Capacity of the [`CacheEvent`] channel. Lagging subscribers miss the oldest events.
const EVENT_CAPACITY: usize = 64;

/// A change to the contents of a [`LocatorCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A resolution completed and its locator was cached.
    Resolved { id: String, locator: Locator },
    /// A resolution failed and the placeholder was cached instead.
    Failed { id: String, placeholder: Locator },
    /// The record for `id` was invalidated or evicted.
    Removed { id: String },
    /// The cache was cleared.
    Cleared,
}

/// Diagnostic counters of a [`LocatorCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    /// Number of records in the cache, regardless of their validity.
    pub cached_count: usize,
    /// Number of tracked resolutions that have not completed yet.
    pub pending_count: usize,
}

/// The tracker of a pending resolution.
#[derive(Debug)]
pub(super) struct InFlight {
    /// Identifies this resolution; a completion only writes back while its ticket is registered.
    pub ticket: u64,
    pub source_key: String,
    pub channel: ResolutionChannel,
}

#[derive(Debug, Default)]
pub(super) struct CacheState {
    pub records: CacheStore,
    pub in_flight: HashMap<String, InFlight>,
}

pub(super) struct Inner {
    pub name: CacheName,
    pub config: CacheConfig,
    pub placeholder: Locator,
    pub resolver: Arc<dyn Resolver>,
    pub clock: Arc<dyn Clock>,
    pub persistence: Option<Persistence>,
    /// Records and pending resolutions, guarded together so that joining and settling a
    /// resolution are atomic with respect to each other.
    pub state: Mutex<CacheState>,
    pub next_ticket: AtomicU64,
    pub events: broadcast::Sender<CacheEvent>,
}

impl Inner {
    /// Removes the tracker for `id`, unless it has been replaced by another resolution.
    fn release(&self, id: &str, ticket: u64) {
        let mut state = self.state.lock().unwrap();
        if state.in_flight.get(id).is_some_and(|f| f.ticket == ticket) {
            state.in_flight.remove(id);
        }
    }
}

/// Caches resolved locators per entity id and coalesces concurrent resolutions.
///
/// A request for `(id, source_key)` is served from memory if a valid record exists (see
/// [`CacheRecord::is_valid`]). Otherwise, it joins the pending resolution for `id`, or starts a new
/// one if there is none for the same source key. Resolutions run as separate tasks, so dropping a
/// request future does not cancel the resolution.
///
/// Resolver failures are never surfaced. Instead, the configured placeholder is cached for the
/// requested key, so that the failing resolution is not retried before the record expires.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct LocatorCache {
    pub(super) inner: Arc<Inner>,
}

impl fmt::Debug for LocatorCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocatorCache")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Builds a [`LocatorCache`].
#[derive(Debug)]
pub struct LocatorCacheBuilder {
    name: CacheName,
    config: CacheConfig,
    resolver: Arc<dyn Resolver>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn DurableStore>>,
}

impl LocatorCacheBuilder {
    /// Uses `clock` instead of the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Mirrors records to `store` and loads the unexpired ones on build.
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> LocatorCache {
        let cache_duration = self.config.cache_duration();
        let persistence = self
            .store
            .map(|store| Persistence::new(store, self.name));

        let mut records = CacheStore::default();
        if let Some(ref persistence) = persistence {
            for (id, record) in persistence.load(self.clock.now(), cache_duration) {
                records.insert(&id, record);
            }
            tracing::debug!(
                cache = %self.name,
                loaded = records.len(),
                "Loaded persisted locators",
            );
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        LocatorCache {
            inner: Arc::new(Inner {
                name: self.name,
                placeholder: self.config.placeholder().into(),
                config: self.config,
                resolver: self.resolver,
                clock: self.clock,
                persistence,
                state: Mutex::new(CacheState {
                    records,
                    in_flight: HashMap::new(),
                }),
                next_ticket: AtomicU64::new(0),
                events,
            }),
        }
    }
}

impl LocatorCache {
    pub fn builder(
        name: CacheName,
        config: impl Into<CacheConfig>,
        resolver: Arc<dyn Resolver>,
    ) -> LocatorCacheBuilder {
        LocatorCacheBuilder {
            name,
            config: config.into(),
            resolver,
            clock: Arc::new(SystemClock),
            store: None,
        }
    }

    pub fn name(&self) -> CacheName {
        self.inner.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn cache_duration(&self) -> Duration {
        self.inner.config.cache_duration()
    }

    /// The locator handed out in place of one that failed to resolve or is not cached.
    pub fn placeholder(&self) -> Locator {
        self.inner.placeholder.clone()
    }

    pub(super) fn now(&self) -> SystemTime {
        self.inner.clock.now()
    }

    /// Returns the locator for `id` as resolved from `source_key`.
    ///
    /// This suspends only if no valid record is cached. Resolution failures yield the
    /// [`placeholder`](Self::placeholder).
    pub async fn get_locator(&self, id: &str, source_key: &str) -> Locator {
        let name = self.inner.name;
        metric!(counter("locators.access") += 1, "cache" => name.as_ref());

        let (channel, task) = {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(record) =
                state
                    .records
                    .get_valid(id, source_key, self.now(), self.cache_duration())
            {
                metric!(counter("locators.memory.hit") += 1, "cache" => name.as_ref());
                tracing::trace!(cache = %name, id, "Serving cached locator");
                return record.locator.clone();
            }

            let pending = state
                .in_flight
                .get(id)
                .filter(|in_flight| in_flight.source_key == source_key)
                .map(|in_flight| in_flight.channel.clone());
            match pending {
                Some(channel) => {
                    // A concurrent resolution was deduplicated.
                    metric!(counter("locators.channel.hit") += 1, "cache" => name.as_ref());
                    (channel, None)
                }
                None => {
                    let (channel, task) = self.track_resolution(&mut state, id, source_key);
                    (channel, Some(task))
                }
            }
        };

        if let Some(task) = task {
            tokio::spawn(task);
        }

        channel.await.unwrap_or_else(|_cancelled| {
            tracing::error!(cache = %name, id, "Resolution task dropped");
            self.placeholder()
        })
    }

    /// Returns the cached locator for `id` if it has not expired, or the placeholder otherwise.
    ///
    /// Never suspends and never starts a resolution.
    pub fn cached_locator(&self, id: &str) -> Locator {
        let state = self.inner.state.lock().unwrap();
        state
            .records
            .get_record(id)
            .filter(|record| !record.is_expired(self.now(), self.cache_duration()))
            .map(|record| record.locator.clone())
            .unwrap_or_else(|| self.placeholder())
    }

    /// Like [`cached_locator`](Self::cached_locator), but starts a background resolution of
    /// `source_key` if the cached record cannot serve it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn cached_locator_or_preload(&self, id: &str, source_key: &str) -> Locator {
        {
            let state = self.inner.state.lock().unwrap();
            if let Some(record) =
                state
                    .records
                    .get_valid(id, source_key, self.now(), self.cache_duration())
            {
                return record.locator.clone();
            }
        }

        self.preload_one(id, source_key);
        self.placeholder()
    }

    /// Starts resolving `source_key` for `id` in the background, unless it is cached or already
    /// being resolved. Empty source keys are ignored.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn preload_one(&self, id: &str, source_key: &str) {
        if source_key.is_empty() {
            return;
        }

        let task = {
            let mut state = self.inner.state.lock().unwrap();
            let is_cached = state
                .records
                .get_valid(id, source_key, self.now(), self.cache_duration())
                .is_some();
            let is_pending = state
                .in_flight
                .get(id)
                .is_some_and(|in_flight| in_flight.source_key == source_key);

            if is_cached || is_pending {
                return;
            }
            let (_not_awaiting_channel, task) = self.track_resolution(&mut state, id, source_key);
            task
        };

        tokio::spawn(task);
    }

    /// Removes the record for `id` from memory and the durable store.
    ///
    /// A pending resolution for `id` is discarded; its result will not be cached.
    pub fn invalidate(&self, id: &str) {
        let removed = {
            let mut state = self.inner.state.lock().unwrap();
            state.in_flight.remove(id);
            if let Some(ref persistence) = self.inner.persistence {
                persistence.remove(id);
            }
            state.records.remove(id)
        };

        if removed.is_some() {
            tracing::debug!(cache = %self.inner.name, id, "Invalidated locator");
            self.emit(CacheEvent::Removed { id: id.to_owned() });
        }
    }

    /// Invalidates `id` if `source_key` is empty, or makes sure the locator for `source_key` is
    /// cached otherwise.
    pub async fn validate_and_update(&self, id: &str, source_key: &str) {
        if source_key.is_empty() {
            self.invalidate(id);
        } else {
            self.get_locator(id, source_key).await;
        }
    }

    /// Discards all pending resolutions and removes every record from memory and the durable
    /// store.
    ///
    /// Pending resolutions keep running, but their results are not cached.
    pub fn clear(&self) {
        let stats = {
            let mut state = self.inner.state.lock().unwrap();
            let stats = CacheStats {
                cached_count: state.records.len(),
                pending_count: state.in_flight.len(),
            };
            state.records.clear();
            state.in_flight.clear();
            if let Some(ref persistence) = self.inner.persistence {
                persistence.clear();
            }
            stats
        };

        tracing::debug!(
            cache = %self.inner.name,
            removed = stats.cached_count,
            discarded_pending = stats.pending_count,
            "Cleared locator cache",
        );
        self.emit(CacheEvent::Cleared);
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock().unwrap();
        CacheStats {
            cached_count: state.records.len(),
            pending_count: state.in_flight.len(),
        }
    }

    /// Subscribes to changes of this cache.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    pub(super) fn emit(&self, event: CacheEvent) {
        // there may be no subscribers
        self.inner.events.send(event).ok();
    }

    /// Registers a resolution of `source_key` as the tracker for `id`.
    ///
    /// A previous tracker for `id` is replaced. Its resolution keeps running, but its result will
    /// only reach the callers that already joined it.
    ///
    /// The returned task must be spawned after the state lock is released, since dropping it
    /// locks the state.
    fn track_resolution(
        &self,
        state: &mut CacheState,
        id: &str,
        source_key: &str,
    ) -> (ResolutionChannel, ResolutionTask) {
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();

        let release_token = {
            let inner = Arc::clone(&self.inner);
            let id = id.to_owned();
            CallOnDrop::new(move || inner.release(&id, ticket))
        };

        let task = {
            let this = self.clone();
            let id = id.to_owned();
            let source_key = source_key.to_owned();
            async move {
                let _release_token = release_token;
                let result = this.inner.resolver.resolve(&source_key).await;
                let locator = this.settle(&id, &source_key, ticket, result);
                sender.send(locator).ok();
            }
        };

        let superseded = state.in_flight.insert(
            id.to_owned(),
            InFlight {
                ticket,
                source_key: source_key.to_owned(),
                channel: channel.clone(),
            },
        );
        if let Some(superseded) = superseded {
            tracing::debug!(
                cache = %self.inner.name,
                id,
                superseded_key = %superseded.source_key,
                "Source key changed during resolution",
            );
        }

        tracing::trace!(cache = %self.inner.name, id, source_key, "Spawning resolution");
        let task = task.bind_hub(Hub::new_from_top(Hub::current())).boxed();

        (channel, task)
    }

    /// Caches the outcome of the resolution identified by `ticket` and returns the locator to
    /// hand out to its callers.
    ///
    /// Nothing is written back if the resolution has been discarded in the meantime.
    fn settle(
        &self,
        id: &str,
        source_key: &str,
        ticket: u64,
        result: Result<String, ResolveError>,
    ) -> Locator {
        let name = self.inner.name;
        let now = self.now();
        let record = match result {
            Ok(locator) => {
                metric!(counter("locators.resolve") += 1, "cache" => name.as_ref());
                CacheRecord::resolved(locator.into(), source_key, now)
            }
            Err(e) => {
                metric!(counter("locators.resolve.error") += 1, "cache" => name.as_ref());
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    cache = %name,
                    id,
                    source_key,
                    "Failed to resolve locator",
                );
                CacheRecord::placeholder(self.placeholder(), source_key, now)
            }
        };
        let locator = record.locator.clone();

        // Evict the tracker together with the write-back, so that callers either join a
        // resolution that will complete or find the fresh record. The durable write happens under
        // the same lock, so that a concurrent invalidation cannot be undone by it.
        let is_current = {
            let mut state = self.inner.state.lock().unwrap();
            let is_current = state
                .in_flight
                .get(id)
                .is_some_and(|in_flight| in_flight.ticket == ticket);
            if is_current {
                state.in_flight.remove(id);
                if let Some(ref persistence) = self.inner.persistence {
                    if !record.is_placeholder {
                        persistence.save(id, &record, self.cache_duration());
                    }
                }
                state.records.insert(id, record.clone());
            }
            is_current
        };

        if !is_current {
            tracing::debug!(cache = %name, id, "Discarding result of abandoned resolution");
            return locator;
        }

        if record.is_placeholder {
            self.emit(CacheEvent::Failed {
                id: id.to_owned(),
                placeholder: locator.clone(),
            });
        } else {
            tracing::debug!(cache = %name, id, "Resolved locator");
            self.emit(CacheEvent::Resolved {
                id: id.to_owned(),
                locator: locator.clone(),
            });
        }

        locator
    }
}
