//! # Locator Caching
//!
//! Images are stored under opaque storage keys, and displaying one requires resolving its key into
//! a time-limited locator through a remote [`Resolver`]. This module caches those locators per
//! entity id, so that a catalog page or a story carousel does not hit the resolver for every
//! render.
//!
//! ## Layers
//!
//! - The in-memory [`CacheStore`], which is authoritative.
//! - The request coalescing layer of the [`LocatorCache`]: concurrent requests for the same id and
//!   source key share a single resolution.
//! - An optional [`DurableStore`] that mirrors every successful resolution, so that a restarted
//!   process does not have to resolve everything again. See [`Persistence`].
//!
//! A request for `(id, source_key)` goes through the following steps:
//! - If the in-memory record for `id` was resolved from `source_key` and has not expired, it is
//!   returned right away.
//! - Otherwise, if a resolution of `source_key` is pending for `id`, the request joins it.
//! - Otherwise, a new resolution is spawned. A pending resolution of a different key for the same
//!   id is superseded: it keeps running, but its result is not cached.
//! - Once resolved, the record is cached and mirrored to the durable store. If the resolver fails,
//!   the placeholder is cached instead, but not mirrored.
//!
//! ## Validity
//!
//! A record can only serve a request if it was resolved from the *requested* source key, and its
//! cache duration has not elapsed (see [`CacheRecord::is_valid`]). Checking the key matters: the
//! image of an entity can be replaced under a new key while the old locator is still fresh.
//!
//! ## Eviction
//!
//! [`LocatorCache::sweep`] evicts records that expired or belong to entities which are no longer
//! displayed, and stops tracking their pending resolutions. [`LocatorCache::remove_expired`] only
//! evicts expired records, and can be run periodically via
//! [`LocatorCache::spawn_periodic_sweep`]. [`LocatorCache::clear`] drops everything.
//!
//! Evicted resolutions are never cancelled, since the resolver has no side effects. Their results
//! are just not written back.
//!
//! ## Metrics
//!
//! All metrics are tagged with the `cache` name:
//!
//! - `locators.access`: All accesses via [`LocatorCache::get_locator`].
//! - `locators.memory.hit`: Accesses served by the in-memory layer.
//! - `locators.channel.hit`: Accesses that joined a pending resolution.
//! - `locators.resolve`: Successful resolutions.
//! - `locators.resolve.error`: Failed resolutions, served as placeholder.
//! - `locators.store.error`: Failed accesses to the durable store.
//! - `locators.size.records` / `locators.size.pending`: Gauges reported by every sweep.
//! - `locators.size.removed`: Records removed by sweeps.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CacheConfig, CacheConfigs, Config};
use crate::resolver::Resolver;

mod cacher;
mod cleanup;
mod clock;
mod config;
mod persist;
mod preload;
mod record;

pub use cacher::{CacheEvent, CacheStats, LocatorCache, LocatorCacheBuilder};
pub use cleanup::{PeriodicSweep, SweepStats};
pub use clock::{Clock, SystemClock};
pub use config::CacheName;
pub use persist::{
    DurableStore, FsStore, MemoryStore, Persistence, StoreError, clear_prefix, get_item, set_item,
    touch_item,
};
pub use preload::{PreloadItem, VisibilityGate};
pub use record::{CacheRecord, CacheStore, is_valid};

/// The configured locator caches, sharing one resolver, clock and durable store.
#[derive(Debug, Clone)]
pub struct LocatorCaches {
    /// Locators of product images.
    pub products: LocatorCache,
    /// Locators of story images.
    pub stories: LocatorCache,
}

impl LocatorCaches {
    pub fn new(
        configs: &CacheConfigs,
        resolver: Arc<dyn Resolver>,
        clock: Arc<dyn Clock>,
        store: Option<Arc<dyn DurableStore>>,
    ) -> Self {
        let build = |name, config: CacheConfig| {
            let mut builder = LocatorCache::builder(name, config, Arc::clone(&resolver))
                .clock(Arc::clone(&clock));
            if let Some(ref store) = store {
                builder = builder.store(Arc::clone(store));
            }
            builder.build()
        };

        Self {
            products: build(CacheName::Products, configs.products.clone().into()),
            stories: build(CacheName::Stories, configs.stories.clone().into()),
        }
    }

    /// Creates the caches, persisting to the `locators` directory below the configured
    /// `cache_dir`, if any.
    pub fn from_config(config: &Config, resolver: Arc<dyn Resolver>) -> io::Result<Self> {
        let store = match config.cache_dir("locators") {
            Some(dir) => Some(Arc::new(FsStore::open(dir)?) as Arc<dyn DurableStore>),
            None => None,
        };
        Ok(Self::new(
            &config.caches,
            resolver,
            Arc::new(SystemClock),
            store,
        ))
    }

    pub fn get(&self, name: CacheName) -> &LocatorCache {
        match name {
            CacheName::Products => &self.products,
            CacheName::Stories => &self.stories,
        }
    }

    fn all(&self) -> [&LocatorCache; 2] {
        // Destructure so we do not accidentally forget one of our members.
        let Self { products, stories } = self;
        [products, stories]
    }

    /// Removes expired records from all caches.
    pub fn remove_expired(&self) -> Vec<(CacheName, SweepStats)> {
        self.all()
            .into_iter()
            .map(|cache| (cache.name(), cache.remove_expired()))
            .collect()
    }

    /// Sweeps expired records from all caches every `period`, until the handles are dropped.
    pub fn spawn_periodic_sweeps(&self, period: Duration) -> Vec<PeriodicSweep> {
        self.all()
            .into_iter()
            .map(|cache| cache.spawn_periodic_sweep(period))
            .collect()
    }

    pub fn clear(&self) {
        for cache in self.all() {
            cache.clear();
        }
    }
}
