//! Resolution and caching of resource locators.
//!
//! Storefront images are stored under opaque object-storage keys. Before they can be displayed,
//! those keys have to be resolved into time-limited locators (presigned URLs). This crate caches
//! the resolved locators per entity, coalesces concurrent resolutions, evicts entries that expired
//! or are no longer displayed, mirrors them to a durable store and preloads them ahead of display.
//!
//! See the [`caching`] module for a description of how the pieces fit together.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod resolver;
pub mod utils;

#[cfg(test)]
mod test;

pub use caching::{
    CacheEvent, CacheName, CacheRecord, CacheStats, LocatorCache, LocatorCaches, PreloadItem,
    SweepStats, VisibilityGate,
};
pub use resolver::{ResolveError, Resolver};

/// A resolved, typically time-limited, reference to a stored resource.
pub type Locator = std::sync::Arc<str>;
