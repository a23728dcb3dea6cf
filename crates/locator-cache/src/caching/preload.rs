use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::Locator;

use super::LocatorCache;

/// An entity whose locator should be resolved ahead of display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadItem {
    pub id: String,
    /// The storage key to resolve. Empty if the entity has no image, in which case it is skipped.
    #[serde(default, alias = "imageUrl")]
    pub source_key: String,
}

impl PreloadItem {
    pub fn new(id: impl Into<String>, source_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_key: source_key.into(),
        }
    }
}

impl LocatorCache {
    /// Resolves the locators of all `items`, with at most `concurrency` resolutions at a time.
    ///
    /// Without an explicit `concurrency`, the configured preload concurrency is used. Items are
    /// dispatched in order as soon as a slot frees up. Completes once every item is resolved or
    /// has fallen back to the placeholder.
    pub async fn preload<I>(&self, items: I, concurrency: Option<usize>)
    where
        I: IntoIterator<Item = PreloadItem>,
    {
        let concurrency = concurrency
            .unwrap_or_else(|| self.config().preload_concurrency())
            .max(1);
        let semaphore = &Semaphore::new(concurrency);

        let preloads = items
            .into_iter()
            .filter(|item| !item.source_key.is_empty())
            .map(|item| async move {
                // the semaphore is never closed
                let _permit = semaphore.acquire().await;
                self.get_locator(&item.id, &item.source_key).await;
            });
        join_all(preloads).await;
    }

    /// Resolves the items right before and after `current_index` concurrently.
    pub async fn preload_adjacent(&self, items: &[PreloadItem], current_index: usize) {
        let previous = current_index.checked_sub(1).and_then(|i| items.get(i));
        let next = current_index.checked_add(1).and_then(|i| items.get(i));

        let adjacent = previous
            .into_iter()
            .chain(next)
            .filter(|item| !item.source_key.is_empty())
            .map(|item| self.get_locator(&item.id, &item.source_key));
        join_all(adjacent).await;
    }

    /// Creates a [`VisibilityGate`] resolving into this cache.
    pub fn visibility_gate(&self) -> VisibilityGate {
        VisibilityGate::new(self.clone())
    }
}

/// Defers resolutions until the entity is displayed.
///
/// Entities are [registered](Self::register) with their source key and resolved once the UI
/// reports them as [visible](Self::on_visible), after which they are unregistered.
#[derive(Debug, Clone)]
pub struct VisibilityGate {
    cache: LocatorCache,
    registered: Arc<Mutex<HashMap<String, String>>>,
}

impl VisibilityGate {
    pub fn new(cache: LocatorCache) -> Self {
        Self {
            cache,
            registered: Default::default(),
        }
    }

    /// Registers `id` for resolution of `source_key` once visible.
    ///
    /// Registering an id again replaces its source key. Empty source keys are ignored.
    pub fn register(&self, id: &str, source_key: &str) {
        if source_key.is_empty() {
            return;
        }
        self.registered
            .lock()
            .unwrap()
            .insert(id.to_owned(), source_key.to_owned());
    }

    /// Stops watching `id`. Returns `false` if it was not registered.
    pub fn unregister(&self, id: &str) -> bool {
        self.registered.lock().unwrap().remove(id).is_some()
    }

    /// Resolves a registered `id` and unregisters it.
    ///
    /// Returns `None` without resolving anything if `id` is not registered.
    pub async fn on_visible(&self, id: &str) -> Option<Locator> {
        let source_key = self.registered.lock().unwrap().get(id).cloned()?;
        let locator = self.cache.get_locator(id, &source_key).await;

        let mut registered = self.registered.lock().unwrap();
        // it may have been registered again with a different key in the meantime
        if registered.get(id) == Some(&source_key) {
            registered.remove(id);
        }
        Some(locator)
    }

    pub fn registered_count(&self) -> usize {
        self.registered.lock().unwrap().len()
    }
}
