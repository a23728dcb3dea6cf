use std::sync::Arc;

use locator_cache::caching::{CacheName, FsStore, LocatorCaches};
use locator_cache::config::{Config, ResolverConfig};
use locator_cache::resolver::HttpResolver;

use crate::{PresignServer, setup, tempdir};

fn config(server: &PresignServer, cache_dir: &std::path::Path) -> Config {
    Config {
        cache_dir: Some(cache_dir.to_owned()),
        resolver: ResolverConfig {
            url: Some(server.url()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn caches(config: &Config) -> LocatorCaches {
    let resolver = HttpResolver::from_config(&config.resolver).unwrap().unwrap();
    LocatorCaches::from_config(config, Arc::new(resolver)).unwrap()
}

#[tokio::test]
async fn test_survives_restart() {
    setup();
    let server = PresignServer::new().await;
    let cache_dir = tempdir();
    let config = config(&server, cache_dir.path());

    let first = caches(&config);
    let locator = first.products.get_locator("p1", "products/a.png").await;
    assert_eq!(&*locator, PresignServer::locator("products/a.png"));
    assert_eq!(server.hits(), 1);

    let restarted = caches(&config);
    assert_eq!(restarted.products.stats().cached_count, 1);
    assert_eq!(restarted.stories.stats().cached_count, 0);
    let locator = restarted.get(CacheName::Products).get_locator("p1", "products/a.png").await;
    assert_eq!(&*locator, PresignServer::locator("products/a.png"));
    assert_eq!(server.hits(), 1);

    // a new key for the same id is resolved again
    restarted.products.get_locator("p1", "products/b.png").await;
    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn test_failures_are_not_persisted() {
    setup();
    let server = PresignServer::new().await;
    let cache_dir = tempdir();
    let config = config(&server, cache_dir.path());

    let first = caches(&config);
    let locator = first.stories.get_locator("s1", "missing").await;
    assert_eq!(&*locator, "/api/placeholder/100/100");

    let restarted = caches(&config);
    assert_eq!(restarted.stories.stats().cached_count, 0);
}

#[tokio::test]
async fn test_corrupted_files_are_skipped() {
    setup();
    let server = PresignServer::new().await;
    let cache_dir = tempdir();
    let config = config(&server, cache_dir.path());

    let first = caches(&config);
    first.products.get_locator("p1", "products/a.png").await;
    first.products.get_locator("p2", "products/b.png").await;

    // truncate every persisted entry but one
    let store = FsStore::open(cache_dir.path().join("locators")).unwrap();
    let mut entries: Vec<_> = std::fs::read_dir(store.dir())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    entries.sort();
    assert_eq!(entries.len(), 2);
    std::fs::write(&entries[0], b"{\"value\":").unwrap();

    let restarted = caches(&config);
    assert_eq!(restarted.products.stats().cached_count, 1);
}
