//! Helpers for testing the caches.
//!
//! In every test, call [`setup`] so that log output is captured by the test runner. Tests
//! depending on resolver latency should run with paused time (`#[tokio::test(start_paused =
//! true)]`); the [`MockResolver`] sleeps on the Tokio clock.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use crate::caching::Clock;
use crate::resolver::{ResolveError, Resolver};

/// Setup the test environment.
///
/// Initializes logs: the logger only captures logs from this crate.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("locator_cache=trace"))
        .with_target(false)
        .with_test_writer()
        .try_init()
        .ok();
}

/// A wall clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)),
        })
    }

    pub fn advance(&self, duration: Duration) {
        *self.now.lock().unwrap() += duration;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}

/// A resolver that counts its invocations.
///
/// Resolves `key` into `https://storage.test/{key}` after the configured latency, or fails for
/// keys registered via [`fail`](Self::fail).
#[derive(Debug, Default)]
pub struct MockResolver {
    latency: Duration,
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
    calls_per_key: Mutex<BTreeMap<String, usize>>,
}

impl MockResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Self::default()
        })
    }

    /// Makes all further resolutions of `key` fail.
    pub fn fail(&self, key: &str) {
        self.failing.lock().unwrap().insert(key.to_owned());
    }

    /// The total number of invocations.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.calls_per_key
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    pub fn locator(key: &str) -> String {
        format!("https://storage.test/{key}")
    }
}

#[async_trait]
impl Resolver for MockResolver {
    async fn resolve(&self, source_key: &str) -> Result<String, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .calls_per_key
            .lock()
            .unwrap()
            .entry(source_key.to_owned())
            .or_default() += 1;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.failing.lock().unwrap().contains(source_key) {
            return Err(ResolveError::Rejected("mock failure".into()));
        }
        Ok(Self::locator(source_key))
    }
}
