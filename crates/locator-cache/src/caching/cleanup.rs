use std::collections::HashSet;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{CacheEvent, LocatorCache};

/// The shortest period accepted by [`LocatorCache::spawn_periodic_sweep`].
const MIN_SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// The outcome of a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepStats {
    /// Records that were expired or no longer active.
    pub removed: usize,
    /// Records left in the cache.
    pub retained: usize,
    /// Pending resolutions that are no longer tracked.
    pub discarded_pending: usize,
}

impl LocatorCache {
    /// Removes every record that expired or whose id is not in `active_ids`.
    ///
    /// Pending resolutions for inactive ids are discarded. They are not cancelled, but their
    /// results will not be cached.
    pub fn sweep<I>(&self, active_ids: I) -> SweepStats
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let active_ids: HashSet<String> = active_ids
            .into_iter()
            .map(|id| id.as_ref().to_owned())
            .collect();
        self.evict(|id| active_ids.contains(id))
    }

    /// Removes every record that expired. Pending resolutions are left alone.
    pub fn remove_expired(&self) -> SweepStats {
        self.evict(|_| true)
    }

    /// Runs [`remove_expired`](Self::remove_expired) every `period`, starting one period from now.
    ///
    /// The sweep stops when the returned handle is dropped.
    pub fn spawn_periodic_sweep(&self, period: Duration) -> PeriodicSweep {
        let period = period.max(MIN_SWEEP_PERIOD);
        let cache = self.clone();
        let task = async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                cache.remove_expired();
            }
        };

        PeriodicSweep {
            handle: tokio::spawn(task),
        }
    }

    fn evict<F>(&self, is_active: F) -> SweepStats
    where
        F: Fn(&str) -> bool,
    {
        let name = self.name();
        let now = self.now();
        let cache_duration = self.cache_duration();

        let mut removed_ids = Vec::new();
        let (retained, pending, discarded_pending) = {
            let mut state = self.inner.state.lock().unwrap();
            state.records.retain(|id, record| {
                let keep = is_active(id) && !record.is_expired(now, cache_duration);
                if !keep {
                    removed_ids.push(id.clone());
                }
                keep
            });

            if let Some(ref persistence) = self.inner.persistence {
                for id in removed_ids.iter() {
                    persistence.remove(id);
                }
            }

            let tracked = state.in_flight.len();
            state.in_flight.retain(|id, _| is_active(id));
            let pending = state.in_flight.len();

            (state.records.len(), pending, tracked - pending)
        };

        for id in removed_ids.iter() {
            tracing::trace!(cache = %name, %id, "Evicting locator");
            self.emit(CacheEvent::Removed { id: id.clone() });
        }

        let stats = SweepStats {
            removed: removed_ids.len(),
            retained,
            discarded_pending,
        };
        tracing::debug!(
            cache = %name,
            removed = stats.removed,
            retained = stats.retained,
            discarded_pending = stats.discarded_pending,
            "Swept locator cache",
        );

        metric!(gauge("locators.size.records") = retained as u64, "cache" => name.as_ref());
        metric!(gauge("locators.size.pending") = pending as u64, "cache" => name.as_ref());
        metric!(counter("locators.size.removed") += stats.removed as i64, "cache" => name.as_ref());

        stats
    }
}

/// A handle to a periodic sweep of a [`LocatorCache`].
///
/// Dropping the handle stops the sweep.
#[derive(Debug)]
pub struct PeriodicSweep {
    handle: JoinHandle<()>,
}

impl Drop for PeriodicSweep {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
