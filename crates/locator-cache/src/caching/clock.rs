use std::fmt;
use std::time::SystemTime;

/// A source of wall-clock time for cache bookkeeping.
///
/// Resolution timestamps are persisted across restarts, so this is wall-clock time rather than a
/// monotonic [`Instant`](std::time::Instant).
pub trait Clock: fmt::Debug + Send + Sync + 'static {
    fn now(&self) -> SystemTime;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}
