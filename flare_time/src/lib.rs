//! Time abstractions for FlareDB.
//!
//! Components that need to ask for "now" take an [`Arc<dyn TimeProvider>`]
//! instead of reading the wall clock, so tests can drive time deterministically
//! through [`MockProvider`].
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::{
    fmt,
    ops::{Add, Sub},
    sync::Arc,
    time::Duration,
};

/// A moment in time.
///
/// Only millisecond precision is guaranteed to survive a round-trip through
/// the metastore, which keys everything in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(DateTime<Utc>);

impl Time {
    /// Build a time from milliseconds since the Unix epoch.
    pub fn from_timestamp_millis(millis: i64) -> Self {
        Self(
            Utc.timestamp_millis_opt(millis)
                .single()
                .expect("timestamp in range"),
        )
    }

    /// Build a time from a [`DateTime<Utc>`].
    pub fn from_date_time(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Milliseconds since the Unix epoch.
    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// The underlying [`DateTime<Utc>`].
    pub fn date_time(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        let rhs = chrono::Duration::from_std(rhs).expect("duration in range");
        Self(self.0 + rhs)
    }
}

impl Sub<Duration> for Time {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self::Output {
        let rhs = chrono::Duration::from_std(rhs).expect("duration in range");
        Self(self.0 - rhs)
    }
}

/// A source of the current time.
pub trait TimeProvider: fmt::Debug + Send + Sync + 'static {
    /// The current time.
    fn now(&self) -> Time;
}

impl<T: TimeProvider + ?Sized> TimeProvider for Arc<T> {
    fn now(&self) -> Time {
        (**self).now()
    }
}

/// A [`TimeProvider`] that reads the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider;

impl SystemProvider {
    /// Create a new system clock provider.
    pub fn new() -> Self {
        Self
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// A [`TimeProvider`] owned by tests: time only moves when told to.
#[derive(Debug)]
pub struct MockProvider {
    now: Mutex<Time>,
}

impl MockProvider {
    /// Create a provider pinned at `start`.
    pub fn new(start: Time) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Pin the clock at `time`.
    pub fn set(&self, time: Time) {
        *self.now.lock() = time;
    }

    /// Advance the clock, returning the new time.
    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.lock();
        *now = *now + duration;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.lock()
    }
}
