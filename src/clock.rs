//! Logical clock shared by the tablet and its log.
//!
//! Commit records carry the timestamp their operation was assigned.
//! During replay the clock is ratcheted forward past every replayed
//! commit so that timestamps handed out after bootstrap never move
//! backwards relative to the recovered history.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::{Error, Result};

/// A point on the tablet's logical timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The minimum assignable timestamp.
    pub const MIN: Timestamp = Timestamp(0);

    /// Sentinel for operations that never received a timestamp
    /// (e.g. aborted operations).
    pub const INVALID: Timestamp = Timestamp(u64::MAX);

    /// Check whether this is the invalid sentinel.
    pub fn is_valid(&self) -> bool {
        *self != Timestamp::INVALID
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "<invalid>")
        }
    }
}

/// Monotonic logical clock.
///
/// Thread-safe; shared via `Arc` between the tablet and the log.
#[derive(Debug, Default)]
pub struct Clock {
    last: AtomicU64,
}

impl Clock {
    /// Create a clock starting at the minimum timestamp.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hand out the next timestamp.
    pub fn now(&self) -> Timestamp {
        Timestamp(self.last.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// The most recent timestamp observed or handed out.
    pub fn last(&self) -> Timestamp {
        Timestamp(self.last.load(Ordering::SeqCst))
    }

    /// Advance the clock to at least `ts`.
    ///
    /// Passing the invalid sentinel is a programming error; callers must
    /// filter out operations that never received a timestamp.
    pub fn update(&self, ts: Timestamp) -> Result<()> {
        if !ts.is_valid() {
            return Err(Error::invalid_argument(
                "cannot update clock from an invalid timestamp",
            ));
        }
        self.last.fetch_max(ts.0, Ordering::SeqCst);
        Ok(())
    }
}
