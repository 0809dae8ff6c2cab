//! Time utilities for the ledger.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Timing constants.
pub mod constants {
    use std::time::Duration;

    /// Default time an operation may wait for its account locks.
    pub const LOCK_ACQUISITION_TIMEOUT: Duration = Duration::from_secs(5);

    /// Interval between sweeps of idle per-account locks.
    pub const LOCK_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

    /// Attempts made to record a terminal transaction status.
    pub const FINALIZE_ATTEMPTS: usize = 3;

    /// Base backoff between terminal status attempts.
    pub const FINALIZE_BACKOFF: Duration = Duration::from_millis(20);
}

/// A timestamp (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Point in time by which a caller wants an operation to have acquired its
/// resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Deadline `duration` from now.
    pub fn after(duration: Duration) -> Self {
        Self {
            at: Instant::now() + duration,
        }
    }

    /// Deadline at a given instant.
    pub fn at(instant: Instant) -> Self {
        Self { at: instant }
    }

    /// The instant the deadline elapses.
    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Check if the deadline has elapsed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Get remaining time until the deadline.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}
