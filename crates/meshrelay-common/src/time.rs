// ============================================
// File: crates/meshrelay-common/src/time.rs
// ============================================
//! # Time Utilities
//!
//! ## Creation Reason
//! Streams, UDP associations and peer links all record "last seen"
//! instants from their I/O paths while background reapers read them.
//! `AtomicInstant` lets both sides do that without a lock.
//!
//! ## Main Functionality
//! - `AtomicInstant`: lock-free `Instant` cell
//! - `Timestamp`: wall-clock Unix seconds for persisted records
//!
//! ## ⚠️ Important Note for Next Developer
//! - `AtomicInstant` stores nanoseconds since a process-wide reference
//!   instant; values before the reference clamp to the reference
//!
//! ## Last Modified
//! v0.1.0 - Initial time utilities

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ============================================
// AtomicInstant
// ============================================

/// Thread-safe activity timestamp.
///
/// # Example
/// ```
/// use meshrelay_common::time::AtomicInstant;
/// use std::time::Duration;
///
/// let last_seen = AtomicInstant::now();
/// last_seen.touch();
/// assert!(!last_seen.is_idle(Duration::from_secs(60)));
/// ```
#[derive(Debug)]
pub struct AtomicInstant {
    nanos: AtomicU64,
}

impl AtomicInstant {
    fn reference() -> Instant {
        static REFERENCE: OnceLock<Instant> = OnceLock::new();
        *REFERENCE.get_or_init(Instant::now)
    }

    fn to_nanos(instant: Instant) -> u64 {
        instant
            .checked_duration_since(Self::reference())
            .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    /// Creates a cell holding the current instant.
    #[must_use]
    pub fn now() -> Self {
        Self::from_instant(Instant::now())
    }

    /// Creates a cell holding `instant`.
    #[must_use]
    pub fn from_instant(instant: Instant) -> Self {
        Self {
            nanos: AtomicU64::new(Self::to_nanos(instant)),
        }
    }

    /// Loads the stored instant.
    #[must_use]
    pub fn load(&self) -> Instant {
        Self::reference() + Duration::from_nanos(self.nanos.load(Ordering::Relaxed))
    }

    /// Stores a new instant.
    pub fn store(&self, instant: Instant) {
        self.nanos.store(Self::to_nanos(instant), Ordering::Relaxed);
    }

    /// Marks activity now.
    pub fn touch(&self) {
        self.store(Instant::now());
    }

    /// Time elapsed between the stored instant and `now`.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.load())
    }

    /// Returns `true` if nothing touched the cell for longer than `timeout`.
    #[must_use]
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.idle_for(Instant::now()) > timeout
    }
}

impl Default for AtomicInstant {
    fn default() -> Self {
        Self::now()
    }
}

// ============================================
// Timestamp
// ============================================

/// Unix timestamp in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp from Unix seconds.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Current wall-clock time. A clock set before 1970 reads as zero.
    #[must_use]
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self(secs)
    }

    /// Returns the Unix timestamp in seconds.
    #[must_use]
    pub const fn as_secs(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_atomic_instant_store_and_load() {
        let cell = AtomicInstant::now();
        thread::sleep(Duration::from_millis(10));

        let before = cell.load();
        cell.touch();
        assert!(cell.load() > before);
    }

    #[test]
    fn test_idle_detection() {
        let past = Instant::now();
        let cell = AtomicInstant::from_instant(past);

        let later = past + Duration::from_secs(5);
        assert_eq!(cell.idle_for(later), Duration::from_secs(5));
        assert!(!cell.is_idle(Duration::from_secs(3600)));
    }

    #[test]
    fn test_idle_for_never_underflows() {
        let cell = AtomicInstant::now();
        let earlier = Instant::now()
            .checked_sub(Duration::from_millis(1))
            .unwrap_or_else(Instant::now);
        assert!(cell.idle_for(earlier) <= Duration::from_millis(1));
    }

    #[test]
    fn test_timestamp_now_is_after_2020() {
        assert!(Timestamp::now().as_secs() > 1_577_836_800);
    }
}
