//! Hybrid logical clock.
//!
//! Proposal batches, vote rounds, and ticket keys are all stamped from a
//! single process-global clock. The clock combines wall time in
//! milliseconds with a logical counter so that every stamp it hands out is
//! strictly greater than the previous one, even when the wall clock stalls
//! or steps backwards.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A hybrid logical timestamp: wall milliseconds plus a logical counter.
///
/// Total order is `(physical, counter)` lexicographic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HlcTimestamp {
    pub physical: i64,
    pub counter: u32,
}

impl HlcTimestamp {
    pub fn new(physical: i64, counter: u32) -> Self {
        Self { physical, counter }
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.physical, self.counter)
    }
}

/// Process-global hybrid logical clock.
///
/// Thread-safe; each operation is an atomic read-modify-write returning a
/// timestamp strictly greater than any previously returned by this clock.
#[derive(Debug, Default)]
pub struct HlcClock {
    last: Mutex<HlcTimestamp>,
}

impl HlcClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn wall_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Stamp a local event.
    pub fn local_event(&self) -> HlcTimestamp {
        let wall = Self::wall_millis();
        let mut last = self.last.lock();
        *last = if wall > last.physical {
            HlcTimestamp::new(wall, 0)
        } else {
            HlcTimestamp::new(last.physical, last.counter + 1)
        };
        *last
    }

    /// Stamp an outgoing message. Same guarantee as [`local_event`].
    ///
    /// [`local_event`]: HlcClock::local_event
    pub fn send_event(&self) -> HlcTimestamp {
        self.local_event()
    }

    /// Merge a remote timestamp into the clock and stamp the receipt.
    ///
    /// The result is strictly greater than both the local clock's previous
    /// stamp and `remote`.
    pub fn receive_event(&self, remote: HlcTimestamp) -> HlcTimestamp {
        let wall = Self::wall_millis();
        let mut last = self.last.lock();
        *last = if wall > last.physical && wall > remote.physical {
            HlcTimestamp::new(wall, 0)
        } else if last.physical == remote.physical {
            HlcTimestamp::new(last.physical, last.counter.max(remote.counter) + 1)
        } else if last.physical > remote.physical {
            HlcTimestamp::new(last.physical, last.counter + 1)
        } else {
            HlcTimestamp::new(remote.physical, remote.counter + 1)
        };
        *last
    }
}
