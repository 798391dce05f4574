//! Monotonic and hybrid timestamps used to order replicate messages.

use std::sync::Mutex;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;

/// A hybrid timestamp: physical microseconds since the epoch plus a logical
/// counter that breaks ties when the physical clock stalls or runs backwards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HybridTimestamp {
    /// Microseconds since the Unix epoch.
    pub physical_us: u64,
    /// Logical sequence number within the same physical microsecond.
    pub logical: u64,
}

impl HybridTimestamp {
    pub const MIN: HybridTimestamp = HybridTimestamp { physical_us: 0, logical: 0 };
}

impl std::fmt::Display for HybridTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.physical_us, self.logical)
    }
}

/// Issues monotonic hybrid timestamps for one tablet.
///
/// The leader stamps every replicate message at assignment time; followers
/// feed observed timestamps back through [`TimeManager::observe`] so that
/// their own clocks never issue a timestamp behind one they have seen.
pub struct TimeManager {
    last: Mutex<HybridTimestamp>,
}

impl TimeManager {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(HybridTimestamp::MIN),
        }
    }

    /// Return a timestamp strictly greater than every timestamp previously
    /// returned or observed.
    pub fn now(&self) -> HybridTimestamp {
        let physical = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let mut last = self.last.lock().unwrap();
        let next = if physical > last.physical_us {
            HybridTimestamp {
                physical_us: physical,
                logical: 0,
            }
        } else {
            HybridTimestamp {
                physical_us: last.physical_us,
                logical: last.logical + 1,
            }
        };
        *last = next;
        next
    }

    /// Fold a timestamp observed on the wire into the local clock.
    pub fn observe(&self, ts: HybridTimestamp) {
        let mut last = self.last.lock().unwrap();
        if ts > *last {
            *last = ts;
        }
    }

    /// The most recent timestamp issued or observed.
    pub fn last(&self) -> HybridTimestamp {
        *self.last.lock().unwrap()
    }
}

impl Default for TimeManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_strictly_monotonic() {
        let tm = TimeManager::new();
        let mut prev = tm.now();
        for _ in 0..1000 {
            let next = tm.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_observe_advances_clock() {
        let tm = TimeManager::new();
        let far_ahead = HybridTimestamp {
            physical_us: u64::MAX / 2,
            logical: 7,
        };
        tm.observe(far_ahead);
        assert!(tm.now() > far_ahead);
    }

    #[test]
    fn test_observe_ignores_stale_timestamps() {
        let tm = TimeManager::new();
        let current = tm.now();
        tm.observe(HybridTimestamp::MIN);
        assert!(tm.last() >= current);
    }
}
