//! Logical cluster timestamp.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical cluster time: seconds `t` plus an ordinal `i` among operations
/// within the same second. Ordered lexicographically by `(t, i)`.
#[derive(
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Copy,
    Serialize,
    Deserialize,
)]
pub struct Timestamp {
    pub t: u32,
    pub i: u32,
}

impl Timestamp {
    pub const fn new(t: u32, i: u32) -> Self {
        Timestamp { t, i }
    }

    /// The zero timestamp stands for "unbounded" in timeframe filters.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.t == 0 && self.i == 0
    }

    /// True if this heartbeat lags `now` by more than `frame_sec` seconds.
    #[inline]
    pub fn is_stale(&self, now: Timestamp, frame_sec: u32) -> bool {
        self.t.saturating_add(frame_sec) < now.t
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.t, self.i)
    }
}

#[cfg(test)]
mod timestamp_tests {
    use super::*;

    #[test]
    fn ordering() {
        assert!(Timestamp::new(10, 5) < Timestamp::new(11, 0));
        assert!(Timestamp::new(10, 5) > Timestamp::new(10, 4));
        assert_eq!(Timestamp::new(3, 3), Timestamp::new(3, 3));
        assert!(Timestamp::default().is_zero());
    }

    #[test]
    fn staleness() {
        let hb = Timestamp::new(100, 0);
        assert!(!hb.is_stale(Timestamp::new(130, 0), 30));
        assert!(hb.is_stale(Timestamp::new(131, 0), 30));
        let far = Timestamp::new(u32::MAX, 0);
        assert!(!far.is_stale(Timestamp::new(5, 0), 30));
    }
}
