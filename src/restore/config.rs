//! Tunables of the restore coordination.

use crate::utils::PitrError;

use tokio::time::Duration;

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordConfig {
    /// Polling period of convergence and status waits.
    pub poll_interval_ms: u64,

    /// A heartbeat older than this many seconds of cluster time means the
    /// owner is gone.
    pub stale_frame_sec: u32,

    /// Refresh period of heartbeats written by this agent.
    pub hb_interval_ms: u64,

    /// Number of most recent commits each shard publishes for
    /// cross-shard transaction resolution.
    pub txn_window: usize,

    /// Default bound on a leader's convergence wait; 0 means unbounded.
    pub converge_timeout_sec: u64,

    /// How long to wait for other shards to publish their commits before
    /// resolving leftovers with what is there.
    pub txn_wait_sec: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for CoordConfig {
    fn default() -> Self {
        CoordConfig {
            poll_interval_ms: 1000,
            stale_frame_sec: 30,
            hb_interval_ms: 5000,
            txn_window: 100,
            converge_timeout_sec: 0,
            txn_wait_sec: 600,
        }
    }
}

impl CoordConfig {
    /// Parses from an optional TOML string on top of the defaults, then
    /// validates.
    pub fn from_toml(config_str: Option<&str>) -> Result<Self, PitrError> {
        let config = parsed_config!(config_str => CoordConfig;
                                    poll_interval_ms, stale_frame_sec,
                                    hb_interval_ms, txn_window,
                                    converge_timeout_sec, txn_wait_sec)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PitrError> {
        if self.poll_interval_ms == 0 {
            return logged_err!(
                "invalid config.poll_interval_ms '{}'",
                self.poll_interval_ms
            );
        }
        if self.stale_frame_sec == 0 {
            return logged_err!(
                "invalid config.stale_frame_sec '{}'",
                self.stale_frame_sec
            );
        }
        if self.hb_interval_ms == 0
            || self.hb_interval_ms >= u64::from(self.stale_frame_sec) * 1000
        {
            return logged_err!(
                "invalid config.hb_interval_ms '{}', stale frame is {}s",
                self.hb_interval_ms, self.stale_frame_sec
            );
        }
        if self.txn_window == 0 {
            return logged_err!(
                "invalid config.txn_window '{}'",
                self.txn_window
            );
        }
        Ok(())
    }

    #[inline]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[inline]
    pub fn hb_interval(&self) -> Duration {
        Duration::from_millis(self.hb_interval_ms)
    }

    #[inline]
    pub fn txn_wait(&self) -> Duration {
        Duration::from_secs(self.txn_wait_sec)
    }

    /// The configured default converge bound, if any.
    pub fn converge_timeout(&self) -> Option<Duration> {
        if self.converge_timeout_sec == 0 {
            None
        } else {
            Some(Duration::from_secs(self.converge_timeout_sec))
        }
    }
}
