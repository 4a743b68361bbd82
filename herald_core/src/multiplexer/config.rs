//! Configuration for the multiplexer's lease timing, idle reclamation and naming.

use rand::Rng;
use std::time::Duration;

/// Configuration of a [`Multiplexer`](super::Multiplexer).
///
/// The lease timing is the important part: `refresh_interval` must stay well below
/// `lock_expiry` so that a live leader never looks stale to other tabs under ordinary
/// scheduling jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiplexerConfig {
    /// How long a lease record stays valid without being refreshed.
    ///
    /// Default: 5 seconds
    pub lock_expiry: Duration,

    /// How often the leader rewrites its lease, and how often a follower checks whether the
    /// lease has expired.
    ///
    /// Default: 3 seconds
    pub refresh_interval: Duration,

    /// How often the idle reaper sweeps channel records.
    ///
    /// Default: 5 minutes
    pub reap_interval: Duration,

    /// How long a channel record without listeners may stay idle before the reaper tears it
    /// down.
    ///
    /// Default: 10 minutes
    pub idle_timeout: Duration,

    /// Fixed part of the delay before a follower reacts to `leader_left`.
    ///
    /// Default: 100 milliseconds
    pub takeover_delay: Duration,

    /// Upper bound of the random part added to `takeover_delay`, so that followers in several
    /// tabs do not all race for the lease at the same instant.
    ///
    /// Default: 400 milliseconds
    pub takeover_jitter: Duration,

    /// Prefix of lease keys in the shared store.
    pub lock_key_prefix: String,

    /// Prefix of cross-tab bus topics.
    pub bus_topic_prefix: String,

    /// Schema used for registrations that do not name one.
    pub default_schema: String,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            lock_expiry: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(3),
            reap_interval: Duration::from_secs(5 * 60),
            idle_timeout: Duration::from_secs(10 * 60),
            takeover_delay: Duration::from_millis(100),
            takeover_jitter: Duration::from_millis(400),
            lock_key_prefix: "realtime_leader:".to_string(),
            bus_topic_prefix: "realtime_bus:".to_string(),
            default_schema: "public".to_string(),
        }
    }
}

/// Errors raised by [`MultiplexerConfig::validate`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The leader would not refresh its lease before it expires.
    #[error("refresh interval ({refresh:?}) must be shorter than lock expiry ({expiry:?})")]
    RefreshNotShorterThanExpiry {
        /// The configured refresh interval.
        refresh: Duration,
        /// The configured lock expiry.
        expiry: Duration,
    },
    /// An interval that drives a timer was zero.
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

impl MultiplexerConfig {
    /// Checks the timing constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("refresh_interval"));
        }
        if self.reap_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("reap_interval"));
        }
        if self.refresh_interval >= self.lock_expiry {
            return Err(ConfigError::RefreshNotShorterThanExpiry {
                refresh: self.refresh_interval,
                expiry: self.lock_expiry,
            });
        }
        Ok(())
    }

    /// The shared-store key of the lease for `subscription_key`.
    pub fn lock_key(&self, subscription_key: &str) -> String {
        format!("{}{}", self.lock_key_prefix, subscription_key)
    }

    /// The bus topic for `subscription_key`.
    pub fn bus_topic(&self, subscription_key: &str) -> String {
        format!("{}{}", self.bus_topic_prefix, subscription_key)
    }

    /// A randomized delay before reacting to `leader_left`.
    pub(crate) fn takeover_backoff(&self) -> Duration {
        let jitter_ms = self.takeover_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.takeover_delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        self.takeover_delay + Duration::from_millis(jitter)
    }
}
