//! Dispatcher configuration and time source
//!
//! Timeouts and throttling knobs live here so embedders can load them
//! from a config file alongside the rest of their settings. All times
//! are in nanoseconds to match event timestamps.

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// One millisecond in nanoseconds
pub const MILLIS: i64 = 1_000_000;

/// One second in nanoseconds
pub const SECONDS: i64 = 1_000_000_000;

/// Default timeout before a non-responding consumer is reported
pub const DEFAULT_DISPATCHING_TIMEOUT: i64 = 5 * SECONDS;

/// How long an app-switch key press is allowed to preempt queued work
pub const DEFAULT_APP_SWITCH_TIMEOUT: i64 = 500 * MILLIS;

/// Events older than this are dropped instead of dispatched
pub const DEFAULT_STALE_EVENT_TIMEOUT: i64 = 10 * SECONDS;

/// Granularity at which throttled motion samples are coalesced
pub const MOTION_SAMPLE_COALESCE_INTERVAL: i64 = 3 * MILLIS;

/// Dispatcher tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Delay before a held key begins repeating, in nanoseconds
    pub key_repeat_timeout: i64,
    /// Interval between synthetic key repeats, in nanoseconds
    pub key_repeat_delay: i64,
    /// Maximum motion event rate per device+source; 0 disables throttling
    pub max_events_per_second: u32,
    /// Timeout applied when a target supplies none of its own
    pub default_dispatching_timeout: i64,
    /// How long pending app-switch keys may preempt the queue
    pub app_switch_timeout: i64,
    /// Age at which undispatched events are considered stale and dropped
    pub stale_event_timeout: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            key_repeat_timeout: 500 * MILLIS,
            key_repeat_delay: 50 * MILLIS,
            max_events_per_second: 0,
            default_dispatching_timeout: DEFAULT_DISPATCHING_TIMEOUT,
            app_switch_timeout: DEFAULT_APP_SWITCH_TIMEOUT,
            stale_event_timeout: DEFAULT_STALE_EVENT_TIMEOUT,
        }
    }
}

impl DispatcherConfig {
    /// Validate parameter ranges
    pub fn validate(&self) -> Result<()> {
        if self.key_repeat_timeout <= 0 || self.key_repeat_delay <= 0 {
            return Err(DispatchError::Config(
                "key repeat timeout and delay must be positive".into(),
            ));
        }
        if self.default_dispatching_timeout <= 0 {
            return Err(DispatchError::Config(
                "default dispatching timeout must be positive".into(),
            ));
        }
        if self.stale_event_timeout <= self.app_switch_timeout {
            return Err(DispatchError::Config(
                "stale event timeout must exceed app switch timeout".into(),
            ));
        }
        Ok(())
    }

    /// Minimum spacing between throttled motion events, or `None` when
    /// throttling is disabled
    pub fn min_motion_interval(&self) -> Option<i64> {
        if self.max_events_per_second == 0 {
            None
        } else {
            Some(SECONDS / self.max_events_per_second as i64)
        }
    }
}

/// Monotonic time source, in nanoseconds
///
/// The dispatcher never reads wall-clock time directly so tests can
/// substitute a deterministic clock.
pub trait Clock: Send + Sync {
    /// Current monotonic time in nanoseconds
    fn now(&self) -> i64;
}

/// Clock backed by [`std::time::Instant`]
pub struct MonotonicClock {
    origin: std::time::Instant,
}

impl MonotonicClock {
    /// Create a clock anchored at construction time
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }
}
