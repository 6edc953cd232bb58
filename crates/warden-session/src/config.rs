//! Configuration for the session cache.

use std::time::Duration;

use warden_config::{AccessTimeout, EvictionAction, ResolvedBeanConfig};

/// Default interval between expiration sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Default idle timeout (none: sessions never expire).
pub const DEFAULT_IDLE_TIMEOUT: Option<Duration> = None;

/// Configuration for a stateful component's session cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long an inactive session may stay untouched before the sweep evicts it.
    /// `None` disables the sweep entirely.
    pub idle_timeout: Option<Duration>,

    /// How long a passivated image is kept before the sweep drops it.
    /// `None` uses the idle timeout.
    pub passivation_timeout: Option<Duration>,

    /// Interval between expiration sweeps.
    pub sweep_interval: Duration,

    /// Maximum number of in-memory sessions; idle sessions beyond it are evicted.
    pub max_sessions: Option<usize>,

    /// What happens to evicted sessions.
    pub eviction: EvictionAction,

    /// Lock wait for methods without their own access timeout.
    pub access_timeout: AccessTimeout,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            passivation_timeout: None,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_sessions: None,
            eviction: EvictionAction::Destroy,
            access_timeout: AccessTimeout::default(),
        }
    }
}

impl CacheConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from resolved component settings.
    pub fn from_resolved(resolved: &ResolvedBeanConfig) -> Self {
        Self {
            idle_timeout: resolved.idle_timeout,
            passivation_timeout: resolved.passivation_timeout,
            sweep_interval: resolved.sweep_interval,
            max_sessions: resolved.max_sessions,
            eviction: resolved.eviction,
            access_timeout: resolved.access_timeout,
        }
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Disable idle expiration.
    pub fn without_idle_timeout(mut self) -> Self {
        self.idle_timeout = None;
        self
    }

    /// Keep passivated images for `timeout` instead of the idle timeout.
    pub fn with_passivation_timeout(mut self, timeout: Duration) -> Self {
        self.passivation_timeout = Some(timeout);
        self
    }

    /// Effective expiry of passivated images.
    pub fn passivated_expiry(&self) -> Option<Duration> {
        self.passivation_timeout.or(self.idle_timeout)
    }

    /// Set the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Bound the number of in-memory sessions.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = Some(max.max(1));
        self
    }

    /// Set the eviction action.
    pub fn with_eviction(mut self, eviction: EvictionAction) -> Self {
        self.eviction = eviction;
        self
    }

    /// Set the default access timeout.
    pub fn with_access_timeout(mut self, timeout: AccessTimeout) -> Self {
        self.access_timeout = timeout;
        self
    }
}
