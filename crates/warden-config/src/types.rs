//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [cache]                         # defaults for every component
//! [bean.cart]                     # per-component overrides
//! [bean.cart.method.checkout]     # per-method settings
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Default interval between expiration sweeps.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 500;

/// Default maximum wait for a session lock.
pub const DEFAULT_ACCESS_TIMEOUT_MS: u64 = 5000;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Cache-wide defaults (the `[cache]` section).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheSection>,

    /// Per-component sections (`[bean.<name>]`).
    pub bean: HashMap<String, BeanSection>,
}

impl WardenConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Scalar settings are merged field by field; method tables are merged
    /// per method name.
    pub fn merge(&mut self, other: WardenConfig) {
        if let Some(over) = other.cache {
            match self.cache.as_mut() {
                Some(base) => base.merge(over),
                None => self.cache = Some(over),
            }
        }

        for (name, section) in other.bean {
            match self.bean.get_mut(&name) {
                Some(existing) => existing.merge(section),
                None => {
                    self.bean.insert(name, section);
                }
            }
        }
    }

    /// Resolve the effective settings for a component.
    ///
    /// The component's `[bean.<name>]` section is layered over `[cache]`,
    /// which in turn is layered over the built-in defaults. Components
    /// without a section get the `[cache]` settings.
    pub fn bean(&self, name: &str) -> Result<ResolvedBeanConfig> {
        let mut layered = self.cache.clone().unwrap_or_default();
        let methods = match self.bean.get(name) {
            Some(section) => {
                layered.merge(section.cache.clone());
                section.method.clone()
            }
            None => HashMap::new(),
        };

        let context = format!("bean '{name}'");
        let sweep_interval_ms = layered
            .sweep_interval_ms
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_MS);
        if sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sweep_interval_ms".to_string(),
                context,
                reason: "must be greater than zero".to_string(),
            });
        }
        if layered.max_sessions == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "max_sessions".to_string(),
                context,
                reason: "must be greater than zero when set".to_string(),
            });
        }

        let idle_timeout = layered.idle_timeout.and_then(|value| {
            Timeout::new(value, layered.idle_timeout_unit.unwrap_or_default()).to_duration()
        });
        let passivation_timeout = layered.passivation_timeout.and_then(|value| {
            Timeout::new(value, layered.passivation_timeout_unit.unwrap_or_default())
                .to_duration()
        });
        let access_timeout = match layered.access_timeout {
            Some(value) => {
                Timeout::new(value, layered.access_timeout_unit.unwrap_or_default())
                    .to_access_timeout()
            }
            None => AccessTimeout::Bounded(Duration::from_millis(DEFAULT_ACCESS_TIMEOUT_MS)),
        };

        let methods = methods
            .into_iter()
            .map(|(method, config)| {
                let resolved = ResolvedMethodConfig {
                    access_timeout: config.access_timeout.map(|value| {
                        Timeout::new(value, config.access_timeout_unit.unwrap_or_default())
                            .to_access_timeout()
                    }),
                    remove: config.remove,
                    retain_if_exception: config.retain_if_exception,
                };
                (method, resolved)
            })
            .collect();

        Ok(ResolvedBeanConfig {
            name: name.to_string(),
            idle_timeout,
            passivation_timeout,
            sweep_interval: Duration::from_millis(sweep_interval_ms),
            max_sessions: layered.max_sessions,
            eviction: layered.eviction.unwrap_or_default(),
            access_timeout,
            methods,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// Cache settings, used both for `[cache]` and inline in `[bean.<name>]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Idle timeout value. Negative disables expiration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<i64>,

    /// Unit of `idle_timeout` (default: milliseconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_unit: Option<TimeUnit>,

    /// How long a passivated image is kept before the sweep drops it.
    /// Unset or negative uses the idle timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passivation_timeout: Option<i64>,

    /// Unit of `passivation_timeout` (default: milliseconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passivation_timeout_unit: Option<TimeUnit>,

    /// Interval between expiration sweeps in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_interval_ms: Option<u64>,

    /// Maximum number of in-memory sessions before idle ones are evicted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<usize>,

    /// What happens to an evicted session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eviction: Option<EvictionAction>,

    /// Default lock acquisition timeout. Negative waits indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_timeout: Option<i64>,

    /// Unit of `access_timeout` (default: milliseconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_timeout_unit: Option<TimeUnit>,
}

impl CacheSection {
    fn merge(&mut self, other: CacheSection) {
        if other.idle_timeout.is_some() {
            self.idle_timeout = other.idle_timeout;
            // A bare value without a unit must not inherit a foreign unit.
            self.idle_timeout_unit = other.idle_timeout_unit;
        } else if other.idle_timeout_unit.is_some() {
            self.idle_timeout_unit = other.idle_timeout_unit;
        }
        if other.passivation_timeout.is_some() {
            self.passivation_timeout = other.passivation_timeout;
            self.passivation_timeout_unit = other.passivation_timeout_unit;
        } else if other.passivation_timeout_unit.is_some() {
            self.passivation_timeout_unit = other.passivation_timeout_unit;
        }
        if other.sweep_interval_ms.is_some() {
            self.sweep_interval_ms = other.sweep_interval_ms;
        }
        if other.max_sessions.is_some() {
            self.max_sessions = other.max_sessions;
        }
        if other.eviction.is_some() {
            self.eviction = other.eviction;
        }
        if other.access_timeout.is_some() {
            self.access_timeout = other.access_timeout;
            self.access_timeout_unit = other.access_timeout_unit;
        } else if other.access_timeout_unit.is_some() {
            self.access_timeout_unit = other.access_timeout_unit;
        }
    }
}

/// A `[bean.<name>]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeanSection {
    /// Cache overrides for this component.
    #[serde(flatten)]
    pub cache: CacheSection,

    /// Per-method settings (`[bean.<name>.method.<method>]`).
    pub method: HashMap<String, MethodConfig>,
}

impl BeanSection {
    fn merge(&mut self, other: BeanSection) {
        self.cache.merge(other.cache);
        for (name, config) in other.method {
            self.method.insert(name, config);
        }
    }
}

/// Settings for a single business method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodConfig {
    /// Lock acquisition timeout for this method. Negative waits indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_timeout: Option<i64>,

    /// Unit of `access_timeout` (default: milliseconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_timeout_unit: Option<TimeUnit>,

    /// Whether completing this method ends the session.
    pub remove: bool,

    /// Keep the session alive if a remove method fails with an application error.
    pub retain_if_exception: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Value types
// ─────────────────────────────────────────────────────────────────────────────

/// Unit for timeout values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    #[default]
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Convert a non-negative amount of this unit to a [`Duration`].
    pub fn duration(self, value: u64) -> Duration {
        match self {
            TimeUnit::Nanoseconds => Duration::from_nanos(value),
            TimeUnit::Microseconds => Duration::from_micros(value),
            TimeUnit::Milliseconds => Duration::from_millis(value),
            TimeUnit::Seconds => Duration::from_secs(value),
            TimeUnit::Minutes => Duration::from_secs(value.saturating_mul(60)),
            TimeUnit::Hours => Duration::from_secs(value.saturating_mul(3600)),
            TimeUnit::Days => Duration::from_secs(value.saturating_mul(86_400)),
        }
    }
}

/// A signed timeout value with its unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    pub value: i64,
    pub unit: TimeUnit,
}

impl Timeout {
    pub fn new(value: i64, unit: TimeUnit) -> Self {
        Self { value, unit }
    }

    /// The timeout as a duration, or `None` when the value is negative.
    pub fn to_duration(self) -> Option<Duration> {
        u64::try_from(self.value)
            .ok()
            .map(|value| self.unit.duration(value))
    }

    /// Interpret the timeout as a lock wait (negative means wait indefinitely).
    pub fn to_access_timeout(self) -> AccessTimeout {
        match self.to_duration() {
            Some(duration) => AccessTimeout::Bounded(duration),
            None => AccessTimeout::Indefinite,
        }
    }
}

/// Maximum wait for a session lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessTimeout {
    /// Give up after the duration elapses.
    Bounded(Duration),
    /// Wait until the lock is granted.
    Indefinite,
}

impl Default for AccessTimeout {
    fn default() -> Self {
        AccessTimeout::Bounded(Duration::from_millis(DEFAULT_ACCESS_TIMEOUT_MS))
    }
}

/// What the cache does with a session it evicts (idle expiry or size bound).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionAction {
    /// Destroy the instance through its factory.
    #[default]
    Destroy,
    /// Hand the instance to the passivation store.
    Passivate,
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolved settings
// ─────────────────────────────────────────────────────────────────────────────

/// Effective settings for one component, with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBeanConfig {
    /// Component name.
    pub name: String,
    /// Idle timeout; `None` disables expiry of in-memory sessions.
    pub idle_timeout: Option<Duration>,
    /// Expiry of passivated images; `None` falls back to the idle timeout.
    pub passivation_timeout: Option<Duration>,
    /// Interval between expiration sweeps.
    pub sweep_interval: Duration,
    /// Size bound for in-memory sessions.
    pub max_sessions: Option<usize>,
    /// Eviction action.
    pub eviction: EvictionAction,
    /// Default lock wait for methods without their own setting.
    pub access_timeout: AccessTimeout,
    /// Per-method settings.
    pub methods: HashMap<String, ResolvedMethodConfig>,
}

/// Effective settings for one business method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedMethodConfig {
    /// Lock wait override; `None` uses the component default.
    pub access_timeout: Option<AccessTimeout>,
    pub remove: bool,
    pub retain_if_exception: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[cache]
idle_timeout = 30
idle_timeout_unit = "minutes"
access_timeout = 5000

[bean.cart]
idle_timeout = 10
idle_timeout_unit = "seconds"
eviction = "passivate"
max_sessions = 100

[bean.cart.method.checkout]
access_timeout = 2
access_timeout_unit = "seconds"
remove = true
retain_if_exception = true

[bean.cart.method.browse]
access_timeout = -1
"#;

    #[test]
    fn test_parse_sample() {
        let config = WardenConfig::from_toml(SAMPLE).unwrap();
        let cache = config.cache.as_ref().unwrap();
        assert_eq!(cache.idle_timeout, Some(30));
        assert_eq!(cache.idle_timeout_unit, Some(TimeUnit::Minutes));

        let cart = &config.bean["cart"];
        assert_eq!(cart.cache.eviction, Some(EvictionAction::Passivate));
        assert!(cart.method["checkout"].remove);
    }

    #[test]
    fn test_resolve_bean_overrides_cache() {
        let config = WardenConfig::from_toml(SAMPLE).unwrap();
        let cart = config.bean("cart").unwrap();

        assert_eq!(cart.idle_timeout, Some(Duration::from_secs(10)));
        assert_eq!(cart.eviction, EvictionAction::Passivate);
        assert_eq!(cart.max_sessions, Some(100));
        assert_eq!(
            cart.access_timeout,
            AccessTimeout::Bounded(Duration::from_millis(5000))
        );
        assert_eq!(
            cart.sweep_interval,
            Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS)
        );

        let checkout = cart.methods["checkout"];
        assert_eq!(
            checkout.access_timeout,
            Some(AccessTimeout::Bounded(Duration::from_secs(2)))
        );
        assert!(checkout.remove);
        assert!(checkout.retain_if_exception);

        assert_eq!(
            cart.methods["browse"].access_timeout,
            Some(AccessTimeout::Indefinite)
        );
    }

    #[test]
    fn test_resolve_unknown_bean_uses_cache_section() {
        let config = WardenConfig::from_toml(SAMPLE).unwrap();
        let other = config.bean("ledger").unwrap();
        assert_eq!(other.idle_timeout, Some(Duration::from_secs(30 * 60)));
        assert_eq!(other.eviction, EvictionAction::Destroy);
        assert!(other.methods.is_empty());
    }

    #[test]
    fn test_negative_idle_timeout_disables_expiry() {
        let config = WardenConfig::from_toml("[cache]\nidle_timeout = -1\n").unwrap();
        assert_eq!(config.bean("any").unwrap().idle_timeout, None);
    }

    #[test]
    fn test_passivation_timeout_resolves_with_unit() {
        let config = WardenConfig::from_toml(
            r#"
[cache]
idle_timeout = 10

[bean.cart]
passivation_timeout = 2
passivation_timeout_unit = "hours"
"#,
        )
        .unwrap();
        assert_eq!(
            config.bean("cart").unwrap().passivation_timeout,
            Some(Duration::from_secs(2 * 3600))
        );
        assert_eq!(config.bean("ledger").unwrap().passivation_timeout, None);
    }

    #[test]
    fn test_defaults_without_sections() {
        let resolved = WardenConfig::new().bean("empty").unwrap();
        assert_eq!(resolved.idle_timeout, None);
        assert_eq!(resolved.max_sessions, None);
        assert_eq!(resolved.access_timeout, AccessTimeout::default());
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let config = WardenConfig::from_toml("[cache]\nsweep_interval_ms = 0\n").unwrap();
        let err = config.bean("any").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref field, .. } if field == "sweep_interval_ms"
        ));
    }

    #[test]
    fn test_merge_overlays_fields() {
        let mut base = WardenConfig::from_toml(SAMPLE).unwrap();
        let overlay = WardenConfig::from_toml(
            r#"
[cache]
max_sessions = 5

[bean.cart.method.checkout]
remove = false
"#,
        )
        .unwrap();
        base.merge(overlay);

        let cache = base.cache.as_ref().unwrap();
        assert_eq!(cache.max_sessions, Some(5));
        assert_eq!(cache.idle_timeout, Some(30));
        assert!(!base.bean["cart"].method["checkout"].remove);
        assert!(base.bean["cart"].method.contains_key("browse"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = WardenConfig::from_toml(SAMPLE).unwrap();
        let text = config.to_toml().unwrap();
        assert_eq!(WardenConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_time_unit_conversion() {
        assert_eq!(TimeUnit::Minutes.duration(2), Duration::from_secs(120));
        assert_eq!(Timeout::new(-5, TimeUnit::Seconds).to_duration(), None);
        assert_eq!(
            Timeout::new(0, TimeUnit::Seconds).to_access_timeout(),
            AccessTimeout::Bounded(Duration::ZERO)
        );
    }
}
