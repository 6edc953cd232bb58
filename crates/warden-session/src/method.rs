//! Per-method invocation settings.

use warden_config::{AccessTimeout, ResolvedMethodConfig};

/// Marks a business method as session-terminating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoveMethod {
    /// Keep the session when the method fails with an application error.
    pub retain_if_exception: bool,
}

/// How a single business method is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    name: String,
    access_timeout: Option<AccessTimeout>,
    remove: Option<RemoveMethod>,
}

impl MethodDescriptor {
    /// A plain business method using the component's default access timeout.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            access_timeout: None,
            remove: None,
        }
    }

    /// Build from resolved configuration.
    pub fn from_config(name: impl Into<String>, config: &ResolvedMethodConfig) -> Self {
        Self {
            name: name.into(),
            access_timeout: config.access_timeout,
            remove: config.remove.then_some(RemoveMethod {
                retain_if_exception: config.retain_if_exception,
            }),
        }
    }

    /// Override the lock wait for this method.
    pub fn with_access_timeout(mut self, timeout: AccessTimeout) -> Self {
        self.access_timeout = Some(timeout);
        self
    }

    /// Mark the method as session-terminating.
    pub fn removing(mut self, retain_if_exception: bool) -> Self {
        self.remove = Some(RemoveMethod {
            retain_if_exception,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock wait for this method, falling back to `default`.
    pub fn access_timeout(&self, default: AccessTimeout) -> AccessTimeout {
        self.access_timeout.unwrap_or(default)
    }

    pub fn remove(&self) -> Option<RemoveMethod> {
        self.remove
    }

    pub fn is_remove(&self) -> bool {
        self.remove.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_from_config() {
        let config = ResolvedMethodConfig {
            access_timeout: Some(AccessTimeout::Bounded(Duration::from_secs(2))),
            remove: true,
            retain_if_exception: true,
        };
        let method = MethodDescriptor::from_config("checkout", &config);

        assert_eq!(method.name(), "checkout");
        assert_eq!(
            method.access_timeout(AccessTimeout::Indefinite),
            AccessTimeout::Bounded(Duration::from_secs(2))
        );
        assert_eq!(
            method.remove(),
            Some(RemoveMethod {
                retain_if_exception: true
            })
        );
    }

    #[test]
    fn test_plain_method_uses_component_default() {
        let method = MethodDescriptor::new("add_item");
        assert!(!method.is_remove());
        assert_eq!(
            method.access_timeout(AccessTimeout::Indefinite),
            AccessTimeout::Indefinite
        );
    }

    #[test]
    fn test_retain_flag_ignored_without_remove() {
        let config = ResolvedMethodConfig {
            access_timeout: None,
            remove: false,
            retain_if_exception: true,
        };
        assert_eq!(MethodDescriptor::from_config("peek", &config).remove(), None);
    }
}
