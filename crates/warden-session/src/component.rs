//! Stateful component: the entry point for session invocations.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};
use warden_config::ResolvedBeanConfig;

use crate::cache::SessionCache;
use crate::config::CacheConfig;
use crate::error::{BeanError, Error, Result};
use crate::factory::InstanceFactory;
use crate::handle::SessionProxy;
use crate::id::SessionId;
use crate::instance::Identifiable;
use crate::lifecycle::StatefulBean;
use crate::method::MethodDescriptor;
use crate::synchronization::{Invocation, InvocationContext};

/// A stateful component: one session cache plus its business-method settings.
///
/// The locator names the component for [`SessionHandle`](crate::SessionHandle)
/// resolution.
pub struct StatefulComponent<B: StatefulBean> {
    locator: String,
    cache: Arc<SessionCache<B>>,
    methods: HashMap<String, MethodDescriptor>,
}

impl<B: StatefulBean> StatefulComponent<B> {
    pub fn new(locator: impl Into<String>, cache: SessionCache<B>) -> Self {
        Self {
            locator: locator.into(),
            cache: Arc::new(cache),
            methods: HashMap::new(),
        }
    }

    /// Build a component from resolved configuration, named after the bean.
    pub fn from_config(
        config: &ResolvedBeanConfig,
        factory: impl InstanceFactory<B> + 'static,
    ) -> Self {
        let cache = SessionCache::new(factory, CacheConfig::from_resolved(config));
        Self::new(config.name.clone(), cache).with_methods_from(config)
    }

    /// Build a component named `name` from the layered config files.
    ///
    /// Reads `config.toml` from `config_dir` (default: the user config
    /// directory), then `warden.toml` from `project_dir` (default: the current
    /// directory). Malformed layers are skipped with a warning.
    pub fn load(
        name: &str,
        project_dir: Option<&Path>,
        config_dir: Option<&Path>,
        factory: impl InstanceFactory<B> + 'static,
    ) -> Result<Self> {
        let loaded = warden_config::load_config(project_dir, config_dir)?;
        for warning in &loaded.warnings {
            warn!(bean = name, "{warning}");
        }
        debug!(bean = name, sources = ?loaded.loaded_from(), "Component configuration loaded");
        let resolved = loaded.config.bean(name)?;
        Ok(Self::from_config(&resolved, factory))
    }

    /// Register a business method's settings.
    pub fn with_method(mut self, method: MethodDescriptor) -> Self {
        self.methods.insert(method.name().to_string(), method);
        self
    }

    /// Register every method configured for the bean.
    pub fn with_methods_from(mut self, config: &ResolvedBeanConfig) -> Self {
        for (name, method) in &config.methods {
            self.methods
                .insert(name.clone(), MethodDescriptor::from_config(name, method));
        }
        self
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn cache(&self) -> &Arc<SessionCache<B>> {
        &self.cache
    }

    /// Settings for `name`; unconfigured methods use the component defaults.
    pub fn method(&self, name: &str) -> MethodDescriptor {
        self.methods
            .get(name)
            .cloned()
            .unwrap_or_else(|| MethodDescriptor::new(name))
    }

    /// Start the expiration sweep.
    pub fn start(&self) {
        self.cache.start();
    }

    /// Stop the sweep and drop all sessions.
    pub fn stop(&self) {
        self.cache.stop();
    }

    /// Create a session and return its identifier.
    pub fn create_session(&self) -> Result<SessionId> {
        let instance = self.cache.create()?;
        self.cache.release(&instance);
        Ok(*instance.session_id())
    }

    /// Create a session and return a proxy bound to it.
    pub fn create_proxy(self: &Arc<Self>) -> Result<SessionProxy<B>> {
        let id = self.create_session()?;
        Ok(self.proxy(id))
    }

    /// A proxy for `session_id`. The session is resolved on first use.
    pub fn proxy(self: &Arc<Self>, session_id: SessionId) -> SessionProxy<B> {
        SessionProxy::new(Arc::clone(self), session_id)
    }

    /// Invoke the business method `method` on a session.
    ///
    /// `f` runs with exclusive access to the bean. A [`BeanError::System`] or
    /// a panic discards the session; a panic is resumed after the discard.
    pub async fn invoke<R, F>(
        &self,
        session_id: &SessionId,
        method: &str,
        ctx: &InvocationContext,
        f: F,
    ) -> Result<R>
    where
        F: FnOnce(&mut B) -> std::result::Result<R, BeanError>,
    {
        let method = self.method(method);
        self.invoke_method(session_id, &method, ctx, f).await
    }

    /// Invoke with explicit method settings.
    pub async fn invoke_method<R, F>(
        &self,
        session_id: &SessionId,
        method: &MethodDescriptor,
        ctx: &InvocationContext,
        f: F,
    ) -> Result<R>
    where
        F: FnOnce(&mut B) -> std::result::Result<R, BeanError>,
    {
        let timeout = method.access_timeout(self.cache.config().access_timeout);
        let invocation = Invocation::begin(&self.cache, session_id, ctx, timeout).await?;

        let outcome = invocation
            .instance()
            .with_bean(|bean| panic::catch_unwind(AssertUnwindSafe(|| f(bean))));
        let outcome = match outcome {
            Some(Ok(outcome)) => outcome,
            Some(Err(payload)) => {
                invocation.discard(&"business method panicked");
                drop(invocation);
                panic::resume_unwind(payload);
            }
            None => return Err(Error::NotFound(*session_id)),
        };

        match outcome {
            Ok(value) => {
                if method.is_remove() {
                    invocation.remove()?;
                }
                Ok(value)
            }
            Err(BeanError::System(source)) => {
                invocation.discard(&source);
                Err(Error::System {
                    session_id: *session_id,
                    source,
                })
            }
            Err(BeanError::Application(source)) => {
                if let Some(remove) = method.remove() {
                    if remove.retain_if_exception {
                        debug!(
                            session_id = %session_id,
                            method = method.name(),
                            "Session retained after application error"
                        );
                    } else if let Err(err) = invocation.remove() {
                        warn!(
                            session_id = %session_id,
                            error = %err,
                            "Failed to remove session after application error"
                        );
                    }
                }
                Err(Error::Application(source))
            }
        }
    }

    /// Remove a session on behalf of a client.
    ///
    /// Waits for the session lock like an invocation would. A session bound
    /// to a transaction cannot be removed, not even from within that
    /// transaction. Removing an unknown session is reported as
    /// [`Error::NotFound`].
    pub async fn remove_session(
        &self,
        session_id: &SessionId,
        ctx: &InvocationContext,
    ) -> Result<()> {
        let timeout = self.cache.config().access_timeout;
        // A non-transactional checkout never enlists, and is rejected by any binding.
        let none = InvocationContext::none();
        let invocation = Invocation::begin(&self.cache, session_id, &none, timeout)
            .await
            .map_err(|err| match err {
                Error::TransactionConflict {
                    session_id, bound, ..
                } => Error::TransactionConflict {
                    session_id,
                    bound,
                    caller: ctx.transaction_key(),
                },
                other => other,
            })?;

        debug!(session_id = %invocation.session_id(), "Removing session on request");
        self.cache.remove(session_id)
    }
}

impl<B: StatefulBean> std::fmt::Debug for StatefulComponent<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatefulComponent")
            .field("locator", &self.locator)
            .field("sessions", &self.cache.len())
            .field("methods", &self.methods.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::DefaultFactory;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct Basket;

    impl StatefulBean for Basket {}

    #[test]
    fn test_load_layers_project_over_user_config() {
        let user = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        fs::write(
            user.path().join("config.toml"),
            "[cache]\nmax_sessions = 10\nidle_timeout = 5\n",
        )
        .unwrap();
        fs::write(
            project.path().join("warden.toml"),
            "[bean.basket]\nmax_sessions = 3\n\n[bean.basket.method.checkout]\nremove = true\n",
        )
        .unwrap();

        let component = StatefulComponent::load(
            "basket",
            Some(project.path()),
            Some(user.path()),
            DefaultFactory::<Basket>::new(),
        )
        .unwrap();

        assert_eq!(component.locator(), "basket");
        let config = component.cache().config();
        assert_eq!(config.max_sessions, Some(3));
        assert_eq!(config.idle_timeout, Some(std::time::Duration::from_millis(5)));
        assert!(component.method("checkout").is_remove());
        assert!(!component.method("browse").is_remove());
    }

    #[test]
    fn test_load_rejects_invalid_settings() {
        let user = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        fs::write(project.path().join("warden.toml"), "[cache]\nmax_sessions = 0\n").unwrap();

        let result = StatefulComponent::load(
            "basket",
            Some(project.path()),
            Some(user.path()),
            DefaultFactory::<Basket>::new(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
