//! Lifecycle callbacks for stateful session instances.
//!
//! A [`LifecycleChain`] fires a fixed set of events at well-defined points:
//! construction, destruction, transaction boundaries, remove-method completion
//! and passivation. Registered [`LifecycleInterceptor`]s run first, in
//! registration order, followed by the bean's own [`StatefulBean`] callback.
//! The event being fired travels explicitly in a [`CallbackContext`].

use std::fmt;
use std::sync::Arc;

use crate::error::{BoxError, Error, Result};
use crate::id::SessionId;

/// Points at which lifecycle callbacks fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// After the factory created the instance, before it is usable.
    PostConstruct,
    /// Before the factory destroys the instance.
    PreDestroy,
    /// The session joined a transaction.
    AfterBegin,
    /// The session's transaction is about to complete.
    BeforeCompletion,
    /// The session's transaction completed.
    AfterCompletion { committed: bool },
    /// A session-terminating business method finished.
    RemoveCompleted,
    /// The instance is about to be handed to the passivation store.
    PrePassivate,
    /// The instance was restored from the passivation store.
    PostActivate,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::PostConstruct => write!(f, "post-construct"),
            LifecycleEvent::PreDestroy => write!(f, "pre-destroy"),
            LifecycleEvent::AfterBegin => write!(f, "after-begin"),
            LifecycleEvent::BeforeCompletion => write!(f, "before-completion"),
            LifecycleEvent::AfterCompletion { .. } => write!(f, "after-completion"),
            LifecycleEvent::RemoveCompleted => write!(f, "remove"),
            LifecycleEvent::PrePassivate => write!(f, "pre-passivate"),
            LifecycleEvent::PostActivate => write!(f, "post-activate"),
        }
    }
}

/// Describes the callback currently executing.
#[derive(Debug, Clone, Copy)]
pub struct CallbackContext<'a> {
    pub session_id: &'a SessionId,
    pub event: LifecycleEvent,
}

/// A stateful bean: the user-defined state held by a session.
///
/// Every callback defaults to a no-op.
pub trait StatefulBean: Send + 'static {
    fn post_construct(&mut self) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    fn pre_destroy(&mut self) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    fn after_begin(&mut self) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    fn before_completion(&mut self) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    fn after_completion(&mut self, _committed: bool) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    fn pre_passivate(&mut self) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    fn post_activate(&mut self) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

/// Extension point invoked around the bean's own callbacks.
pub trait LifecycleInterceptor<B>: Send + Sync {
    fn intercept(
        &self,
        bean: &mut B,
        ctx: &CallbackContext<'_>,
    ) -> std::result::Result<(), BoxError>;
}

/// Adapts a closure into a [`LifecycleInterceptor`].
pub struct FnInterceptor<F>(F);

impl<B, F> LifecycleInterceptor<B> for FnInterceptor<F>
where
    F: Fn(&mut B, &CallbackContext<'_>) -> std::result::Result<(), BoxError> + Send + Sync,
{
    fn intercept(
        &self,
        bean: &mut B,
        ctx: &CallbackContext<'_>,
    ) -> std::result::Result<(), BoxError> {
        (self.0)(bean, ctx)
    }
}

/// Ordered set of lifecycle interceptors for one component.
pub struct LifecycleChain<B> {
    interceptors: Vec<Arc<dyn LifecycleInterceptor<B>>>,
}

impl<B: StatefulBean> LifecycleChain<B> {
    /// Create an empty chain (only the bean's own callbacks fire).
    pub fn new() -> Self {
        Self {
            interceptors: Vec::new(),
        }
    }

    /// Append an interceptor.
    pub fn with(mut self, interceptor: impl LifecycleInterceptor<B> + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Append a closure interceptor.
    pub fn with_fn<F>(self, f: F) -> Self
    where
        F: Fn(&mut B, &CallbackContext<'_>) -> std::result::Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.with(FnInterceptor(f))
    }

    /// Number of registered interceptors.
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Whether no interceptors are registered.
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Fire `event` for `bean`, stopping at the first failure.
    pub fn fire(&self, bean: &mut B, session_id: &SessionId, event: LifecycleEvent) -> Result<()> {
        let ctx = CallbackContext { session_id, event };
        let wrap = |source: BoxError| Error::Lifecycle {
            session_id: *session_id,
            event,
            source,
        };

        for interceptor in &self.interceptors {
            interceptor.intercept(bean, &ctx).map_err(wrap)?;
        }

        let own = match event {
            LifecycleEvent::PostConstruct => bean.post_construct(),
            LifecycleEvent::PreDestroy => bean.pre_destroy(),
            LifecycleEvent::AfterBegin => bean.after_begin(),
            LifecycleEvent::BeforeCompletion => bean.before_completion(),
            LifecycleEvent::AfterCompletion { committed } => bean.after_completion(committed),
            LifecycleEvent::PrePassivate => bean.pre_passivate(),
            LifecycleEvent::PostActivate => bean.post_activate(),
            LifecycleEvent::RemoveCompleted => Ok(()),
        };
        own.map_err(wrap)
    }
}

impl<B: StatefulBean> Default for LifecycleChain<B> {
    fn default() -> Self {
        Self::new()
    }
}
