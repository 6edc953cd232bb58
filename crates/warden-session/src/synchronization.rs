//! Transaction association for session invocations.
//!
//! Each invocation checks out its session from the cache, takes the session
//! lock and, when the caller runs inside a transaction, binds the session to
//! that transaction. The first invocation under a transaction hands its lock
//! hold and cache usage to a [`SessionSynchronization`] registered with the
//! transaction, so the session stays exclusively owned until completion.
//!
//! Every exit path clears the binding before releasing the lock.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, trace};
use warden_config::AccessTimeout;

use crate::cache::SessionCache;
use crate::error::{Error, Result};
use crate::id::SessionId;
use crate::instance::{Identifiable, Lifecycle, SessionInstance, TransactionAware};
use crate::lifecycle::{LifecycleEvent, StatefulBean};
use crate::lock::{InvocationId, LockOwner};
use crate::transaction::{Synchronization, Transaction, TransactionKey, TransactionStatus};

/// Caller context accompanying an invocation.
#[derive(Clone, Default)]
pub struct InvocationContext {
    transaction: Option<Arc<dyn Transaction>>,
}

impl InvocationContext {
    /// A non-transactional caller.
    pub fn none() -> Self {
        Self::default()
    }

    /// A caller running inside `transaction`.
    pub fn with_transaction(transaction: Arc<dyn Transaction>) -> Self {
        Self {
            transaction: Some(transaction),
        }
    }

    /// The caller's transaction, if it still accepts work.
    pub fn active_transaction(&self) -> Option<&Arc<dyn Transaction>> {
        self.transaction.as_ref().filter(|tx| tx.is_active())
    }

    /// Key of the caller's active transaction.
    pub fn transaction_key(&self) -> Option<TransactionKey> {
        self.active_transaction().map(|tx| tx.key())
    }
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("transaction", &self.transaction.as_ref().map(|tx| tx.key()))
            .finish()
    }
}

pub(crate) fn timeout_duration(timeout: AccessTimeout) -> Duration {
    match timeout {
        AccessTimeout::Bounded(limit) => limit,
        AccessTimeout::Indefinite => Duration::MAX,
    }
}

/// Reject a caller whose transaction differs from the session's binding.
pub(crate) fn check_binding<B>(
    instance: &SessionInstance<B>,
    caller: Option<TransactionKey>,
) -> Result<()> {
    match instance.bound_transaction() {
        Some(bound) if Some(bound) != caller => Err(Error::TransactionConflict {
            session_id: *instance.session_id(),
            bound,
            caller,
        }),
        _ => Ok(()),
    }
}

/// A session checked out for one invocation.
///
/// Dropping it returns whatever it still owns: the lock hold and the cache
/// usage, unless both were handed to the transaction binding.
pub(crate) struct Invocation<'a, B: StatefulBean> {
    cache: &'a Arc<SessionCache<B>>,
    instance: Arc<SessionInstance<B>>,
    owner: LockOwner,
    transaction: Option<Arc<dyn Transaction>>,
    acquired: bool,
    bound_here: bool,
}

impl<'a, B: StatefulBean> Invocation<'a, B> {
    /// Check out `session_id`, take its lock and enlist it in the caller's transaction.
    pub(crate) async fn begin(
        cache: &'a Arc<SessionCache<B>>,
        session_id: &SessionId,
        ctx: &InvocationContext,
        timeout: AccessTimeout,
    ) -> Result<Self> {
        let transaction = ctx.active_transaction().cloned();
        let caller = transaction.as_ref().map(|tx| tx.key());
        let owner = match caller {
            Some(key) => LockOwner::Transaction(key),
            None => LockOwner::Invocation(InvocationId::next()),
        };

        let mut invocation = Self {
            cache,
            instance: cache.get(session_id)?,
            owner,
            transaction,
            acquired: false,
            bound_here: false,
        };

        // Fail fast instead of queueing behind a foreign transaction.
        check_binding(&invocation.instance, caller)?;

        if invocation.instance.lock().acquire(owner, timeout).await.is_err() {
            debug!(session_id = %session_id, %owner, "Session lock wait timed out");
            return Err(Error::ConcurrentAccessTimeout {
                session_id: *session_id,
                timeout: timeout_duration(timeout),
            });
        }
        invocation.acquired = true;
        trace!(session_id = %session_id, %owner, "Session lock acquired");

        if !invocation.instance.is_live() {
            return Err(Error::NotFound(*session_id));
        }
        check_binding(&invocation.instance, caller)?;
        invocation.enlist()?;
        Ok(invocation)
    }

    pub(crate) fn instance(&self) -> &Arc<SessionInstance<B>> {
        &self.instance
    }

    pub(crate) fn session_id(&self) -> &SessionId {
        self.instance.session_id()
    }

    /// Bind an unbound session to the caller's transaction.
    ///
    /// Only the call that creates the binding registers the completion
    /// callback; later calls from the same transaction keep their own hold.
    fn enlist(&mut self) -> Result<()> {
        let Some(transaction) = self.transaction.clone() else {
            return Ok(());
        };

        let key = transaction.key();
        match self.instance.bind_transaction(key) {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(bound) => {
                return Err(Error::TransactionConflict {
                    session_id: *self.session_id(),
                    bound,
                    caller: Some(key),
                });
            }
        }

        let sync = Arc::new(SessionSynchronization {
            cache: Arc::clone(self.cache),
            instance: Arc::clone(&self.instance),
            key,
            owner: self.owner,
        });
        if let Err(err) = transaction.register_synchronization(sync) {
            self.instance.unbind_transaction(key);
            return Err(err);
        }
        self.bound_here = true;
        debug!(session_id = %self.session_id(), tx = %key, "Session enlisted in transaction");

        if let Err(err) = fire(self.cache, &self.instance, LifecycleEvent::AfterBegin) {
            self.discard(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Drop the session from the cache for good.
    pub(crate) fn discard(&self, cause: &dyn std::fmt::Display) {
        error!(session_id = %self.session_id(), error = %cause, "Discarding session");
        self.cache.discard(self.session_id());
    }

    /// Remove the session after a session-terminating method.
    ///
    /// Outside a transaction the session is destroyed now. Inside one, it is
    /// destroyed by the completion callback while the lock is still held.
    pub(crate) fn remove(self) -> Result<()> {
        if let Some(transaction) = &self.transaction {
            let key = transaction.key();
            if self.instance.remove_on_completion(key) {
                debug!(
                    session_id = %self.session_id(),
                    tx = %key,
                    "Session removal deferred to completion"
                );
                return Ok(());
            }
            // The binding is already gone: the transaction completed under us.
            debug!(
                session_id = %self.session_id(),
                tx = %key,
                "Transaction already completed, removing now"
            );
        }

        if let Err(err) = fire(self.cache, &self.instance, LifecycleEvent::RemoveCompleted) {
            self.discard(&err);
            return Err(err);
        }
        self.cache.remove(self.session_id())
    }
}

impl<B: StatefulBean> Drop for Invocation<'_, B> {
    fn drop(&mut self) {
        if self.bound_here {
            return;
        }
        if self.instance.is_live() {
            self.cache.release(&self.instance);
        }
        if self.acquired {
            self.instance.lock().release(self.owner);
        }
    }
}

/// Fire a lifecycle event against the instance's bean.
fn fire<B: StatefulBean>(
    cache: &SessionCache<B>,
    instance: &SessionInstance<B>,
    event: LifecycleEvent,
) -> Result<()> {
    let id = instance.session_id();
    instance
        .with_bean(|bean| cache.lifecycle().fire(bean, id, event))
        .unwrap_or(Err(Error::NotFound(*id)))
}

/// Completion callback holding a session for the duration of a transaction.
pub struct SessionSynchronization<B: StatefulBean> {
    cache: Arc<SessionCache<B>>,
    instance: Arc<SessionInstance<B>>,
    key: TransactionKey,
    owner: LockOwner,
}

impl<B: StatefulBean> SessionSynchronization<B> {
    /// Whether this callback still owns the session.
    fn owns_binding(&self) -> bool {
        self.instance.bound_transaction() == Some(self.key)
    }

    fn unbind_and_unlock(&self) {
        self.instance.unbind_transaction(self.key);
        self.instance.lock().release(self.owner);
    }

    fn fail(&self, err: &Error) {
        error!(
            session_id = %self.instance.session_id(),
            tx = %self.key,
            error = %err,
            "Transaction callback failed, discarding session"
        );
        self.cache.discard(self.instance.session_id());
        self.unbind_and_unlock();
    }

    /// Destroy a session whose remove method ran inside the transaction.
    fn remove(&self) -> Result<()> {
        let id = self.instance.session_id();
        if let Err(err) = fire(&self.cache, &self.instance, LifecycleEvent::RemoveCompleted) {
            self.fail(&err);
            return Err(err);
        }

        let removed = match self.cache.remove(id) {
            Err(Error::NotFound(_)) => {
                debug!(session_id = %id, "Session already gone at deferred removal");
                Ok(())
            }
            other => other,
        };
        self.unbind_and_unlock();
        debug!(session_id = %id, tx = %self.key, "Session removed at completion");
        removed
    }
}

impl<B: StatefulBean> Synchronization for SessionSynchronization<B> {
    fn before_completion(&self) -> Result<()> {
        if !self.owns_binding() || !self.instance.is_live() {
            return Ok(());
        }
        fire(&self.cache, &self.instance, LifecycleEvent::BeforeCompletion)
            .inspect_err(|err| self.fail(err))
    }

    fn after_completion(&self, status: TransactionStatus) -> Result<()> {
        if !self.owns_binding() {
            return Ok(());
        }
        if !self.instance.is_live() {
            self.unbind_and_unlock();
            return Ok(());
        }

        let event = LifecycleEvent::AfterCompletion {
            committed: status.is_committed(),
        };
        if let Err(err) = fire(&self.cache, &self.instance, event) {
            self.fail(&err);
            return Err(err);
        }

        // Removal happens before the lock is handed to the next waiter.
        if self.instance.is_removal_pending() {
            return self.remove();
        }

        self.instance.unbind_transaction(self.key);
        self.cache.release(&self.instance);
        self.instance.lock().release(self.owner);
        debug!(
            session_id = %self.instance.session_id(),
            tx = %self.key,
            ?status,
            "Session released by transaction"
        );
        Ok(())
    }
}
