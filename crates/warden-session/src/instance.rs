//! Live session instances.
//!
//! A [`SessionInstance`] owns one bean, its [`SessionLock`] and its transaction
//! binding. The lock lives with the instance, not with the cache entry, so it
//! survives any number of get/release cycles for the same identifier.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::id::SessionId;
use crate::lock::SessionLock;
use crate::transaction::TransactionKey;

/// Something with a session identity.
pub trait Identifiable {
    fn session_id(&self) -> &SessionId;
}

/// Liveness of a session instance.
pub trait Lifecycle {
    /// Whether the instance may still serve invocations.
    fn is_live(&self) -> bool;

    /// Mark the instance as never to be reused. Returns `true` on the first call.
    fn mark_discarded(&self) -> bool;

    fn is_discarded(&self) -> bool;
}

/// Association of an instance with at most one transaction.
pub trait TransactionAware {
    /// The transaction this instance is bound to, if any.
    fn bound_transaction(&self) -> Option<TransactionKey>;

    /// Bind to `key`. Returns `true` if this call created the binding and
    /// `false` if the instance was already bound to `key`. Fails with the
    /// current binding if bound elsewhere.
    fn bind_transaction(&self, key: TransactionKey) -> Result<bool, TransactionKey>;

    /// Clear the binding if it is `key`. Returns whether it was cleared.
    fn unbind_transaction(&self, key: TransactionKey) -> bool;

    /// Mark the instance for removal when transaction `key` completes.
    /// Returns `false` if the instance is not bound to `key`.
    fn remove_on_completion(&self, key: TransactionKey) -> bool;

    /// Whether removal is pending on completion of the current binding.
    fn is_removal_pending(&self) -> bool;
}

/// The transaction an instance is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    key: TransactionKey,
    remove_on_completion: bool,
}

/// A stateful bean together with its identity, lock and transaction binding.
pub struct SessionInstance<B> {
    id: SessionId,
    created_at: DateTime<Utc>,
    lock: SessionLock,
    binding: Mutex<Option<Binding>>,
    discarded: AtomicBool,
    bean: Mutex<Option<B>>,
}

impl<B> SessionInstance<B> {
    pub(crate) fn new(id: SessionId, bean: B) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            lock: SessionLock::new(),
            binding: Mutex::new(None),
            discarded: AtomicBool::new(false),
            bean: Mutex::new(Some(bean)),
        }
    }

    /// Wall-clock creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The per-session lock.
    pub fn lock(&self) -> &SessionLock {
        &self.lock
    }

    /// Run `f` against the bean. Returns `None` once the bean has been taken
    /// for destruction or passivation.
    pub(crate) fn with_bean<R>(&self, f: impl FnOnce(&mut B) -> R) -> Option<R> {
        let mut guard = self.bean.lock();
        guard.as_mut().map(f)
    }

    /// Take the bean out of the instance, leaving it permanently empty.
    pub(crate) fn take_bean(&self) -> Option<B> {
        self.bean.lock().take()
    }
}

impl<B> Identifiable for SessionInstance<B> {
    fn session_id(&self) -> &SessionId {
        &self.id
    }
}

impl<B> Lifecycle for SessionInstance<B> {
    fn is_live(&self) -> bool {
        !self.is_discarded() && self.bean.lock().is_some()
    }

    fn mark_discarded(&self) -> bool {
        !self.discarded.swap(true, Ordering::AcqRel)
    }

    fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }
}

impl<B> TransactionAware for SessionInstance<B> {
    fn bound_transaction(&self) -> Option<TransactionKey> {
        self.binding.lock().map(|b| b.key)
    }

    fn bind_transaction(&self, key: TransactionKey) -> Result<bool, TransactionKey> {
        let mut binding = self.binding.lock();
        match *binding {
            Some(current) if current.key != key => Err(current.key),
            Some(_) => Ok(false),
            None => {
                *binding = Some(Binding {
                    key,
                    remove_on_completion: false,
                });
                Ok(true)
            }
        }
    }

    fn unbind_transaction(&self, key: TransactionKey) -> bool {
        let mut binding = self.binding.lock();
        if binding.is_some_and(|b| b.key == key) {
            *binding = None;
            true
        } else {
            false
        }
    }

    fn remove_on_completion(&self, key: TransactionKey) -> bool {
        match self.binding.lock().as_mut() {
            Some(binding) if binding.key == key => {
                binding.remove_on_completion = true;
                true
            }
            _ => false,
        }
    }

    fn is_removal_pending(&self) -> bool {
        self.binding.lock().is_some_and(|b| b.remove_on_completion)
    }
}

impl<B> fmt::Debug for SessionInstance<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInstance")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("binding", &self.bound_transaction())
            .field("discarded", &self.is_discarded())
            .field("lock", &self.lock)
            .finish()
    }
}
