//! Per-session mutual exclusion.
//!
//! [`SessionLock`] is fair (FIFO hand-off) and reentrant by *owner* rather than
//! by thread: a transactional caller owns the lock through its transaction key,
//! so every call made under that transaction re-enters, while a
//! non-transactional call owns it through a one-off invocation token.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{trace, warn};
use warden_config::AccessTimeout;

use crate::transaction::TransactionKey;

/// Token identifying a single non-transactional invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvocationId(u64);

impl InvocationId {
    /// Allocate a fresh invocation token.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Who holds a [`SessionLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockOwner {
    Transaction(TransactionKey),
    Invocation(InvocationId),
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockOwner::Transaction(key) => write!(f, "tx:{key}"),
            LockOwner::Invocation(InvocationId(id)) => write!(f, "invocation:{id}"),
        }
    }
}

/// Lock acquisition did not complete within the access timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimeout;

struct Waiter {
    ticket: u64,
    owner: LockOwner,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockState {
    owner: Option<LockOwner>,
    holds: usize,
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
}

impl LockState {
    /// Hand the free lock to the oldest live waiter, plus any queued waiters
    /// sharing its owner.
    fn hand_off(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.grant.send(()).is_ok() {
                self.owner = Some(waiter.owner);
                self.holds = 1;
                break;
            }
        }

        let Some(owner) = self.owner else {
            return;
        };
        let mut index = 0;
        while index < self.waiters.len() {
            if self.waiters[index].owner == owner {
                if let Some(waiter) = self.waiters.remove(index)
                    && waiter.grant.send(()).is_ok()
                {
                    self.holds += 1;
                }
            } else {
                index += 1;
            }
        }
    }
}

/// Undoes a queued acquisition if the waiting future is dropped.
struct PendingGrant<'a> {
    lock: &'a SessionLock,
    ticket: u64,
    owner: LockOwner,
    armed: bool,
}

impl Drop for PendingGrant<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.lock.state.lock();
        if let Some(index) = state.waiters.iter().position(|w| w.ticket == self.ticket) {
            state.waiters.remove(index);
        } else if state.owner == Some(self.owner) {
            // Granted to a waiter that is no longer listening.
            state.holds -= 1;
            if state.holds == 0 {
                state.owner = None;
                state.hand_off();
            }
        }
    }
}

/// Fair, owner-reentrant lock guarding one session instance.
pub struct SessionLock {
    state: Mutex<LockState>,
}

impl SessionLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
        }
    }

    /// Acquire the lock for `owner`, waiting at most `timeout`.
    ///
    /// Re-entry by the current owner succeeds immediately. Other callers queue
    /// in arrival order.
    pub async fn acquire(
        &self,
        owner: LockOwner,
        timeout: AccessTimeout,
    ) -> Result<(), LockTimeout> {
        if self.try_acquire(owner) {
            return Ok(());
        }

        let (ticket, mut granted) = {
            let mut state = self.state.lock();
            // The lock may have been released since the fast path.
            if state.owner.is_none() && state.waiters.is_empty() {
                state.owner = Some(owner);
                state.holds = 1;
                return Ok(());
            }

            if timeout == AccessTimeout::Bounded(std::time::Duration::ZERO) {
                return Err(LockTimeout);
            }

            let (tx, rx) = oneshot::channel();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.waiters.push_back(Waiter {
                ticket,
                owner,
                grant: tx,
            });
            (ticket, rx)
        };
        trace!(%owner, ticket, "Waiting for session lock");
        let mut pending = PendingGrant {
            lock: self,
            ticket,
            owner,
            armed: true,
        };

        let result = match timeout {
            AccessTimeout::Indefinite => (&mut granted).await.map_err(|_| LockTimeout),
            AccessTimeout::Bounded(limit) => tokio::select! {
                result = &mut granted => result.map_err(|_| LockTimeout),
                _ = tokio::time::sleep(limit) => {
                    let mut state = self.state.lock();
                    match state.waiters.iter().position(|w| w.ticket == ticket) {
                        Some(index) => {
                            state.waiters.remove(index);
                            Err(LockTimeout)
                        }
                        // Granted while the timer fired; the receiver was still
                        // alive, so the hand-off went through.
                        None => Ok(()),
                    }
                }
            },
        };
        pending.armed = false;
        result
    }

    /// Acquire without waiting. Succeeds only if the lock is free with no
    /// queue, or already held by `owner`.
    pub fn try_acquire(&self, owner: LockOwner) -> bool {
        let mut state = self.state.lock();
        match state.owner {
            None if state.waiters.is_empty() => {
                state.owner = Some(owner);
                state.holds = 1;
                true
            }
            Some(current) if current == owner => {
                state.holds += 1;
                true
            }
            _ => false,
        }
    }

    /// Release one hold by `owner`. Returns `false` if `owner` does not hold the lock.
    pub fn release(&self, owner: LockOwner) -> bool {
        let mut state = self.state.lock();
        if state.owner != Some(owner) {
            warn!(%owner, holder = ?state.owner, "Session lock released by non-owner");
            return false;
        }

        state.holds -= 1;
        if state.holds == 0 {
            state.owner = None;
            state.hand_off();
        }
        true
    }

    /// Whether anyone currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Current holder, if any.
    pub fn owner(&self) -> Option<LockOwner> {
        self.state.lock().owner
    }

    /// Number of callers queued for the lock.
    pub fn queue_len(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

impl Default for SessionLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SessionLock")
            .field("owner", &state.owner)
            .field("holds", &state.holds)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn invocation() -> LockOwner {
        LockOwner::Invocation(InvocationId::next())
    }

    fn bounded(ms: u64) -> AccessTimeout {
        AccessTimeout::Bounded(Duration::from_millis(ms))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let lock = SessionLock::new();
        let owner = invocation();

        lock.acquire(owner, bounded(10)).await.unwrap();
        assert_eq!(lock.owner(), Some(owner));
        assert!(lock.release(owner));
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_reentrant_for_same_transaction() {
        let lock = SessionLock::new();
        let owner = LockOwner::Transaction(TransactionKey::new());

        lock.acquire(owner, bounded(10)).await.unwrap();
        lock.acquire(owner, bounded(10)).await.unwrap();
        assert!(lock.release(owner));
        assert!(lock.is_locked());
        assert!(lock.release(owner));
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_timeout_leaves_holder_untouched() {
        let lock = SessionLock::new();
        let holder = invocation();
        lock.acquire(holder, bounded(10)).await.unwrap();

        let result = lock.acquire(invocation(), bounded(30)).await;
        assert_eq!(result, Err(LockTimeout));
        assert_eq!(lock.owner(), Some(holder));
        assert_eq!(lock.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_zero_timeout_fails_fast() {
        let lock = SessionLock::new();
        lock.acquire(invocation(), bounded(10)).await.unwrap();
        assert_eq!(
            lock.acquire(invocation(), AccessTimeout::Bounded(Duration::ZERO))
                .await,
            Err(LockTimeout)
        );
    }

    #[tokio::test]
    async fn test_release_hands_off_in_fifo_order() {
        let lock = Arc::new(SessionLock::new());
        let holder = invocation();
        lock.acquire(holder, bounded(10)).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for n in 0..3 {
            let task_lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let owner = invocation();
                task_lock.acquire(owner, bounded(2_000)).await.unwrap();
                order.lock().push(n);
                task_lock.release(owner);
            }));
            // Let each waiter enqueue before the next one.
            while lock.queue_len() < n + 1 {
                tokio::task::yield_now().await;
            }
        }

        lock.release(holder);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_hand_off_grants_same_transaction_waiters_together() {
        let lock = Arc::new(SessionLock::new());
        let holder = invocation();
        lock.acquire(holder, bounded(10)).await.unwrap();

        let tx = LockOwner::Transaction(TransactionKey::new());
        let first = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.acquire(tx, bounded(2_000)).await })
        };
        while lock.queue_len() < 1 {
            tokio::task::yield_now().await;
        }
        let other = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.acquire(invocation(), bounded(2_000)).await })
        };
        while lock.queue_len() < 2 {
            tokio::task::yield_now().await;
        }
        let second = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.acquire(tx, bounded(2_000)).await })
        };
        while lock.queue_len() < 3 {
            tokio::task::yield_now().await;
        }

        lock.release(holder);
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(lock.owner(), Some(tx));
        assert_eq!(lock.queue_len(), 1);

        assert!(lock.release(tx));
        assert!(lock.release(tx));
        other.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dropped_waiter_leaves_queue() {
        let lock = Arc::new(SessionLock::new());
        let holder = invocation();
        lock.acquire(holder, bounded(10)).await.unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.acquire(invocation(), bounded(5_000)).await })
        };
        while lock.queue_len() < 1 {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert_eq!(lock.queue_len(), 0);

        lock.release(holder);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_try_acquire() {
        let lock = SessionLock::new();
        let owner = invocation();
        assert!(lock.try_acquire(owner));
        assert!(lock.try_acquire(owner));
        assert!(!lock.try_acquire(invocation()));
        lock.release(owner);
        lock.release(owner);
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_release_by_non_owner_is_rejected() {
        let lock = SessionLock::new();
        let holder = invocation();
        lock.acquire(holder, bounded(10)).await.unwrap();
        assert!(!lock.release(invocation()));
        assert_eq!(lock.owner(), Some(holder));
    }
}
