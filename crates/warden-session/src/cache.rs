//! Session cache with idle expiration, size-bound eviction and passivation.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use warden_config::EvictionAction;

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::factory::InstanceFactory;
use crate::id::SessionId;
use crate::instance::{Identifiable, Lifecycle, SessionInstance};
use crate::lifecycle::{LifecycleChain, LifecycleEvent, StatefulBean};
use crate::lock::{InvocationId, LockOwner};
use crate::passivation::{NoPassivation, PassivationStore};

/// Whether a cached session is currently handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    InUse,
    Inactive,
}

/// Entry stored in the cache.
struct CacheEntry<B> {
    instance: Arc<SessionInstance<B>>,
    last_used: Instant,
    /// Outstanding `get`s not yet matched by a `release`.
    usage: usize,
}

impl<B> CacheEntry<B> {
    fn new(instance: Arc<SessionInstance<B>>) -> Self {
        Self {
            instance,
            last_used: Instant::now(),
            usage: 1,
        }
    }

    fn state(&self) -> EntryState {
        if self.usage > 0 {
            EntryState::InUse
        } else {
            EntryState::Inactive
        }
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Inactive and not held by any invocation or transaction.
    fn is_evictable(&self) -> bool {
        self.state() == EntryState::Inactive && !self.instance.lock().is_locked()
    }
}

/// Snapshot of a cached session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub state: EntryState,
    pub idle_for: Duration,
    pub locked: bool,
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Sessions held in memory.
    pub size: usize,
    /// In-memory sessions currently handed out.
    pub in_use: usize,
    /// In-memory sessions waiting for their next call.
    pub idle: usize,
    /// Sessions held by the passivation store.
    pub passivated: usize,
}

/// Handle to the running expiration sweep; cancels it on drop.
struct SweepHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Live sessions of one stateful component.
///
/// The entry map is guarded by a single lock that is only held for map
/// bookkeeping. Exclusive use of an instance is enforced by its own
/// [`SessionLock`](crate::SessionLock), not by the cache. Instance
/// destruction and passivation always happen outside the map lock.
pub struct SessionCache<B: StatefulBean> {
    entries: Mutex<LruCache<SessionId, CacheEntry<B>>>,
    factory: Box<dyn InstanceFactory<B>>,
    lifecycle: Arc<LifecycleChain<B>>,
    store: Box<dyn PassivationStore<B>>,
    config: CacheConfig,
    sweeper: Mutex<Option<SweepHandle>>,
}

impl<B: StatefulBean> SessionCache<B> {
    /// Create a cache with no lifecycle interceptors and no passivation store.
    pub fn new(factory: impl InstanceFactory<B> + 'static, config: CacheConfig) -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            factory: Box::new(factory),
            lifecycle: Arc::new(LifecycleChain::new()),
            store: Box::new(NoPassivation),
            config,
            sweeper: Mutex::new(None),
        }
    }

    /// Use `chain` for lifecycle callbacks.
    pub fn with_lifecycle(mut self, chain: Arc<LifecycleChain<B>>) -> Self {
        self.lifecycle = chain;
        self
    }

    /// Use `store` for passivated sessions.
    pub fn with_passivation(mut self, store: impl PassivationStore<B> + 'static) -> Self {
        self.store = Box::new(store);
        self
    }

    /// Get the cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The lifecycle chain shared with the invocation machinery.
    pub fn lifecycle(&self) -> &Arc<LifecycleChain<B>> {
        &self.lifecycle
    }

    /// Create a new session. The returned instance is IN_USE.
    ///
    /// If the factory or a post-construct callback fails, nothing is cached.
    pub fn create(&self) -> Result<Arc<SessionInstance<B>>> {
        let mut bean = self.factory.create_instance().map_err(Error::Factory)?;
        let id = SessionId::new();
        self.lifecycle
            .fire(&mut bean, &id, LifecycleEvent::PostConstruct)?;

        let instance = Arc::new(SessionInstance::new(id, bean));
        let victims = {
            let mut entries = self.entries.lock();
            entries.put(id, CacheEntry::new(Arc::clone(&instance)));
            self.over_capacity(&mut entries)
        };
        debug!(session_id = %id, "Session created");

        self.evict_all(victims);
        Ok(instance)
    }

    /// Look up a session and mark it IN_USE.
    ///
    /// Sessions absent from memory are activated from the passivation store.
    pub fn get(&self, session_id: &SessionId) -> Result<Arc<SessionInstance<B>>> {
        let (instance, activation) = {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(session_id) {
                entry.usage += 1;
                entry.touch();
                trace!(session_id = %session_id, "Session found in cache");
                return Ok(Arc::clone(&entry.instance));
            }

            // Restoring under the map lock keeps two concurrent lookups from
            // both missing the image.
            let Some(bean) = self.store.activate(session_id)? else {
                return Err(Error::NotFound(*session_id));
            };
            let instance = Arc::new(SessionInstance::new(*session_id, bean));
            let activation = LockOwner::Invocation(InvocationId::next());
            // Fresh lock; post-activate runs before anyone else can use the bean.
            instance.lock().try_acquire(activation);
            entries.put(*session_id, CacheEntry::new(Arc::clone(&instance)));
            (instance, activation)
        };

        let activated = instance
            .with_bean(|bean| {
                self.lifecycle
                    .fire(bean, session_id, LifecycleEvent::PostActivate)
            })
            .unwrap_or(Err(Error::NotFound(*session_id)));
        instance.lock().release(activation);

        match activated {
            Ok(()) => {
                debug!(session_id = %session_id, "Session activated");
                let victims = self.over_capacity(&mut self.entries.lock());
                self.evict_all(victims);
                Ok(instance)
            }
            Err(err) => {
                error!(
                    session_id = %session_id,
                    error = %err,
                    "Activation failed, discarding session"
                );
                self.discard(session_id);
                Err(err)
            }
        }
    }

    /// Mark a session INACTIVE after use.
    ///
    /// Releasing an instance that is no longer cached (removed or discarded
    /// concurrently) only logs a warning.
    pub fn release(&self, instance: &SessionInstance<B>) {
        let id = instance.session_id();
        let mut entries = self.entries.lock();
        match entries.peek_mut(id) {
            Some(entry) if std::ptr::eq(Arc::as_ptr(&entry.instance), instance) => {
                entry.usage = entry.usage.saturating_sub(1);
                entry.touch();
                trace!(session_id = %id, usage = entry.usage, "Session released");
            }
            _ => warn!(session_id = %id, "Released session is no longer cached"),
        }
    }

    /// Drop a session without running any destroy callback.
    ///
    /// A passivated session loses its stored image. Returns whether the
    /// session existed.
    pub fn discard(&self, session_id: &SessionId) -> bool {
        let entry = self.entries.lock().pop(session_id);
        match entry {
            Some(entry) => {
                entry.instance.mark_discarded();
                debug!(session_id = %session_id, "Session discarded");
                true
            }
            None => match self.store.remove(session_id) {
                Ok(removed) => {
                    if removed {
                        debug!(session_id = %session_id, "Passivated session discarded");
                    }
                    removed
                }
                Err(err) => {
                    warn!(
                        session_id = %session_id,
                        error = %err,
                        "Failed to drop passivated image"
                    );
                    false
                }
            },
        }
    }

    /// Remove a session and destroy its instance.
    ///
    /// Fails with [`Error::NotFound`] if the session does not exist, so a
    /// second removal of the same identifier is reported rather than ignored.
    pub fn remove(&self, session_id: &SessionId) -> Result<()> {
        let entry = self.entries.lock().pop(session_id);
        match entry {
            Some(entry) => {
                debug!(session_id = %session_id, "Removing session");
                self.destroy(&entry.instance)
            }
            None => {
                let Some(mut bean) = self.store.activate(session_id)? else {
                    return Err(Error::NotFound(*session_id));
                };
                debug!(session_id = %session_id, "Removing passivated session");
                self.destroy_bean(session_id, &mut bean);
                self.factory.destroy_instance(bean).map_err(Error::Factory)
            }
        }
    }

    /// Start the expiration sweep if an idle or passivation timeout is configured.
    ///
    /// Must be called from within a Tokio runtime. Calling it again while the
    /// sweep runs has no effect.
    pub fn start(self: &Arc<Self>) {
        if self.config.passivated_expiry().is_none() {
            debug!("No idle timeout configured, expiration sweep disabled");
            return;
        }

        let mut sweeper = self.sweeper.lock();
        if sweeper.as_ref().is_some_and(|s| !s.task.is_finished()) {
            return;
        }

        let token = CancellationToken::new();
        let cache = Arc::downgrade(self);
        let task = tokio::spawn(run_sweep(cache, self.config.sweep_interval, token.clone()));
        debug!(
            idle_timeout = ?self.config.idle_timeout,
            interval = ?self.config.sweep_interval,
            "Expiration sweep started"
        );
        *sweeper = Some(SweepHandle { token, task });
    }

    /// Stop the sweep and drop every session without destroying it.
    ///
    /// Passivated images are dropped too, so no session outlives a stop.
    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.token.cancel();
        }

        let drained: Vec<_> = {
            let mut entries = self.entries.lock();
            let mut drained = Vec::with_capacity(entries.len());
            while let Some((_, entry)) = entries.pop_lru() {
                drained.push(entry.instance);
            }
            drained
        };
        for instance in &drained {
            instance.mark_discarded();
        }
        let passivated = self.store.clear().unwrap_or_else(|err| {
            warn!(error = %err, "Failed to clear passivated sessions");
            0
        });
        debug!(count = drained.len(), passivated, "Session cache stopped");
    }

    /// Whether the expiration sweep is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|s| !s.task.is_finished() && !s.token.is_cancelled())
    }

    /// Evict every INACTIVE session idle for longer than the idle timeout,
    /// then drop passivated images older than the passivation timeout.
    ///
    /// Expired entries are taken out of the map in one pass under the map
    /// lock, then evicted outside it. Expired images are dropped without
    /// callbacks since their beans are never restored. Returns the number of
    /// sessions evicted or expired.
    pub fn sweep(&self) -> usize {
        let mut count = 0;
        if let Some(idle_timeout) = self.config.idle_timeout {
            let expired: Vec<_> = {
                let mut entries = self.entries.lock();
                let now = Instant::now();
                let ids: Vec<SessionId> = entries
                    .iter()
                    .filter(|(_, entry)| {
                        entry.is_evictable() && now.duration_since(entry.last_used) > idle_timeout
                    })
                    .map(|(id, _)| *id)
                    .collect();
                ids.iter()
                    .filter_map(|id| entries.pop(id))
                    .map(|entry| entry.instance)
                    .collect()
            };

            count += expired.len();
            if !expired.is_empty() {
                debug!(count = expired.len(), "Evicting expired sessions");
            }
            self.evict_all(expired);
        }

        if let Some(max_age) = self.config.passivated_expiry() {
            match self.store.expire(max_age) {
                Ok(expired) => {
                    for id in &expired {
                        debug!(session_id = %id, "Passivated session expired");
                    }
                    count += expired.len();
                }
                Err(err) => warn!(error = %err, "Failed to expire passivated sessions"),
            }
        }
        count
    }

    /// Get the current number of in-memory sessions.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if no sessions are held in memory.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Check if a session is held in memory (without touching it).
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.entries.lock().contains(session_id)
    }

    /// State of an in-memory session (without touching it).
    pub fn state(&self, session_id: &SessionId) -> Option<EntryState> {
        self.entries.lock().peek(session_id).map(CacheEntry::state)
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        let in_use = entries
            .iter()
            .filter(|(_, e)| e.state() == EntryState::InUse)
            .count();
        CacheStats {
            size: entries.len(),
            in_use,
            idle: entries.len() - in_use,
            passivated: self.store.len(),
        }
    }

    /// Snapshot of all in-memory sessions, most recently used first.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let entries = self.entries.lock();
        let now = Instant::now();
        entries
            .iter()
            .map(|(id, entry)| SessionInfo {
                session_id: *id,
                created_at: entry.instance.created_at(),
                state: entry.state(),
                idle_for: now.duration_since(entry.last_used),
                locked: entry.instance.lock().is_locked(),
            })
            .collect()
    }

    /// Pop least-recently-used evictable entries above the size bound.
    fn over_capacity(
        &self,
        entries: &mut LruCache<SessionId, CacheEntry<B>>,
    ) -> Vec<Arc<SessionInstance<B>>> {
        let Some(max) = self.config.max_sessions else {
            return Vec::new();
        };
        let excess = entries.len().saturating_sub(max);
        if excess == 0 {
            return Vec::new();
        }

        let ids: Vec<SessionId> = entries
            .iter()
            .rev()
            .filter(|(_, entry)| entry.is_evictable())
            .take(excess)
            .map(|(id, _)| *id)
            .collect();
        ids.iter()
            .filter_map(|id| entries.pop(id))
            .map(|entry| {
                let id = entry.instance.session_id();
                debug!(session_id = %id, "Evicting LRU session to make room");
                entry.instance
            })
            .collect()
    }

    fn evict_all(&self, instances: Vec<Arc<SessionInstance<B>>>) {
        for instance in instances {
            self.evict(&instance);
        }
    }

    /// Passivate or destroy an instance already taken out of the map.
    /// Failures are logged; they never propagate.
    fn evict(&self, instance: &SessionInstance<B>) {
        let id = *instance.session_id();
        if self.config.eviction == EvictionAction::Passivate {
            let Some(mut bean) = instance.take_bean() else {
                return;
            };
            match self.passivate(&id, &mut bean) {
                Ok(()) => {
                    debug!(session_id = %id, "Session passivated");
                    return;
                }
                Err(err) => {
                    warn!(session_id = %id, error = %err, "Passivation failed, destroying session");
                    self.destroy_bean(&id, &mut bean);
                    if let Err(err) = self.factory.destroy_instance(bean) {
                        error!(session_id = %id, error = %err, "Failed to destroy session");
                    }
                    return;
                }
            }
        }

        if let Err(err) = self.destroy(instance) {
            error!(session_id = %id, error = %err, "Failed to destroy expired session");
        }
    }

    fn passivate(&self, session_id: &SessionId, bean: &mut B) -> Result<()> {
        self.lifecycle
            .fire(bean, session_id, LifecycleEvent::PrePassivate)?;
        self.store.passivate(session_id, bean)
    }

    /// Fire pre-destroy and hand the bean back to the factory.
    fn destroy(&self, instance: &SessionInstance<B>) -> Result<()> {
        let id = instance.session_id();
        let Some(mut bean) = instance.take_bean() else {
            return Ok(());
        };
        self.destroy_bean(id, &mut bean);
        self.factory.destroy_instance(bean).map_err(Error::Factory)
    }

    /// Pre-destroy failures are logged; destruction continues regardless.
    fn destroy_bean(&self, session_id: &SessionId, bean: &mut B) {
        if let Err(err) = self
            .lifecycle
            .fire(bean, session_id, LifecycleEvent::PreDestroy)
        {
            warn!(session_id = %session_id, error = %err, "Pre-destroy callback failed");
        }
    }
}

impl<B: StatefulBean> Drop for SessionCache<B> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.token.cancel();
        }
    }
}

/// Background loop driving [`SessionCache::sweep`].
async fn run_sweep<B: StatefulBean>(
    cache: Weak<SessionCache<B>>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                cache.sweep();
            }
        }
    }
    trace!("Expiration sweep stopped");
}
