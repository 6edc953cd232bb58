//! Stateful session management with per-session locking and transaction association.
//!
//! This crate keeps server-side session instances alive across client calls:
//! - A session cache with idle expiration, an optional size bound and
//!   passivation as an alternative to destruction
//! - A fair, owner-reentrant lock giving each session at most one active
//!   invocation (or one transaction's worth of invocations)
//! - Transaction binding with completion callbacks, and session-terminating
//!   remove methods
//! - Serializable session handles resolved through an injected registry
//!
//! # Example
//!
//! ```rust,ignore
//! use warden_session::{
//!     CacheConfig, DefaultFactory, InvocationContext, SessionCache, StatefulComponent,
//! };
//!
//! let cache = SessionCache::new(DefaultFactory::<Cart>::new(), CacheConfig::default()
//!     .with_idle_timeout(Duration::from_secs(600)));
//! let component = Arc::new(StatefulComponent::new("shop/cart", cache));
//! component.start();
//!
//! let cart = component.create_proxy()?;
//! cart.invoke("add", &InvocationContext::none(), |c| {
//!     c.items.push("pen".into());
//!     Ok(())
//! })
//! .await?;
//! ```

mod cache;
mod component;
mod config;
mod error;
mod factory;
mod handle;
mod id;
mod instance;
mod lifecycle;
mod lock;
mod method;
mod passivation;
mod synchronization;
mod transaction;

pub use cache::{CacheStats, EntryState, SessionCache, SessionInfo};
pub use component::StatefulComponent;
pub use config::{CacheConfig, DEFAULT_IDLE_TIMEOUT, DEFAULT_SWEEP_INTERVAL};
pub use error::{BeanError, BoxError, Error, Result};
pub use factory::{DefaultFactory, FnFactory, InstanceFactory, factory_fn};
pub use handle::{
    ComponentRegistry, ComponentResolver, HANDLE_VERSION, HandleCodec, MarshallingConfig,
    SessionHandle, SessionProxy,
};
pub use id::SessionId;
pub use instance::{Identifiable, Lifecycle, SessionInstance, TransactionAware};
pub use lifecycle::{
    CallbackContext, FnInterceptor, LifecycleChain, LifecycleEvent, LifecycleInterceptor,
    StatefulBean,
};
pub use lock::{InvocationId, LockOwner, LockTimeout, SessionLock};
pub use method::{MethodDescriptor, RemoveMethod};
pub use passivation::{MemoryPassivationStore, NoPassivation, PassivationStore};
pub use synchronization::{InvocationContext, SessionSynchronization};
pub use transaction::{
    LocalTransaction, Synchronization, Transaction, TransactionKey, TransactionStatus,
};
pub use warden_config::{AccessTimeout, EvictionAction};
