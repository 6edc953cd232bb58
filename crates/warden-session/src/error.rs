//! Error types for stateful session operations.

use std::time::Duration;

use crate::id::SessionId;
use crate::transaction::TransactionKey;

/// Opaque error produced by collaborators (factories, beans, stores).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type for stateful session operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No session with this identifier exists (never created, removed, discarded or reaped).
    #[error("No such session: {0}")]
    NotFound(SessionId),

    /// The session lock could not be acquired in time.
    #[error("Timed out after {timeout:?} waiting for session {session_id}")]
    ConcurrentAccessTimeout {
        session_id: SessionId,
        timeout: Duration,
    },

    /// The session is bound to a different transaction than the caller's.
    #[error(
        "Session {session_id} is already associated with transaction {bound}, caller is in {}",
        .caller.map(|k| k.to_string()).unwrap_or_else(|| "no transaction".to_string())
    )]
    TransactionConflict {
        session_id: SessionId,
        bound: TransactionKey,
        caller: Option<TransactionKey>,
    },

    /// An unexpected failure from business logic; the session has been discarded.
    #[error("Session {session_id} discarded: {source}")]
    System {
        session_id: SessionId,
        source: BoxError,
    },

    /// An application error raised by business logic; the session is intact.
    #[error("{0}")]
    Application(BoxError),

    /// A lifecycle callback failed.
    #[error("{event} callback failed for session {session_id}: {source}")]
    Lifecycle {
        session_id: SessionId,
        event: crate::lifecycle::LifecycleEvent,
        source: BoxError,
    },

    /// The instance factory failed.
    #[error("Instance factory error: {0}")]
    Factory(BoxError),

    /// The passivation store failed.
    #[error("Passivation error for session {session_id}: {message}")]
    Passivation {
        session_id: SessionId,
        message: String,
    },

    /// The transaction refused the operation (e.g., it is no longer active).
    #[error("Transaction {key} error: {message}")]
    Transaction {
        key: TransactionKey,
        message: String,
    },

    /// A session handle locator did not resolve to a live component.
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// A session handle could not be encoded or decoded.
    #[error("Handle codec error: {0}")]
    Codec(String),

    /// Component configuration could not be resolved.
    #[error(transparent)]
    Config(#[from] warden_config::ConfigError),
}

impl Error {
    /// Whether the caller may retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrentAccessTimeout { .. })
    }

    /// Whether this is a "no such session" failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

/// Result type for stateful session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a business method.
#[derive(Debug)]
pub enum BeanError {
    /// A declared application error; it does not indicate instance corruption.
    Application(BoxError),
    /// Any other failure; the instance must never be reused.
    System(BoxError),
}

impl BeanError {
    /// Wrap an application error.
    pub fn application(err: impl Into<BoxError>) -> Self {
        BeanError::Application(err.into())
    }

    /// Wrap a system error.
    pub fn system(err: impl Into<BoxError>) -> Self {
        BeanError::System(err.into())
    }
}
