//! Transaction manager interface consumed by the session machinery.
//!
//! The cache never drives transactions itself. Callers pass the current
//! [`Transaction`] (if any) explicitly in the invocation context; the session
//! machinery registers [`Synchronization`] callbacks on it and reacts to
//! completion. [`LocalTransaction`] is a small in-process implementation.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Identity of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionKey(Uuid);

impl TransactionKey {
    /// Create a new random transaction key.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TransactionKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Final outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Committed,
    RolledBack,
}

impl TransactionStatus {
    /// The "committed" flag passed to after-completion callbacks.
    pub fn is_committed(self) -> bool {
        matches!(self, TransactionStatus::Committed)
    }
}

/// Completion callback registered with a transaction.
///
/// Callbacks run synchronously on whichever thread drives completion.
pub trait Synchronization: Send + Sync {
    /// Called before the transaction commits. An error forces rollback.
    fn before_completion(&self) -> Result<()>;

    /// Called once the outcome is decided.
    fn after_completion(&self, status: TransactionStatus) -> Result<()>;
}

/// A transaction as seen by the session machinery.
pub trait Transaction: Send + Sync {
    /// Identity of this transaction.
    fn key(&self) -> TransactionKey;

    /// Whether the transaction still accepts work.
    fn is_active(&self) -> bool;

    /// Register a completion callback.
    fn register_synchronization(&self, sync: Arc<dyn Synchronization>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Completing,
    Completed(TransactionStatus),
}

struct LocalState {
    phase: Phase,
    synchronizations: Vec<Arc<dyn Synchronization>>,
}

/// In-process transaction that drives its registered synchronizations.
///
/// `commit` runs every `before_completion` in registration order; the first
/// failure turns the outcome into a rollback. `after_completion` then runs for
/// every synchronization regardless of earlier failures.
pub struct LocalTransaction {
    key: TransactionKey,
    state: Mutex<LocalState>,
}

impl LocalTransaction {
    /// Begin a new transaction.
    pub fn new() -> Self {
        Self {
            key: TransactionKey::new(),
            state: Mutex::new(LocalState {
                phase: Phase::Active,
                synchronizations: Vec::new(),
            }),
        }
    }

    /// Outcome, once completed.
    pub fn status(&self) -> Option<TransactionStatus> {
        match self.state.lock().phase {
            Phase::Completed(status) => Some(status),
            _ => None,
        }
    }

    /// Commit the transaction.
    ///
    /// Returns the first `before_completion` error if one forced a rollback.
    pub fn commit(&self) -> Result<TransactionStatus> {
        self.begin_completion()?;

        let mut failure = None;
        let mut index = 0;
        // Callbacks may register further synchronizations while completing.
        while let Some(sync) = self.synchronization_at(index) {
            if let Err(err) = sync.before_completion() {
                warn!(tx = %self.key, error = %err, "before_completion failed, rolling back");
                failure = Some(err);
                break;
            }
            index += 1;
        }

        let status = if failure.is_some() {
            TransactionStatus::RolledBack
        } else {
            TransactionStatus::Committed
        };
        self.finish(status);

        match failure {
            Some(err) => Err(err),
            None => Ok(status),
        }
    }

    /// Roll the transaction back.
    pub fn rollback(&self) -> Result<()> {
        self.begin_completion()?;
        self.finish(TransactionStatus::RolledBack);
        Ok(())
    }

    fn begin_completion(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.phase != Phase::Active {
            return Err(Error::Transaction {
                key: self.key,
                message: "transaction is not active".to_string(),
            });
        }
        state.phase = Phase::Completing;
        Ok(())
    }

    fn synchronization_at(&self, index: usize) -> Option<Arc<dyn Synchronization>> {
        self.state.lock().synchronizations.get(index).cloned()
    }

    fn finish(&self, status: TransactionStatus) {
        let synchronizations = {
            let mut state = self.state.lock();
            state.phase = Phase::Completed(status);
            std::mem::take(&mut state.synchronizations)
        };

        for sync in synchronizations {
            if let Err(err) = sync.after_completion(status) {
                warn!(tx = %self.key, error = %err, "after_completion failed");
            }
        }
        debug!(tx = %self.key, ?status, "Transaction completed");
    }
}

impl Default for LocalTransaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction for LocalTransaction {
    fn key(&self) -> TransactionKey {
        self.key
    }

    fn is_active(&self) -> bool {
        self.state.lock().phase == Phase::Active
    }

    fn register_synchronization(&self, sync: Arc<dyn Synchronization>) -> Result<()> {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Completed(_) => Err(Error::Transaction {
                key: self.key,
                message: "cannot register a synchronization on a completed transaction"
                    .to_string(),
            }),
            _ => {
                state.synchronizations.push(sync);
                Ok(())
            }
        }
    }
}

impl fmt::Debug for LocalTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransaction")
            .field("key", &self.key)
            .field("phase", &self.state.lock().phase)
            .finish()
    }
}
