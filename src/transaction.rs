//! Local Transactions
//!
//! A small in-process transaction service: enough to give the container real
//! transaction boundaries, rollback-only marking and synchronization callbacks.
//!
//! ```text
//!            begin()                  commit()
//! Manager ───────────▶ Transaction ──────────────┐
//!                       │  Active                 │ before_completion (each sync,
//!                       │  MarkedRollback         │   stops at first failure)
//!                       │                         ▼
//!                       │                  Committed / RolledBack
//!                       │                         │ after_completion (every sync)
//!                       └─────────────────────────┘
//! ```
//!
//! How a method runs with respect to the caller's transaction is decided by a
//! [`TransactionPolicy`] created from the method's [`TransactionAttribute`].

use crate::error::{BoxError, TransactionError};
use crate::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub mod policy;
pub mod user;

pub use policy::{BeanTransactionPolicy, JtaTransactionPolicy, TransactionPolicy};
pub use user::UserTransaction;

/// Shared resource stored on a transaction or policy scope.
pub type Resource = Arc<dyn Any + Send + Sync>;

/// Identifier of a transaction, unique within its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(u64);

impl TransactionId {
    /// Raw id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Running; may commit.
    Active,
    /// Running; can only roll back.
    MarkedRollback,
    /// Completed and committed.
    Committed,
    /// Completed and rolled back.
    RolledBack,
}

impl Status {
    /// `true` while the transaction has not completed.
    pub fn is_active(self) -> bool {
        matches!(self, Status::Active | Status::MarkedRollback)
    }
}

/// How a method participates in the caller's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransactionAttribute {
    /// Join the caller's transaction or start a new one.
    #[default]
    Required,
    /// Always run in a new transaction, suspending the caller's.
    RequiresNew,
    /// Join the caller's transaction if there is one.
    Supports,
    /// Run without a transaction, suspending the caller's.
    NotSupported,
    /// Require the caller's transaction.
    Mandatory,
    /// Fail if the caller has a transaction.
    Never,
    /// The bean demarcates its own transactions through a [`UserTransaction`].
    BeanManaged,
}

/// Callbacks fired around transaction completion.
///
/// When work completes without a transaction, registered synchronizations are
/// still fired once, with `None` passed to `before_completion` and
/// [`Status::Committed`] to `after_completion`.
pub trait TransactionSynchronization: Send + Sync {
    /// Called before the outcome is decided. An error marks the transaction
    /// rollback-only.
    fn before_completion(&self, transaction: Option<&Transaction>) -> Result<(), BoxError>;

    /// Called after the outcome is decided.
    fn after_completion(&self, status: Status) -> Result<(), BoxError>;
}

struct TransactionState {
    status: Status,
    /// Set once `commit` or `rollback` has claimed the transaction.
    completing: bool,
    rollback_cause: Option<String>,
    synchronizations: Vec<Arc<dyn TransactionSynchronization>>,
    resources: HashMap<TypeId, Resource>,
}

/// An in-process transaction.
pub struct Transaction {
    id: TransactionId,
    state: Mutex<TransactionState>,
}

impl Transaction {
    fn new(id: TransactionId) -> Self {
        Self {
            id,
            state: Mutex::new(TransactionState {
                status: Status::Active,
                completing: false,
                rollback_cause: None,
                synchronizations: Vec::new(),
                resources: HashMap::new(),
            }),
        }
    }

    /// Transaction id.
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Current status.
    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    /// `true` until the transaction completes.
    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    /// `true` if the transaction can only roll back.
    pub fn is_rollback_only(&self) -> bool {
        self.status() == Status::MarkedRollback
    }

    /// Marks the transaction rollback-only. The first cause is kept.
    pub fn set_rollback_only(&self, cause: impl Into<String>) {
        let mut state = self.state.lock();
        if state.status == Status::Active {
            state.status = Status::MarkedRollback;
        }
        if state.rollback_cause.is_none() {
            state.rollback_cause = Some(cause.into());
        }
    }

    /// Why the transaction was marked rollback-only.
    pub fn rollback_cause(&self) -> Option<String> {
        self.state.lock().rollback_cause.clone()
    }

    /// Registers a completion callback. Accepted until the outcome is decided,
    /// including from another synchronization's `before_completion`.
    pub fn register_synchronization(
        &self,
        synchronization: Arc<dyn TransactionSynchronization>,
    ) -> Result<(), TransactionError> {
        let mut state = self.state.lock();
        if !state.status.is_active() {
            return Err(TransactionError::NotActive(self.id));
        }
        state.synchronizations.push(synchronization);
        Ok(())
    }

    /// Resource stored under `key`.
    pub fn resource(&self, key: TypeId) -> Option<Resource> {
        self.state.lock().resources.get(&key).cloned()
    }

    /// Stores a resource that lives as long as the transaction.
    pub fn put_resource(&self, key: TypeId, value: Resource) {
        self.state.lock().resources.insert(key, value);
    }

    /// Commits, or rolls back if the transaction is rollback-only or a
    /// `before_completion` callback fails.
    pub fn commit(&self) -> Result<(), TransactionError> {
        self.complete(true)
    }

    /// Rolls back.
    pub fn rollback(&self) -> Result<(), TransactionError> {
        self.complete(false)
    }

    fn complete(&self, attempt_commit: bool) -> Result<(), TransactionError> {
        {
            let mut state = self.state.lock();
            if !state.status.is_active() || state.completing {
                return Err(TransactionError::NotActive(self.id));
            }
            state.completing = true;
        }

        // synchronizations registered by a before_completion callback are fired too
        if attempt_commit {
            let mut fired = 0;
            loop {
                let next = {
                    let state = self.state.lock();
                    if state.status != Status::Active {
                        break;
                    }
                    state.synchronizations.get(fired).cloned()
                };
                let Some(synchronization) = next else {
                    break;
                };
                fired += 1;
                if let Err(err) = synchronization.before_completion(Some(self)) {
                    warn!(transaction = %self.id, error = %err, "before_completion failed; rolling back");
                    self.set_rollback_only(err.to_string());
                    break;
                }
            }
        }

        let (status, synchronizations) = {
            let mut state = self.state.lock();
            state.status = if attempt_commit && state.status == Status::Active {
                Status::Committed
            } else {
                Status::RolledBack
            };
            state.resources.clear();
            (state.status, state.synchronizations.clone())
        };
        debug!(transaction = %self.id, ?status, "transaction completed");

        for synchronization in &synchronizations {
            if let Err(err) = synchronization.after_completion(status) {
                error!(transaction = %self.id, error = %err, "after_completion failed");
            }
        }

        if attempt_commit && status == Status::RolledBack {
            return Err(TransactionError::RolledBack {
                id: self.id,
                cause: self
                    .rollback_cause()
                    .unwrap_or_else(|| "marked rollback-only".to_string()),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("status", &state.status)
            .field("synchronizations", &state.synchronizations.len())
            .finish()
    }
}

/// Creates transactions and transaction policies.
#[derive(Debug, Default)]
pub struct TransactionManager {
    next_id: AtomicU64,
}

impl TransactionManager {
    /// Creates a shared manager.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Starts a new transaction.
    pub fn begin(&self) -> Arc<Transaction> {
        let id = TransactionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        debug!(transaction = %id, "transaction started");
        Arc::new(Transaction::new(id))
    }

    /// Creates the policy for running a method with `attribute` on behalf of a
    /// caller whose transaction is `client`.
    pub fn create_policy(
        self: &Arc<Self>,
        attribute: TransactionAttribute,
        client: Option<&Arc<Transaction>>,
    ) -> Result<Box<dyn TransactionPolicy>, TransactionError> {
        let client = client.filter(|tx| tx.is_active()).cloned();
        let policy: Box<dyn TransactionPolicy> = match attribute {
            TransactionAttribute::Required => match client {
                Some(tx) => Box::new(JtaTransactionPolicy::joined(attribute, tx)),
                None => Box::new(JtaTransactionPolicy::started(attribute, self.begin())),
            },
            TransactionAttribute::RequiresNew => {
                Box::new(JtaTransactionPolicy::started(attribute, self.begin()))
            }
            TransactionAttribute::Supports => match client {
                Some(tx) => Box::new(JtaTransactionPolicy::joined(attribute, tx)),
                None => Box::new(JtaTransactionPolicy::unspecified(attribute)),
            },
            TransactionAttribute::NotSupported => {
                Box::new(JtaTransactionPolicy::unspecified(attribute))
            }
            TransactionAttribute::Mandatory => match client {
                Some(tx) => Box::new(JtaTransactionPolicy::joined(attribute, tx)),
                None => return Err(TransactionError::Required),
            },
            TransactionAttribute::Never => match client {
                Some(_) => return Err(TransactionError::NotAllowed),
                None => Box::new(JtaTransactionPolicy::unspecified(attribute)),
            },
            TransactionAttribute::BeanManaged => {
                Box::new(BeanTransactionPolicy::new(UserTransaction::new(Arc::clone(self))))
            }
        };
        Ok(policy)
    }
}
