//! Transaction policies: how one container call relates to transactions.
//!
//! A policy is created per call from the method's [`TransactionAttribute`] and
//! completed once the call finishes. Completion commits or rolls back a
//! transaction the policy started; a joined caller transaction is left to its
//! owner.
//!
//! Work that runs with no transaction still gets a scope: resources and
//! synchronizations registered on the policy live in a local scope whose
//! synchronizations fire when the policy completes.

use super::{
    Resource, Status, Transaction, TransactionAttribute, TransactionSynchronization,
    UserTransaction,
};
use crate::error::TransactionError;
use crate::HashMap;
use parking_lot::Mutex;
use std::any::TypeId;
use std::fmt;
use std::sync::Arc;
use tracing::{error, warn};

/// Per-call transaction policy.
pub trait TransactionPolicy: Send + Sync {
    /// Attribute the policy was created for.
    fn attribute(&self) -> TransactionAttribute;

    /// Transaction the call runs in, if any.
    fn current_transaction(&self) -> Option<Arc<Transaction>>;

    /// `true` if the policy started the transaction and will complete it.
    fn is_new_transaction(&self) -> bool;

    /// `true` if the call joined the caller's transaction.
    fn is_client_transaction(&self) -> bool;

    /// `true` if the call currently runs in an active transaction.
    fn is_transaction_active(&self) -> bool {
        self.current_transaction().is_some_and(|tx| tx.is_active())
    }

    /// `true` if the current transaction is marked rollback-only.
    fn is_rollback_only(&self) -> bool {
        self.current_transaction()
            .is_some_and(|tx| tx.is_rollback_only())
    }

    /// Marks the current transaction rollback-only; no-op without one.
    fn set_rollback_only(&self, cause: &str) {
        if let Some(tx) = self.current_transaction() {
            tx.set_rollback_only(cause);
        }
    }

    /// Resource stored on the transaction or local scope.
    fn resource(&self, key: TypeId) -> Option<Resource>;

    /// Stores a resource on the transaction or local scope.
    fn put_resource(&self, key: TypeId, value: Resource);

    /// Registers completion callbacks on the transaction or local scope.
    fn register_synchronization(&self, synchronization: Arc<dyn TransactionSynchronization>);

    /// User transaction handle for bean-managed calls.
    fn user_transaction(&self) -> Option<&UserTransaction> {
        None
    }

    /// Finishes the call: commits or rolls back a transaction the policy started
    /// and fires local-scope synchronizations.
    fn complete(&self) -> Result<(), TransactionError>;
}

/// Resources and synchronizations of work that runs outside a transaction.
#[derive(Default)]
struct LocalScope {
    resources: Mutex<HashMap<TypeId, Resource>>,
    synchronizations: Mutex<Vec<Arc<dyn TransactionSynchronization>>>,
}

impl LocalScope {
    fn resource(&self, key: TypeId) -> Option<Resource> {
        self.resources.lock().get(&key).cloned()
    }

    fn put_resource(&self, key: TypeId, value: Resource) {
        self.resources.lock().insert(key, value);
    }

    fn register(&self, synchronization: Arc<dyn TransactionSynchronization>) {
        self.synchronizations.lock().push(synchronization);
    }

    /// Fires every synchronization once, as if a transaction committed.
    fn fire(&self) {
        let synchronizations = std::mem::take(&mut *self.synchronizations.lock());
        for synchronization in &synchronizations {
            if let Err(err) = synchronization.before_completion(None) {
                warn!(error = %err, "before_completion failed outside a transaction");
            }
        }
        for synchronization in &synchronizations {
            if let Err(err) = synchronization.after_completion(Status::Committed) {
                error!(error = %err, "after_completion failed outside a transaction");
            }
        }
        self.resources.lock().clear();
    }
}

/// Container-managed policy.
pub struct JtaTransactionPolicy {
    attribute: TransactionAttribute,
    transaction: Option<Arc<Transaction>>,
    started: bool,
    local: LocalScope,
}

impl JtaTransactionPolicy {
    /// Runs in the caller's transaction.
    pub fn joined(attribute: TransactionAttribute, transaction: Arc<Transaction>) -> Self {
        Self {
            attribute,
            transaction: Some(transaction),
            started: false,
            local: LocalScope::default(),
        }
    }

    /// Runs in a transaction the policy started and completes.
    pub fn started(attribute: TransactionAttribute, transaction: Arc<Transaction>) -> Self {
        Self {
            attribute,
            transaction: Some(transaction),
            started: true,
            local: LocalScope::default(),
        }
    }

    /// Runs without a transaction.
    pub fn unspecified(attribute: TransactionAttribute) -> Self {
        Self {
            attribute,
            transaction: None,
            started: false,
            local: LocalScope::default(),
        }
    }

    fn active_transaction(&self) -> Option<&Arc<Transaction>> {
        self.transaction.as_ref().filter(|tx| tx.is_active())
    }
}

impl TransactionPolicy for JtaTransactionPolicy {
    fn attribute(&self) -> TransactionAttribute {
        self.attribute
    }

    fn current_transaction(&self) -> Option<Arc<Transaction>> {
        self.transaction.clone()
    }

    fn is_new_transaction(&self) -> bool {
        self.started
    }

    fn is_client_transaction(&self) -> bool {
        self.transaction.is_some() && !self.started
    }

    fn resource(&self, key: TypeId) -> Option<Resource> {
        match self.active_transaction() {
            Some(tx) => tx.resource(key),
            None => self.local.resource(key),
        }
    }

    fn put_resource(&self, key: TypeId, value: Resource) {
        match self.active_transaction() {
            Some(tx) => tx.put_resource(key, value),
            None => self.local.put_resource(key, value),
        }
    }

    fn register_synchronization(&self, synchronization: Arc<dyn TransactionSynchronization>) {
        let Some(tx) = self.active_transaction() else {
            self.local.register(synchronization);
            return;
        };
        if let Err(err) = tx.register_synchronization(Arc::clone(&synchronization)) {
            warn!(error = %err, "transaction completed before registration; using local scope");
            self.local.register(synchronization);
        }
    }

    fn complete(&self) -> Result<(), TransactionError> {
        self.local.fire();
        match &self.transaction {
            Some(tx) if self.started => {
                if tx.is_rollback_only() {
                    tx.rollback()
                } else {
                    tx.commit()
                }
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for JtaTransactionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JtaTransactionPolicy")
            .field("attribute", &self.attribute)
            .field("transaction", &self.transaction.as_ref().map(|tx| tx.id()))
            .field("started", &self.started)
            .finish()
    }
}

/// Bean-managed policy. The caller's transaction is never joined; the bean
/// demarcates its own through the [`UserTransaction`]. Session synchronization
/// does not apply, so synchronizations always use the local scope.
pub struct BeanTransactionPolicy {
    user: UserTransaction,
    local: LocalScope,
}

impl BeanTransactionPolicy {
    /// Creates a policy around a user transaction handle.
    pub fn new(user: UserTransaction) -> Self {
        Self {
            user,
            local: LocalScope::default(),
        }
    }
}

impl TransactionPolicy for BeanTransactionPolicy {
    fn attribute(&self) -> TransactionAttribute {
        TransactionAttribute::BeanManaged
    }

    fn current_transaction(&self) -> Option<Arc<Transaction>> {
        self.user.transaction()
    }

    fn is_new_transaction(&self) -> bool {
        false
    }

    fn is_client_transaction(&self) -> bool {
        false
    }

    fn resource(&self, key: TypeId) -> Option<Resource> {
        self.local.resource(key)
    }

    fn put_resource(&self, key: TypeId, value: Resource) {
        self.local.put_resource(key, value);
    }

    fn register_synchronization(&self, synchronization: Arc<dyn TransactionSynchronization>) {
        self.local.register(synchronization);
    }

    fn user_transaction(&self) -> Option<&UserTransaction> {
        Some(&self.user)
    }

    fn complete(&self) -> Result<(), TransactionError> {
        self.local.fire();
        Ok(())
    }
}

impl fmt::Debug for BeanTransactionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeanTransactionPolicy")
            .field("user", &self.user)
            .finish()
    }
}
